//! File transfer secondary sessions (C7, §4.7).
//!
//! Download: the agent stats the requested file on the Control connection
//! (so the operator gets an immediate yes/no), then opens a secondary File
//! connection, sends `request_to_download`, waits for the coordinator's
//! fire-and-forget `clear_to_download`, and streams the raw file bytes.
//!
//! Upload: `check_only` is answered synchronously on the Control
//! connection with no secondary session (the coordinator never allocates a
//! rendezvous for it, so there's nothing to connect to). A real upload
//! opens a secondary File connection, announces `clear_to_upload`, then
//! writes every inbound byte straight to `dest` until the coordinator
//! closes the write side, applying `perm` only after the file is complete.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::protocol::{LogFormat, ParseMode, Request, Response, SessionMode};
use crate::rpc::ReadEvent;

use super::ipc::SessionState;
use super::AgentIdentity;

/// Control-connection handler for an inbound `file_download` request. When
/// the request omits `filename`, falls back to the next path a local client
/// queued via the IPC `add_to_download_queue` op.
pub async fn handle_download_command(
    req: &Request,
    identity: &AgentIdentity,
    coordinator_addr: &str,
    sessions: &Arc<SessionState>,
) -> Option<Response> {
    let Some(sid) = req.payload.get("sid").and_then(|v| v.as_str()).map(str::to_string) else {
        return Some(Response::failure(req.rid.clone(), "missing sid"));
    };
    let filename = req
        .payload
        .get("filename")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| sessions.pop_queued_download());
    let Some(filename) = filename else {
        return Some(Response::failure(req.rid.clone(), "missing filename and no queued download"));
    };

    let metadata = match std::fs::metadata(&filename) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Some(Response::failure(req.rid.clone(), "not a regular file")),
        Err(e) => return Some(Response::failure(req.rid.clone(), e.to_string())),
    };
    let size = metadata.len();

    let identity = identity.clone();
    let coordinator_addr = coordinator_addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_download(&coordinator_addr, &identity, &sid, &filename, size).await {
            log::warn!("download sid={sid:?} failed: {e:#}");
        }
    });
    Some(Response::success(req.rid.clone(), serde_json::Value::Null))
}

async fn run_download(
    coordinator_addr: &str,
    identity: &AgentIdentity,
    sid: &str,
    filename: &str,
    size: u64,
) -> Result<()> {
    let (mut core, mut writer, mut read_rx) = super::dial_and_register(
        coordinator_addr,
        &identity.mid,
        sid,
        SessionMode::File,
        LogFormat::default(),
        serde_json::Value::Null,
    )
    .await
    .context("registering File secondary session for download")?;

    let name = Path::new(filename).file_name().map_or_else(|| filename.to_string(), |n| n.to_string_lossy().into_owned());
    let req = Request::new(
        "request_to_download",
        30,
        serde_json::json!({"terminal_sid": "", "filename": name, "size": size}),
    );
    let bytes = core.send_request(&req, None);
    writer.write_all(&bytes).await.context("writing request_to_download")?;

    // Wait for `request_to_download`'s own ack, then for the coordinator's
    // fire-and-forget `clear_to_download` before streaming bytes (§4.7).
    let mut got_clear = false;
    while !got_clear {
        match read_rx.recv().await {
            Some(ReadEvent::Chunk(chunk)) => {
                let requests = core.parse_requests(&chunk, ParseMode::Multi);
                for inbound in requests {
                    if inbound.name == "clear_to_download" {
                        got_clear = true;
                    }
                }
            }
            _ => anyhow::bail!("connection closed before clear_to_download"),
        }
    }

    let mut file = tokio::fs::File::open(filename).await.context("opening file for download")?;
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = file.read(&mut buf).await.context("reading file")?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.context("writing file bytes to socket")?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Control-connection handler for an inbound `file_upload` request.
pub async fn handle_upload_command(
    req: &Request,
    identity: &AgentIdentity,
    coordinator_addr: &str,
) -> Option<Response> {
    #[derive(serde::Deserialize)]
    struct Payload {
        sid: String,
        dest: String,
        #[serde(default)]
        perm: Option<u32>,
        #[serde(default)]
        check_only: bool,
    }
    let payload: Payload = match serde_json::from_value(req.payload.clone()) {
        Ok(p) => p,
        Err(e) => return Some(Response::failure(req.rid.clone(), e.to_string())),
    };

    if payload.check_only {
        return Some(check_upload_destination(req, &payload.dest));
    }

    let identity = identity.clone();
    let coordinator_addr = coordinator_addr.to_string();
    let dest = payload.dest;
    let perm = payload.perm.unwrap_or(0o644);
    let sid = payload.sid;
    tokio::spawn(async move {
        if let Err(e) = run_upload(&coordinator_addr, &identity, &sid, &dest, perm).await {
            log::warn!("upload sid={sid:?} failed: {e:#}");
        }
    });
    Some(Response::success(req.rid.clone(), serde_json::Value::Null))
}

fn check_upload_destination(req: &Request, dest: &str) -> Response {
    let parent = Path::new(dest).parent().unwrap_or_else(|| Path::new("."));
    match std::fs::metadata(parent) {
        Ok(m) if m.is_dir() => Response::success(req.rid.clone(), serde_json::Value::Null),
        Ok(_) => Response::failure(req.rid.clone(), "destination parent is not a directory"),
        Err(e) => Response::failure(req.rid.clone(), e.to_string()),
    }
}

async fn run_upload(
    coordinator_addr: &str,
    identity: &AgentIdentity,
    sid: &str,
    dest: &str,
    perm: u32,
) -> Result<()> {
    let (mut core, mut writer, mut read_rx) = super::dial_and_register(
        coordinator_addr,
        &identity.mid,
        sid,
        SessionMode::File,
        LogFormat::default(),
        serde_json::Value::Null,
    )
    .await
    .context("registering File secondary session for upload")?;

    let bytes = core.send_request(&Request::new("clear_to_upload", -1, serde_json::json!({})), None);
    writer.write_all(&bytes).await.context("announcing clear_to_upload")?;

    let mut file = tokio::fs::File::create(dest).await.context("creating upload destination")?;
    loop {
        match read_rx.recv().await {
            Some(ReadEvent::Chunk(chunk)) => {
                file.write_all(&chunk).await.context("writing uploaded bytes")?;
            }
            Some(ReadEvent::Eof) => break,
            Some(ReadEvent::Error(e)) => return Err(e).context("reading uploaded bytes"),
            None => break,
        }
    }
    file.flush().await.ok();
    drop(file);

    // Permissions are applied only once the upload is fully written, so a
    // partial transfer never leaves a file with its final mode bits set.
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(perm))
        .context("applying permission bits to uploaded file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_only_accepts_existing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("uploaded.bin");
        let req = Request::new("file_upload", 30, serde_json::json!({}));
        let res = check_upload_destination(&req, dest.to_str().unwrap());
        assert!(res.is_success());
    }

    #[test]
    fn check_only_rejects_missing_parent_directory() {
        let req = Request::new("file_upload", 30, serde_json::json!({}));
        let res = check_upload_destination(&req, "/no/such/directory/uploaded.bin");
        assert!(!res.is_success());
    }
}
