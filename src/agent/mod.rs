//! Agent session (C3, §4.3).
//!
//! One `AgentSession` drives the Control connection for the lifetime of the
//! process: build a candidate coordinator address list, optionally run LAN
//! discovery and a local IPC server alongside it, then loop forever trying
//! to connect/register/listen, sleeping `RECONNECT_INTERVAL` between
//! attempts. Secondary sessions (Terminal/Shell/Forward/File) are each a
//! fresh TCP connection opened in response to an inbound Control request
//! and run to completion on their own task, mirroring the teacher's
//! `agent::spawn` pattern of one task per PTY session but without its
//! vt100 terminal emulation (the operator's browser renders the stream
//! itself).

pub mod file_transfer;
pub mod forward;
pub mod ipc;
pub mod shell;
pub mod terminal;
pub mod upgrade;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::config::AgentConfig;
use crate::constants;
use crate::ids::{derive_mid, new_sid};
use crate::protocol::{
    encode_request, Frame, FrameDecoder, LogFormat, ParseMode, RegisterPayload, Request, Response,
    SessionMode,
};
use crate::rpc::{spawn_reader_pump, ReadEvent, RpcCore};

/// Identity and configuration shared by the Control loop and every
/// secondary session it spawns.
#[derive(Clone)]
pub struct AgentIdentity {
    pub mid: String,
    pub properties: serde_json::Value,
}

/// Runs the agent forever: build candidates, optionally start discovery and
/// IPC, then connect/register/listen with reconnect backoff (§4.3 step 3).
pub async fn run(config: AgentConfig) -> Result<()> {
    let salt = load_or_create_salt()?;
    let hostname = hostname::get().context("reading hostname")?.to_string_lossy().into_owned();
    let identity = AgentIdentity {
        mid: derive_mid(&hostname, &salt),
        properties: config.load_properties(),
    };
    log::info!("agent identity mid={:?}", identity.mid);

    let candidates = Arc::new(Mutex::new(initial_candidates(&config)));
    let sessions = Arc::new(ipc::SessionState::default());
    let (discovery_stop_tx, discovery_stop_rx) = watch::channel(false);

    if config.discovery_enabled {
        let candidates = Arc::clone(&candidates);
        tokio::spawn(async move {
            if let Err(e) = crate::discovery::listen_loop(candidates, discovery_stop_rx).await {
                log::warn!("discovery listener stopped: {e}");
            }
        });
    }

    {
        let ipc_addr = config.ipc_addr.clone();
        let candidates = Arc::clone(&candidates);
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            if let Err(e) = ipc::serve(&ipc_addr, candidates, sessions).await {
                log::warn!("local IPC server stopped: {e}");
            }
        });
    }

    loop {
        let targets = current_candidates(&config, &candidates);
        let mut connected = false;
        for addr in targets {
            match run_one_connection(&addr, &identity, &discovery_stop_tx, &sessions).await {
                Ok(()) => {
                    connected = true;
                }
                Err(e) => {
                    log::warn!("control connection to {addr} ended: {e:#}");
                }
            }
            let _ = discovery_stop_tx.send(false);
        }
        if !connected {
            log::debug!("no candidate reachable, retrying in {:?}", constants::RECONNECT_INTERVAL);
        }
        tokio::time::sleep(constants::RECONNECT_INTERVAL).await;
    }
}

fn initial_candidates(config: &AgentConfig) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(addr) = &config.coordinator_addr {
        out.push(addr.clone());
    }
    out.push(format!("127.0.0.1:{}", constants::DEFAULT_HTTPS_PORT));
    out.push(format!("127.0.0.1:{}", constants::DEFAULT_HTTP_PORT));
    out.extend(crate::discovery::gateway_candidates(
        constants::DEFAULT_HTTPS_PORT,
        constants::DEFAULT_HTTP_PORT,
    ));
    out
}

fn current_candidates(config: &AgentConfig, discovered: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    let mut out = initial_candidates(config);
    out.extend(discovered.lock().expect("candidates lock poisoned").clone());
    out
}

fn load_or_create_salt() -> Result<String> {
    let path = crate::config::config_dir()?.join("identity_salt");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }
    let salt = crate::ids::new_salt();
    std::fs::write(&path, &salt).context("writing identity salt")?;
    Ok(salt)
}

/// Dials `addr`, registers in `mode`, and returns the split halves plus the
/// reader-pump channel once registration succeeds. Shared by the Control
/// loop and every secondary session module.
pub(crate) async fn dial_and_register(
    addr: &str,
    mid: &str,
    sid: &str,
    mode: SessionMode,
    format: LogFormat,
    properties: serde_json::Value,
) -> Result<(RpcCore, WriteHalf<TcpStream>, mpsc::Receiver<ReadEvent>)> {
    let mut stream = TcpStream::connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
    stream.set_nodelay(true).ok();

    let payload = RegisterPayload {
        mid: mid.to_string(),
        sid: sid.to_string(),
        mode,
        format,
        properties,
    };
    let req = Request::new("register", 30, serde_json::to_value(&payload)?);
    stream.write_all(&encode_request(&req)).await.context("writing register frame")?;

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.context("reading register response")?;
        if n == 0 {
            anyhow::bail!("coordinator closed connection before ack'ing registration");
        }
        let frames = decoder.feed(&buf[..n], ParseMode::Single);
        let Some(frame) = frames.into_iter().next() else {
            continue;
        };
        let Frame::Response(res) = frame else {
            anyhow::bail!("expected a registration Response, got a Request");
        };
        if !res.is_success() {
            anyhow::bail!("registration rejected: {}", res.status);
        }
        break;
    }

    let (read_half, write_half) = tokio::io::split(stream);
    let (read_tx, read_rx) = mpsc::channel::<ReadEvent>(64);
    spawn_reader_pump(read_half, read_tx);
    Ok((RpcCore::new(), write_half, read_rx))
}

/// Runs one Control connection to completion: register, then alternate
/// between sending pings and dispatching inbound requests until the
/// connection is lost.
async fn run_one_connection(
    addr: &str,
    identity: &AgentIdentity,
    discovery_stop_tx: &watch::Sender<bool>,
    sessions: &Arc<ipc::SessionState>,
) -> Result<()> {
    let sid = new_sid();
    let (mut core, mut writer, mut read_rx) = dial_and_register(
        addr,
        &identity.mid,
        &sid,
        SessionMode::Control,
        LogFormat::default(),
        identity.properties.clone(),
    )
    .await?;
    log::info!("registered as Control with {addr}");
    let _ = discovery_stop_tx.send(true);

    let mut ping_tick = interval(constants::PING_INTERVAL);
    let identity = identity.clone();
    let addr = addr.to_string();

    loop {
        tokio::select! {
            biased;
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Chunk(chunk)) => {
                        let requests = core.parse_requests(&chunk, ParseMode::Multi);
                        for req in requests {
                            let response = dispatch_control_request(&req, &identity, &addr, sessions).await;
                            if let Some(res) = response {
                                if writer.write_all(&core.send_response(&res)).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => {
                        anyhow::bail!("connection to coordinator lost");
                    }
                }
            }
            _ = ping_tick.tick() => {
                let bytes = core.send_request(
                    &Request::new("ping", 5, serde_json::json!({})),
                    Some(Box::new(move |res| {
                        if res.is_none() {
                            log::warn!("ping to coordinator timed out");
                        }
                    })),
                );
                if writer.write_all(&bytes).await.is_err() {
                    anyhow::bail!("write failed sending ping");
                }
                core.scan_for_timeouts();
            }
        }
    }
}

/// Handles one inbound Control request from the coordinator, spawning a
/// secondary session task where appropriate and always returning a
/// `Response` to acknowledge dispatch (§4.4's command table).
async fn dispatch_control_request(
    req: &Request,
    identity: &AgentIdentity,
    coordinator_addr: &str,
    sessions: &Arc<ipc::SessionState>,
) -> Option<Response> {
    match req.name.as_str() {
        "ping" => Some(Response::success(req.rid.clone(), serde_json::json!({"response": "pong"}))),
        "upgrade" => {
            tokio::spawn(async move {
                if let Err(e) = upgrade::perform_upgrade().await {
                    log::error!("self-upgrade failed: {e:#}");
                }
            });
            None
        }
        "terminal" => spawn_terminal_session(req, identity, coordinator_addr, sessions).await,
        "shell" => spawn_stream_session(req, identity, coordinator_addr, SessionMode::Shell).await,
        "forward" => spawn_stream_session(req, identity, coordinator_addr, SessionMode::Forward).await,
        "file_download" => file_transfer::handle_download_command(req, identity, coordinator_addr, sessions).await,
        "file_upload" => file_transfer::handle_upload_command(req, identity, coordinator_addr).await,
        "list_tree" => Some(handle_list_tree(req)),
        "fstat" => Some(handle_fstat(req)),
        "create_symlink" => Some(handle_create_symlink(req)),
        "mkdir" => Some(handle_mkdir(req)),
        other => {
            log::debug!("unhandled control request {other}");
            Some(Response::failure(req.rid.clone(), format!("unknown request {other}")))
        }
    }
}

/// Shared dispatch for Shell/Forward: pull `sid` out of the payload, spawn
/// the matching secondary-session task, and ack immediately (the session
/// itself runs independently; failures after this point are only visible
/// as the operator WebSocket closing, per §4.4).
async fn spawn_stream_session(
    req: &Request,
    identity: &AgentIdentity,
    coordinator_addr: &str,
    mode: SessionMode,
) -> Option<Response> {
    let Some(sid) = req.payload.get("sid").and_then(|v| v.as_str()).map(str::to_string) else {
        return Some(Response::failure(req.rid.clone(), "missing sid in spawn request"));
    };
    let identity = identity.clone();
    let coordinator_addr = coordinator_addr.to_string();
    let payload = req.payload.clone();
    tokio::spawn(async move {
        let result = match mode {
            SessionMode::Shell => {
                let command = payload.get("command").and_then(|v| v.as_str()).unwrap_or("sh").to_string();
                shell::run(&coordinator_addr, &identity, &sid, &command).await
            }
            SessionMode::Forward => {
                let host = payload.get("host").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let port = payload.get("port").and_then(serde_json::Value::as_u64).unwrap_or(0) as u16;
                forward::run(&coordinator_addr, &identity, &sid, &host, port).await
            }
            _ => unreachable!("spawn_stream_session only called for Shell/Forward"),
        };
        if let Err(e) = result {
            log::warn!("{mode:?} session sid={sid:?} ended with error: {e:#}");
        }
    });
    Some(Response::success(req.rid.clone(), serde_json::Value::Null))
}

/// Dispatch for `terminal`: resolves the `tty_device` to attach to, either
/// from the coordinator's own request payload or from a local client's
/// prior `register_tty` IPC call (§4.3 "register (sid→ttyname) locally"),
/// falling back to allocating a fresh PTY when neither is present.
async fn spawn_terminal_session(
    req: &Request,
    identity: &AgentIdentity,
    coordinator_addr: &str,
    sessions: &Arc<ipc::SessionState>,
) -> Option<Response> {
    let Some(sid) = req.payload.get("sid").and_then(|v| v.as_str()).map(str::to_string) else {
        return Some(Response::failure(req.rid.clone(), "missing sid in spawn request"));
    };
    let tty_device = req
        .payload
        .get("tty_device")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| sessions.tty_for(&sid));

    let identity = identity.clone();
    let coordinator_addr = coordinator_addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = terminal::run(&coordinator_addr, &identity, &sid, tty_device.as_deref()).await {
            log::warn!("terminal session sid={sid:?} ended with error: {e:#}");
        }
    });
    Some(Response::success(req.rid.clone(), serde_json::Value::Null))
}

fn handle_list_tree(req: &Request) -> Response {
    let Some(path) = req.payload.get("path").and_then(|v| v.as_str()) else {
        return Response::failure(req.rid.clone(), "missing path");
    };
    match walk_tree(std::path::Path::new(path)) {
        Ok(entries) => Response::success(req.rid.clone(), serde_json::json!(entries)),
        Err(e) => Response::failure(req.rid.clone(), e.to_string()),
    }
}

fn walk_tree(root: &std::path::Path) -> std::io::Result<Vec<serde_json::Value>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        out.push(serde_json::json!({
            "name": entry.file_name().to_string_lossy(),
            "is_dir": metadata.is_dir(),
            "size": metadata.len(),
        }));
    }
    Ok(out)
}

fn handle_fstat(req: &Request) -> Response {
    let Some(path) = req.payload.get("path").and_then(|v| v.as_str()) else {
        return Response::failure(req.rid.clone(), "missing path");
    };
    match std::fs::metadata(path) {
        Ok(metadata) => Response::success(
            req.rid.clone(),
            serde_json::json!({
                "is_dir": metadata.is_dir(),
                "is_file": metadata.is_file(),
                "size": metadata.len(),
                "readonly": metadata.permissions().readonly(),
            }),
        ),
        Err(e) => Response::failure(req.rid.clone(), e.to_string()),
    }
}

fn handle_create_symlink(req: &Request) -> Response {
    let (Some(target), Some(link)) = (
        req.payload.get("target").and_then(|v| v.as_str()),
        req.payload.get("link").and_then(|v| v.as_str()),
    ) else {
        return Response::failure(req.rid.clone(), "missing target or link");
    };
    match symlink(target, link) {
        Ok(()) => Response::success(req.rid.clone(), serde_json::Value::Null),
        Err(e) => Response::failure(req.rid.clone(), e.to_string()),
    }
}

#[cfg(unix)]
fn symlink(target: &str, link: &str) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &str, link: &str) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

fn handle_mkdir(req: &Request) -> Response {
    let Some(path) = req.payload.get("path").and_then(|v| v.as_str()) else {
        return Response::failure(req.rid.clone(), "missing path");
    };
    match std::fs::create_dir_all(path) {
        Ok(()) => Response::success(req.rid.clone(), serde_json::Value::Null),
        Err(e) => Response::failure(req.rid.clone(), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_candidates_include_explicit_addr_first() {
        let mut config = AgentConfig::default();
        config.coordinator_addr = Some("10.0.0.9:4343".to_string());
        let candidates = initial_candidates(&config);
        assert_eq!(candidates[0], "10.0.0.9:4343");
    }

    #[test]
    fn initial_candidates_fall_back_to_localhost_defaults() {
        let config = AgentConfig::default();
        let candidates = initial_candidates(&config);
        assert!(candidates.iter().any(|c| c.contains("4443")));
        assert!(candidates.iter().any(|c| c.contains("4343")));
    }
}
