//! Local IPC server (§4.3 step 2: "a local JSON-RPC IPC server for
//! client-initiated ops: `Reconnect`, `GetStatus`, `RegisterTTY`,
//! `RegisterSession`, `AddToDownloadQueue`").
//!
//! Loopback-only, line-delimited JSON (reusing C1's frame codec so the IPC
//! surface and the wire protocol share one parser), one request per line,
//! one response per line. This exists for a local CLI companion to poke the
//! running agent; it is not part of the agent-coordinator wire protocol.
//!
//! `RegisterTTY`/`RegisterSession`/`AddToDownloadQueue` mutate [`SessionState`],
//! the same handle the Control dispatch loop consults when it spawns a
//! Terminal session or services a `file_download` request (§4.3 "Terminal:
//! ... register (sid→ttyname) locally").

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::{encode_response, Frame, FrameDecoder, ParseMode, Response};

/// Local session-correlation state: ties a local client (a companion shell
/// hook, a scripted uploader) to an in-progress or upcoming Control
/// dispatch. Shared between the IPC server and the Control dispatch loop.
#[derive(Debug, Default)]
pub struct SessionState {
    ttys: Mutex<HashMap<String, String>>,
    sessions: Mutex<HashMap<String, serde_json::Value>>,
    download_queue: Mutex<VecDeque<String>>,
}

impl SessionState {
    /// The tty device path a local client registered for `sid`, if any.
    /// Consulted by the Control dispatch loop when it spawns a Terminal
    /// session and the coordinator's own request didn't supply one.
    #[must_use]
    pub fn tty_for(&self, sid: &str) -> Option<String> {
        self.ttys.lock().expect("ttys lock poisoned").get(sid).cloned()
    }

    /// Pops the next queued download path, if a local client primed one via
    /// `add_to_download_queue`. Consulted by `file_transfer` when a
    /// `file_download` request omits its own filename.
    pub fn pop_queued_download(&self) -> Option<String> {
        self.download_queue.lock().expect("download queue lock poisoned").pop_front()
    }
}

/// Binds `addr` and serves IPC requests until the listener errors.
pub async fn serve(addr: &str, candidates: Arc<Mutex<Vec<String>>>, sessions: Arc<SessionState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding IPC listener on {addr}"))?;
    log::info!("local IPC server listening on {addr}");
    loop {
        let (stream, peer) = listener.accept().await?;
        let candidates = Arc::clone(&candidates);
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, &candidates, &sessions).await {
                log::debug!("IPC client {peer} disconnected: {e:#}");
            }
        });
    }
}

async fn handle_client(mut stream: TcpStream, candidates: &Arc<Mutex<Vec<String>>>, sessions: &SessionState) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let frames = decoder.feed(&buf[..n], ParseMode::Multi);
        for frame in frames {
            let Frame::Request(req) = frame else { continue };
            let response = dispatch(&req.name, &req.payload, candidates, sessions);
            let res = match response {
                Ok(payload) => Response::success(req.rid.clone(), payload),
                Err(e) => Response::failure(req.rid.clone(), e.to_string()),
            };
            stream.write_all(&encode_response(&res)).await?;
        }
    }
}

fn dispatch(
    name: &str,
    payload: &serde_json::Value,
    candidates: &Arc<Mutex<Vec<String>>>,
    sessions: &SessionState,
) -> Result<serde_json::Value> {
    match name {
        "get_status" => Ok(serde_json::json!({
            "candidates": candidates.lock().expect("candidates lock poisoned").clone(),
            "registered_ttys": sessions.ttys.lock().expect("ttys lock poisoned").clone(),
            "registered_sessions": sessions.sessions.lock().expect("sessions lock poisoned").clone(),
            "queued_downloads": sessions.download_queue.lock().expect("download queue lock poisoned").len(),
        })),
        "reconnect" => {
            // The Control loop already retries on its own cadence; a client
            // asking to reconnect just clears the discovered-candidate
            // cache so the next attempt re-probes from scratch.
            candidates.lock().expect("candidates lock poisoned").clear();
            Ok(serde_json::Value::Null)
        }
        "register_tty" => {
            let sid = require_str(payload, "sid")?;
            let tty_device = require_str(payload, "tty_device")?;
            sessions.ttys.lock().expect("ttys lock poisoned").insert(sid, tty_device);
            Ok(serde_json::Value::Null)
        }
        "register_session" => {
            let sid = require_str(payload, "sid")?;
            sessions.sessions.lock().expect("sessions lock poisoned").insert(sid, payload.clone());
            Ok(serde_json::Value::Null)
        }
        "add_to_download_queue" => {
            let path = require_str(payload, "path")?;
            let mut queue = sessions.download_queue.lock().expect("download queue lock poisoned");
            queue.push_back(path);
            Ok(serde_json::json!({"queue_len": queue.len()}))
        }
        other => anyhow::bail!("unknown IPC method {other}"),
    }
}

fn require_str(payload: &serde_json::Value, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .with_context(|| format!("missing {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_status_reports_current_candidates() {
        let candidates = Arc::new(Mutex::new(vec!["10.0.0.1:4343".to_string()]));
        let sessions = SessionState::default();
        let result = dispatch("get_status", &serde_json::json!({}), &candidates, &sessions).unwrap();
        assert_eq!(result["candidates"][0], "10.0.0.1:4343");
    }

    #[test]
    fn reconnect_clears_candidates() {
        let candidates = Arc::new(Mutex::new(vec!["10.0.0.1:4343".to_string()]));
        let sessions = SessionState::default();
        dispatch("reconnect", &serde_json::json!({}), &candidates, &sessions).unwrap();
        assert!(candidates.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_method_is_an_error() {
        let candidates = Arc::new(Mutex::new(vec![]));
        let sessions = SessionState::default();
        assert!(dispatch("bogus", &serde_json::json!({}), &candidates, &sessions).is_err());
    }

    #[test]
    fn register_tty_is_observable_via_tty_for() {
        let candidates = Arc::new(Mutex::new(vec![]));
        let sessions = SessionState::default();
        dispatch(
            "register_tty",
            &serde_json::json!({"sid": "s1", "tty_device": "/dev/pts/4"}),
            &candidates,
            &sessions,
        )
        .unwrap();
        assert_eq!(sessions.tty_for("s1"), Some("/dev/pts/4".to_string()));
    }

    #[test]
    fn register_tty_without_sid_is_an_error() {
        let candidates = Arc::new(Mutex::new(vec![]));
        let sessions = SessionState::default();
        assert!(dispatch(
            "register_tty",
            &serde_json::json!({"tty_device": "/dev/pts/4"}),
            &candidates,
            &sessions,
        )
        .is_err());
    }

    #[test]
    fn register_session_is_observable_via_get_status() {
        let candidates = Arc::new(Mutex::new(vec![]));
        let sessions = SessionState::default();
        dispatch(
            "register_session",
            &serde_json::json!({"sid": "s1", "label": "alice@laptop"}),
            &candidates,
            &sessions,
        )
        .unwrap();
        let status = dispatch("get_status", &serde_json::json!({}), &candidates, &sessions).unwrap();
        assert_eq!(status["registered_sessions"]["s1"]["label"], "alice@laptop");
    }

    #[test]
    fn add_to_download_queue_is_observable_via_pop() {
        let candidates = Arc::new(Mutex::new(vec![]));
        let sessions = SessionState::default();
        let result = dispatch(
            "add_to_download_queue",
            &serde_json::json!({"path": "/var/log/syslog"}),
            &candidates,
            &sessions,
        )
        .unwrap();
        assert_eq!(result["queue_len"], 1);
        assert_eq!(sessions.pop_queued_download(), Some("/var/log/syslog".to_string()));
        assert_eq!(sessions.pop_queued_download(), None);
    }
}
