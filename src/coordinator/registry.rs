//! Coordinator registry (C5, §3.3 "Registries", §4.5).
//!
//! Five independently-locked maps, matching the teacher's per-concern
//! locking style (see `broker::connection`'s separate session/ring-buffer
//! state): `agents` (Control only, keyed by mid), `logcats` (nested
//! mid → sid), `wsctxs` (pending operator-WS rendezvous, keyed by sid),
//! `downloads`/`uploads` (in-flight File transfers, keyed by sid), and
//! `monitor_clients` (lifecycle event subscribers). Each map lives behind
//! its own `std::sync::Mutex` so a slow operation on one never blocks an
//! unrelated one — register/unregister are O(1).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::RegistrationError;
use crate::protocol::Response;

/// A command issued to a registered Control agent's `ConnServer`, which
/// turns it into an RPC `Request` on the agent connection (§4.4 "Operator
/// command channel").
#[derive(Debug)]
pub enum ControlCommand {
    SpawnTerminal {
        sid: String,
        reply: oneshot::Sender<Response>,
    },
    SpawnShell {
        sid: String,
        command: String,
        reply: oneshot::Sender<Response>,
    },
    SpawnForward {
        sid: String,
        host: String,
        port: u16,
        reply: oneshot::Sender<Response>,
    },
    SpawnFileDownload {
        sid: String,
        filename: String,
        reply: oneshot::Sender<Response>,
    },
    SpawnFileUpload {
        sid: String,
        terminal_sid: String,
        filename: String,
        dest: String,
        perm: u32,
        check_only: bool,
        reply: oneshot::Sender<Response>,
    },
    ListTree {
        path: String,
        reply: oneshot::Sender<Response>,
    },
    Fstat {
        path: String,
        reply: oneshot::Sender<Response>,
    },
    CreateSymlink {
        target: String,
        link: String,
        reply: oneshot::Sender<Response>,
    },
    Mkdir {
        path: String,
        reply: oneshot::Sender<Response>,
    },
    /// Fire-and-forget (§6: `clear_to_download` timeout = -1).
    ClearToDownload { sid: String },
    /// Fire-and-forget (§6: `upgrade` timeout = -1).
    Upgrade,
}

/// A handle to a registered Control agent: everything the registry and the
/// browser bridge need without touching the owning `ConnServer` task
/// directly (§9 "no shared-mutable graphs" — cross-task access is through
/// this channel).
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub mid: String,
    pub properties: serde_json::Value,
    pub cmd_tx: mpsc::Sender<ControlCommand>,
}

/// A command issued to a registered Logcat `ConnServer` (§4.6 "Logcat
/// subscribe").
#[derive(Debug)]
pub enum LogcatCommand {
    /// Pre-send the ring buffer to `sink`, then add it to subscribers.
    Subscribe { sink: WsSink },
}

/// Outbound half of an operator WebSocket, abstracted so the registry and
/// `ConnServer` don't depend on the HTTP framework's concrete socket type.
pub type WsSink = mpsc::Sender<WsMessage>;

/// A message destined for an operator WebSocket.
#[derive(Debug, Clone)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Clone)]
pub struct LogcatHandle {
    pub mid: String,
    pub sid: String,
    pub cmd_tx: mpsc::Sender<LogcatCommand>,
}

/// A pending rendezvous: an operator WS is waiting for a secondary agent to
/// register with this `sid` (§3.3 "Pending sid"). `sink` carries
/// agent-to-operator bytes; `to_agent_rx` carries operator-to-agent bytes
/// the other way, so the `ConnServer` that eventually claims this context
/// can bridge both directions (§4.4, §5 ordering).
pub struct WsContext {
    pub sid: String,
    pub sink: WsSink,
    pub to_agent_rx: mpsc::Receiver<Vec<u8>>,
}

/// State handed to a download's HTTP response writer once the secondary
/// File agent has announced readiness (§4.7 download).
pub struct DownloadContext {
    pub name: String,
    pub size: u64,
    pub terminal_sid: String,
    pub ready: bool,
    pub data_rx: Option<mpsc::Receiver<Option<Vec<u8>>>>,
    pub clear_tx: Option<oneshot::Sender<()>>,
}

/// State for an in-flight upload: the multipart body is copied directly
/// into `body_rx`'s paired sender (held by the HTTP bridge), and the
/// secondary File agent's `ConnServer` drains `body_rx` onto the wire,
/// shutting the write half down (EOF) once the sender is dropped (§4.7
/// upload). `ready` mirrors `DownloadContext::ready`: the HTTP bridge polls
/// it with a deadline before answering the request, so a secondary that
/// never connects times out instead of leaving this context stranded.
pub struct UploadContext {
    pub dest: String,
    pub perm: u32,
    pub ready: bool,
    pub body_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Lifecycle event broadcast to `/api/monitor` subscribers (§4.5, §6).
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    pub event: &'static str,
    pub data: serde_json::Value,
}

/// Bound on each monitor subscriber's queue; a subscriber that falls this
/// far behind is dropped rather than allowed to slow down the broadcaster
/// (§5 "back-pressure isolation").
const MONITOR_QUEUE_DEPTH: usize = 64;

/// The coordinator's in-process registries (§3.3, §4.5).
#[derive(Default)]
pub struct Registry {
    agents: Mutex<HashMap<String, AgentHandle>>,
    logcats: Mutex<HashMap<String, HashMap<String, LogcatHandle>>>,
    wsctxs: Mutex<HashMap<String, WsContext>>,
    downloads: Mutex<HashMap<String, DownloadContext>>,
    uploads: Mutex<HashMap<String, UploadContext>>,
    monitor_clients: Mutex<Vec<mpsc::Sender<MonitorEvent>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Control agents (invariant 4: at most one per mid) ----

    /// Insert a new Control agent, or fail with `DuplicateMachineId` if one
    /// is already registered for this `mid`.
    pub fn register_agent(&self, handle: AgentHandle) -> Result<(), RegistrationError> {
        let mut agents = self.agents.lock().expect("agents lock poisoned");
        if agents.contains_key(&handle.mid) {
            return Err(RegistrationError::DuplicateMachineId(handle.mid));
        }
        let mid = handle.mid.clone();
        agents.insert(mid.clone(), handle);
        drop(agents);
        self.broadcast_monitor("agent joined", serde_json::json!([mid]));
        Ok(())
    }

    #[must_use]
    pub fn get_agent(&self, mid: &str) -> Option<AgentHandle> {
        self.agents.lock().expect("agents lock poisoned").get(mid).cloned()
    }

    pub fn unregister_agent(&self, mid: &str) {
        let removed = self
            .agents
            .lock()
            .expect("agents lock poisoned")
            .remove(mid)
            .is_some();
        if removed {
            self.broadcast_monitor("agent left", serde_json::json!([mid]));
        }
    }

    #[must_use]
    pub fn list_agents(&self) -> Vec<AgentHandle> {
        self.agents.lock().expect("agents lock poisoned").values().cloned().collect()
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.lock().expect("agents lock poisoned").len()
    }

    // ---- Logcats (nested mid -> sid) ----

    pub fn register_logcat(&self, handle: LogcatHandle) -> Result<(), RegistrationError> {
        let mut logcats = self.logcats.lock().expect("logcats lock poisoned");
        let inner = logcats.entry(handle.mid.clone()).or_default();
        if inner.contains_key(&handle.sid) {
            return Err(RegistrationError::DuplicateLogcatSession(
                handle.mid.clone(),
                handle.sid.clone(),
            ));
        }
        let (mid, sid) = (handle.mid.clone(), handle.sid.clone());
        inner.insert(sid.clone(), handle);
        drop(logcats);
        self.broadcast_monitor("logcat joined", serde_json::json!({"mid": mid, "sid": sid}));
        Ok(())
    }

    #[must_use]
    pub fn get_logcat(&self, mid: &str, sid: &str) -> Option<LogcatHandle> {
        self.logcats
            .lock()
            .expect("logcats lock poisoned")
            .get(mid)
            .and_then(|inner| inner.get(sid))
            .cloned()
    }

    /// Remove a single logcat session; deletes the empty inner map when it
    /// was the last session for `mid` (§4.5).
    pub fn unregister_logcat(&self, mid: &str, sid: &str) {
        let mut logcats = self.logcats.lock().expect("logcats lock poisoned");
        let mut removed = false;
        if let Some(inner) = logcats.get_mut(mid) {
            removed = inner.remove(sid).is_some();
            if inner.is_empty() {
                logcats.remove(mid);
            }
        }
        drop(logcats);
        if removed {
            self.broadcast_monitor(
                "logcat left",
                serde_json::json!({"mid": mid, "sid": sid}),
            );
        }
    }

    // ---- Pending operator-WS rendezvous ----

    pub fn insert_wsctx(&self, ctx: WsContext) {
        self.wsctxs
            .lock()
            .expect("wsctxs lock poisoned")
            .insert(ctx.sid.clone(), ctx);
    }

    /// Remove and return the pending context for `sid`, if a secondary
    /// agent has just registered with it.
    pub fn take_wsctx(&self, sid: &str) -> Option<WsContext> {
        self.wsctxs.lock().expect("wsctxs lock poisoned").remove(sid)
    }

    pub fn remove_wsctx(&self, sid: &str) {
        self.wsctxs.lock().expect("wsctxs lock poisoned").remove(sid);
    }

    // ---- File transfer contexts ----

    pub fn insert_download(&self, sid: String, ctx: DownloadContext) {
        self.downloads.lock().expect("downloads lock poisoned").insert(sid, ctx);
    }

    pub fn with_download<T>(&self, sid: &str, f: impl FnOnce(&DownloadContext) -> T) -> Option<T> {
        self.downloads.lock().expect("downloads lock poisoned").get(sid).map(f)
    }

    pub fn take_download(&self, sid: &str) -> Option<DownloadContext> {
        self.downloads.lock().expect("downloads lock poisoned").remove(sid)
    }

    pub fn mark_download_ready(&self, sid: &str) {
        if let Some(ctx) = self.downloads.lock().expect("downloads lock poisoned").get_mut(sid) {
            ctx.ready = true;
        }
        self.broadcast_monitor("file download", serde_json::json!({"sid": sid}));
    }

    pub fn insert_upload(&self, sid: String, ctx: UploadContext) {
        self.uploads.lock().expect("uploads lock poisoned").insert(sid, ctx);
    }

    pub fn with_upload<T>(&self, sid: &str, f: impl FnOnce(&UploadContext) -> T) -> Option<T> {
        self.uploads.lock().expect("uploads lock poisoned").get(sid).map(f)
    }

    pub fn take_upload(&self, sid: &str) -> Option<UploadContext> {
        self.uploads.lock().expect("uploads lock poisoned").remove(sid)
    }

    /// Called by the secondary's `ConnServer` once it actually connects and
    /// sends `clear_to_upload`: marks the context ready (so the HTTP
    /// bridge's poll loop observes the connection) and hands over the body
    /// receiver, while leaving the rest of the context in the registry for
    /// the bridge to clean up via `take_upload` (mirrors the
    /// `mark_download_ready` / `take_download` split used for downloads).
    pub fn mark_upload_connected(&self, sid: &str) -> Option<mpsc::Receiver<Vec<u8>>> {
        let body_rx = {
            let mut uploads = self.uploads.lock().expect("uploads lock poisoned");
            let ctx = uploads.get_mut(sid)?;
            ctx.ready = true;
            ctx.body_rx.take()
        };
        self.broadcast_monitor("file upload", serde_json::json!({"sid": sid}));
        body_rx
    }

    // ---- Monitor ----

    pub fn subscribe_monitor(&self) -> mpsc::Receiver<MonitorEvent> {
        let (tx, rx) = mpsc::channel(MONITOR_QUEUE_DEPTH);
        self.monitor_clients.lock().expect("monitor lock poisoned").push(tx);
        rx
    }

    /// Broadcast under the registry's own lock, using non-blocking sends so
    /// a stalled subscriber is dropped rather than stalling the broadcaster
    /// (§5 "non-blocking sends ... full queue ⇒ drop that subscriber").
    pub fn broadcast_monitor(&self, event: &'static str, data: serde_json::Value) {
        let msg = MonitorEvent { event, data };
        let mut clients = self.monitor_clients.lock().expect("monitor lock poisoned");
        clients.retain(|tx| tx.try_send(msg.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_agent(mid: &str) -> AgentHandle {
        let (tx, _rx) = mpsc::channel(1);
        AgentHandle {
            mid: mid.to_string(),
            properties: serde_json::json!({}),
            cmd_tx: tx,
        }
    }

    fn dummy_logcat(mid: &str, sid: &str) -> LogcatHandle {
        let (tx, _rx) = mpsc::channel(1);
        LogcatHandle {
            mid: mid.to_string(),
            sid: sid.to_string(),
            cmd_tx: tx,
        }
    }

    #[test]
    fn duplicate_control_registration_fails() {
        let reg = Registry::new();
        reg.register_agent(dummy_agent("m1")).unwrap();
        let err = reg.register_agent(dummy_agent("m1")).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateMachineId(m) if m == "m1"));
        assert_eq!(reg.agent_count(), 1);
    }

    #[test]
    fn unregister_removes_exactly_the_matching_record() {
        let reg = Registry::new();
        reg.register_agent(dummy_agent("m1")).unwrap();
        reg.register_agent(dummy_agent("m2")).unwrap();
        reg.unregister_agent("m1");
        assert!(reg.get_agent("m1").is_none());
        assert!(reg.get_agent("m2").is_some());
    }

    #[test]
    fn duplicate_logcat_session_fails() {
        let reg = Registry::new();
        reg.register_logcat(dummy_logcat("m1", "s1")).unwrap();
        let err = reg.register_logcat(dummy_logcat("m1", "s1")).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateLogcatSession(..)));
    }

    #[test]
    fn last_logcat_unregister_drops_empty_inner_map() {
        let reg = Registry::new();
        reg.register_logcat(dummy_logcat("m1", "s1")).unwrap();
        reg.unregister_logcat("m1", "s1");
        assert!(reg.logcats.lock().unwrap().get("m1").is_none());
    }

    #[test]
    fn wsctx_rendezvous_round_trip() {
        let reg = Registry::new();
        let (tx, _rx) = mpsc::channel(1);
        let (_to_agent_tx, to_agent_rx) = mpsc::channel(1);
        reg.insert_wsctx(WsContext { sid: "s1".into(), sink: tx, to_agent_rx });
        assert!(reg.take_wsctx("s1").is_some());
        assert!(reg.take_wsctx("s1").is_none());
    }

    #[test]
    fn monitor_broadcast_reaches_subscribers() {
        let reg = Registry::new();
        let mut rx = reg.subscribe_monitor();
        reg.register_agent(dummy_agent("m1")).unwrap();
        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.event, "agent joined");
    }

    #[test]
    fn upload_not_ready_until_connected() {
        let reg = Registry::new();
        let (_body_tx, body_rx) = mpsc::channel(1);
        reg.insert_upload(
            "s1".into(),
            UploadContext { dest: "/tmp/x".into(), perm: 0o644, ready: false, body_rx: Some(body_rx) },
        );
        assert_eq!(reg.with_upload("s1", |ctx| ctx.ready), Some(false));
        let got = reg.mark_upload_connected("s1").expect("context must still be present");
        drop(got);
        assert_eq!(reg.with_upload("s1", |ctx| ctx.ready), Some(true));
        assert!(reg.take_upload("s1").is_some());
    }

    #[test]
    fn mark_upload_connected_on_missing_sid_returns_none() {
        let reg = Registry::new();
        assert!(reg.mark_upload_connected("nope").is_none());
    }

    #[test]
    fn full_monitor_queue_drops_subscriber_not_broadcaster() {
        let reg = Registry::new();
        let rx = reg.subscribe_monitor();
        // Fill the subscriber's queue without ever reading.
        for _ in 0..MONITOR_QUEUE_DEPTH + 5 {
            reg.broadcast_monitor("agent joined", serde_json::json!([]));
        }
        drop(rx);
        // Broadcasting again must not panic or block even though the
        // receiver is gone / was full.
        reg.broadcast_monitor("agent joined", serde_json::json!([]));
        assert_eq!(reg.monitor_clients.lock().unwrap().len(), 0);
    }
}
