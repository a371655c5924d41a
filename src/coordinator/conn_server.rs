//! Connection server (C4): coordinator-side state machine for one accepted
//! agent TCP connection (§4.4).
//!
//! One `ConnServer` owns one connection from accept to close. It is the
//! sole mutator of that connection's `RpcCore` and mode state (§5). Bytes
//! come from a dedicated reader-pump task (`rpc::reader`); everything else
//! — operator commands, the liveness timer, registry lookups — is driven
//! from this task's own select loop, mirroring the teacher's
//! `broker::connection::BrokerConnection` split between a blocking I/O core
//! and an async owning task.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::constants;
use crate::error::RegistrationError;
use crate::protocol::{LogFormat, ParseMode, RegisterPayload, Request, Response, SessionMode};
use crate::rpc::{spawn_reader_pump, ReadEvent, RpcCore};

use super::registry::{
    AgentHandle, ControlCommand, DownloadContext, LogcatCommand, LogcatHandle, Registry, WsMessage,
    WsSink,
};
use super::ring_buffer::RingBuffer;

/// Channel depth for the operator command channel handed to a registered
/// Control agent (§4.4 "Operator command channel").
const CMD_CHANNEL_DEPTH: usize = 32;

/// Runs one accepted agent connection to completion. Never returns early on
/// recoverable faults — only on transport loss, ping timeout, or explicit
/// stop.
pub async fn run(stream: TcpStream, peer: std::net::SocketAddr, registry: Arc<Registry>) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = tokio::io::split(stream);
    let (read_tx, mut read_rx) = mpsc::channel::<ReadEvent>(64);
    let _reader = spawn_reader_pump(read_half, read_tx);

    let mut core = RpcCore::new();
    let mut writer = write_half;

    let registered = match registration_gate(&mut core, &mut writer, &mut read_rx).await {
        Some(r) => r,
        None => return,
    };

    log::info!(
        "connection from {peer} registered mid={:?} sid={:?} mode={:?}",
        registered.mid,
        registered.sid,
        registered.mode
    );

    match registered.mode {
        SessionMode::Control => run_control(registered, core, writer, read_rx, registry).await,
        SessionMode::Terminal | SessionMode::Shell | SessionMode::Forward => {
            run_stream_bridge(registered, writer, read_rx, registry).await;
        }
        SessionMode::Logcat => run_logcat(registered, writer, read_rx, registry).await,
        SessionMode::File => run_file(registered, core, writer, read_rx, registry).await,
    }
}

struct Registered {
    mid: String,
    sid: String,
    mode: SessionMode,
    format: LogFormat,
    properties: serde_json::Value,
    /// Any bytes that arrived in the same read as the register frame,
    /// preserved by single-frame parsing (§4.1, §4.4 "For Logcat, any bytes
    /// that arrived in the same read ... are immediately forwarded").
    residual: Vec<u8>,
}

/// Parses frames in single-frame mode until the first (and only the first)
/// frame — which must be `register` — is consumed. Returns `None` if the
/// connection died before a valid registration completed.
async fn registration_gate(
    core: &mut RpcCore,
    writer: &mut WriteHalf<TcpStream>,
    read_rx: &mut mpsc::Receiver<ReadEvent>,
) -> Option<Registered> {
    loop {
        let event = read_rx.recv().await?;
        let chunk = match event {
            ReadEvent::Chunk(c) => c,
            ReadEvent::Eof | ReadEvent::Error(_) => return None,
        };
        let requests = core.parse_requests(&chunk, ParseMode::Single);
        let Some(req) = requests.into_iter().next() else {
            continue;
        };
        if req.name != "register" {
            log::warn!("first frame was {:?}, not register; dropping connection", req.name);
            return None;
        }
        let payload: Result<RegisterPayload, _> = serde_json::from_value(req.payload.clone());
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                let res = Response::failure(req.rid.clone(), format!("malformed register: {e}"));
                let _ = writer.write_all(&core.send_response(&res)).await;
                return None;
            }
        };
        if payload.mid.is_empty() {
            let res = Response::failure(req.rid, RegistrationError::EmptyMachineId.to_string());
            let _ = writer.write_all(&core.send_response(&res)).await;
            return None;
        }
        if payload.sid.is_empty() {
            let res = Response::failure(req.rid, RegistrationError::EmptySessionId.to_string());
            let _ = writer.write_all(&core.send_response(&res)).await;
            return None;
        }
        let residual = core.take_raw_residual();
        let res = Response::success(req.rid, serde_json::Value::Null);
        if writer.write_all(&core.send_response(&res)).await.is_err() {
            return None;
        }
        return Some(Registered {
            mid: payload.mid,
            sid: payload.sid,
            mode: payload.mode,
            format: payload.format,
            properties: payload.properties,
            residual,
        });
    }
}

async fn run_control(
    registered: Registered,
    mut core: RpcCore,
    mut writer: WriteHalf<TcpStream>,
    mut read_rx: mpsc::Receiver<ReadEvent>,
    registry: Arc<Registry>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ControlCommand>(CMD_CHANNEL_DEPTH);
    let handle = AgentHandle {
        mid: registered.mid.clone(),
        properties: registered.properties.clone(),
        cmd_tx,
    };
    if let Err(e) = registry.register_agent(handle) {
        log::warn!("control registration rejected: {e}");
        return;
    }

    let mut last_ping = Instant::now();
    let mut sweep = interval(constants::TIMEOUT_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Chunk(chunk)) => {
                        let requests = core.parse_requests(&chunk, ParseMode::Multi);
                        for req in requests {
                            if req.name == "ping" {
                                last_ping = Instant::now();
                            }
                            if let Some(bytes) = handle_control_request(&mut core, &req) {
                                if writer.write_all(&bytes).await.is_err() {
                                    registry.unregister_agent(&registered.mid);
                                    return;
                                }
                            }
                        }
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => {
                        registry.unregister_agent(&registered.mid);
                        return;
                    }
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                if let Some(bytes) = dispatch_control_command(&mut core, cmd) {
                    if writer.write_all(&bytes).await.is_err() {
                        registry.unregister_agent(&registered.mid);
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                core.scan_for_timeouts();
                if last_ping.elapsed() > constants::PING_TIMEOUT {
                    log::warn!("ping timeout for mid={:?}", registered.mid);
                    registry.unregister_agent(&registered.mid);
                    return;
                }
            }
        }
    }
}

/// Handles a Control-mode inbound Request that the coordinator must answer
/// itself (`ping`, `request_to_download` is File-mode only, so Control only
/// ever needs to ack `ping` here — everything else inbound on Control is a
/// Response to a command we issued, already consumed by `parse_requests`).
fn handle_control_request(core: &mut RpcCore, req: &Request) -> Option<Vec<u8>> {
    if req.name == "ping" {
        let res = Response::success(req.rid.clone(), serde_json::json!({"response": "pong"}));
        return Some(core.send_response(&res));
    }
    log::debug!("unexpected inbound request on Control connection: {}", req.name);
    None
}

fn dispatch_control_command(core: &mut RpcCore, cmd: ControlCommand) -> Option<Vec<u8>> {
    match cmd {
        ControlCommand::SpawnTerminal { sid, reply } => {
            Some(core.send_request(
                &Request::new("terminal", 30, serde_json::json!({"sid": sid})),
                Some(reply_handler(reply)),
            ))
        }
        ControlCommand::SpawnShell { sid, command, reply } => Some(core.send_request(
            &Request::new("shell", 30, serde_json::json!({"sid": sid, "command": command})),
            Some(reply_handler(reply)),
        )),
        ControlCommand::SpawnForward { sid, host, port, reply } => Some(core.send_request(
            &Request::new(
                "forward",
                30,
                serde_json::json!({"sid": sid, "host": host, "port": port}),
            ),
            Some(reply_handler(reply)),
        )),
        ControlCommand::SpawnFileDownload { sid, filename, reply } => Some(core.send_request(
            &Request::new(
                "file_download",
                30,
                serde_json::json!({"sid": sid, "filename": filename}),
            ),
            Some(reply_handler(reply)),
        )),
        ControlCommand::SpawnFileUpload {
            sid,
            terminal_sid,
            filename,
            dest,
            perm,
            check_only,
            reply,
        } => Some(core.send_request(
            &Request::new(
                "file_upload",
                30,
                serde_json::json!({
                    "sid": sid,
                    "terminal_sid": terminal_sid,
                    "filename": filename,
                    "dest": dest,
                    "perm": perm,
                    "check_only": check_only,
                }),
            ),
            Some(reply_handler(reply)),
        )),
        ControlCommand::ListTree { path, reply } => Some(core.send_request(
            &Request::new("list_tree", 30, serde_json::json!({"path": path})),
            Some(reply_handler(reply)),
        )),
        ControlCommand::Fstat { path, reply } => Some(core.send_request(
            &Request::new("fstat", 30, serde_json::json!({"path": path})),
            Some(reply_handler(reply)),
        )),
        ControlCommand::CreateSymlink { target, link, reply } => Some(core.send_request(
            &Request::new(
                "create_symlink",
                30,
                serde_json::json!({"target": target, "link": link}),
            ),
            Some(reply_handler(reply)),
        )),
        ControlCommand::Mkdir { path, reply } => Some(core.send_request(
            &Request::new("mkdir", 30, serde_json::json!({"path": path})),
            Some(reply_handler(reply)),
        )),
        ControlCommand::ClearToDownload { .. } => Some(
            core.send_request(&Request::new("clear_to_download", -1, serde_json::json!({})), None),
        ),
        ControlCommand::Upgrade => {
            Some(core.send_request(&Request::new("upgrade", -1, serde_json::json!({})), None))
        }
    }
}

fn reply_handler(reply: tokio::sync::oneshot::Sender<Response>) -> crate::rpc::ResponseHandler {
    Box::new(move |res| {
        let response = res.unwrap_or_else(|| Response::failure("", "request timed out"));
        let _ = reply.send(response);
    })
}

/// Terminal/Shell/Forward: after rendezvous, bytes flow verbatim in both
/// directions between the agent socket and the operator WebSocket (§4.4,
/// §5 ordering guarantee).
async fn run_stream_bridge(
    registered: Registered,
    mut writer: WriteHalf<TcpStream>,
    mut read_rx: mpsc::Receiver<ReadEvent>,
    registry: Arc<Registry>,
) {
    let Some(mut ctx) = registry.take_wsctx(&registered.sid) else {
        log::warn!(
            "no pending operator for sid={:?} (mode={:?}); closing",
            registered.sid,
            registered.mode
        );
        return;
    };

    if matches!(registered.mode, SessionMode::Terminal) {
        let sid_frame = serde_json::json!({"type": "sid", "data": registered.sid}).to_string();
        if ctx.sink.send(WsMessage::Text(sid_frame)).await.is_err() {
            return;
        }
    }

    if !registered.residual.is_empty() && ctx.sink.send(WsMessage::Binary(registered.residual)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Chunk(chunk)) => {
                        if ctx.sink.send(WsMessage::Binary(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => {
                        let _ = ctx.sink.send(WsMessage::Close).await;
                        return;
                    }
                }
            }
            from_operator = ctx.to_agent_rx.recv() => {
                match from_operator {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        // Operator WS closed; half-close toward the agent so
                        // it can observe EOF on its end too.
                        let _ = writer.shutdown().await;
                        return;
                    }
                }
            }
        }
    }
}

/// Logcat: the agent connection is the log *source*. Bytes are appended to
/// a ring buffer this task owns exclusively and broadcast to every
/// subscribing operator WS (§4.4, §5).
async fn run_logcat(
    registered: Registered,
    _writer: WriteHalf<TcpStream>,
    mut read_rx: mpsc::Receiver<ReadEvent>,
    registry: Arc<Registry>,
) {
    let mut ring = RingBuffer::for_logcat();
    if !registered.residual.is_empty() {
        ring.push(&registered.residual);
    }
    let mut subscribers: Vec<WsSink> = Vec::new();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<LogcatCommand>(CMD_CHANNEL_DEPTH);

    let handle = LogcatHandle {
        mid: registered.mid.clone(),
        sid: registered.sid.clone(),
        cmd_tx,
    };
    if let Err(e) = registry.register_logcat(handle) {
        log::warn!("logcat registration rejected: {e}");
        return;
    }

    if !registered.residual.is_empty() {
        broadcast_logcat(&mut subscribers, &registered.residual, registered.format).await;
    }

    loop {
        tokio::select! {
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Chunk(chunk)) => {
                        ring.push(&chunk);
                        broadcast_logcat(&mut subscribers, &chunk, registered.format).await;
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => {
                        registry.unregister_logcat(&registered.mid, &registered.sid);
                        return;
                    }
                }
            }
            Some(cmd) = cmd_rx.recv() => match cmd {
                LogcatCommand::Subscribe { sink } => {
                    if sink.send(WsMessage::Binary(ring.to_vec())).await.is_ok() {
                        subscribers.push(sink);
                    }
                }
            }
        }
    }
}

async fn broadcast_logcat(subscribers: &mut Vec<WsSink>, chunk: &[u8], format: LogFormat) {
    let framed = match format {
        LogFormat::Term => chunk.to_vec(),
        LogFormat::Text => to_vt_newline(chunk),
    };
    let mut keep = Vec::with_capacity(subscribers.len());
    for sink in subscribers.drain(..) {
        if sink.send(WsMessage::Binary(framed.clone())).await.is_ok() {
            keep.push(sink);
        }
    }
    *subscribers = keep;
}

/// Rewrites bare `\n` to `\r\n` for text-format Logcat framing (§4.4, §8
/// "`ToVTNewLine` applied twice equals applied once on text without bare
/// CRs"). Idempotent: a `\r\n` already present is left untouched because the
/// scan only inserts a `\r` before a `\n` not already preceded by one.
fn to_vt_newline(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut prev = 0u8;
    for &b in input {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// File mode dispatches to the download or upload handshake depending on
/// which request the secondary agent sends first (§4.7).
async fn run_file(
    registered: Registered,
    mut core: RpcCore,
    mut writer: WriteHalf<TcpStream>,
    mut read_rx: mpsc::Receiver<ReadEvent>,
    registry: Arc<Registry>,
) {
    loop {
        let event = read_rx.recv().await;
        let chunk = match event {
            Some(ReadEvent::Chunk(c)) => c,
            _ => return,
        };
        let requests = core.parse_requests(&chunk, ParseMode::Single);
        let Some(req) = requests.into_iter().next() else {
            continue;
        };
        match req.name.as_str() {
            "request_to_download" => {
                let res = Response::success(req.rid.clone(), serde_json::Value::Null);
                if writer.write_all(&core.send_response(&res)).await.is_err() {
                    return;
                }
                run_file_download(registered, req, writer, core, read_rx, registry).await;
                return;
            }
            "clear_to_upload" => {
                run_file_upload(registered, writer, read_rx, registry).await;
                return;
            }
            other => {
                log::warn!("unexpected first frame on File connection: {other}");
                return;
            }
        }
    }
}

async fn run_file_download(
    registered: Registered,
    req: Request,
    mut writer: WriteHalf<TcpStream>,
    mut core: RpcCore,
    mut read_rx: mpsc::Receiver<ReadEvent>,
    registry: Arc<Registry>,
) {
    #[derive(serde::Deserialize)]
    struct Payload {
        terminal_sid: String,
        filename: String,
        size: u64,
    }
    let payload: Payload = match serde_json::from_value(req.payload) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("malformed request_to_download payload: {e}");
            return;
        }
    };

    let (data_tx, data_rx) = mpsc::channel::<Option<Vec<u8>>>(16);
    let (clear_tx, clear_rx) = tokio::sync::oneshot::channel::<()>();
    registry.insert_download(
        registered.sid.clone(),
        DownloadContext {
            name: payload.filename,
            size: payload.size,
            terminal_sid: payload.terminal_sid,
            ready: false,
            data_rx: Some(data_rx),
            clear_tx: Some(clear_tx),
        },
    );
    registry.mark_download_ready(&registered.sid);

    // Wait for the HTTP bridge's go-ahead, then send `clear_to_download`
    // (fire-and-forget) before draining raw file bytes (§4.7).
    if clear_rx.await.is_err() {
        registry.take_download(&registered.sid);
        return;
    }
    let bytes = core.send_request(&Request::new("clear_to_download", -1, serde_json::json!({})), None);
    if writer.write_all(&bytes).await.is_err() {
        let _ = data_tx.send(None).await;
        return;
    }

    loop {
        match read_rx.recv().await {
            Some(ReadEvent::Chunk(chunk)) => {
                if data_tx.send(Some(chunk)).await.is_err() {
                    return;
                }
            }
            _ => {
                let _ = data_tx.send(None).await;
                return;
            }
        }
    }
}

async fn run_file_upload(
    registered: Registered,
    mut writer: WriteHalf<TcpStream>,
    mut read_rx: mpsc::Receiver<ReadEvent>,
    registry: Arc<Registry>,
) {
    let Some(mut body_rx) = registry.mark_upload_connected(&registered.sid) else {
        log::warn!("clear_to_upload with no pending upload context for sid={:?}", registered.sid);
        return;
    };

    // Drain the HTTP bridge's multipart body onto the wire; shut the write
    // half down once the bridge drops its sender (§4.7 "permission bits
    // applied by the agent after close").
    loop {
        tokio::select! {
            biased;
            chunk = body_rx.recv() => {
                match chunk {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => return,
                    Some(ReadEvent::Chunk(_)) => {
                        log::debug!("ignoring unexpected bytes from agent during upload");
                    }
                }
            }
        }
    }
    // Drain remaining reader-pump events until the agent closes, so the
    // task exits once the upload is fully acknowledged.
    while !matches!(read_rx.recv().await, Some(ReadEvent::Eof) | None) {}
}
