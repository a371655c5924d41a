//! Terminal secondary session (§4.4 "Terminal").
//!
//! Allocates a PTY via `portable-pty` (same crate the teacher's orphaned
//! `agent::pty` module used for its own TUI sessions) and bridges it
//! verbatim with the socket back to the coordinator. Unlike the teacher's
//! PTY server, there is no `vt100::Parser` here: the operator's browser
//! terminal does its own rendering, so the agent only needs to move bytes
//! and intercept one escape sequence for resize.
//!
//! CSI `ESC [ 8 ; rows ; cols t` arriving from the coordinator is parsed out
//! of the inbound byte stream and applied as a PTY resize instead of being
//! written into the PTY (§4.3 "CSI resize interception happens on the agent
//! side").
//!
//! When a `tty_device` is supplied (either by the coordinator's own
//! request, or by a local client's earlier `register_tty` IPC call), the
//! agent opens that existing device directly instead of allocating a new
//! PTY and shell. There is no PTY master on this side of an attached
//! device, so resize escapes pass through unintercepted — whatever process
//! already owns that tty handles its own resizing.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{LogFormat, SessionMode};
use crate::rpc::ReadEvent;

use super::AgentIdentity;

pub async fn run(
    coordinator_addr: &str,
    identity: &AgentIdentity,
    sid: &str,
    tty_device: Option<&str>,
) -> Result<()> {
    let (_core, mut writer, mut read_rx) = super::dial_and_register(
        coordinator_addr,
        &identity.mid,
        sid,
        SessionMode::Terminal,
        LogFormat::default(),
        serde_json::Value::Null,
    )
    .await
    .context("registering Terminal secondary session")?;

    if let Some(device) = tty_device {
        return run_attached(device, &mut writer, &mut read_rx).await;
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows: 24, cols: 80, pixel_width: 0, pixel_height: 0 })
        .context("allocating PTY")?;

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let mut cmd = CommandBuilder::new(shell);
    cmd.env("TERM", "xterm-256color");
    let mut child = pair.slave.spawn_command(cmd).context("spawning shell in PTY")?;
    drop(pair.slave);

    let mut pty_reader = pair.master.try_clone_reader().context("cloning PTY reader")?;
    let mut pty_writer = pair.master.take_writer().context("taking PTY writer")?;
    let master = pair.master;

    let (pty_tx, mut pty_rx) = mpsc::channel::<Vec<u8>>(64);
    let pty_pump = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match std::io::Read::read(&mut pty_reader, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if pty_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut resize_parser = ResizeParser::default();
    loop {
        tokio::select! {
            biased;
            chunk = pty_rx.recv() => {
                match chunk {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Chunk(bytes)) => {
                        for piece in resize_parser.feed(&bytes) {
                            match piece {
                                Piece::Data(data) => {
                                    if std::io::Write::write_all(&mut pty_writer, &data).is_err() {
                                        break;
                                    }
                                }
                                Piece::Resize { rows, cols } => {
                                    let _ = master.resize(PtySize {
                                        rows,
                                        cols,
                                        pixel_width: 0,
                                        pixel_height: 0,
                                    });
                                }
                            }
                        }
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => break,
                }
            }
        }
    }

    let _ = child.kill();
    pty_pump.abort();
    Ok(())
}

/// Bridges an already-registered tty device straight to the socket, with no
/// PTY allocation and no resize interception (there's no master side to
/// resize here).
async fn run_attached(
    device: &str,
    writer: &mut WriteHalf<TcpStream>,
    read_rx: &mut mpsc::Receiver<ReadEvent>,
) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .await
        .with_context(|| format!("opening registered tty device {device}"))?;
    let (mut tty_read, mut tty_write) = tokio::io::split(file);

    let (tty_tx, mut tty_rx) = mpsc::channel::<Vec<u8>>(64);
    let tty_pump = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match tty_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tty_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            biased;
            chunk = tty_rx.recv() => {
                match chunk {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Chunk(bytes)) => {
                        if tty_write.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => break,
                }
            }
        }
    }

    tty_pump.abort();
    Ok(())
}

enum Piece {
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

/// Incrementally extracts `ESC [ 8 ; rows ; cols t` resize sequences from an
/// inbound byte stream, passing everything else through untouched.
#[derive(Default)]
struct ResizeParser {
    pending: Vec<u8>,
}

impl ResizeParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Piece> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut data_run = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i] == 0x1b && self.pending[i..].starts_with(b"\x1b[8;") {
                if let Some(end) = self.pending[i..].iter().position(|&b| b == b't') {
                    let seq = &self.pending[i + 4..i + end];
                    if let Some((rows, cols)) = parse_rows_cols(seq) {
                        if !data_run.is_empty() {
                            out.push(Piece::Data(std::mem::take(&mut data_run)));
                        }
                        out.push(Piece::Resize { rows, cols });
                    }
                    i += end + 1;
                    continue;
                }
                // Incomplete escape sequence at the end of the buffer; keep
                // it for the next feed.
                break;
            }
            data_run.push(self.pending[i]);
            i += 1;
        }
        if !data_run.is_empty() {
            out.push(Piece::Data(data_run));
        }
        self.pending.drain(..i);
        out
    }
}

fn parse_rows_cols(seq: &[u8]) -> Option<(u16, u16)> {
    let text = std::str::from_utf8(seq).ok()?;
    let mut parts = text.split(';');
    let rows: u16 = parts.next()?.parse().ok()?;
    let cols: u16 = parts.next()?.parse().ok()?;
    Some((rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_plain_data_through_untouched() {
        let mut parser = ResizeParser::default();
        let pieces = parser.feed(b"hello world");
        assert_eq!(pieces.len(), 1);
        assert!(matches!(&pieces[0], Piece::Data(d) if d == b"hello world"));
    }

    #[test]
    fn extracts_resize_sequence_between_data_runs() {
        let mut parser = ResizeParser::default();
        let mut input = b"before".to_vec();
        input.extend_from_slice(b"\x1b[8;40;120t");
        input.extend_from_slice(b"after");
        let pieces = parser.feed(&input);
        assert_eq!(pieces.len(), 3);
        assert!(matches!(&pieces[0], Piece::Data(d) if d == b"before"));
        assert!(matches!(pieces[1], Piece::Resize { rows: 40, cols: 120 }));
        assert!(matches!(&pieces[2], Piece::Data(d) if d == b"after"));
    }

    #[test]
    fn incomplete_escape_sequence_is_retained_across_feeds() {
        let mut parser = ResizeParser::default();
        let pieces = parser.feed(b"data\x1b[8;40;");
        assert_eq!(pieces.len(), 1);
        assert!(matches!(&pieces[0], Piece::Data(d) if d == b"data"));
        let pieces2 = parser.feed(b"120t");
        assert_eq!(pieces2.len(), 1);
        assert!(matches!(pieces2[0], Piece::Resize { rows: 40, cols: 120 }));
    }
}
