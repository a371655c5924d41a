//! Shell secondary session (§4.4 "Shell").
//!
//! Runs `sh -c <command>`, merges stdout/stderr onto the socket, and copies
//! socket bytes to the child's stdin verbatim except for one sentinel: the
//! `STDIN_CLOSED_TOKEN` literal closes stdin instead of being written to the
//! child, letting line-buffered tools (`cat`, `read`) see EOF without
//! tearing down the whole session.

use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::constants;
use crate::protocol::{LogFormat, SessionMode};
use crate::rpc::ReadEvent;

use super::AgentIdentity;

pub async fn run(coordinator_addr: &str, identity: &AgentIdentity, sid: &str, command: &str) -> Result<()> {
    let (_core, mut writer, mut read_rx) = super::dial_and_register(
        coordinator_addr,
        &identity.mid,
        sid,
        SessionMode::Shell,
        LogFormat::default(),
        serde_json::Value::Null,
    )
    .await
    .context("registering Shell secondary session")?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning shell command")?;

    let mut stdin = Some(child.stdin.take().context("child stdin missing")?);
    let mut stdout = child.stdout.take().context("child stdout missing")?;
    let mut stderr = child.stderr.take().context("child stderr missing")?;

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let stdout_tx = out_tx.clone();
    tokio::spawn(async move { pipe_to_channel(&mut stdout, stdout_tx).await });
    tokio::spawn(async move { pipe_to_channel(&mut stderr, out_tx).await });

    loop {
        tokio::select! {
            biased;
            chunk = out_rx.recv() => {
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
                        if bytes == constants::STDIN_CLOSED_TOKEN {
                            stdin = None;
                            continue;
                        }
                        if let Some(sink) = stdin.as_mut() {
                            if sink.write_all(&bytes).await.is_err() {
                                stdin = None;
                            }
                        }
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => break,
                }
            }
            status = child.wait() => {
                log::debug!("shell sid={sid:?} exited: {status:?}");
                break;
            }
        }
    }

    let _ = child.kill().await;
    Ok(())
}

async fn pipe_to_channel<R: tokio::io::AsyncRead + Unpin>(reader: &mut R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}
