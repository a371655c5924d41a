//! Forward secondary session (§4.4 "Forward").
//!
//! Dials `(host, port)` on the agent's LAN and splices it verbatim with the
//! socket back to the coordinator, in either direction, until either side
//! closes.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{LogFormat, SessionMode};
use crate::rpc::ReadEvent;

use super::AgentIdentity;

pub async fn run(
    coordinator_addr: &str,
    identity: &AgentIdentity,
    sid: &str,
    host: &str,
    port: u16,
) -> Result<()> {
    let (_core, mut writer, mut read_rx) = super::dial_and_register(
        coordinator_addr,
        &identity.mid,
        sid,
        SessionMode::Forward,
        LogFormat::default(),
        serde_json::Value::Null,
    )
    .await
    .context("registering Forward secondary session")?;

    let mut target = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("dialing forward target {host}:{port}"))?;

    // The coordinator side delivers bytes as `ReadEvent`s over a channel
    // rather than a raw socket, so the two directions are bridged by hand
    // instead of with `tokio::io::copy_bidirectional`.
    let mut target_buf = [0u8; 8192];
    loop {
        tokio::select! {
            biased;
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Chunk(bytes)) => {
                        if target.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(ReadEvent::Eof) | Some(ReadEvent::Error(_)) | None => break,
                }
            }
            result = target.read(&mut target_buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&target_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}
