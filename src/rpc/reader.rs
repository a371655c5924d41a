//! Reader pump: a dedicated task that turns an `AsyncRead` half into a
//! channel of byte chunks, so the owning task's select loop never blocks on
//! socket reads directly.
//!
//! Grounded in the teacher's `agent::spawn::spawn_server_reader_thread` (a
//! dedicated thread reading a PTY master into a channel) and
//! `socket::server`'s accept-loop-emits-event shape, translated to async:
//! here the producer is a tokio task instead of an OS thread, and it forwards
//! raw chunks rather than pre-parsed notifications — parsing stays in
//! `RpcCore`.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A chunk read from the socket, or the terminal error/EOF condition.
#[derive(Debug)]
pub enum ReadEvent {
    Chunk(Vec<u8>),
    Eof,
    Error(std::io::Error),
}

/// Spawn a task that reads from `reader` in a loop, forwarding each chunk
/// (and finally an `Eof` or `Error`) on `tx`. The task exits once `tx` is
/// dropped by the receiver or a terminal event has been sent.
pub fn spawn_reader_pump<R>(mut reader: R, tx: mpsc::Sender<ReadEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(ReadEvent::Eof).await;
                    return;
                }
                Ok(n) => {
                    if tx.send(ReadEvent::Chunk(buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReadEvent::Error(e)).await;
                    return;
                }
            }
        }
    })
}
