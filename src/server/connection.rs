//! One control connection
//!
//! Requests are handled concurrently; replies and status broadcasts share a
//! single writer task so lines never interleave.

use crate::commands::{CommandBus, CommandReply, CommandRequest};
use crate::sweep::StatusBroadcast;
use crate::utils::AppError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

const OUTBOUND_QUEUE: usize = 256;

pub struct Connection {
    session_id: u64,
    bus: CommandBus,
    status: broadcast::Receiver<StatusBroadcast>,
}

impl Connection {
    pub fn new(session_id: u64, bus: CommandBus, status: broadcast::Receiver<StatusBroadcast>) -> Self {
        Self {
            session_id,
            bus,
            status,
        }
    }

    pub async fn run(self, socket: TcpStream) -> std::io::Result<()> {
        let Connection {
            session_id,
            bus,
            mut status,
        } = self;
        let (reader, mut writer) = socket.into_split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        let write_task = tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let status_tx = tx.clone();
        let status_task = tokio::spawn(async move {
            loop {
                match status.recv().await {
                    Ok(message) => {
                        let Ok(line) = serde_json::to_string(&message) else {
                            continue;
                        };
                        if status_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(session_id = session_id, skipped = skipped, "Status broadcasts dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            let request: CommandRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    tracing::debug!(session_id = session_id, error = %e, "Malformed request");
                    send_reply(&tx, CommandReply::err(request_id(&line), AppError::from(e))).await;
                    continue;
                }
            };

            let bus = bus.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = bus.handle(request).await;
                send_reply(&tx, reply).await;
            });
        };

        status_task.abort();
        drop(tx);
        // In-flight replies still hold senders; the writer drains them first.
        let _ = write_task.await;
        result
    }
}

async fn send_reply(tx: &mpsc::Sender<String>, reply: CommandReply) {
    match serde_json::to_string(&reply) {
        Ok(line) => {
            let _ = tx.send(line).await;
        }
        Err(e) => tracing::error!(error = %e, "Could not encode reply"),
    }
}

/// Best-effort id from a request that failed to parse
fn request_id(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_recovery() {
        assert_eq!(request_id(r#"{"id":"42","cmd":7}"#), "42");
        assert_eq!(request_id("not json"), "");
    }
}
