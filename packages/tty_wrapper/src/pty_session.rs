use anyhow::{Context, Result, anyhow};
use portable_pty::PtySize;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::pty_actor::{PtyActor, PtyRequest};

/// Bytes of recent output kept for replay to newly attached clients.
const REPLAY_BUFFER_LIMIT: usize = 256 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputEvent {
    pub data: String,
    pub timestamp: i64,
}

/// One pty child plus the output fan-out that WebSocket clients attach to.
pub struct PtySession {
    sender: mpsc::Sender<PtyRequest>,
    replay: Arc<RwLock<ReplayBuffer>>,
    output_tx: broadcast::Sender<OutputEvent>,
    exited: CancellationToken,
}

#[derive(Default)]
struct ReplayBuffer {
    chunks: VecDeque<String>,
    bytes: usize,
}

impl ReplayBuffer {
    fn push(&mut self, chunk: String) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.bytes > REPLAY_BUFFER_LIMIT {
            match self.chunks.pop_front() {
                Some(old) => self.bytes -= old.len(),
                None => break,
            }
        }
    }
}

impl PtySession {
    pub fn spawn(command: &str, args: &[String], working_dir: Option<&str>) -> Result<Self> {
        let exited = CancellationToken::new();
        let (sender, mut raw_rx) = PtyActor::spawn(command, args, working_dir, exited.clone())?;

        let (output_tx, _) = broadcast::channel(1024);
        let replay = Arc::new(RwLock::new(ReplayBuffer::default()));

        let replay_clone = replay.clone();
        let tx_clone = output_tx.clone();
        tokio::spawn(async move {
            loop {
                match raw_rx.recv().await {
                    Ok(event) => {
                        replay_clone.write().await.push(event.data.clone());
                        let _ = tx_clone.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self {
            sender,
            replay,
            output_tx,
            exited,
        })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> PtyRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("PTY actor has stopped"))?;
        response.await.context("PTY actor dropped the request")
    }

    pub async fn write_input(&self, data: &[u8]) -> Result<usize> {
        let bytes = data.to_vec();
        self.request(|reply| PtyRequest::Write { bytes, reply }).await?
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.request(|reply| PtyRequest::Resize { size, reply }).await?
    }

    pub async fn get_state(&self) -> Result<PtyState> {
        self.request(|reply| PtyRequest::State { reply }).await
    }

    /// Hang up and reap the child. Returns once the child is gone; a session
    /// whose actor already stopped returns immediately.
    pub async fn close(&self) {
        let _ = self.request(|reply| PtyRequest::Close { reply }).await;
    }

    /// Output buffered so far, oldest first.
    pub async fn replay(&self) -> String {
        let replay = self.replay.read().await;
        replay.chunks.iter().map(String::as_str).collect()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputEvent> {
        self.output_tx.subscribe()
    }

    /// Cancelled when the child closed its side of the pty.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_buffer_drops_oldest_chunks() {
        let mut buffer = ReplayBuffer::default();
        let chunk = "x".repeat(REPLAY_BUFFER_LIMIT / 2);
        buffer.push(chunk.clone());
        buffer.push(chunk.clone());
        buffer.push("tail".to_string());

        assert!(buffer.bytes <= REPLAY_BUFFER_LIMIT);
        assert_eq!(buffer.chunks.back().map(String::as_str), Some("tail"));
        assert_eq!(buffer.chunks.len(), 2);
    }

    #[test]
    fn replay_buffer_keeps_small_output() {
        let mut buffer = ReplayBuffer::default();
        buffer.push("hello ".to_string());
        buffer.push("world".to_string());
        assert_eq!(buffer.bytes, 11);
        assert_eq!(buffer.chunks.len(), 2);
    }
}
