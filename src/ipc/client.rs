//! IPC client (§4.5): the control-surface and intelligence-peer side of the
//! Unix domain socket connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

use super::protocol::Envelope;
use super::server::MessageHandler;

pub struct IpcClient {
    socket_path: PathBuf,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            listen_task: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn connect(&self) -> AppResult<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| AppError::bind_failed(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(read_half));
        *self.writer.lock().await = Some(write_half);
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.listen_task.lock().await.take() {
            task.abort();
        }
        *self.writer.lock().await = None;
        *self.reader.lock().await = None;
    }

    pub async fn send_message(&self, envelope: &Envelope) -> AppResult<()> {
        let line = envelope.to_line()?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| AppError::peer_disconnected("client is not connected"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::peer_disconnected(e.to_string()))
    }

    /// Read exactly one message. Mutually exclusive with `start_listening`
    /// on the same connection — both drain the same reader.
    pub async fn receive_message(&self) -> AppResult<Envelope> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| AppError::peer_disconnected("client is not connected"))?;

        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| AppError::peer_disconnected(e.to_string()))?;
        if n == 0 {
            return Err(AppError::peer_disconnected("server closed the connection"));
        }
        Envelope::from_line(&line)
    }

    /// Spawn a background loop that dispatches every received message to
    /// `handler`, until disconnect or a read error.
    pub async fn start_listening(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> AppResult<()> {
        if self.reader.lock().await.is_none() {
            return Err(AppError::peer_disconnected("client is not connected"));
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match this.receive_message().await {
                    Ok(envelope) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(envelope).await {
                                warn!("ipc client handler failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        debug!("ipc client listen loop stopping: {e}");
                        return;
                    }
                }
            }
        });
        *self.listen_task.lock().await = Some(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::MessageType;
    use crate::ipc::server::IpcServer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct RecordingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, _envelope: Envelope) -> AppResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn connect_send_and_receive_round_trip() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("devtrack.sock");
        let server = Arc::new(IpcServer::new(&socket_path));
        server.start().await.unwrap();

        let client = Arc::new(IpcClient::new(&socket_path));
        client.connect().await.unwrap();

        server
            .send_message(&Envelope::new(MessageType::TimerTrigger, json!({"trigger_count": 1})))
            .await
            .unwrap();
        let received = client.receive_message().await.unwrap();
        assert_eq!(received.message_type, MessageType::TimerTrigger);

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn start_listening_dispatches_to_handler() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("devtrack.sock");
        let server = Arc::new(IpcServer::new(&socket_path));
        server.start().await.unwrap();

        let client = Arc::new(IpcClient::new(&socket_path));
        client.connect().await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        client
            .start_listening(Arc::new(RecordingHandler { count: Arc::clone(&count) }))
            .await
            .unwrap();

        server
            .send_message(&Envelope::new(MessageType::ConfigUpdate, json!({})))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn send_message_before_connect_reports_peer_disconnected() {
        let dir = tempdir().unwrap();
        let client = IpcClient::new(dir.path().join("devtrack.sock"));
        let err = client
            .send_message(&Envelope::new(MessageType::StatusQuery, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PeerDisconnected { .. }));
    }
}
