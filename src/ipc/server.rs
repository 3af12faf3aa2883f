//! IPC server (§4.5): accepts concurrent clients on a Unix domain socket,
//! routes incoming messages to registered per-type handlers, and publishes
//! server-originated messages to every connected client.
//!
//! Framing follows the same `BufReader::read_line` / `write_all(line)`
//! newline-delimited-JSON idiom the pack's stdio MCP transport uses, just
//! over a Unix socket instead of a child process's stdio pipes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};

use super::protocol::{Envelope, MessageType};

/// How long `stop` waits after broadcasting the shutdown notice before
/// tearing down connections (§4.7 Graceful shutdown: "~500ms").
const SHUTDOWN_GRACE_PERIOD: std::time::Duration = std::time::Duration::from_millis(500);

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> AppResult<()>;
}

struct ClientHandle {
    outbound: mpsc::UnboundedSender<String>,
}

pub struct IpcServer {
    socket_path: PathBuf,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    clients: Mutex<Vec<ClientHandle>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handlers: RwLock::new(HashMap::new()),
            clients: Mutex::new(Vec::new()),
            accept_task: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    pub async fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.insert(message_type, handler);
    }

    /// Bind the socket and start accepting clients. Fails with `BindFailed`
    /// if the path is in use or unwritable (§4.5 Failures).
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| AppError::bind_failed(e.to_string()))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::bind_failed(e.to_string()))?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| AppError::bind_failed(e.to_string()))?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let this = Arc::clone(&this);
                                tokio::spawn(async move { this.serve_client(stream).await });
                            }
                            Err(e) => warn!("ipc accept failed: {e}"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("ipc accept loop exiting");
                            return;
                        }
                    }
                }
            }
        });
        *self.accept_task.lock().await = Some(task);

        info!(path = %self.socket_path.display(), "ipc server listening");
        Ok(())
    }

    async fn serve_client(self: Arc<Self>, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        self.clients.lock().await.push(ClientHandle { outbound: tx });

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("ipc peer disconnected");
                    break;
                }
                Ok(_) => {
                    let envelope = match Envelope::from_line(&line) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!("malformed ipc message: {e}");
                            continue;
                        }
                    };
                    self.dispatch(envelope).await;
                }
                Err(e) => {
                    warn!("ipc peer read error (treated as disconnect): {e}");
                    break;
                }
            }
        }

        writer_task.abort();
    }

    /// Route to the handler registered for this message's type. Awaited
    /// in place, not spawned: within one client connection, messages must
    /// finish processing in arrival order (§5), so a `task_update`
    /// completes before its immediately-following `ack` is dispatched.
    async fn dispatch(&self, envelope: Envelope) {
        let handler = self.handlers.read().await.get(&envelope.message_type).cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle(envelope).await {
                    error!("ipc handler failed: {e}");
                }
            }
            None => debug!(message_type = ?envelope.message_type, "no handler registered; discarding"),
        }
    }

    /// Broadcast to every connected client. If none are connected, logs and
    /// drops the message (§4.5 Behavior) — the corresponding `triggers` row
    /// in the event store is the durable record.
    pub async fn send_message(&self, envelope: &Envelope) -> AppResult<()> {
        let line = envelope.to_line()?;
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            debug!(message_type = ?envelope.message_type, "no client connected; dropping outbound message");
            return Ok(());
        }
        clients.retain(|client| client.outbound.send(line.clone()).is_ok());
        Ok(())
    }

    /// Broadcast a shutdown notice, close every connection, and remove the
    /// socket file (§4.5 Shutdown).
    pub async fn stop(&self) {
        let _ = self.send_message(&Envelope::shutdown()).await;
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        self.clients.lock().await.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("failed to remove ipc socket {}: {e}", self.socket_path.display());
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
