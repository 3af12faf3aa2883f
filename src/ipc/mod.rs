//! Local IPC transport (§4.5).
//!
//! POSIX only for now: the server and client below bind a Unix domain
//! socket. A Windows named-pipe transport would live behind the same
//! `MessageHandler`/`Envelope` contract in a parallel `cfg(windows)`
//! module; it is not implemented here.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{CommitTriggerPayload, Envelope, MessageType, TaskUpdatePayload, TimerTriggerPayload};
pub use server::{IpcServer, MessageHandler};
