//! # rhop-transfer
//!
//! File and directory synchronization over an authenticated
//! [`TransportSession`](rhop_ssh::TransportSession). Directory transfers
//! decompose into independent per-file copy units that run with bounded
//! concurrency and feed one shared progress accumulator; a failing unit
//! never disturbs its siblings.

pub mod engine;
pub mod path;
pub mod progress;
pub mod remote;

pub use engine::TransferEngine;
pub use progress::{LogProgress, ProgressSink, ProgressState};
pub use remote::{EntryStat, LocalFs, RemoteFs, SftpFs};
