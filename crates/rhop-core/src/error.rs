//! Error taxonomy for the remote-access subsystem.
//!
//! Each enum maps to one failure domain. Setup failures (connect, source
//! stat, listener bind) propagate synchronously to the caller; background
//! failures (resize watcher, per-connection forwards, per-file copy units)
//! stay inside their own task and are logged instead.

use std::io;
use thiserror::Error;

/// Dial / handshake / authentication failures. Fatal, never retried
/// internally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect to {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {address} timed out after {seconds}s")]
    Timeout { address: String, seconds: u64 },

    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("authentication for user '{username}' failed: {reason}")]
    Auth { username: String, reason: String },

    #[error("private key '{context}' unusable: {reason}")]
    KeyAuth { context: String, reason: String },
}

/// Channel creation failure. Fatal to the operation that needed the
/// channel, nothing else.
#[derive(Debug, Error)]
#[error("channel error: {0}")]
pub struct ChannelError(pub String);

/// Transfer failures. `Stat` and `Sftp` abort the whole call; `Partial`
/// reports per-file units that failed while their siblings completed.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("stat '{path}' failed: {reason}")]
    Stat { path: String, reason: String },

    #[error("create '{path}' failed: {reason}")]
    Create { path: String, reason: String },

    #[error("copy '{path}' failed: {reason}")]
    Copy { path: String, reason: String },

    #[error("sftp subsystem unavailable: {0}")]
    Sftp(String),

    #[error("path '{path}' could not be resolved: {reason}")]
    Path { path: String, reason: String },

    #[error("{} of {} file(s) failed: {}", failures.len(), total, summarize(failures))]
    Partial {
        total: usize,
        failures: Vec<(String, String)>,
    },
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(path, reason)| format!("{path}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resize-watcher failures. Asynchronous and never fatal to the terminal
/// session; surfaced on the log sink only.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("window size query failed: {0}")]
    Query(String),

    #[error("resize request failed: {0}")]
    Apply(String),
}

/// Tunnel failures. `Bind` is fatal to `start`; per-connection dial and
/// copy failures are isolated to that connection.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("bind {address} failed: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("accept on {address} failed: {source}")]
    Accept {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("dial {address} through session failed: {reason}")]
    Dial { address: String, reason: String },
}
