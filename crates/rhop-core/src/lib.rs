//! # rhop-core
//!
//! Shared connection/auth types and the error taxonomy used by the
//! transport, terminal, tunnel and transfer crates.

pub mod error;
pub mod types;

pub use error::{ChannelError, ConnectionError, TransferError, TunnelError, WatcherError};
pub use types::{AuthIdentity, KeyMaterial, NetworkKind, NetworkSpec};
