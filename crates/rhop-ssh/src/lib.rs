//! # rhop-ssh
//!
//! Remote-access core: one authenticated [`TransportSession`] per host,
//! from which callers open interactive terminals ([`TerminalSession`]),
//! forward TCP tunnels ([`TunnelForwarder`]), or nest further sessions
//! through [`TransportSession::open_proxy`].
//!
//! The underlying handshake, ciphers and channel multiplexing come from
//! `ssh2`; this crate wires them into a task-per-activity model where a
//! failing sub-operation never takes down its siblings.

pub mod session;
pub mod terminal;
pub mod tunnel;

pub use session::TransportSession;
pub use terminal::{PollingSignal, ResizeSignal, TerminalSession};
pub use tunnel::{Dialer, Duplex, TunnelForwarder};

#[cfg(unix)]
pub use terminal::SigwinchSignal;
