//! Authenticated transport session.
//!
//! One [`TransportSession`] owns one underlying connection (TCP or Unix
//! socket). Command channels, dialed streams and SFTP handles derived from
//! it share that connection and start failing once it is closed.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use ssh2::{DisconnectCode, Session};
use tokio::net::TcpStream as AsyncTcpStream;

use rhop_core::{
    AuthIdentity, ChannelError, ConnectionError, NetworkKind, NetworkSpec, TransferError,
};

/// One authenticated multiplexed connection to a remote host.
pub struct TransportSession {
    session: Session,
    address: String,
    username: String,
    closed: AtomicBool,
    // Keeps the loopback bridge of a proxied session alive for as long as
    // the nested session exists.
    _proxy_bridge: Option<std::thread::JoinHandle<()>>,
}

impl TransportSession {
    /// Connect and authenticate. Not retried internally; a timeout or an
    /// auth rejection surfaces immediately.
    pub async fn connect(
        spec: &NetworkSpec,
        identity: &AuthIdentity,
    ) -> Result<TransportSession, ConnectionError> {
        let session = match spec.kind {
            NetworkKind::Tcp => {
                let stream = Self::dial_tcp(&spec.address, spec.connect_timeout_secs).await?;
                let mut sess = Self::new_session(&spec.address)?;
                sess.set_tcp_stream(stream);
                sess
            }
            #[cfg(unix)]
            NetworkKind::Unix => {
                let stream = std::os::unix::net::UnixStream::connect(&spec.address).map_err(
                    |source| ConnectionError::Dial {
                        address: spec.address.clone(),
                        source,
                    },
                )?;
                let mut sess = Self::new_session(&spec.address)?;
                sess.set_tcp_stream(stream);
                sess
            }
            #[cfg(not(unix))]
            NetworkKind::Unix => {
                return Err(ConnectionError::Dial {
                    address: spec.address.clone(),
                    source: io::Error::new(
                        io::ErrorKind::Unsupported,
                        "unix sockets are unavailable on this platform",
                    ),
                });
            }
        };

        let session = Self::establish(session, &spec.address, identity)?;
        info!(
            "session established: {}@{}",
            identity.username, spec.address
        );

        Ok(TransportSession {
            session,
            address: spec.address.clone(),
            username: identity.username.clone(),
            closed: AtomicBool::new(false),
            _proxy_bridge: None,
        })
    }

    async fn dial_tcp(address: &str, timeout_secs: u64) -> Result<TcpStream, ConnectionError> {
        let stream = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            AsyncTcpStream::connect(address),
        )
        .await
        .map_err(|_| ConnectionError::Timeout {
            address: address.to_string(),
            seconds: timeout_secs,
        })?
        .map_err(|source| ConnectionError::Dial {
            address: address.to_string(),
            source,
        })?;

        let stream = stream.into_std().map_err(|source| ConnectionError::Dial {
            address: address.to_string(),
            source,
        })?;
        stream
            .set_nonblocking(false)
            .map_err(|source| ConnectionError::Dial {
                address: address.to_string(),
                source,
            })?;
        Ok(stream)
    }

    fn new_session(address: &str) -> Result<Session, ConnectionError> {
        Session::new().map_err(|e| ConnectionError::Handshake {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }

    /// Handshake and authenticate a session whose stream is already set.
    fn establish(
        mut session: Session,
        address: &str,
        identity: &AuthIdentity,
    ) -> Result<Session, ConnectionError> {
        session
            .handshake()
            .map_err(|e| ConnectionError::Handshake {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Self::authenticate(&mut session, identity)?;
        Ok(session)
    }

    /// Explicit password wins; otherwise the resolved key material is used
    /// (file content when a file exists at the given path, inline text
    /// otherwise). A key that libssh2 cannot parse is fatal.
    fn authenticate(session: &mut Session, identity: &AuthIdentity) -> Result<(), ConnectionError> {
        if let Some(password) = &identity.password {
            session
                .userauth_password(&identity.username, password)
                .map_err(|e| ConnectionError::Auth {
                    username: identity.username.clone(),
                    reason: e.to_string(),
                })?;
            return Ok(());
        }

        let material = identity
            .key_material()
            .ok_or_else(|| ConnectionError::Auth {
                username: identity.username.clone(),
                reason: "no password and no usable private key".to_string(),
            })?;

        session
            .userauth_pubkey_memory(
                &identity.username,
                None,
                &material.content,
                identity.passphrase.as_deref(),
            )
            .map_err(|e| ConnectionError::KeyAuth {
                context: material.context.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Open a fresh command channel.
    pub fn channel(&self) -> Result<ssh2::Channel, ChannelError> {
        self.session.set_blocking(true);
        self.session
            .channel_session()
            .map_err(|e| ChannelError(format!("channel open on {} failed: {}", self.address, e)))
    }

    /// Dial `host:port` through the remote peer, yielding a byte stream
    /// routed over this session.
    pub fn dial(&self, host: &str, port: u16) -> Result<ssh2::Channel, ChannelError> {
        self.session.set_blocking(true);
        self.session
            .channel_direct_tcpip(host, port, None)
            .map_err(|e| ChannelError(format!("dial {}:{} via {} failed: {}", host, port, self.address, e)))
    }

    /// SFTP subsystem handle for file transfer.
    pub fn sftp(&self) -> Result<ssh2::Sftp, TransferError> {
        self.session.set_blocking(true);
        self.session
            .sftp()
            .map_err(|e| TransferError::Sftp(e.to_string()))
    }

    /// ssh2's blocking flag is session-global; long-lived pumps (tunnels,
    /// interactive shells) flip it off, blocking operations flip it back.
    pub fn set_blocking(&self, blocking: bool) {
        self.session.set_blocking(blocking);
    }

    pub(crate) fn raw(&self) -> &Session {
        &self.session
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Open a nested authenticated session through this one.
    ///
    /// Dials the target over this session, bridges the resulting channel
    /// to a loopback socket (libssh2 handshakes only over a real fd) and
    /// runs a fresh handshake + authentication on top. The returned
    /// session has every capability this one has; closing this session is
    /// not propagated, the nested one's I/O simply starts failing.
    pub fn open_proxy(
        &self,
        spec: &NetworkSpec,
        identity: &AuthIdentity,
    ) -> Result<TransportSession, ConnectionError> {
        let (host, port) = spec.host_port().ok_or_else(|| ConnectionError::Dial {
            address: spec.address.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "expected host:port"),
        })?;

        let channel = self
            .dial(host, port)
            .map_err(|e| ConnectionError::Handshake {
                address: spec.address.clone(),
                reason: e.to_string(),
            })?;

        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").map_err(|source| ConnectionError::Dial {
                address: spec.address.clone(),
                source,
            })?;
        let bridge_addr = listener.local_addr().map_err(|source| ConnectionError::Dial {
            address: spec.address.clone(),
            source,
        })?;

        self.session.set_blocking(false);
        let outer = self.session.clone();
        let target = spec.address.clone();
        let bridge = std::thread::spawn(move || {
            match listener.accept() {
                Ok((sock, _)) => {
                    if sock.set_nonblocking(true).is_err() {
                        return;
                    }
                    crate::tunnel::pump(channel, sock);
                    debug!("proxy bridge to {} ended", target);
                }
                Err(e) => warn!("proxy bridge accept failed: {}", e),
            }
            drop(outer);
        });

        let stream = TcpStream::connect(bridge_addr).map_err(|source| ConnectionError::Dial {
            address: spec.address.clone(),
            source,
        })?;

        let mut sess = Self::new_session(&spec.address)?;
        sess.set_tcp_stream(stream);
        let sess = Self::establish(sess, &spec.address, identity)?;
        info!(
            "proxied session established: {}@{} via {}",
            identity.username, spec.address, self.address
        );

        Ok(TransportSession {
            session: sess,
            address: spec.address.clone(),
            username: identity.username.clone(),
            closed: AtomicBool::new(false),
            _proxy_bridge: Some(bridge),
        })
    }

    /// Disconnect, releasing every derived channel and stream with it.
    /// Best effort and idempotent; further calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.set_blocking(true);
        if let Err(e) =
            self.session
                .disconnect(Some(DisconnectCode::ByApplication), "closing", None)
        {
            debug!("disconnect from {}: {}", self.address, e);
        }
        info!("session closed: {}", self.address);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}
