//! Local tunnel forwarding.
//!
//! [`TunnelForwarder::start`] binds a local listener and forwards every
//! accepted connection, bidirectionally, to a destination dialed through
//! the session. Each connection lives in its own task; a dial or copy
//! failure drops that connection and nothing else.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use rhop_core::{NetworkKind, NetworkSpec, TunnelError};

use crate::session::TransportSession;

/// A bidirectional byte stream. Dropping it is the close attempt for that
/// side.
pub trait Duplex: Read + Write + Send {}
impl<T: Read + Write + Send> Duplex for T {}

/// How tunneled destinations are reached. [`TransportSession`] dials
/// through the remote peer; tests substitute a direct TCP dialer.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, spec: &NetworkSpec) -> Result<Box<dyn Duplex>, TunnelError>;
}

impl Dialer for TransportSession {
    fn dial(&self, spec: &NetworkSpec) -> Result<Box<dyn Duplex>, TunnelError> {
        match spec.kind {
            NetworkKind::Tcp => {
                let (host, port) = spec.host_port().ok_or_else(|| TunnelError::Dial {
                    address: spec.address.clone(),
                    reason: "expected host:port".to_string(),
                })?;
                let channel =
                    TransportSession::dial(self, host, port).map_err(|e| TunnelError::Dial {
                        address: spec.address.clone(),
                        reason: e.to_string(),
                    })?;
                // The pump polls; reads must not park the shared session.
                self.set_blocking(false);
                Ok(Box::new(channel))
            }
            NetworkKind::Unix => Err(TunnelError::Dial {
                address: spec.address.clone(),
                reason: "libssh2 cannot dial unix sockets on the remote side".to_string(),
            }),
        }
    }
}

/// Forwards local connections through a [`Dialer`].
pub struct TunnelForwarder {
    dialer: Arc<dyn Dialer>,
}

impl TunnelForwarder {
    pub fn new(dialer: Arc<dyn Dialer>) -> TunnelForwarder {
        TunnelForwarder { dialer }
    }

    /// Bind `local` and forward every accepted connection to `remote`.
    /// Blocks until the listener itself fails; per-connection failures are
    /// logged and isolated.
    pub async fn start(&self, local: &NetworkSpec, remote: &NetworkSpec) -> Result<(), TunnelError> {
        match local.kind {
            NetworkKind::Tcp => self.accept_tcp(local, remote).await,
            #[cfg(unix)]
            NetworkKind::Unix => self.accept_unix(local, remote).await,
            #[cfg(not(unix))]
            NetworkKind::Unix => Err(TunnelError::Bind {
                address: local.address.clone(),
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are unavailable on this platform",
                ),
            }),
        }
    }

    async fn accept_tcp(&self, local: &NetworkSpec, remote: &NetworkSpec) -> Result<(), TunnelError> {
        let listener = tokio::net::TcpListener::bind(&local.address)
            .await
            .map_err(|source| TunnelError::Bind {
                address: local.address.clone(),
                source,
            })?;
        info!("tunnel listening on {} -> {}", local.address, remote.address);

        loop {
            let (stream, peer) = listener.accept().await.map_err(|source| TunnelError::Accept {
                address: local.address.clone(),
                source,
            })?;
            let stream = match stream.into_std() {
                Ok(s) => s,
                Err(e) => {
                    warn!("tunnel: detaching accepted stream failed: {}", e);
                    continue;
                }
            };
            debug!("tunnel: accepted {}", peer);
            self.forward(stream, remote.clone());
        }
    }

    #[cfg(unix)]
    async fn accept_unix(&self, local: &NetworkSpec, remote: &NetworkSpec) -> Result<(), TunnelError> {
        let listener =
            tokio::net::UnixListener::bind(&local.address).map_err(|source| TunnelError::Bind {
                address: local.address.clone(),
                source,
            })?;
        info!("tunnel listening on {} -> {}", local.address, remote.address);

        loop {
            let (stream, _) = listener.accept().await.map_err(|source| TunnelError::Accept {
                address: local.address.clone(),
                source,
            })?;
            let stream = match stream.into_std() {
                Ok(s) => s,
                Err(e) => {
                    warn!("tunnel: detaching accepted stream failed: {}", e);
                    continue;
                }
            };
            self.forward(stream, remote.clone());
        }
    }

    /// Dial the destination and pump both directions until either side
    /// ends. Runs entirely in its own tasks; errors never reach the
    /// accept loop.
    fn forward<S>(&self, local: S, remote: NetworkSpec)
    where
        S: Read + Write + Send + AsNonblocking + 'static,
    {
        let dialer = Arc::clone(&self.dialer);
        let conn_id = Uuid::new_v4().to_string()[..8].to_string();

        tokio::spawn(async move {
            let dialed = tokio::task::spawn_blocking({
                let remote = remote.clone();
                move || dialer.dial(&remote)
            })
            .await;

            let dialed = match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("tunnel[{}]: {}", conn_id, e);
                    return;
                }
                Err(e) => {
                    warn!("tunnel[{}]: dial task failed: {}", conn_id, e);
                    return;
                }
            };

            if let Err(e) = local.set_nonblocking(true) {
                warn!("tunnel[{}]: nonblocking setup failed: {}", conn_id, e);
                return;
            }

            let _ = tokio::task::spawn_blocking(move || pump(dialed, local)).await;
            debug!("tunnel[{}]: closed", conn_id);
        });
    }
}

/// `set_nonblocking` for the stream types the forwarder accepts.
pub trait AsNonblocking {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl AsNonblocking for std::net::TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        std::net::TcpStream::set_nonblocking(self, nonblocking)
    }
}

#[cfg(unix)]
impl AsNonblocking for std::os::unix::net::UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_nonblocking(self, nonblocking)
    }
}

const PUMP_BUF: usize = 32 * 1024;
const MIN_SLEEP_MS: u64 = 1;
const MAX_SLEEP_MS: u64 = 10;
const IDLE_THRESHOLD: u32 = 10;

/// Copy bytes both ways between two non-blocking streams until either
/// side reaches EOF or errors, then drop (close) both. Byte order is
/// preserved independently per direction.
pub(crate) fn pump<A, B>(mut a: A, mut b: B)
where
    A: Read + Write,
    B: Read + Write,
{
    let mut buf = [0u8; PUMP_BUF];
    let mut idle_count: u32 = 0;

    loop {
        let mut moved = false;

        match copy_once(&mut a, &mut b, &mut buf) {
            Ok(true) => moved = true,
            Ok(false) => {}
            Err(_) => break,
        }
        match copy_once(&mut b, &mut a, &mut buf) {
            Ok(true) => moved = true,
            Ok(false) => {}
            Err(_) => break,
        }

        if moved {
            idle_count = 0;
        } else {
            idle_count = idle_count.saturating_add(1);
            let sleep_ms = if idle_count > IDLE_THRESHOLD {
                MAX_SLEEP_MS
            } else {
                MIN_SLEEP_MS
            };
            std::thread::sleep(Duration::from_millis(sleep_ms));
        }
    }
    // Both sides dropped here: one close attempt per side.
}

/// One read from `src` written through to `dst`. `Ok(true)` when bytes
/// moved, `Ok(false)` when the source had nothing yet, `Err` on EOF or a
/// real failure.
fn copy_once<R: Read, W: Write>(src: &mut R, dst: &mut W, buf: &mut [u8]) -> io::Result<bool> {
    match src.read(buf) {
        Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended")),
        Ok(n) => {
            write_all_nb(dst, &buf[..n])?;
            let _ = dst.flush();
            Ok(true)
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(false),
        Err(e) => Err(e),
    }
}

/// `write_all` that rides out `WouldBlock` on a non-blocking sink.
fn write_all_nb<W: Write>(dst: &mut W, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match dst.write(data) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "sink accepts no bytes"))
            }
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(MIN_SLEEP_MS));
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                std::thread::sleep(Duration::from_millis(MIN_SLEEP_MS));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Dials destinations directly over TCP, no session involved.
    struct TcpDialer;

    impl Dialer for TcpDialer {
        fn dial(&self, spec: &NetworkSpec) -> Result<Box<dyn Duplex>, TunnelError> {
            let stream = TcpStream::connect(&spec.address).map_err(|e| TunnelError::Dial {
                address: spec.address.clone(),
                reason: e.to_string(),
            })?;
            stream.set_nonblocking(true).map_err(|e| TunnelError::Dial {
                address: spec.address.clone(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(stream))
        }
    }

    /// Echo server that mirrors every byte back, one thread per client.
    fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                std::thread::spawn(move || {
                    let mut buf = [0u8; 8192];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn start_forwarder(remote_addr: String) -> std::net::SocketAddr {
        // Bind first so the local port is known before start() runs.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = TunnelForwarder::new(Arc::new(TcpDialer));
        let local = NetworkSpec::tcp(local_addr.to_string());
        let remote = NetworkSpec::tcp(remote_addr);
        tokio::spawn(async move {
            let _ = forwarder.start(&local, &remote).await;
        });

        // Give the listener a moment to come up.
        for _ in 0..50 {
            if TcpStream::connect(local_addr).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        local_addr
    }

    fn roundtrip(addr: std::net::SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut conn = TcpStream::connect(addr).unwrap();

        // Write from a second thread so large payloads cannot deadlock on
        // TCP backpressure while we read the echo.
        let mut writer = conn.try_clone().unwrap();
        let outbound = payload.to_vec();
        let handle = std::thread::spawn(move || {
            writer.write_all(&outbound).unwrap();
            writer.flush().unwrap();
        });

        let mut received = vec![0u8; payload.len()];
        if !payload.is_empty() {
            conn.read_exact(&mut received).unwrap();
        }
        handle.join().unwrap();
        received
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn forwards_bytes_unmodified_at_various_sizes() {
        let echo = spawn_echo_server();
        let local = start_forwarder(echo.to_string()).await;

        for size in [0usize, 1, 64 * 1024, 10 * 1024 * 1024] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let payload_clone = payload.clone();
            let received =
                tokio::task::spawn_blocking(move || roundtrip(local, &payload_clone))
                    .await
                    .unwrap();
            assert_eq!(received, payload, "size {} corrupted", size);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dial_failure_does_not_stop_the_accept_loop() {
        // A port with nothing behind it.
        let dead_port = {
            let sock = TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };

        struct FlakyDialer {
            dead: String,
            hits: std::sync::atomic::AtomicUsize,
        }
        impl Dialer for FlakyDialer {
            fn dial(&self, spec: &NetworkSpec) -> Result<Box<dyn Duplex>, TunnelError> {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if self.hits.load(std::sync::atomic::Ordering::SeqCst) == 1 {
                    // First connection goes to the dead port.
                    return TcpDialer.dial(&NetworkSpec::tcp(self.dead.clone()));
                }
                TcpDialer.dial(spec)
            }
        }

        let echo = spawn_echo_server();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = TunnelForwarder::new(Arc::new(FlakyDialer {
            dead: format!("127.0.0.1:{}", dead_port),
            hits: std::sync::atomic::AtomicUsize::new(0),
        }));
        let local = NetworkSpec::tcp(local_addr.to_string());
        let remote = NetworkSpec::tcp(echo.to_string());
        tokio::spawn(async move {
            let _ = forwarder.start(&local, &remote).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First connection hits the dead destination and is dropped.
        let _doomed = TcpStream::connect(local_addr).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second connection must still be accepted and forwarded.
        let payload = b"still alive".to_vec();
        let received = tokio::task::spawn_blocking(move || roundtrip(local_addr, &payload))
            .await
            .unwrap();
        assert_eq!(received, b"still alive");
    }

    #[tokio::test]
    async fn bind_failure_is_fatal_to_start() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let forwarder = TunnelForwarder::new(Arc::new(TcpDialer));
        let err = forwarder
            .start(
                &NetworkSpec::tcp(addr.to_string()),
                &NetworkSpec::tcp("127.0.0.1:1".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Bind { .. }));
    }
}
