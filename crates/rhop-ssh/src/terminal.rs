//! Interactive terminal sessions.
//!
//! [`TerminalSession::login`] puts the local terminal into raw mode,
//! requests a remote PTY sized to the current window, wires the standard
//! streams to the channel and keeps the PTY size in sync while the shell
//! runs. [`TerminalSession::run`] executes one command and streams its
//! output.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use rhop_core::{ChannelError, WatcherError};

use crate::session::TransportSession;

/// Control messages for a running shell. Tagged so exactly one payload is
/// ever populated.
#[derive(Debug)]
enum ShellCommand {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

/// Where resize notifications come from. SIGWINCH where the platform has
/// it, periodic polling otherwise; everything else in this module is
/// platform-agnostic.
#[async_trait]
pub trait ResizeSignal: Send {
    /// Resolves when the window size may have changed; `false` means the
    /// notification source is gone and the watcher should stop.
    async fn wait_for_possible_resize(&mut self) -> bool;

    fn query_size(&self) -> Result<(u16, u16), WatcherError>;
}

/// SIGWINCH-driven notifications.
#[cfg(unix)]
pub struct SigwinchSignal {
    signal: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SigwinchSignal {
    pub fn new() -> Result<SigwinchSignal, WatcherError> {
        let signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            .map_err(|e| WatcherError::Query(e.to_string()))?;
        Ok(SigwinchSignal { signal })
    }
}

#[cfg(unix)]
#[async_trait]
impl ResizeSignal for SigwinchSignal {
    async fn wait_for_possible_resize(&mut self) -> bool {
        self.signal.recv().await.is_some()
    }

    fn query_size(&self) -> Result<(u16, u16), WatcherError> {
        crossterm::terminal::size().map_err(|e| WatcherError::Query(e.to_string()))
    }
}

/// Polling fallback for platforms without a resize signal.
pub struct PollingSignal {
    period: Duration,
}

impl PollingSignal {
    pub fn new(period: Duration) -> PollingSignal {
        PollingSignal { period }
    }
}

impl Default for PollingSignal {
    fn default() -> Self {
        PollingSignal::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl ResizeSignal for PollingSignal {
    async fn wait_for_possible_resize(&mut self) -> bool {
        tokio::time::sleep(self.period).await;
        true
    }

    fn query_size(&self) -> Result<(u16, u16), WatcherError> {
        crossterm::terminal::size().map_err(|e| WatcherError::Query(e.to_string()))
    }
}

/// Restores the terminal on every exit path, including panics.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<RawModeGuard, ChannelError> {
        crossterm::terminal::enable_raw_mode()
            .map_err(|e| ChannelError(format!("raw mode failed: {}", e)))?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!("raw mode restore failed: {}", e);
        }
    }
}

/// Drives an interactive shell or single commands over one
/// [`TransportSession`].
pub struct TerminalSession<'a> {
    session: &'a TransportSession,
}

impl<'a> TerminalSession<'a> {
    pub fn new(session: &'a TransportSession) -> TerminalSession<'a> {
        TerminalSession { session }
    }

    /// Interactive login with the platform-native resize source.
    pub async fn login(&self) -> Result<i32, ChannelError> {
        #[cfg(unix)]
        let signal: Box<dyn ResizeSignal> = match SigwinchSignal::new() {
            Ok(s) => Box::new(s),
            Err(e) => {
                warn!("SIGWINCH unavailable ({}), polling instead", e);
                Box::new(PollingSignal::default())
            }
        };
        #[cfg(not(unix))]
        let signal: Box<dyn ResizeSignal> = Box::new(PollingSignal::default());

        self.login_with(signal).await
    }

    /// Interactive login; blocks until the remote shell exits or errors
    /// and returns its exit status. The resize watcher lives exactly as
    /// long as the shell.
    pub async fn login_with(&self, signal: Box<dyn ResizeSignal>) -> Result<i32, ChannelError> {
        let mut channel = self.session.channel()?;

        let size = crossterm::terminal::size().unwrap_or((80, 24));
        let term = std::env::var("TERM").unwrap_or_else(|_| "linux".to_string());
        channel
            .request_pty(&term, None, Some((size.0 as u32, size.1 as u32, 0, 0)))
            .map_err(|e| ChannelError(format!("pty request failed: {}", e)))?;
        channel
            .shell()
            .map_err(|e| ChannelError(format!("shell request failed: {}", e)))?;

        let _raw = RawModeGuard::enable()?;
        self.session.set_blocking(false);

        let (tx, rx) = mpsc::unbounded_channel::<ShellCommand>();

        let stdin_tx = tx.clone();
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => {
                        let _ = stdin_tx.send(ShellCommand::Close);
                        break;
                    }
                    Ok(n) => {
                        if stdin_tx.send(ShellCommand::Input(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let watcher = tokio::spawn(watch_resizes(signal, tx, size));

        let raw_session = self.session.raw().clone();
        let status = tokio::task::spawn_blocking(move || shell_loop(channel, rx, raw_session))
            .await
            .map_err(|e| ChannelError(format!("shell task failed: {}", e)))?;

        watcher.abort();
        self.session.set_blocking(true);
        Ok(status)
    }

    /// Execute one command, streaming stdout/stderr to the given sinks. A
    /// non-zero remote exit becomes a local error.
    pub async fn run(
        &self,
        cmd: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<(), ChannelError> {
        let mut channel = self.session.channel()?;
        channel
            .exec(cmd)
            .map_err(|e| ChannelError(format!("exec '{}' failed: {}", cmd, e)))?;

        let mut buf = [0u8; 16384];
        loop {
            let n = channel
                .read(&mut buf)
                .map_err(|e| ChannelError(format!("read from '{}' failed: {}", cmd, e)))?;
            if n == 0 {
                break;
            }
            stdout
                .write_all(&buf[..n])
                .map_err(|e| ChannelError(format!("stdout sink failed: {}", e)))?;
        }
        loop {
            let n = channel
                .stderr()
                .read(&mut buf)
                .map_err(|e| ChannelError(format!("stderr read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            stderr
                .write_all(&buf[..n])
                .map_err(|e| ChannelError(format!("stderr sink failed: {}", e)))?;
        }

        channel
            .wait_close()
            .map_err(|e| ChannelError(format!("close of '{}' failed: {}", cmd, e)))?;
        let status = channel
            .exit_status()
            .map_err(|e| ChannelError(format!("exit status of '{}' unavailable: {}", cmd, e)))?;
        if status != 0 {
            return Err(ChannelError(format!("'{}' exited with status {}", cmd, status)));
        }
        Ok(())
    }

    /// Like [`run`](Self::run) but captures stdout as a string.
    pub async fn output(&self, cmd: &str) -> Result<String, ChannelError> {
        let mut stdout = Vec::new();
        let mut stderr = std::io::sink();
        self.run(cmd, &mut stdout, &mut stderr).await?;
        String::from_utf8(stdout).map_err(|e| ChannelError(format!("non-UTF-8 output: {}", e)))
    }
}

/// Re-queries the window on every notification and issues a resize only
/// when the size actually changed. Failures are logged, never fatal.
async fn watch_resizes(
    mut signal: Box<dyn ResizeSignal>,
    tx: mpsc::UnboundedSender<ShellCommand>,
    mut last: (u16, u16),
) {
    while signal.wait_for_possible_resize().await {
        match signal.query_size() {
            Ok(size) if size != last => {
                last = size;
                if tx
                    .send(ShellCommand::Resize {
                        cols: size.0,
                        rows: size.1,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("resize watcher: {}", e),
        }
    }
    debug!("resize watcher stopped");
}

const SHELL_BUF: usize = 16384;
const MIN_SLEEP_MS: u64 = 1;
const MAX_SLEEP_MS: u64 = 10;
const IDLE_THRESHOLD: u32 = 10;

/// Blocking pump between the non-blocking channel and the local stdio,
/// driven by the tagged command stream. Returns the remote exit status.
fn shell_loop(
    mut channel: ssh2::Channel,
    mut rx: mpsc::UnboundedReceiver<ShellCommand>,
    session: ssh2::Session,
) -> i32 {
    let mut buf = [0u8; SHELL_BUF];
    let mut stdout = std::io::stdout();
    let mut running = true;
    let mut idle_count: u32 = 0;

    while running {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                ShellCommand::Input(data) => {
                    if let Err(e) = write_all_channel(&mut channel, &data) {
                        warn!("shell input write failed: {}", e);
                        running = false;
                        break;
                    }
                    let _ = channel.flush();
                    idle_count = 0;
                }
                ShellCommand::Resize { cols, rows } => {
                    if let Err(e) =
                        channel.request_pty_size(cols as u32, rows as u32, None, None)
                    {
                        warn!("{}", WatcherError::Apply(e.to_string()));
                    }
                }
                ShellCommand::Close => {
                    running = false;
                }
            }
        }

        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                idle_count = 0;
                if stdout.write_all(&buf[..n]).is_err() {
                    running = false;
                }
                let _ = stdout.flush();
            }
            Ok(_) => idle_count = idle_count.saturating_add(1),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                idle_count = idle_count.saturating_add(1)
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut => {
                idle_count = idle_count.saturating_add(1)
            }
            Err(e) => {
                warn!("shell read failed: {}", e);
                running = false;
            }
        }

        if channel.eof() {
            running = false;
        }

        let sleep_ms = if idle_count > IDLE_THRESHOLD {
            MAX_SLEEP_MS
        } else {
            MIN_SLEEP_MS
        };
        std::thread::sleep(Duration::from_millis(sleep_ms));
    }

    session.set_blocking(true);
    let _ = channel.close();
    let _ = channel.wait_close();
    channel.exit_status().unwrap_or(0)
}

/// `write_all` riding out `WouldBlock` on the non-blocking channel.
fn write_all_channel(channel: &mut ssh2::Channel, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "channel accepts no bytes",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(MIN_SLEEP_MS));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
