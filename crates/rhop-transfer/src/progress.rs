//! Progress accounting.
//!
//! One [`ProgressState`] per top-level transfer call; every concurrent
//! copy unit adds its byte deltas to the same atomic counter through a
//! [`CountingReader`] interposed on the source side of its stream.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;

/// Observer of a running transfer. Updates are cheap and must not block.
pub trait ProgressSink: Send + Sync {
    fn update(&self, transferred: u64, total: u64);
}

/// Shared byte accounting. `transferred` is monotonic and safe under
/// concurrent writers; it can pass `total` only when a source file grew
/// between the pre-walk and the copy.
pub struct ProgressState {
    total: u64,
    transferred: AtomicU64,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl ProgressState {
    pub fn new(total: u64, sink: Option<Arc<dyn ProgressSink>>) -> ProgressState {
        ProgressState {
            total,
            transferred: AtomicU64::new(0),
            sink,
        }
    }

    pub fn add(&self, delta: u64) {
        let transferred = self.transferred.fetch_add(delta, Ordering::Relaxed) + delta;
        if let Some(sink) = &self.sink {
            sink.update(transferred, self.total);
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Counting decorator over a source stream.
pub struct CountingReader<R> {
    inner: R,
    progress: Arc<ProgressState>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, progress: Arc<ProgressState>) -> CountingReader<R> {
        CountingReader { inner, progress }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.progress.add(n as u64);
        }
        Ok(n)
    }
}

/// Default sink: logs the running total whenever another mebibyte has
/// gone by, and once at the end.
pub struct LogProgress {
    last_logged: AtomicU64,
}

const LOG_STEP: u64 = 1024 * 1024;

impl LogProgress {
    pub fn new() -> LogProgress {
        LogProgress {
            last_logged: AtomicU64::new(0),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        LogProgress::new()
    }
}

impl ProgressSink for LogProgress {
    fn update(&self, transferred: u64, total: u64) {
        let last = self.last_logged.load(Ordering::Relaxed);
        if transferred >= last + LOG_STEP || transferred >= total {
            if self
                .last_logged
                .compare_exchange(last, transferred, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                info!("transferred {}/{} bytes", transferred, total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_reader_accumulates_exactly_the_bytes_read() {
        let progress = Arc::new(ProgressState::new(11, None));
        let mut reader = CountingReader::new(&b"hello world"[..], Arc::clone(&progress));

        let mut out = Vec::new();
        io::copy(&mut reader, &mut out).unwrap();

        assert_eq!(out, b"hello world");
        assert_eq!(progress.transferred(), 11);
        assert_eq!(progress.total(), 11);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let progress = Arc::new(ProgressState::new(0, None));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = Arc::clone(&progress);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    p.add(3);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(progress.transferred(), 8 * 1000 * 3);
    }

    #[test]
    fn sink_sees_running_totals() {
        struct Capture(std::sync::Mutex<Vec<u64>>);
        impl ProgressSink for Capture {
            fn update(&self, transferred: u64, _total: u64) {
                self.0.lock().unwrap().push(transferred);
            }
        }

        let capture = Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
        let progress = ProgressState::new(10, Some(capture.clone() as Arc<dyn ProgressSink>));
        progress.add(4);
        progress.add(6);

        assert_eq!(*capture.0.lock().unwrap(), vec![4, 10]);
    }
}
