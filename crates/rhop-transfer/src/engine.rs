//! The transfer engine.
//!
//! `push` copies local → remote, `get` copies remote → local; both stat
//! the source to decide between single-file and recursive-directory mode.
//! A directory transfer pre-walks the source for a byte total and a
//! deterministic entry list, creates every destination directory before
//! any file under it, then runs one copy unit per file under a
//! concurrency bound. Per-unit failures are isolated and aggregated;
//! pre-walk failures abort the call.

use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use rhop_core::TransferError;
use rhop_ssh::TransportSession;

use crate::path;
use crate::progress::{CountingReader, ProgressSink, ProgressState};
use crate::remote::{RemoteFs, SftpFs};

const DEFAULT_CONCURRENCY: usize = 8;

/// One source entry from the pre-walk, relative to the transfer root.
#[derive(Debug)]
struct WalkEntry {
    rel: String,
    is_dir: bool,
    size: u64,
}

/// Orchestrates file and directory copies over a [`RemoteFs`].
pub struct TransferEngine {
    remote: Arc<dyn RemoteFs>,
    concurrency: usize,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl TransferEngine {
    pub fn new(remote: Arc<dyn RemoteFs>) -> TransferEngine {
        TransferEngine {
            remote,
            concurrency: DEFAULT_CONCURRENCY,
            sink: None,
        }
    }

    /// Engine backed by the session's SFTP subsystem.
    pub fn over_session(session: &TransportSession) -> Result<TransferEngine, TransferError> {
        Ok(TransferEngine::new(Arc::new(SftpFs::new(session)?)))
    }

    /// Bound on simultaneously running copy units.
    pub fn with_concurrency(mut self, limit: usize) -> TransferEngine {
        self.concurrency = limit.max(1);
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> TransferEngine {
        self.sink = Some(sink);
        self
    }

    // ── Push: local → remote ────────────────────────────────────────────

    /// Copy a local file or directory tree to the remote side. Returns
    /// the bytes transferred.
    pub async fn push(&self, src: &str, dst: &str) -> Result<u64, TransferError> {
        let src = path::expand_local(src)?;
        let dst = path::expand_remote(dst, self.remote.as_ref())?;

        let meta = fs::metadata(&src).map_err(|e| TransferError::Stat {
            path: src.clone(),
            reason: e.to_string(),
        })?;

        let transferred = if meta.is_dir() {
            self.push_dir(&src, &dst).await?
        } else {
            let dst = self.resolve_remote_dst(&dst, &src);
            let progress = Arc::new(ProgressState::new(meta.len(), self.sink.clone()));
            let remote = Arc::clone(&self.remote);
            let src_clone = src.clone();
            run_unit(move || copy_local_to_remote(&src_clone, &dst, remote, progress)).await?
        };

        info!("pushed {} bytes from {}", transferred, src);
        Ok(transferred)
    }

    async fn push_dir(&self, src: &str, dst: &str) -> Result<u64, TransferError> {
        let entries = walk_local(src)?;
        let total: u64 = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();

        let dst_root = self.resolve_remote_dst(dst, src);

        // Directories first, in walk order, so every file's parent exists
        // before any copy unit starts.
        self.remote
            .mkdir(&dst_root)
            .map_err(|e| TransferError::Create {
                path: dst_root.clone(),
                reason: e.to_string(),
            })?;
        for entry in entries.iter().filter(|e| e.is_dir) {
            let dir = path::join_dir(&dst_root, &entry.rel);
            self.remote.mkdir(&dir).map_err(|e| TransferError::Create {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }

        let progress = Arc::new(ProgressState::new(total, self.sink.clone()));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut units: JoinSet<(String, Result<u64, TransferError>)> = JoinSet::new();

        let mut file_count = 0usize;
        for entry in entries.iter().filter(|e| !e.is_dir) {
            file_count += 1;
            let src_file = format!("{}/{}", src.trim_end_matches('/'), entry.rel);
            let dst_file = path::join_dir(&dst_root, &entry.rel);
            let remote = Arc::clone(&self.remote);
            let progress = Arc::clone(&progress);
            let semaphore = Arc::clone(&semaphore);

            units.spawn(async move {
                let src_unit = src_file.clone();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        run_unit(move || copy_local_to_remote(&src_unit, &dst_file, remote, progress))
                            .await
                    }
                    Err(e) => Err(TransferError::Copy {
                        path: src_file.clone(),
                        reason: e.to_string(),
                    }),
                };
                (src_file, result)
            });
        }

        join_units(&mut units, file_count).await
    }

    /// Destination-is-directory heuristic: copying onto an existing
    /// directory lands inside it under the source's base name.
    fn resolve_remote_dst(&self, dst: &str, src: &str) -> String {
        match self.remote.stat(dst) {
            Ok(stat) if stat.is_dir => path::join_dir(dst, path::base_name(src)),
            _ => dst.to_string(),
        }
    }

    // ── Get: remote → local ─────────────────────────────────────────────

    /// Copy a remote file or directory tree to the local side. Returns
    /// the bytes transferred.
    pub async fn get(&self, src: &str, dst: &str) -> Result<u64, TransferError> {
        let src = path::expand_remote(src, self.remote.as_ref())?;
        let dst = path::expand_local(dst)?;

        let stat = self.remote.stat(&src).map_err(|e| TransferError::Stat {
            path: src.clone(),
            reason: e.to_string(),
        })?;

        let transferred = if stat.is_dir {
            self.get_dir(&src, &dst).await?
        } else {
            let dst = resolve_local_dst(&dst, &src);
            let progress = Arc::new(ProgressState::new(stat.size, self.sink.clone()));
            let remote = Arc::clone(&self.remote);
            let src_clone = src.clone();
            run_unit(move || copy_remote_to_local(&src_clone, &dst, remote, progress)).await?
        };

        info!("fetched {} bytes from {}", transferred, src);
        Ok(transferred)
    }

    async fn get_dir(&self, src: &str, dst: &str) -> Result<u64, TransferError> {
        let mut entries = Vec::new();
        walk_remote(self.remote.as_ref(), src, "", &mut entries)?;
        let total: u64 = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();

        let dst_root = resolve_local_dst(dst, src);

        fs::create_dir_all(&dst_root).map_err(|e| TransferError::Create {
            path: dst_root.clone(),
            reason: e.to_string(),
        })?;
        for entry in entries.iter().filter(|e| e.is_dir) {
            let dir = path::join_dir(&dst_root, &entry.rel);
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(TransferError::Create {
                        path: dir,
                        reason: e.to_string(),
                    })
                }
            }
        }

        let progress = Arc::new(ProgressState::new(total, self.sink.clone()));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut units: JoinSet<(String, Result<u64, TransferError>)> = JoinSet::new();

        let mut file_count = 0usize;
        for entry in entries.iter().filter(|e| !e.is_dir) {
            file_count += 1;
            let src_file = format!("{}/{}", src.trim_end_matches('/'), entry.rel);
            let dst_file = path::join_dir(&dst_root, &entry.rel);
            let remote = Arc::clone(&self.remote);
            let progress = Arc::clone(&progress);
            let semaphore = Arc::clone(&semaphore);

            units.spawn(async move {
                let src_unit = src_file.clone();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        run_unit(move || copy_remote_to_local(&src_unit, &dst_file, remote, progress))
                            .await
                    }
                    Err(e) => Err(TransferError::Copy {
                        path: src_file.clone(),
                        reason: e.to_string(),
                    }),
                };
                (src_file, result)
            });
        }

        join_units(&mut units, file_count).await
    }
}

/// Local destination heuristic, mirroring [`TransferEngine::resolve_remote_dst`].
fn resolve_local_dst(dst: &str, src: &str) -> String {
    match fs::metadata(dst) {
        Ok(meta) if meta.is_dir() => path::join_dir(dst, path::base_name(src)),
        _ => dst.to_string(),
    }
}

/// Run one blocking copy unit on the blocking pool.
async fn run_unit<F>(unit: F) -> Result<u64, TransferError>
where
    F: FnOnce() -> Result<u64, TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(unit)
        .await
        .map_err(|e| TransferError::Copy {
            path: "<unit>".to_string(),
            reason: format!("copy task failed: {}", e),
        })?
}

/// Drain the unit set. All units run to completion; failures are logged
/// per path and aggregated afterwards — siblings of a failed unit are
/// never cancelled.
async fn join_units(
    units: &mut JoinSet<(String, Result<u64, TransferError>)>,
    file_count: usize,
) -> Result<u64, TransferError> {
    let mut transferred = 0u64;
    let mut failures = Vec::new();

    while let Some(joined) = units.join_next().await {
        match joined {
            Ok((_, Ok(bytes))) => transferred += bytes,
            Ok((path, Err(e))) => {
                warn!("copy unit {} failed: {}", path, e);
                failures.push((path, e.to_string()));
            }
            Err(e) => failures.push(("<unit>".to_string(), e.to_string())),
        }
    }

    if failures.is_empty() {
        Ok(transferred)
    } else {
        failures.sort();
        Err(TransferError::Partial {
            total: file_count,
            failures,
        })
    }
}

/// Pre-walk of a local tree: lexical order, directories before their
/// children, paths relative to `root` (the root itself excluded).
fn walk_local(root: &str) -> Result<Vec<WalkEntry>, TransferError> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| TransferError::Stat {
            path: root.to_string(),
            reason: e.to_string(),
        })?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| TransferError::Stat {
                path: entry.path().display().to_string(),
                reason: e.to_string(),
            })?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        let meta = entry.metadata().map_err(|e| TransferError::Stat {
            path: entry.path().display().to_string(),
            reason: e.to_string(),
        })?;
        entries.push(WalkEntry {
            rel,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
        });
    }
    Ok(entries)
}

/// Pre-walk of a remote tree via [`RemoteFs::read_dir`], same ordering
/// contract as [`walk_local`].
fn walk_remote(
    remote: &dyn RemoteFs,
    root: &str,
    rel: &str,
    out: &mut Vec<WalkEntry>,
) -> Result<(), TransferError> {
    let abs = if rel.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), rel)
    };
    let mut children = remote.read_dir(&abs).map_err(|e| TransferError::Stat {
        path: abs.clone(),
        reason: e.to_string(),
    })?;
    children.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, stat) in children {
        let child_rel = if rel.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", rel, name)
        };
        out.push(WalkEntry {
            rel: child_rel.clone(),
            is_dir: stat.is_dir,
            size: if stat.is_dir { 0 } else { stat.size },
        });
        if stat.is_dir {
            walk_remote(remote, root, &child_rel, out)?;
        }
    }
    Ok(())
}

/// One copy unit, local → remote. Owns both handles for its lifetime;
/// the counting decorator sits on the source side.
fn copy_local_to_remote(
    src: &str,
    dst: &str,
    remote: Arc<dyn RemoteFs>,
    progress: Arc<ProgressState>,
) -> Result<u64, TransferError> {
    let file = fs::File::open(src).map_err(|e| TransferError::Copy {
        path: src.to_string(),
        reason: e.to_string(),
    })?;
    let mut out = remote.create(dst).map_err(|e| TransferError::Create {
        path: dst.to_string(),
        reason: e.to_string(),
    })?;

    let mut reader = CountingReader::new(file, progress);
    let bytes = io::copy(&mut reader, &mut out).map_err(|e| TransferError::Copy {
        path: src.to_string(),
        reason: e.to_string(),
    })?;
    out.flush().map_err(|e| TransferError::Copy {
        path: dst.to_string(),
        reason: e.to_string(),
    })?;
    Ok(bytes)
}

/// One copy unit, remote → local.
fn copy_remote_to_local(
    src: &str,
    dst: &str,
    remote: Arc<dyn RemoteFs>,
    progress: Arc<ProgressState>,
) -> Result<u64, TransferError> {
    let reader = remote.open(src).map_err(|e| TransferError::Copy {
        path: src.to_string(),
        reason: e.to_string(),
    })?;
    let mut out = fs::File::create(dst).map_err(|e| TransferError::Create {
        path: dst.to_string(),
        reason: e.to_string(),
    })?;

    let mut reader = CountingReader::new(reader, progress);
    let bytes = io::copy(&mut reader, &mut out).map_err(|e| TransferError::Copy {
        path: src.to_string(),
        reason: e.to_string(),
    })?;
    out.flush().map_err(|e| TransferError::Copy {
        path: dst.to_string(),
        reason: e.to_string(),
    })?;
    Ok(bytes)
}
