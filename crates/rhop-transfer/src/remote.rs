//! The remote-filesystem seam.
//!
//! The engine only ever talks to a [`RemoteFs`]; [`SftpFs`] backs it with
//! the session's SFTP subsystem, [`LocalFs`] backs it with a local
//! directory (local→local sync and the engine's test bed).

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use rhop_ssh::TransportSession;

/// The subset of stat the engine needs.
#[derive(Debug, Clone, Copy)]
pub struct EntryStat {
    pub size: u64,
    pub is_dir: bool,
}

/// Narrow file-system interface on the far side of a transfer. Blocking;
/// the engine calls it from blocking tasks only.
pub trait RemoteFs: Send + Sync {
    fn stat(&self, path: &str) -> io::Result<EntryStat>;
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;
    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;
    fn mkdir(&self, path: &str) -> io::Result<()>;
    /// Entries of one directory as `(name, stat)`, no recursion, no order
    /// guarantee — callers sort.
    fn read_dir(&self, path: &str) -> io::Result<Vec<(String, EntryStat)>>;
    /// The remote working directory `~` expands to.
    fn home_dir(&self) -> io::Result<String>;
}

fn to_io(e: ssh2::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// [`RemoteFs`] over the session's SFTP subsystem.
pub struct SftpFs {
    sftp: ssh2::Sftp,
}

impl SftpFs {
    pub fn new(session: &TransportSession) -> Result<SftpFs, rhop_core::TransferError> {
        // SFTP round trips need the session in blocking mode.
        session.set_blocking(true);
        Ok(SftpFs {
            sftp: session.sftp()?,
        })
    }
}

impl RemoteFs for SftpFs {
    fn stat(&self, path: &str) -> io::Result<EntryStat> {
        let stat = self.sftp.stat(Path::new(path)).map_err(to_io)?;
        Ok(EntryStat {
            size: stat.size.unwrap_or(0),
            is_dir: stat.is_dir(),
        })
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = self.sftp.open(Path::new(path)).map_err(to_io)?;
        Ok(Box::new(file))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let file = self.sftp.create(Path::new(path)).map_err(to_io)?;
        Ok(Box::new(file))
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        match self.sftp.mkdir(Path::new(path), 0o755) {
            Ok(()) => Ok(()),
            // Re-pushing into an existing tree is fine.
            Err(e) if self.sftp.stat(Path::new(path)).map(|s| s.is_dir()).unwrap_or(false) => {
                let _ = e;
                Ok(())
            }
            Err(e) => Err(to_io(e)),
        }
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<(String, EntryStat)>> {
        let entries = self.sftp.readdir(Path::new(path)).map_err(to_io)?;
        Ok(entries
            .into_iter()
            .filter_map(|(p, stat)| {
                let name = p.file_name()?.to_str()?.to_string();
                Some((
                    name,
                    EntryStat {
                        size: stat.size.unwrap_or(0),
                        is_dir: stat.is_dir(),
                    },
                ))
            })
            .collect())
    }

    fn home_dir(&self) -> io::Result<String> {
        let home = self.sftp.realpath(Path::new(".")).map_err(to_io)?;
        home.to_str()
            .map(str::to_string)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 remote home"))
    }
}

/// [`RemoteFs`] over a local directory tree.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Paths passed to the trait are interpreted relative to `root` when
    /// they are not absolute; absolute paths are stripped of the leading
    /// separator first.
    pub fn new(root: impl Into<PathBuf>) -> LocalFs {
        LocalFs { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let trimmed = path.trim_start_matches('/');
        self.root.join(trimmed)
    }
}

impl RemoteFs for LocalFs {
    fn stat(&self, path: &str) -> io::Result<EntryStat> {
        let meta = fs::metadata(self.resolve(path))?;
        Ok(EntryStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(self.resolve(path))?))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(fs::File::create(self.resolve(path))?))
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        match fs::create_dir(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<(String, EntryStat)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            out.push((
                name,
                EntryStat {
                    size: meta.len(),
                    is_dir: meta.is_dir(),
                },
            ));
        }
        Ok(out)
    }

    fn home_dir(&self) -> io::Result<String> {
        Ok("/".to_string())
    }
}
