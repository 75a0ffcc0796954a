//! Path expression normalization.
//!
//! A leading `~` expands to the local home directory on the local side
//! and to the remote working directory (one round trip, resolved once per
//! top-level call) on the remote side. Everything else passes through.

use rhop_core::TransferError;

use crate::remote::RemoteFs;

/// Expand a leading `~` with the local home directory.
pub fn expand_local(path: &str) -> Result<String, TransferError> {
    let Some(rest) = strip_tilde(path) else {
        return Ok(path.to_string());
    };
    let home = dirs::home_dir().ok_or_else(|| TransferError::Path {
        path: path.to_string(),
        reason: "local home directory unknown".to_string(),
    })?;
    let home = home.to_str().ok_or_else(|| TransferError::Path {
        path: path.to_string(),
        reason: "local home directory is not UTF-8".to_string(),
    })?;
    Ok(join(home, rest))
}

/// Expand a leading `~` with the remote working directory.
pub fn expand_remote(path: &str, fs: &dyn RemoteFs) -> Result<String, TransferError> {
    let Some(rest) = strip_tilde(path) else {
        return Ok(path.to_string());
    };
    let home = fs.home_dir().map_err(|e| TransferError::Path {
        path: path.to_string(),
        reason: format!("remote working directory unavailable: {}", e),
    })?;
    Ok(join(&home, rest))
}

/// `Some(rest)` when the first component is exactly `~`.
fn strip_tilde(path: &str) -> Option<&str> {
    if path == "~" {
        return Some("");
    }
    path.strip_prefix("~/")
}

fn join(base: &str, rest: &str) -> String {
    if rest.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rest)
    }
}

/// Final path component, used by the destination-is-directory heuristic.
pub(crate) fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Join a destination directory and a base name.
pub(crate) fn join_dir(dir: &str, name: &str) -> String {
    join(dir, name)
}
