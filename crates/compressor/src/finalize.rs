//! Moving finished outputs into place.
//!
//! Outputs are written to a temp location first and only appear at their
//! final path once complete, so a reader never sees a partial file there.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Refusing to overwrite existing file {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("Failed to copy output into place: {0}")]
    CopyFailed(std::io::Error),

    #[error("Failed to rename output into place: {0}")]
    RenameFailed(std::io::Error),
}

/// Pick `<dir>/<stem><suffix>.<ext>`, adding `-1`, `-2`, ... while `is_taken`
pub fn unique_destination(
    dir: &Path,
    stem: &str,
    suffix: &str,
    ext: &str,
    is_taken: impl Fn(&Path) -> bool,
) -> PathBuf {
    let first = dir.join(format!("{}{}.{}", stem, suffix, ext));
    if !is_taken(&first) {
        return first;
    }

    (1u32..)
        .map(|n| dir.join(format!("{}{}-{}.{}", stem, suffix, n, ext)))
        .find(|p| !is_taken(p))
        .unwrap_or(first)
}

/// Sibling path used while copying across filesystems
fn incoming_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".incoming");
    PathBuf::from(name)
}

/// Move `temp` to `dest`.
///
/// Tries a rename first. When that fails (temp dir on another filesystem)
/// the file is copied next to `dest` and renamed over, then `temp` removed.
pub fn move_into_place(temp: &Path, dest: &Path) -> Result<(), FinalizeError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|source| FinalizeError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    if dest.exists() {
        return Err(FinalizeError::DestinationExists(dest.to_path_buf()));
    }

    if fs::rename(temp, dest).is_ok() {
        debug!("Renamed {} to {}", temp.display(), dest.display());
        return Ok(());
    }

    let incoming = incoming_path(dest);
    if let Err(e) = fs::copy(temp, &incoming) {
        let _ = fs::remove_file(&incoming);
        return Err(FinalizeError::CopyFailed(e));
    }
    if let Err(e) = fs::rename(&incoming, dest) {
        let _ = fs::remove_file(&incoming);
        return Err(FinalizeError::RenameFailed(e));
    }

    remove_partial(temp);
    debug!("Copied {} to {}", temp.display(), dest.display());
    Ok(())
}

/// Best-effort removal of a temp or partial output
pub fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}
