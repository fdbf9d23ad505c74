//! Crash-safe file replacement.
//!
//! All writes follow crash-only design: write to a temp file in the target
//! directory, fsync, rename over the destination.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::warn;

use crate::errors::{BackstopError, Result};

/// Atomically replace `path` with `data`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(parent).map_err(|e| BackstopError::io(parent, e))?;
    temp.write_all(data).map_err(|e| BackstopError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| BackstopError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| BackstopError::io(path, e.error))?;

    // fsync the directory so the rename itself is durable.
    #[cfg(unix)]
    if let Err(e) = std::fs::File::open(parent).and_then(|dir| dir.sync_all()) {
        warn!(dir = %parent.display(), error = %e, "failed to fsync directory after rename");
    }
    Ok(())
}

/// Read `path`, mapping a missing file to [`BackstopError::NotFound`].
pub fn read_existing(path: &Path, what: &str) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackstopError::not_found(
            format!("{what} at {}", path.display()),
        )),
        Err(e) => Err(BackstopError::io(path, e)),
    }
}
