//! Filesystem utilities for crash-safe writes.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::ApplyError;

/// Write data to a file atomically using temp-file-then-rename.
///
/// The temporary file lives in the target's directory so the final rename
/// stays on one filesystem. It is synced before the rename and inherits the
/// original file's permissions.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ApplyError> {
    atomic_write_with(path, data, |_| Ok(()))
}

/// [`atomic_write`] with a hook that runs after the temporary file is fully
/// written and before it replaces the original.
///
/// An error from the hook aborts the write: the temporary file is removed
/// and the original is left untouched.
pub fn atomic_write_with<F>(path: &Path, data: &[u8], before_rename: F) -> Result<(), ApplyError>
where
    F: FnOnce(&Path) -> std::io::Result<()>,
{
    let display = path.display().to_string();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| ApplyError::io(&display, e))?;
    tmp.write_all(data).map_err(|e| ApplyError::io(&display, e))?;
    tmp.flush().map_err(|e| ApplyError::io(&display, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ApplyError::io(&display, e))?;

    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(tmp.path(), meta.permissions())
            .map_err(|e| ApplyError::io(&display, e))?;
    }

    before_rename(tmp.path()).map_err(|e| ApplyError::io(&display, e))?;

    tmp.persist(path)
        .map_err(|e| ApplyError::io(&display, e.error))?;
    debug!(path = %path.display(), bytes = data.len(), "atomic write complete");
    Ok(())
}
