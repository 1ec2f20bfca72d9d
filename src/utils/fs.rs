//! Filesystem helpers for crash-atomic writes.

use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Result, TaktError};

/// Write `contents` to `path` atomically.
///
/// The bytes land in a temporary file in the same directory, then replace
/// the destination via rename, so readers never observe a torn file and a
/// crash mid-write leaves the previous version intact.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        TaktError::store(format!("path has no parent directory: {}", path.display()))
    })?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| TaktError::Store {
        message: format!("failed to replace {}", path.display()),
        source: Some(Box::new(e)),
    })?;
    Ok(())
}
