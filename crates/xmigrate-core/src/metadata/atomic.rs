//! Atomic JSON persistence for reports and ID-map exports.
//!
//! Writes go to a temp file with a PID suffix, are synced to disk, and are
//! renamed over the target, so readers see either the old or the new file.

use crate::{MigrateError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MigrateError::io_with_path(e, path)),
    };

    let data = serde_json::from_str(&contents).map_err(|e| MigrateError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;
    Ok(Some(data))
}

/// Serialize `data` as pretty JSON and write it atomically to `path`.
///
/// With `keep_backup`, an existing target is copied to `<name>.json.bak`
/// first; a failed backup is logged and does not abort the write.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(data).map_err(|e| MigrateError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    if keep_backup && path.exists() {
        let backup_path = path.with_extension("json.bak");
        if let Err(e) = fs::copy(path, &backup_path) {
            warn!("Failed to create backup {}: {}", backup_path.display(), e);
        }
    }

    atomic_write_bytes(path, &serialized)?;
    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Write bytes to `path` through a synced temp file and a rename.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| MigrateError::io_with_path(e, parent))?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let write_result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(MigrateError::io_with_path(e, &temp_path));
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        MigrateError::io_with_path(e, path)
    })
}
