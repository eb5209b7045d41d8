//! Crash-safe file replacement.
//!
//! Writers produce a sibling temp file, flush it to disk, then rename it over
//! the target. A crash at any point leaves either the old file or the new one,
//! never a partial write.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{RelayError, Result};

/// Atomically replaces `path` with `data`.
///
/// The temp file is named `.{file}.tmp-{pid}-{nonce}` next to the target so the
/// rename stays on one filesystem. Parent directories are created as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| RelayError::Config(format!("Path {} has no file name", path.display())))?;

    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let temp_name = format!(
        ".{}.tmp-{}-{}",
        file_name.to_string_lossy(),
        std::process::id(),
        &nonce[..8]
    );
    let temp_path = path.with_file_name(temp_name);

    let write_result = (|| -> std::io::Result<()> {
        let mut temp_file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        temp_file.write_all(data)?;
        temp_file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(RelayError::Io(err));
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(RelayError::Io(err));
    }

    Ok(())
}

/// Async wrapper around [`atomic_write`] for use inside the runtime.
pub async fn atomic_write_async(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write(&path, &data))
        .await
        .map_err(|e| RelayError::Session(format!("write task failed: {}", e)))?
}
