//! Crash-safe file replacement: readers see the old file or the new one,
//! never a partial write.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// `notes/a.md` -> `notes/a.md.<suffix>` in the same directory.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}", name, suffix))
}

/// Write `bytes` to `<path>.tmp`, fsync it, then rename over `path`.
///
/// The parent directory must exist. On error the temp file is removed and
/// `path` is left as it was. Concurrent writers to the same `path` must be
/// serialized by the caller.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty destination path"));
    }
    let temp_path = sibling(path, "tmp");
    if let Err(e) = write_synced(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = fs::File::create(path).await?;
    f.write_all(bytes).await?;
    f.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn replaces_existing_file_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "old body that is longer").unwrap();

        write_atomic(&path, b"new").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert!(!dir.path().join("note.md.tmp").exists());
    }

    #[tokio::test]
    async fn failed_write_keeps_the_previous_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "committed").unwrap();
        // a directory where the temp file should go makes the write fail
        std::fs::create_dir(dir.path().join("note.md.tmp")).unwrap();

        assert!(write_atomic(&path, b"partial").await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "committed");
    }
}
