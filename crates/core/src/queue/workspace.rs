//! Working files.
//!
//! Workers write into a private working file and the queue copies it to the
//! caller's destination only after success, so a worker killed mid-encode
//! never leaves a partial file where the caller can see it.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, ShrinkError};

/// Name prefix of every working file.
pub const WORKING_FILE_PREFIX: &str = "working_";

fn not_a_directory(dir: &Path) -> ShrinkError {
    ShrinkError::Workspace {
        path: dir.to_path_buf(),
        reason: "workspace must be a directory".to_string(),
    }
}

/// Deletes every file left in `dir` by an earlier run. Returns how many
/// were removed.
pub(crate) fn sweep(dir: &Path) -> Result<usize> {
    if dir.is_file() {
        return Err(not_a_directory(dir));
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    debug!("swept {} files from {}", removed, dir.display());
    Ok(removed)
}

/// Creates an empty working file that outlives this call.
pub(crate) fn create_working_file(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| ShrinkError::Workspace {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !dir.is_dir() {
        return Err(not_a_directory(dir));
    }
    let (_, path) = tempfile::Builder::new()
        .prefix(WORKING_FILE_PREFIX)
        .suffix(".mp4")
        .tempfile_in(dir)?
        .keep()
        .map_err(|e| ShrinkError::Io(e.error))?;
    Ok(path)
}

pub(crate) async fn remove_working_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete working file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("working_a.mp4"), b"partial").unwrap();
        std::fs::write(dir.path().join("other"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(sweep(dir.path()).unwrap(), 2);
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_sweep_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sweep(&dir.path().join("absent")).unwrap(), 0);
    }

    #[test]
    fn test_workspace_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            sweep(file.path()),
            Err(ShrinkError::Workspace { .. })
        ));
        assert!(matches!(
            create_working_file(file.path()),
            Err(ShrinkError::Workspace { .. })
        ));
    }

    #[test]
    fn test_working_file_is_created_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("work");

        let path = create_working_file(&workspace).unwrap();

        assert!(path.exists());
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(WORKING_FILE_PREFIX)));
    }

    #[tokio::test]
    async fn test_remove_missing_working_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        remove_working_file(&dir.path().join("working_gone.mp4")).await;
    }
}
