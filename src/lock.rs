//! File-based locking for single-writer safety.
//!
//! Cross-platform (fs2) advisory locks:
//! - Exclusive: single writing process per store; a second writer is rejected
//!   at open time (try-lock, no blocking).
//! - Shared: read-only tooling (`obexdb check`); blocks while a writer holds
//!   the exclusive lock.
//!
//! Lock file path: <root>/LOCK
//! Lock is released on Drop.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::errors::{ObexError, Result};

#[derive(Debug, Clone, Copy)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}

fn lock_file_path(root: &Path) -> PathBuf {
    root.join("LOCK")
}

fn open_lock_file(root: &Path) -> Result<std::fs::File> {
    let path = lock_file_path(root);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)?;
    Ok(f)
}

/// Try to acquire the exclusive writer lock. Fails immediately if another
/// process holds it, a second writer is rejected at open.
pub fn try_acquire_exclusive_lock(root: &Path) -> Result<LockGuard> {
    let file = open_lock_file(root)?;
    file.try_lock_exclusive().map_err(|_| {
        ObexError::usage(format!(
            "store at {} is locked by another writing process",
            root.display()
        ))
    })?;
    Ok(LockGuard {
        file,
        path: lock_file_path(root),
        mode: LockMode::Exclusive,
    })
}

/// Shared lock for read-only tooling. Blocks until the writer releases.
pub fn acquire_shared_lock(root: &Path) -> Result<LockGuard> {
    let file = open_lock_file(root)?;
    file.lock_shared().map_err(|e| {
        ObexError::usage(format!(
            "lock_shared {}: {}",
            lock_file_path(root).display(),
            e
        ))
    })?;
    Ok(LockGuard {
        file,
        path: lock_file_path(root),
        mode: LockMode::Shared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_exclusive_lock_rejected() {
        let root = std::env::temp_dir().join(format!(
            "obx-lock-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&root).unwrap();

        let g1 = try_acquire_exclusive_lock(&root).unwrap();
        let err = try_acquire_exclusive_lock(&root).unwrap_err();
        assert!(matches!(err, ObexError::Usage(_)));
        drop(g1);

        // После освобождения лок снова доступен.
        let _g2 = try_acquire_exclusive_lock(&root).unwrap();
    }
}
