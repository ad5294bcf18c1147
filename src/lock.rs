use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use fs4::FileExt;
use tracing::debug;
use crate::error::{EngineError, EngineResult};
use crate::link::Layout;

/// Exclusive lock over a target namespace, held for the lifetime of the value.
///
/// Only one installer may mutate a prefix at a time; the lock is released when
/// the guard is dropped, including on early returns.
#[derive(Debug)]
pub struct NamespaceLock {
    file: File,
    path: PathBuf,
}

impl NamespaceLock {
    /// Acquires the lock without waiting.
    ///
    /// # Errors
    /// Returns [`EngineError::NamespaceLocked`] if another process holds it.
    pub fn acquire(layout: &Layout) -> EngineResult<NamespaceLock> {
        let path = layout.lock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| EngineError::io(format!("opening lock {}", path.display()), e))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked namespace {}", path.display());
                Ok(NamespaceLock { file, path })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Err(EngineError::NamespaceLocked(layout.prefix().to_path_buf()))
            }
            Err(e) => Err(EngineError::io(format!("locking {}", path.display()), e)),
        }
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Unlocked namespace {}", self.path.display());
    }
}
