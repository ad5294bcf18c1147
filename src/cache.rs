use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;
use crate::digest;
use crate::error::{EngineError, EngineResult};

/// A verified payload retained on disk under its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub digest: String,
    pub path: PathBuf,
    pub size: u64,
}

impl CacheEntry {
    pub fn read(&self) -> EngineResult<Vec<u8>> {
        std::fs::read(&self.path)
            .map_err(|e| EngineError::io(format!("reading cache entry {}", self.path.display()), e))
    }
}

/// Content-addressed store of fetched payloads.
///
/// Entries are written to a temporary file and renamed into place, so
/// concurrent writers of the same digest converge on one complete file.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, digest: &str) -> EngineResult<PathBuf> {
        if !digest::is_well_formed(digest) {
            return Err(EngineError::io(
                format!("cache key '{digest}'"),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a sha256 digest"),
            ));
        }
        Ok(self.root.join(digest))
    }

    /// Looks up the entry for `digest`.
    pub fn get(&self, digest: &str) -> EngineResult<Option<CacheEntry>> {
        let path = self.path_for(digest)?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(CacheEntry {
                digest: digest.to_string(),
                path,
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::io(format!("reading cache entry {}", path.display()), e)),
        }
    }

    /// Stores `bytes` under `digest`. The caller must have verified them.
    pub fn put(&self, digest: &str, bytes: &[u8]) -> EngineResult<CacheEntry> {
        let path = self.path_for(digest)?;
        std::fs::create_dir_all(&self.root)
            .map_err(|e| EngineError::io(format!("creating cache dir {}", self.root.display()), e))?;
        let mut tmp = NamedTempFile::new_in(&self.root)
            .map_err(|e| EngineError::io("creating cache temp file", e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| EngineError::io("writing cache temp file", e))?;
        tmp.persist(&path)
            .map_err(|e| EngineError::io(format!("persisting cache entry {}", path.display()), e.error))?;
        debug!("Cached {} ({} bytes)", digest::short(digest), bytes.len());
        Ok(CacheEntry {
            digest: digest.to_string(),
            path,
            size: bytes.len() as u64,
        })
    }

    pub fn remove(&self, digest: &str) -> EngineResult<()> {
        let path = self.path_for(digest)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(format!("removing cache entry {}", path.display()), e)),
        }
    }

    /// All complete entries, oldest modification first.
    pub fn entries(&self) -> EngineResult<Vec<CacheEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| EngineError::io("listing cache", e.into()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().is_file() || !digest::is_well_formed(&name) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| EngineError::io("listing cache", e.into()))?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, CacheEntry {
                digest: name,
                path: entry.path().to_path_buf(),
                size: meta.len(),
            }));
        }
        entries.sort_by(|(a, ea), (b, eb)| a.cmp(b).then_with(|| ea.digest.cmp(&eb.digest)));
        Ok(entries.into_iter().map(|(_, e)| e).collect())
    }

    pub fn total_size(&self) -> EngineResult<u64> {
        Ok(self.entries()?.iter().map(|e| e.size).sum())
    }

    /// Removes the oldest entries until the cache fits in `max_bytes`.
    /// Returns the evicted digests.
    pub fn evict_to(&self, max_bytes: u64) -> EngineResult<Vec<String>> {
        let entries = self.entries()?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let mut evicted = Vec::new();
        for entry in entries {
            if total <= max_bytes {
                break;
            }
            self.remove(&entry.digest)?;
            total -= entry.size;
            evicted.push(entry.digest);
        }
        Ok(evicted)
    }

    /// Drops every entry.
    pub fn clean(&self) -> EngineResult<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)
                .map_err(|e| EngineError::io(format!("removing cache dir {}", self.root.display()), e))?;
        }
        std::fs::create_dir_all(&self.root)
            .map_err(|e| EngineError::io(format!("creating cache dir {}", self.root.display()), e))?;
        Ok(())
    }
}
