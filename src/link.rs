use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::error::{EngineError, EngineResult};

/// Name of the engine's private directory inside a prefix.
pub const STATE_DIR: &str = ".formulary";

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Paths of a target namespace.
///
/// ```text
/// <prefix>/<to>                      -> <prefix>/.formulary/opt/<name>/<to>
/// <prefix>/.formulary/opt/<name>     -> ../kegs/<name>/<keg id>
/// <prefix>/.formulary/kegs/<name>/<keg id>/<to>
/// <prefix>/.formulary/records/<name>.toml
/// ```
///
/// Every target path resolves through the `opt` link, so swapping that one
/// link moves all of a formula's paths to another version at once.
#[derive(Debug, Clone)]
pub struct Layout {
    prefix: PathBuf,
}

impl Layout {
    /// A relative `prefix` is made absolute against the current directory.
    pub fn new<P: AsRef<Path>>(prefix: P) -> Self {
        let prefix = prefix.as_ref();
        let prefix = std::path::absolute(prefix).unwrap_or_else(|_| prefix.to_path_buf());
        Self { prefix }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn state_dir(&self) -> PathBuf {
        self.prefix.join(STATE_DIR)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn opt_link(&self, name: &str) -> PathBuf {
        self.state_dir().join("opt").join(name)
    }

    pub fn kegs_dir(&self, name: &str) -> PathBuf {
        self.state_dir().join("kegs").join(name)
    }

    pub fn keg_dir(&self, name: &str, keg_id: &str) -> PathBuf {
        self.kegs_dir(name).join(keg_id)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.state_dir().join("records")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    /// Absolute location of a prefix-relative target path.
    pub fn target(&self, rel: &Path) -> PathBuf {
        self.prefix.join(rel)
    }

    /// What the link at `rel` points to when `name` owns it.
    pub fn link_source(&self, name: &str, rel: &Path) -> PathBuf {
        self.opt_link(name).join(rel)
    }

    /// Whether the path at `rel` is a link created for `name`.
    pub fn is_owned_by(&self, name: &str, rel: &Path) -> bool {
        read_link(&self.target(rel)).is_some_and(|t| t == self.link_source(name, rel))
    }

    /// Ensures the state directory structure exists.
    pub fn ensure(&self) -> EngineResult<()> {
        for dir in [
            self.state_dir().join("opt"),
            self.state_dir().join("kegs"),
            self.records_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| EngineError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }
}

/// Creates a platform-specific symbolic link at `link` pointing to `target`.
pub fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(windows)]
    {
        let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
        if resolved.is_dir() {
            std::os::windows::fs::symlink_dir(target, link)
        } else {
            std::os::windows::fs::symlink_file(target, link)
        }
    }
}

/// Atomically points `link` at `target`.
///
/// The new link is created under a temporary name next to `link` and renamed
/// over it, so readers see either the old or the new target, never neither.
pub fn replace_symlink(target: &Path, link: &Path) -> EngineResult<()> {
    let parent = link.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
    let file_name = link
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{file_name}.tmp-{}-{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    create_symlink(target, &tmp)
        .map_err(|e| EngineError::io(format!("linking {}", tmp.display()), e))?;
    std::fs::rename(&tmp, link).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        EngineError::io(format!("swapping link {}", link.display()), e)
    })
}

/// The target of the symlink at `path`, if it is one.
pub fn read_link(path: &Path) -> Option<PathBuf> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    std::fs::read_link(path).ok()
}

/// Whether anything (including a dangling link) exists at `path`.
pub fn exists_no_follow(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Removes a link and then any directories it leaves empty, up to `stop`.
pub fn remove_link(link: &Path, stop: &Path) -> EngineResult<()> {
    match std::fs::remove_file(link) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(EngineError::io(format!("removing {}", link.display()), e)),
    }
    let mut dir = link.parent();
    while let Some(current) = dir {
        if current == stop || !current.starts_with(stop) {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_replace_symlink_swaps_target() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("nested").join("current");
        replace_symlink(Path::new("one"), &link).unwrap();
        assert_eq!(read_link(&link), Some(PathBuf::from("one")));
        replace_symlink(Path::new("two"), &link).unwrap();
        assert_eq!(read_link(&link), Some(PathBuf::from("two")));
        let leftovers = std::fs::read_dir(link.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_read_link_ignores_regular_files() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        assert!(read_link(&file).is_none());
        assert!(exists_no_follow(&file));
    }

    #[test]
    fn test_remove_link_prunes_empty_parents() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("share/man/man1/tool.1");
        replace_symlink(Path::new("nowhere"), &link).unwrap();
        remove_link(&link, dir.path()).unwrap();
        assert!(!dir.path().join("share").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_layout_ownership() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let rel = Path::new("bin/tool");
        replace_symlink(&layout.link_source("tool", rel), &layout.target(rel)).unwrap();
        assert!(layout.is_owned_by("tool", rel));
        assert!(!layout.is_owned_by("other", rel));
    }

    #[test]
    fn test_relative_prefix_is_made_absolute() {
        let layout = Layout::new("some/prefix");
        assert!(layout.prefix().is_absolute());
        assert!(layout.prefix().ends_with("some/prefix"));
        assert!(layout.link_source("tool", Path::new("bin/tool")).is_absolute());
    }
}
