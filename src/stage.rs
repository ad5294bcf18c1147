use std::io::Cursor;
use std::path::{Path, PathBuf};
use flate2::read::GzDecoder;
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;
use crate::error::{EngineError, EngineResult};
use crate::formula::{InstallStep, file_name_from_url};

/// A keg assembled in a temporary directory.
///
/// Dropping it removes everything that was not moved out with
/// [`Staged::keg`] first.
#[derive(Debug)]
pub struct Staged {
    dir: TempDir,
}

impl Staged {
    /// The assembled keg root, ready to be renamed into place.
    pub fn keg(&self) -> PathBuf {
        self.dir.path().join("keg")
    }
}

/// Unpacks `bytes` and applies `steps` into a fresh staging directory under `tmp_root`.
///
/// # Errors
/// Returns [`EngineError::InstallIOError`] if the payload cannot be unpacked
/// or a step's source path does not exist.
pub fn stage(
    url: &str,
    fallback_name: &str,
    bytes: &[u8],
    steps: &[InstallStep],
    tmp_root: &Path,
) -> EngineResult<Staged> {
    std::fs::create_dir_all(tmp_root)
        .map_err(|e| EngineError::io(format!("creating {}", tmp_root.display()), e))?;
    let dir = tempfile::Builder::new()
        .prefix("stage-")
        .tempdir_in(tmp_root)
        .map_err(|e| EngineError::io("creating staging directory", e))?;
    let staged = Staged { dir };
    let src = staged.dir.path().join("src");
    unpack(&file_name_from_url(url, fallback_name), bytes, &src)?;
    place(&src, &staged.keg(), steps)?;
    debug!("Staged {} step(s) in {}", steps.len(), staged.dir.path().display());
    Ok(staged)
}

/// Unpacks an archive by file extension, or writes a single file named `file_name`.
pub fn unpack(file_name: &str, bytes: &[u8], dest: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(dest)
        .map_err(|e| EngineError::io(format!("creating {}", dest.display()), e))?;
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        tar::Archive::new(GzDecoder::new(bytes))
            .unpack(dest)
            .map_err(|e| EngineError::io(format!("unpacking {file_name}"), e))
    } else if lower.ends_with(".tar") {
        tar::Archive::new(bytes)
            .unpack(dest)
            .map_err(|e| EngineError::io(format!("unpacking {file_name}"), e))
    } else if lower.ends_with(".zip") {
        zip::ZipArchive::new(Cursor::new(bytes))
            .and_then(|mut archive| archive.extract(dest))
            .map_err(|e| EngineError::io(format!("unpacking {file_name}"), std::io::Error::other(e)))
    } else {
        let path = dest.join(file_name);
        std::fs::write(&path, bytes).map_err(|e| EngineError::io(format!("writing {}", path.display()), e))
    }
}

/// Copies each step's `from` (file or directory) to `to` under `keg`.
pub fn place(src: &Path, keg: &Path, steps: &[InstallStep]) -> EngineResult<()> {
    std::fs::create_dir_all(keg).map_err(|e| EngineError::io(format!("creating {}", keg.display()), e))?;
    for step in steps {
        let from = src.join(&step.from);
        let to = keg.join(&step.to);
        if !from.exists() {
            return Err(EngineError::io(
                format!("install step source {}", step.from.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "not found in unpacked source"),
            ));
        }
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            copy_file(&from, &to)?;
        }
        if is_executable_dir(&step.to) {
            make_executable(&to)?;
        }
    }
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> EngineResult<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
    }
    std::fs::copy(from, to)
        .map_err(|e| EngineError::io(format!("copying {} to {}", from.display(), to.display()), e))?;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> EngineResult<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| EngineError::io(format!("walking {}", from.display()), e.into()))?;
        let Ok(rel) = entry.path().strip_prefix(from) else {
            continue;
        };
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)
                .map_err(|e| EngineError::io(format!("creating {}", dest.display()), e))?;
        } else {
            copy_file(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Targets under `bin/` and `sbin/` are made executable.
fn is_executable_dir(to: &Path) -> bool {
    to.starts_with("bin") || to.starts_with("sbin")
}

#[cfg(unix)]
fn make_executable(path: &Path) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| EngineError::io(format!("walking {}", path.display()), e.into()))?;
        if entry.file_type().is_file() {
            let mut perms = entry
                .metadata()
                .map_err(|e| EngineError::io("reading permissions", e.into()))?
                .permissions();
            perms.set_mode(perms.mode() | 0o755);
            std::fs::set_permissions(entry.path(), perms)
                .map_err(|e| EngineError::io(format!("chmod {}", entry.path().display()), e))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> EngineResult<()> {
    Ok(())
}
