use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use crate::error::{EngineError, EngineResult};
use crate::formula::{Formula, InstallStep};

/// What is installed under a formula name and which files belong to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub name: String,
    pub version: Version,
    pub digest: String,
    pub url: String,
    /// Keg directory name under `kegs/<name>/`.
    pub keg: String,
    /// Prefix-relative paths linked for this version.
    pub installed_paths: Vec<PathBuf>,
    /// Placements used to build the keg, kept so it can be rebuilt from the cache.
    #[serde(default)]
    pub steps: Vec<InstallStep>,
    pub timestamp: DateTime<Utc>,
}

impl InstallRecord {
    pub fn for_formula(formula: &Formula) -> Self {
        InstallRecord {
            name: formula.name.clone(),
            version: formula.version.clone(),
            digest: formula.digest.clone(),
            url: formula.url.clone(),
            keg: formula.keg_id(),
            installed_paths: formula.target_paths(),
            steps: formula.install.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this record already satisfies `formula`.
    pub fn matches(&self, formula: &Formula) -> bool {
        self.version == formula.version && self.digest == formula.digest
    }
}

/// The persisted state of one installed name: the active record and the one it replaced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordFile {
    pub current: InstallRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<InstallRecord>,
}

/// One TOML file per installed name under `records/`.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }

    pub fn load(&self, name: &str) -> EngineResult<Option<RecordFile>> {
        let path = self.path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::io(format!("reading record {}", path.display()), e)),
        };
        let file = toml::from_str(&content).map_err(|e| EngineError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(file))
    }

    /// Writes the record through a temp file and a rename, so a crash leaves
    /// either the old or the new record.
    pub fn save(&self, file: &RecordFile) -> EngineResult<()> {
        let path = self.path(&file.current.name);
        let content = toml::to_string_pretty(file)?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| EngineError::io(format!("creating {}", self.dir.display()), e))?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| EngineError::io("creating record temp file", e))?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| EngineError::io("writing record temp file", e))?;
        tmp.persist(&path)
            .map_err(|e| EngineError::io(format!("persisting record {}", path.display()), e.error))?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> EngineResult<()> {
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(format!("removing record {}", path.display()), e)),
        }
    }

    pub fn current(&self, name: &str) -> EngineResult<Option<InstallRecord>> {
        Ok(self.load(name)?.map(|f| f.current))
    }

    /// Every record file, keyed by name.
    pub fn all(&self) -> EngineResult<BTreeMap<String, RecordFile>> {
        let mut records = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(EngineError::io(format!("listing {}", self.dir.display()), e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::io("listing records", e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if let Some(file) = self.load(&name)? {
                records.insert(name, file);
            }
        }
        Ok(records)
    }

    /// Current records of every installed name.
    pub fn installed(&self) -> EngineResult<BTreeMap<String, InstallRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .map(|(name, file)| (name, file.current))
            .collect())
    }
}
