use std::path::{Path, PathBuf};
use std::time::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use crate::error::{EngineError, EngineResult};

/// Engine settings, read from `config.toml` in the user's config directory.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Root of the namespace formulas are installed into.
    pub prefix: PathBuf,
    /// Directory of formula manifests.
    pub formula_dir: PathBuf,
    /// Content-addressed download cache.
    pub cache_dir: PathBuf,
    pub fetch_timeout_secs: u64,
    pub test_timeout_secs: u64,
    /// Evict least recently written cache entries above this size after each install.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_bytes: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let (config_dir, cache_dir, data_dir) = match project_dirs() {
            Some(dirs) => (
                dirs.config_dir().to_path_buf(),
                dirs.cache_dir().to_path_buf(),
                dirs.data_dir().to_path_buf(),
            ),
            None => {
                let base = PathBuf::from(".formulary");
                (base.join("config"), base.join("cache"), base.join("data"))
            }
        };
        Self {
            prefix: data_dir.join("prefix"),
            formula_dir: config_dir.join("formula"),
            cache_dir: cache_dir.join("downloads"),
            fetch_timeout_secs: 60,
            test_timeout_secs: 30,
            max_cache_bytes: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "formulary", "formulary")
}

impl Config {
    /// `config.toml` in the user's config directory.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads `path`, falling back to defaults if it does not exist.
    ///
    /// # Errors
    /// Returns [`EngineError::Manifest`] if the file exists but is not valid.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> EngineResult<Config> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| EngineError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> EngineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| EngineError::io(format!("writing {}", path.display()), e))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}
