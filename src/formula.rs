use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use crate::digest;
use crate::error::{EngineError, EngineResult};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9+_.@-]*$").expect("formula name pattern")
});

/// A named, versioned package description.
///
/// Formulas are pure data: where to get the bytes, how to check them, where
/// the artifacts go and how to smoke-test the result.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    /// Unique name within a store.
    pub name: String,
    /// Semantic version of the packaged software.
    pub version: Version,
    /// One-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Where the source bytes are fetched from.
    pub url: String,
    /// SHA-256 of the bytes behind `url`, lower-case hex.
    #[serde(rename = "sha256")]
    pub digest: String,
    /// Names of formulas that must be installed first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Artifact placements, applied in order.
    #[serde(default)]
    pub install: Vec<InstallStep>,
    /// Post-install smoke test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestCommand>,
    /// Notes printed after a successful install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveats: Option<String>,
}

/// Places `from` (relative to the unpacked source) at `to` (relative to the prefix).
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// A command and the exit status it must produce.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub command: Vec<String>,
    #[serde(default)]
    pub status: i32,
}

impl fmt::Display for TestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command.join(" "))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl Formula {
    /// Parses a formula from TOML and normalizes its digest.
    pub fn from_toml_str(content: &str) -> EngineResult<Formula> {
        let mut formula: Formula = toml::from_str(content)?;
        formula.digest = digest::normalize(&formula.digest);
        Ok(formula)
    }

    /// Loads a formula manifest from a file path.
    ///
    /// # Errors
    /// Returns [`EngineError::Manifest`] if the file can't be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Formula> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| EngineError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Checks the structural invariants of a single formula.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidFormula {
            name: self.name.clone(),
            reason,
        };
        if !NAME_RE.is_match(&self.name) {
            return Err(invalid("name must match [a-z0-9][a-z0-9+_.@-]*".into()));
        }
        if !digest::is_well_formed(&self.digest) {
            return Err(invalid(format!("malformed sha256 digest '{}'", self.digest)));
        }
        if self.url.trim().is_empty() {
            return Err(invalid("url is empty".into()));
        }
        if self.depends_on.contains(&self.name) {
            return Err(invalid("formula depends on itself".into()));
        }
        let mut targets = BTreeSet::new();
        for step in &self.install {
            if !is_contained(&step.from) {
                return Err(invalid(format!("source path {} escapes the source tree", step.from.display())));
            }
            if !is_contained(&step.to) {
                return Err(invalid(format!("target path {} escapes the prefix", step.to.display())));
            }
            if step.to.starts_with(crate::link::STATE_DIR) {
                return Err(invalid(format!("target path {} is reserved", step.to.display())));
            }
            if !targets.insert(&step.to) {
                return Err(invalid(format!("target path {} is placed twice", step.to.display())));
            }
        }
        if let Some(test) = &self.test {
            if test.command.is_empty() {
                return Err(invalid("test command is empty".into()));
            }
        }
        Ok(())
    }

    /// The file name a single-file payload is staged under: the last URL segment.
    pub fn source_file_name(&self) -> String {
        file_name_from_url(&self.url, &self.name)
    }

    /// Directory name of this version's keg.
    pub fn keg_id(&self) -> String {
        format!("{}-{}", self.version, digest::short(&self.digest))
    }

    /// Prefix-relative paths this formula places.
    pub fn target_paths(&self) -> Vec<PathBuf> {
        self.install.iter().map(|s| s.to.clone()).collect()
    }
}

/// Last path segment of `url` without query or fragment, or `fallback` if there is none.
pub fn file_name_from_url(url: &str, fallback: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':') && *s != "." && *s != "..")
        .unwrap_or(fallback)
        .to_string()
}

/// A relative path made only of normal components.
fn is_contained(path: &Path) -> bool {
    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => return false,
        }
    }
    normal > 0
}
