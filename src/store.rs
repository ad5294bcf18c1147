use std::collections::BTreeMap;
use std::path::Path;
use semver::Version;
use tracing::debug;
use walkdir::WalkDir;
use crate::error::{EngineError, EngineResult};
use crate::formula::Formula;

/// All known formula versions, keyed by name, with one current version per name.
///
/// The store is an explicit value: the resolver borrows it immutably, so it
/// cannot change while a plan is being computed or executed.
#[derive(Debug, Clone, Default)]
pub struct FormulaStore {
    formulas: BTreeMap<String, BTreeMap<Version, Formula>>,
    current: BTreeMap<String, Version>,
}

impl FormulaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.toml` manifest under `dir` and promotes the highest
    /// version of each name to current.
    ///
    /// # Errors
    /// Fails on the first unreadable, invalid or conflicting manifest.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> EngineResult<FormulaStore> {
        let dir = dir.as_ref();
        let mut store = FormulaStore::new();
        if !dir.exists() {
            debug!("Formula directory {} does not exist", dir.display());
            return Ok(store);
        }
        let mut manifests = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| EngineError::Manifest {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                manifests.push(path.to_path_buf());
            }
        }
        manifests.sort();
        for path in manifests {
            let formula = Formula::load(&path)?;
            store.register(formula).map_err(|e| EngineError::Manifest {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }
        store.promote_latest();
        debug!("Loaded {} formulas from {}", store.len(), dir.display());
        Ok(store)
    }

    /// Registers a formula version.
    ///
    /// Registering an identical definition again is a no-op. The first
    /// registered version of a name becomes its current version.
    ///
    /// # Errors
    /// - [`EngineError::InvalidFormula`] if the formula fails validation
    /// - [`EngineError::DuplicateFormula`] if `(name, version)` exists with a different definition
    /// - [`EngineError::ConflictingDigest`] if the same `(url, version)` is known under another digest
    pub fn register(&mut self, formula: Formula) -> EngineResult<()> {
        formula.validate()?;
        if let Some(existing) = self.get(&formula.name, &formula.version) {
            if *existing == formula {
                return Ok(());
            }
            return Err(EngineError::DuplicateFormula {
                name: formula.name.clone(),
                version: formula.version.to_string(),
            });
        }
        let conflict = self
            .iter()
            .find(|f| f.url == formula.url && f.version == formula.version && f.digest != formula.digest);
        if let Some(existing) = conflict {
            return Err(EngineError::ConflictingDigest {
                url: formula.url.clone(),
                version: formula.version.to_string(),
                existing: existing.digest.clone(),
                new: formula.digest.clone(),
            });
        }
        self.current
            .entry(formula.name.clone())
            .or_insert_with(|| formula.version.clone());
        self.formulas
            .entry(formula.name.clone())
            .or_default()
            .insert(formula.version.clone(), formula);
        Ok(())
    }

    /// Marks a known version as the current one for its name.
    pub fn promote(&mut self, name: &str, version: &Version) -> EngineResult<()> {
        let versions = self
            .formulas
            .get(name)
            .ok_or_else(|| EngineError::FormulaNotFound(name.to_string()))?;
        if !versions.contains_key(version) {
            return Err(EngineError::VersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        self.current.insert(name.to_string(), version.clone());
        Ok(())
    }

    /// Promotes the highest known version of every name.
    pub fn promote_latest(&mut self) {
        for (name, versions) in &self.formulas {
            if let Some(latest) = versions.keys().next_back() {
                self.current.insert(name.clone(), latest.clone());
            }
        }
    }

    /// The designated current version of `name`.
    pub fn current(&self, name: &str) -> Option<&Formula> {
        let version = self.current.get(name)?;
        self.get(name, version)
    }

    pub fn get(&self, name: &str, version: &Version) -> Option<&Formula> {
        self.formulas.get(name)?.get(version)
    }

    /// Known versions of `name`, ascending.
    pub fn versions(&self, name: &str) -> Vec<&Version> {
        self.formulas
            .get(name)
            .map(|v| v.keys().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    /// Every registered formula version, ordered by name then version.
    pub fn iter(&self) -> impl Iterator<Item = &Formula> {
        self.formulas.values().flat_map(|v| v.values())
    }

    /// Number of registered formula versions.
    pub fn len(&self) -> usize {
        self.formulas.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest;

    fn formula(name: &str, version: &str, payload: &str) -> Formula {
        Formula {
            name: name.into(),
            version: Version::parse(version).unwrap(),
            desc: None,
            homepage: None,
            license: None,
            url: format!("https://example.org/{name}-{version}.tar.gz"),
            digest: digest::compute(payload.as_bytes()),
            depends_on: Default::default(),
            install: vec![],
            test: None,
            caveats: None,
        }
    }

    #[test]
    fn test_first_registered_version_is_current() {
        let mut store = FormulaStore::new();
        store.register(formula("fzf", "1.0.0", "a")).unwrap();
        store.register(formula("fzf", "2.0.0", "b")).unwrap();
        assert_eq!(store.current("fzf").unwrap().version, Version::new(1, 0, 0));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_promote_and_promote_latest() {
        let mut store = FormulaStore::new();
        store.register(formula("fzf", "1.0.0", "a")).unwrap();
        store.register(formula("fzf", "2.0.0", "b")).unwrap();
        store.promote_latest();
        assert_eq!(store.current("fzf").unwrap().version, Version::new(2, 0, 0));
        store.promote("fzf", &Version::new(1, 0, 0)).unwrap();
        assert_eq!(store.current("fzf").unwrap().version, Version::new(1, 0, 0));
        assert!(matches!(
            store.promote("fzf", &Version::new(3, 0, 0)),
            Err(EngineError::VersionNotFound { .. })
        ));
        assert!(matches!(
            store.promote("bat", &Version::new(1, 0, 0)),
            Err(EngineError::FormulaNotFound(_))
        ));
    }

    #[test]
    fn test_identical_registration_is_noop() {
        let mut store = FormulaStore::new();
        store.register(formula("fzf", "1.0.0", "a")).unwrap();
        store.register(formula("fzf", "1.0.0", "a")).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_version_with_new_definition_is_rejected() {
        let mut store = FormulaStore::new();
        store.register(formula("fzf", "1.0.0", "a")).unwrap();
        let mut changed = formula("fzf", "1.0.0", "a");
        changed.desc = Some("changed".into());
        assert!(matches!(store.register(changed), Err(EngineError::DuplicateFormula { .. })));
    }

    #[test]
    fn test_same_url_and_version_with_new_digest_is_rejected() {
        let mut store = FormulaStore::new();
        store.register(formula("fzf", "1.0.0", "a")).unwrap();
        let mut mirror = formula("fzf-mirror", "1.0.0", "tampered");
        mirror.url = "https://example.org/fzf-1.0.0.tar.gz".into();
        assert!(matches!(
            store.register(mirror),
            Err(EngineError::ConflictingDigest { .. })
        ));
    }

    #[test]
    fn test_load_dir_promotes_latest() {
        let dir = tempfile::tempdir().unwrap();
        for (file, version, payload) in [("a.toml", "1.0.0", "one"), ("nested/b.toml", "1.2.0", "two")] {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let content = format!(
                "name = \"fzf\"\nversion = \"{version}\"\nurl = \"https://example.org/fzf-{version}\"\nsha256 = \"{}\"\n",
                digest::compute(payload.as_bytes())
            );
            std::fs::write(path, content).unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();
        let store = FormulaStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.versions("fzf").len(), 2);
        assert_eq!(store.current("fzf").unwrap().version, Version::new(1, 2, 0));
    }

    #[test]
    fn test_load_dir_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FormulaStore::load_dir(dir.path().join("nope")).unwrap();
        assert!(store.is_empty());
    }
}
