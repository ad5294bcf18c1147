//! Orchestration: lock, resolve, install, validate.
//!
//! An [`Engine`] ties a [`FormulaStore`] to one namespace. Every mutating
//! operation takes the namespace lock first and releases it when done.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use crate::cache::{ArtifactCache, CacheEntry};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::fetch::{CancelToken, DefaultTransport, Fetcher, Transport};
use crate::installer::{InstallResult, Installer};
use crate::link::Layout;
use crate::lock::NamespaceLock;
use crate::record::InstallRecord;
use crate::resolver::{self, InstallPlan, Request};
use crate::store::FormulaStore;
use crate::validator::{TestResult, Validator};

/// Everything that happened while executing a plan.
#[derive(Debug)]
pub struct Report {
    pub plan: InstallPlan,
    pub result: InstallResult,
    /// Test results for the committed entries, in plan order.
    pub tests: Vec<TestResult>,
}

impl Report {
    pub fn error(&self) -> Option<&EngineError> {
        self.result.failed.as_ref().map(|(_, e)| e)
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    /// `0` on success, otherwise the exit code of the error that halted the plan.
    pub fn exit_code(&self) -> u8 {
        self.error().map_or(0, EngineError::exit_code)
    }
}

pub struct Engine {
    store: FormulaStore,
    installer: Installer,
    validator: Validator,
    max_cache_bytes: Option<u64>,
}

impl Engine {
    pub fn new(store: FormulaStore, installer: Installer, validator: Validator) -> Self {
        Self {
            store,
            installer,
            validator,
            max_cache_bytes: None,
        }
    }

    /// Builds an engine over `config`'s formula directory, prefix and cache,
    /// fetching through the default transport.
    pub fn from_config(config: &Config) -> EngineResult<Engine> {
        let transport: Arc<dyn Transport> = Arc::new(DefaultTransport::new(config.fetch_timeout()));
        Self::from_config_with_transport(config, transport)
    }

    pub fn from_config_with_transport(config: &Config, transport: Arc<dyn Transport>) -> EngineResult<Engine> {
        let store = FormulaStore::load_dir(&config.formula_dir)?;
        debug!("Loaded {} formula(s) from {}", store.len(), config.formula_dir.display());
        let fetcher = Fetcher::with_transport(transport, ArtifactCache::new(&config.cache_dir));
        let installer = Installer::new(Layout::new(&config.prefix), fetcher);
        let mut engine = Engine::new(store, installer, Validator::new(config.test_timeout()));
        engine.max_cache_bytes = config.max_cache_bytes;
        Ok(engine)
    }

    pub fn with_cache_limit(mut self, max_bytes: Option<u64>) -> Self {
        self.max_cache_bytes = max_bytes;
        self
    }

    pub fn store(&self) -> &FormulaStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FormulaStore {
        &mut self.store
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn layout(&self) -> &Layout {
        self.installer.layout()
    }

    /// Resolves `requests` against the store and the installed records without changing anything.
    pub fn plan(&self, requests: &[Request]) -> EngineResult<InstallPlan> {
        let installed = self.installer.records().installed()?;
        resolver::resolve(requests, &self.store, &installed)
    }

    /// Installs `requests` and their dependencies.
    ///
    /// Resolution errors are returned before anything is touched. Once a plan
    /// exists the outcome is reported in the [`Report`], including failures.
    pub fn install(&self, requests: &[Request], cancel: &CancelToken) -> EngineResult<Report> {
        let _lock = NamespaceLock::acquire(self.layout())?;
        let plan = self.plan(requests)?;
        Ok(self.execute(plan, cancel))
    }

    /// Moves an installed formula (and its dependencies) to the store's current version.
    ///
    /// # Errors
    /// Returns [`EngineError::NotInstalled`] if `name` has no record.
    pub fn upgrade(&self, name: &str, cancel: &CancelToken) -> EngineResult<Report> {
        let _lock = NamespaceLock::acquire(self.layout())?;
        if self.installer.records().current(name)?.is_none() {
            return Err(EngineError::NotInstalled(name.to_string()));
        }
        let plan = self.plan(&[Request::new(name)])?;
        if plan.is_noop() {
            info!("{} is already up to date", name);
        }
        Ok(self.execute(plan, cancel))
    }

    /// Restores the version `name` had before its last install or upgrade.
    pub fn rollback(&self, name: &str, cancel: &CancelToken) -> EngineResult<InstallRecord> {
        let _lock = NamespaceLock::acquire(self.layout())?;
        self.installer.rollback(name, cancel)
    }

    /// Removes `name` from the namespace.
    ///
    /// # Errors
    /// Returns [`EngineError::RequiredBy`] if another installed formula
    /// depends on it, unless `force` is set.
    pub fn uninstall(&self, name: &str, force: bool) -> EngineResult<InstallRecord> {
        let _lock = NamespaceLock::acquire(self.layout())?;
        if !force {
            let dependents = self.installed_dependents(name)?;
            if !dependents.is_empty() {
                return Err(EngineError::RequiredBy {
                    name: name.to_string(),
                    dependents,
                });
            }
        }
        self.installer.uninstall(name)
    }

    /// Current install records by name.
    pub fn list(&self) -> EngineResult<BTreeMap<String, InstallRecord>> {
        self.installer.records().installed()
    }

    /// Downloads the sources of a resolved plan into the cache in parallel.
    ///
    /// Results are keyed by formula name.
    pub fn prefetch(
        &self,
        requests: &[Request],
        cancel: &CancelToken,
    ) -> EngineResult<BTreeMap<String, EngineResult<CacheEntry>>> {
        let plan = self.plan(requests)?;
        let sources: Vec<(String, String)> = plan
            .steps
            .iter()
            .map(|s| (s.formula.url.clone(), s.formula.digest.clone()))
            .collect();
        let mut fetched = self.installer.fetcher().fetch_many(&sources, cancel);
        let mut results = BTreeMap::new();
        for step in &plan.steps {
            // Errors are not Clone; names sharing a failed digest after the first get a generic one.
            let result = match fetched.get(&step.formula.digest) {
                Some(Ok(entry)) => Ok(entry.clone()),
                _ => fetched
                    .remove(&step.formula.digest)
                    .unwrap_or_else(|| Err(EngineError::network(&step.formula.url, "fetch failed"))),
            };
            results.insert(step.formula.name.clone(), result);
        }
        Ok(results)
    }

    pub fn cache(&self) -> &ArtifactCache {
        self.installer.fetcher().cache()
    }

    /// Evicts cache entries above the configured limit. Returns evicted digests.
    pub fn prune_cache(&self) -> EngineResult<Vec<String>> {
        match self.max_cache_bytes {
            Some(max) => self.cache().evict_to(max),
            None => Ok(Vec::new()),
        }
    }

    /// Applies `plan` entry by entry, testing each committed formula.
    ///
    /// A failed test halts the remaining entries like any other failure, but
    /// the tested formula stays installed.
    pub fn execute(&self, plan: InstallPlan, cancel: &CancelToken) -> Report {
        let mut result = InstallResult::default();
        let mut tests = Vec::new();
        for (index, step) in plan.steps.iter().enumerate() {
            let committed = match self.installer.apply_step(step, cancel) {
                Ok(Some(committed)) => committed,
                Ok(None) => {
                    result.satisfied.push(step.formula.name.clone());
                    continue;
                }
                Err(e) => {
                    result.halt(&plan, index, e);
                    break;
                }
            };
            result.committed.push(committed);
            let test = self.validator.validate(&step.formula, self.layout());
            let failure = test.to_error();
            tests.push(test);
            if let Some(e) = failure {
                warn!("{} is installed but failed its test", step.formula);
                result.halt(&plan, index, e);
                break;
            }
        }
        if let Err(e) = self.prune_cache() {
            warn!("Could not prune the download cache: {}", e);
        }
        Report { plan, result, tests }
    }

    /// Installed formulas whose definition depends on `name`.
    fn installed_dependents(&self, name: &str) -> EngineResult<Vec<String>> {
        let installed = self.installer.records().installed()?;
        if !installed.contains_key(name) {
            return Err(EngineError::NotInstalled(name.to_string()));
        }
        Ok(installed
            .values()
            .filter(|record| record.name != name)
            .filter(|record| {
                self.store
                    .get(&record.name, &record.version)
                    .or_else(|| self.store.current(&record.name))
                    .is_some_and(|f| f.depends_on.contains(name))
            })
            .map(|record| record.name.clone())
            .collect())
    }
}
