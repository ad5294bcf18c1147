use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use crate::error::{EngineError, EngineResult};
use crate::fetch::{CancelToken, Fetcher};
use crate::formula::Formula;
use crate::link::{self, Layout};
use crate::record::{InstallRecord, RecordFile, RecordStore};
use crate::resolver::{Action, InstallPlan, PlanStep};
use crate::stage::{self, Staged};

/// The outcome of one committed plan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub name: String,
    pub action: Action,
    pub record: InstallRecord,
}

/// What happened to each entry of a plan.
#[derive(Debug, Default)]
pub struct InstallResult {
    /// Entries installed or upgraded, in plan order.
    pub committed: Vec<Committed>,
    /// Entries skipped because they were already satisfied.
    pub satisfied: Vec<String>,
    /// The entry that stopped the plan, and why.
    pub failed: Option<(String, EngineError)>,
    /// Entries after the failure that were never attempted.
    pub not_attempted: Vec<String>,
}

impl InstallResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Records a failure at `index` and marks every later entry as not attempted.
    pub fn halt(&mut self, plan: &InstallPlan, index: usize, error: EngineError) {
        let name = plan.steps[index].formula.name.clone();
        self.not_attempted = plan.steps[index + 1..]
            .iter()
            .map(|s| s.formula.name.clone())
            .collect();
        self.failed = Some((name, error));
    }
}

/// Commits formulas into a target namespace.
///
/// The caller must hold the namespace lock for the duration of any mutating
/// call (see [`crate::lock::NamespaceLock`]).
#[derive(Clone)]
pub struct Installer {
    layout: Layout,
    fetcher: Fetcher,
    records: RecordStore,
}

/// Paths created for an entry that has not been committed yet.
#[derive(Default)]
struct Pending {
    keg: Option<PathBuf>,
    links: Vec<PathBuf>,
}

impl Pending {
    fn undo(self, stop: &Path) {
        for link in self.links.iter().rev() {
            if let Err(e) = link::remove_link(link, stop) {
                warn!("Could not remove uncommitted link {}: {}", link.display(), e);
            }
        }
        if let Some(keg) = self.keg {
            if let Err(e) = std::fs::remove_dir_all(&keg) {
                warn!("Could not remove uncommitted keg {}: {}", keg.display(), e);
            }
        }
    }
}

impl Installer {
    pub fn new(layout: Layout, fetcher: Fetcher) -> Self {
        let records = RecordStore::new(layout.records_dir());
        Self { layout, fetcher, records }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Applies every entry of `plan` in order, stopping at the first failure.
    ///
    /// Entries committed before the failure stay installed.
    pub fn apply(&self, plan: &InstallPlan, cancel: &CancelToken) -> InstallResult {
        let mut result = InstallResult::default();
        for (index, step) in plan.steps.iter().enumerate() {
            match self.apply_step(step, cancel) {
                Ok(Some(committed)) => result.committed.push(committed),
                Ok(None) => result.satisfied.push(step.formula.name.clone()),
                Err(e) => {
                    result.halt(plan, index, e);
                    break;
                }
            }
        }
        result
    }

    /// Applies one plan entry. Already-satisfied entries are skipped without
    /// touching the filesystem and yield `None`.
    pub fn apply_step(&self, step: &PlanStep, cancel: &CancelToken) -> EngineResult<Option<Committed>> {
        if step.action == Action::AlreadySatisfied {
            debug!("{} is already satisfied", step.formula);
            return Ok(None);
        }
        let record = self.commit(&step.formula, cancel)?;
        Ok(Some(Committed {
            name: step.formula.name.clone(),
            action: step.action,
            record,
        }))
    }

    /// Fetches, stages and atomically activates `formula`, then writes its record.
    ///
    /// If another version was installed, its paths that the new version does
    /// not reuse are removed only after the new version is live.
    pub fn commit(&self, formula: &Formula, cancel: &CancelToken) -> EngineResult<InstallRecord> {
        self.layout.ensure()?;
        let existing = self.records.load(&formula.name)?;
        let targets = formula.target_paths();
        self.check_conflicts(&formula.name, &targets, existing.as_ref())?;

        let entry = self.fetcher.fetch(&formula.url, &formula.digest, cancel)?;
        let bytes = entry.read()?;
        let staged = stage::stage(
            &formula.url,
            &formula.name,
            &bytes,
            &formula.install,
            &self.layout.tmp_dir(),
        )?;
        cancel.check()?;

        let record = InstallRecord::for_formula(formula);
        let previous = existing.map(|f| f.current);
        self.activate(&record, Some(staged), previous.as_ref(), cancel)?;
        self.finish(RecordFile { current: record.clone(), previous: previous.clone() }, previous.as_ref())?;
        info!("Installed {}@{}", record.name, record.version);
        Ok(record)
    }

    /// Restores the record that the current installation of `name` replaced.
    ///
    /// # Errors
    /// - [`EngineError::NotInstalled`] if `name` has no record
    /// - [`EngineError::NoPriorVersion`] if there is nothing to roll back to
    pub fn rollback(&self, name: &str, cancel: &CancelToken) -> EngineResult<InstallRecord> {
        let file = self
            .records
            .load(name)?
            .ok_or_else(|| EngineError::NotInstalled(name.to_string()))?;
        let prior = file
            .previous
            .ok_or_else(|| EngineError::NoPriorVersion { name: name.to_string() })?;
        let current = file.current;

        let keg = self.layout.keg_dir(name, &prior.keg);
        let staged = if keg.is_dir() {
            None
        } else {
            debug!("Keg {} is gone, rebuilding it from {}", keg.display(), prior.url);
            let entry = self.fetcher.fetch(&prior.url, &prior.digest, cancel)?;
            let bytes = entry.read()?;
            Some(stage::stage(&prior.url, name, &bytes, &prior.steps, &self.layout.tmp_dir())?)
        };
        cancel.check()?;

        self.activate(&prior, staged, Some(&current), cancel)?;
        self.finish(RecordFile { current: prior.clone(), previous: None }, Some(&current))?;
        info!("Rolled back {} from {} to {}", name, current.version, prior.version);
        Ok(prior)
    }

    /// Removes every path, keg and record of `name`.
    pub fn uninstall(&self, name: &str) -> EngineResult<InstallRecord> {
        let file = self
            .records
            .load(name)?
            .ok_or_else(|| EngineError::NotInstalled(name.to_string()))?;
        for rel in &file.current.installed_paths {
            if self.layout.is_owned_by(name, rel) {
                link::remove_link(&self.layout.target(rel), self.layout.prefix())?;
            }
        }
        link::remove_link(&self.layout.opt_link(name), &self.layout.state_dir())?;
        let kegs = self.layout.kegs_dir(name);
        if kegs.exists() {
            std::fs::remove_dir_all(&kegs)
                .map_err(|e| EngineError::io(format!("removing {}", kegs.display()), e))?;
        }
        self.records.remove(name)?;
        info!("Uninstalled {}@{}", name, file.current.version);
        Ok(file.current)
    }

    /// Rejects target paths owned by another formula or by nobody we know.
    fn check_conflicts(&self, name: &str, targets: &[PathBuf], existing: Option<&RecordFile>) -> EngineResult<()> {
        let records = self.records.all()?;
        for rel in targets {
            for (owner, file) in &records {
                if owner != name && file.current.installed_paths.contains(rel) {
                    return Err(EngineError::PathConflict {
                        path: rel.clone(),
                        owner: owner.clone(),
                    });
                }
            }
            let ours = existing.is_some_and(|f| f.current.installed_paths.contains(rel));
            let path = self.layout.target(rel);
            if link::exists_no_follow(&path) && !ours && !self.layout.is_owned_by(name, rel) {
                return Err(EngineError::PathConflict {
                    path: rel.clone(),
                    owner: "an unmanaged file".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Moves the keg into place, links targets and swaps the `opt` link.
    ///
    /// Nothing is visible through the target links until the `opt` swap, and
    /// everything created before it is undone on failure.
    fn activate(
        &self,
        record: &InstallRecord,
        staged: Option<Staged>,
        replacing: Option<&InstallRecord>,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let mut pending = Pending::default();
        match self.link_and_swap(record, staged, replacing, cancel, &mut pending) {
            Ok(()) => Ok(()),
            Err(e) => {
                pending.undo(self.layout.prefix());
                Err(e)
            }
        }
    }

    fn link_and_swap(
        &self,
        record: &InstallRecord,
        staged: Option<Staged>,
        replacing: Option<&InstallRecord>,
        cancel: &CancelToken,
        pending: &mut Pending,
    ) -> EngineResult<()> {
        let name = &record.name;
        let keg = self.layout.keg_dir(name, &record.keg);
        let opt_link = self.layout.opt_link(name);
        let swap_to = opt_target(name, &record.keg);
        if let Some(staged) = staged {
            // A keg the opt link already points at may be serving reads even
            // when the record disagrees, after an interrupted commit.
            let live = replacing.is_some_and(|r| r.keg == record.keg)
                || link::read_link(&opt_link).is_some_and(|t| t == swap_to);
            if live && keg.is_dir() {
                debug!("Reusing live keg {}", keg.display());
            } else {
                if keg.exists() {
                    std::fs::remove_dir_all(&keg)
                        .map_err(|e| EngineError::io(format!("removing stale keg {}", keg.display()), e))?;
                }
                if let Some(parent) = keg.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
                }
                std::fs::rename(staged.keg(), &keg)
                    .map_err(|e| EngineError::io(format!("moving keg into {}", keg.display()), e))?;
                pending.keg = Some(keg.clone());
            }
        }

        for rel in &record.installed_paths {
            let path = self.layout.target(rel);
            if self.layout.is_owned_by(name, rel) {
                continue;
            }
            link::replace_symlink(&self.layout.link_source(name, rel), &path)?;
            pending.links.push(path);
        }

        cancel.check()?;
        link::replace_symlink(&swap_to, &opt_link)?;
        debug!("Swapped {} to {}", opt_link.display(), record.keg);
        Ok(())
    }

    /// Persists the record and removes what the replaced version no longer needs.
    ///
    /// If the record cannot be written the namespace is pointed back at the
    /// replaced version so state on disk and the record agree.
    fn finish(&self, file: RecordFile, replaced: Option<&InstallRecord>) -> EngineResult<()> {
        let name = file.current.name.clone();
        if let Err(e) = self.records.save(&file) {
            match replaced {
                Some(old) => {
                    let back = opt_target(&name, &old.keg);
                    if let Err(undo) = link::replace_symlink(&back, &self.layout.opt_link(&name)) {
                        warn!("Could not restore {} after failed record write: {}", name, undo);
                    }
                }
                None => {
                    if let Err(undo) = link::remove_link(&self.layout.opt_link(&name), &self.layout.state_dir()) {
                        warn!("Could not unlink {} after failed record write: {}", name, undo);
                    }
                }
            }
            return Err(e);
        }

        if let Some(old) = replaced {
            let keep: BTreeSet<&PathBuf> = file.current.installed_paths.iter().collect();
            for rel in &old.installed_paths {
                if keep.contains(rel) || !self.layout.is_owned_by(&name, rel) {
                    continue;
                }
                if let Err(e) = link::remove_link(&self.layout.target(rel), self.layout.prefix()) {
                    warn!("Could not remove stale path {}: {}", rel.display(), e);
                }
            }
        }
        self.prune_kegs(&file);
        Ok(())
    }

    /// Removes kegs referenced by neither the current nor the previous record.
    fn prune_kegs(&self, file: &RecordFile) {
        let dir = self.layout.kegs_dir(&file.current.name);
        let mut keep = vec![file.current.keg.as_str()];
        if let Some(previous) = &file.previous {
            keep.push(previous.keg.as_str());
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let keg = entry.file_name().to_string_lossy().to_string();
            if keep.contains(&keg.as_str()) {
                continue;
            }
            debug!("Pruning keg {}/{}", file.current.name, keg);
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                warn!("Could not prune keg {}: {}", entry.path().display(), e);
            }
        }
    }
}

/// Target of `opt/<name>` for a keg, relative to the `opt` directory.
fn opt_target(name: &str, keg: &str) -> PathBuf {
    Path::new("..").join("kegs").join(name).join(keg)
}
