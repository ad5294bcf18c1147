//! Dependency resolution.
//!
//! Expands requested formulas to their transitive dependencies and orders
//! them so every dependency comes before its dependents. Resolution only
//! reads the [`FormulaStore`] and the installed records; it has no side
//! effects, and the plan it returns is fixed before anything is installed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use semver::Version;
use serde::Serialize;
use tracing::{debug, info};
use crate::error::{EngineError, EngineResult};
use crate::formula::Formula;
use crate::record::InstallRecord;
use crate::store::FormulaStore;

/// A formula asked for by the caller, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub version: Option<Version>,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: None }
    }

    pub fn pinned(name: impl Into<String>, version: Version) -> Self {
        Self { name: name.into(), version: Some(version) }
    }

    /// Parses `name` or `name@version` against the names known to `store`.
    ///
    /// Names may contain `@` themselves (`python@3.11`): an input that is a
    /// known name, or whose last `@` suffix is not a version, is a plain name.
    pub fn parse(input: &str, store: &FormulaStore) -> Request {
        if store.contains(input) {
            return Request::new(input);
        }
        match input.rsplit_once('@') {
            Some((name, version)) if !name.is_empty() => {
                match Version::parse(version.trim_start_matches('v')) {
                    Ok(version) => Request::pinned(name, version),
                    Err(_) => Request::new(input),
                }
            }
            _ => Request::new(input),
        }
    }
}

/// What the installer will do with a planned formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Install,
    Upgrade,
    AlreadySatisfied,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::AlreadySatisfied => "already-satisfied",
        };
        write!(f, "{}", name)
    }
}

/// One entry of an [`InstallPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub formula: Formula,
    pub action: Action,
    /// Version installed before this plan ran, if any.
    pub installed: Option<Version>,
}

/// Who asked for which version of a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Demand {
    /// `"request"` for the caller, otherwise the dependent formula's name.
    pub by: String,
    pub version: Version,
}

/// Recorded when demands on a name disagree and the current version was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionDecision {
    pub name: String,
    pub demands: Vec<Demand>,
    pub selected: Version,
}

/// A dependency-ordered list of actions, fixed before execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallPlan {
    pub steps: Vec<PlanStep>,
    pub decisions: Vec<VersionDecision>,
}

impl InstallPlan {
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.formula.name.as_str()).collect()
    }

    /// `true` when every step is already satisfied.
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| s.action == Action::AlreadySatisfied)
    }

    pub fn step(&self, name: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.formula.name == name)
    }
}

const REQUEST: &str = "request";

/// Resolves `requests` against `store` into an ordered plan.
///
/// # Errors
/// - [`EngineError::FormulaNotFound`] / [`EngineError::VersionNotFound`] for unknown requests
/// - [`EngineError::MissingDependency`] when a dependency is absent from the store
/// - [`EngineError::DependencyCycle`] with the full cycle path
pub fn resolve(
    requests: &[Request],
    store: &FormulaStore,
    installed: &BTreeMap<String, InstallRecord>,
) -> EngineResult<InstallPlan> {
    let mut pins: BTreeMap<String, Vec<Demand>> = BTreeMap::new();
    for request in requests {
        let formula = match &request.version {
            Some(version) => store.get(&request.name, version).ok_or_else(|| {
                if store.contains(&request.name) {
                    EngineError::VersionNotFound {
                        name: request.name.clone(),
                        version: version.to_string(),
                    }
                } else {
                    EngineError::FormulaNotFound(request.name.clone())
                }
            })?,
            None => store
                .current(&request.name)
                .ok_or_else(|| EngineError::FormulaNotFound(request.name.clone()))?,
        };
        let demands = pins.entry(request.name.clone()).or_default();
        let demand = Demand { by: REQUEST.to_string(), version: formula.version.clone() };
        if !demands.contains(&demand) {
            demands.push(demand);
        }
    }

    // Dependents only ever ask for the current version. A pinned request that
    // is also some other formula's dependency therefore has to be re-selected,
    // which can change the graph; iterate until the dependency demands settle.
    // The set only grows, so this terminates.
    let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let (graph, decisions) = loop {
        let (selection, decisions) = select(store, &pins, &dependents);
        let graph = expand(store, pins.keys(), &selection)?;
        let mut grown = dependents.clone();
        for (name, deps) in &graph.edges {
            for dep in deps {
                grown.entry(dep.clone()).or_default().insert(name.clone());
            }
        }
        if grown == dependents {
            break (graph, decisions);
        }
        dependents = grown;
    };

    detect_cycle(&graph, pins.keys())?;
    let order = topological_order(&graph)?;

    let steps = order
        .into_iter()
        .map(|name| {
            let formula = graph.nodes[&name].clone();
            let record = installed.get(&name);
            let action = match record {
                None => Action::Install,
                Some(record) if record.matches(&formula) => Action::AlreadySatisfied,
                Some(_) => Action::Upgrade,
            };
            PlanStep {
                formula,
                action,
                installed: record.map(|r| r.version.clone()),
            }
        })
        .collect::<Vec<_>>();

    for decision in &decisions {
        info!(
            "Selected current {}@{} over conflicting demands {:?}",
            decision.name,
            decision.selected,
            decision.demands.iter().map(|d| format!("{}@{} by {}", decision.name, d.version, d.by)).collect::<Vec<_>>()
        );
    }
    debug!("Resolved plan: {:?}", steps.iter().map(|s| s.formula.to_string()).collect::<Vec<_>>());
    Ok(InstallPlan { steps, decisions })
}

struct Graph {
    nodes: BTreeMap<String, Formula>,
    edges: BTreeMap<String, BTreeSet<String>>,
}

/// Picks a version for every name with demands: the agreed one, or the
/// store's current version when the demands disagree.
fn select(
    store: &FormulaStore,
    pins: &BTreeMap<String, Vec<Demand>>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> (BTreeMap<String, Formula>, Vec<VersionDecision>) {
    let mut selection = BTreeMap::new();
    let mut decisions = Vec::new();
    for (name, requested) in pins {
        let Some(current) = store.current(name) else {
            continue;
        };
        let mut demands = requested.clone();
        for dependent in dependents.get(name).into_iter().flatten() {
            demands.push(Demand { by: dependent.clone(), version: current.version.clone() });
        }
        let versions: BTreeSet<&Version> = demands.iter().map(|d| &d.version).collect();
        let chosen = if versions.len() == 1 {
            store.get(name, versions.into_iter().next().unwrap_or(&current.version))
        } else {
            decisions.push(VersionDecision {
                name: name.clone(),
                demands,
                selected: current.version.clone(),
            });
            None
        };
        selection.insert(name.clone(), chosen.unwrap_or(current).clone());
    }
    (selection, decisions)
}

/// Walks dependencies from the roots; unselected names use the current version.
fn expand<'a>(
    store: &FormulaStore,
    roots: impl Iterator<Item = &'a String>,
    selection: &BTreeMap<String, Formula>,
) -> EngineResult<Graph> {
    let mut graph = Graph { nodes: BTreeMap::new(), edges: BTreeMap::new() };
    let mut queue: Vec<(String, Option<String>)> = roots.map(|r| (r.clone(), None)).collect();
    queue.reverse();
    while let Some((name, parent)) = queue.pop() {
        if graph.nodes.contains_key(&name) {
            continue;
        }
        let formula = selection
            .get(&name)
            .or_else(|| store.current(&name))
            .ok_or_else(|| match &parent {
                Some(parent) => EngineError::MissingDependency {
                    name: name.clone(),
                    required_by: parent.clone(),
                },
                None => EngineError::FormulaNotFound(name.clone()),
            })?;
        for dep in formula.depends_on.iter().rev() {
            queue.push((dep.clone(), Some(name.clone())));
        }
        graph.edges.insert(name.clone(), formula.depends_on.clone());
        graph.nodes.insert(name, formula.clone());
    }
    Ok(graph)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search from the roots in name order, reporting the first
/// cycle found as `a -> b -> ... -> a`.
fn detect_cycle<'a>(graph: &Graph, roots: impl Iterator<Item = &'a String>) -> EngineResult<()> {
    fn visit(
        name: &str,
        graph: &Graph,
        marks: &mut BTreeMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| n == name).unwrap_or(0);
                let mut path = stack[start..].to_vec();
                path.push(name.to_string());
                return Some(path);
            }
            None => {}
        }
        marks.insert(name.to_string(), Mark::Visiting);
        stack.push(name.to_string());
        for dep in graph.edges.get(name).into_iter().flatten() {
            if let Some(path) = visit(dep, graph, marks, stack) {
                return Some(path);
            }
        }
        stack.pop();
        marks.insert(name.to_string(), Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut stack = Vec::new();
    let roots: Vec<String> = roots.cloned().collect();
    for root in roots.iter().chain(graph.nodes.keys()) {
        if let Some(path) = visit(root, graph, &mut marks, &mut stack) {
            return Err(EngineError::DependencyCycle { path });
        }
    }
    Ok(())
}

/// Kahn's algorithm; among ready nodes the lexicographically smallest goes first.
fn topological_order(graph: &Graph) -> EngineResult<Vec<String>> {
    let mut unmet: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, deps) in &graph.edges {
        unmet.insert(name, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(name);
        }
    }
    let mut ready: BTreeSet<&str> = unmet
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = unmet.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }
    if order.len() != graph.nodes.len() {
        let stuck: Vec<String> = unmet
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(EngineError::DependencyCycle { path: stuck });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest;

    fn formula(name: &str, version: &str, deps: &[&str]) -> Formula {
        Formula {
            name: name.into(),
            version: Version::parse(version).unwrap(),
            desc: None,
            homepage: None,
            license: None,
            url: format!("https://example.org/{name}-{version}"),
            digest: digest::compute(format!("{name}-{version}").as_bytes()),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            install: vec![],
            test: None,
            caveats: None,
        }
    }

    fn store(formulas: Vec<Formula>) -> FormulaStore {
        let mut store = FormulaStore::new();
        for f in formulas {
            store.register(f).unwrap();
        }
        store
    }

    fn names(plan: &InstallPlan) -> Vec<&str> {
        plan.names()
    }

    #[test]
    fn test_dependencies_come_first_with_lexicographic_ties() {
        let store = store(vec![
            formula("app", "1.0.0", &["zlib", "openssl"]),
            formula("openssl", "3.0.0", &["zlib"]),
            formula("zlib", "1.3.0", &[]),
            formula("bat", "0.24.0", &[]),
        ]);
        let plan = resolve(
            &[Request::new("app"), Request::new("bat")],
            &store,
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(names(&plan), vec!["bat", "zlib", "openssl", "app"]);
        assert!(plan.steps.iter().all(|s| s.action == Action::Install));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let store = store(vec![
            formula("a", "1.0.0", &["b"]),
            formula("b", "1.0.0", &["c"]),
            formula("c", "1.0.0", &["a"]),
        ]);
        let err = resolve(&[Request::new("a")], &store, &BTreeMap::new()).unwrap_err();
        match err {
            EngineError::DependencyCycle { path } => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_dependency_names_requirer() {
        let store = store(vec![formula("app", "1.0.0", &["ghost"])]);
        let err = resolve(&[Request::new("app")], &store, &BTreeMap::new()).unwrap_err();
        match err {
            EngineError::MissingDependency { name, required_by } => {
                assert_eq!(name, "ghost");
                assert_eq!(required_by, "app");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_request_and_version() {
        let store = store(vec![formula("fzf", "1.0.0", &[])]);
        assert!(matches!(
            resolve(&[Request::new("nope")], &store, &BTreeMap::new()),
            Err(EngineError::FormulaNotFound(_))
        ));
        assert!(matches!(
            resolve(&[Request::pinned("fzf", Version::new(9, 0, 0))], &store, &BTreeMap::new()),
            Err(EngineError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn test_pinned_request_without_conflict_is_honored() {
        let mut store = store(vec![formula("fzf", "1.0.0", &[]), formula("fzf", "0.9.0", &[])]);
        store.promote_latest();
        let plan = resolve(
            &[Request::pinned("fzf", Version::new(0, 9, 0))],
            &store,
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(plan.steps[0].formula.version, Version::new(0, 9, 0));
        assert!(plan.decisions.is_empty());
    }

    #[test]
    fn test_conflicting_demands_select_current_and_record_it() {
        let mut store = store(vec![
            formula("fzf", "1.0.0", &[]),
            formula("fzf", "0.9.0", &[]),
            formula("fzf-wrapper", "2.1.0", &["fzf"]),
        ]);
        store.promote_latest();
        let plan = resolve(
            &[Request::pinned("fzf", Version::new(0, 9, 0)), Request::new("fzf-wrapper")],
            &store,
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(plan.step("fzf").unwrap().formula.version, Version::new(1, 0, 0));
        assert_eq!(plan.decisions.len(), 1);
        let decision = &plan.decisions[0];
        assert_eq!(decision.name, "fzf");
        assert_eq!(decision.selected, Version::new(1, 0, 0));
        assert!(decision.demands.iter().any(|d| d.by == "fzf-wrapper"));
        assert!(decision.demands.iter().any(|d| d.by == "request" && d.version == Version::new(0, 9, 0)));
    }

    #[test]
    fn test_actions_reflect_installed_records() {
        let store = store(vec![formula("fzf", "1.0.0", &[]), formula("bat", "1.0.0", &[])]);
        let mut installed = BTreeMap::new();
        let fzf = store.current("fzf").unwrap();
        installed.insert("fzf".to_string(), InstallRecord::for_formula(fzf));
        let mut old_bat = InstallRecord::for_formula(store.current("bat").unwrap());
        old_bat.version = Version::new(0, 9, 0);
        installed.insert("bat".to_string(), old_bat);

        let plan = resolve(&[Request::new("fzf"), Request::new("bat")], &store, &installed).unwrap();
        assert_eq!(plan.step("fzf").unwrap().action, Action::AlreadySatisfied);
        let bat = plan.step("bat").unwrap();
        assert_eq!(bat.action, Action::Upgrade);
        assert_eq!(bat.installed, Some(Version::new(0, 9, 0)));
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_request_parse() {
        let store = store(vec![
            formula("fzf", "0.9.0", &[]),
            formula("python@3.11", "3.11.9", &[]),
        ]);
        assert_eq!(Request::parse("fzf", &store), Request::new("fzf"));
        assert_eq!(
            Request::parse("fzf@v0.9.0", &store),
            Request::pinned("fzf", Version::new(0, 9, 0))
        );
        assert_eq!(Request::parse("fzf@latest", &store), Request::new("fzf@latest"));
    }

    #[test]
    fn test_request_parse_names_with_at() {
        let store = store(vec![formula("python@3.11", "3.11.9", &[])]);
        assert_eq!(Request::parse("python@3.11", &store), Request::new("python@3.11"));
        assert_eq!(
            Request::parse("python@3.11@3.11.9", &store),
            Request::pinned("python@3.11", Version::new(3, 11, 9))
        );

        let plan = resolve(&[Request::parse("python@3.11", &store)], &store, &BTreeMap::new()).unwrap();
        assert_eq!(plan.names(), vec!["python@3.11"]);
    }
}
