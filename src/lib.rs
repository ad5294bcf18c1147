//! # Formulary Core Library
//!
//! This crate contains the engine behind the `formulary` tool: it resolves, fetches, verifies and
//! installs named software packages ("formulas") described by declarative TOML manifests.
//!
//! Installs land in a single prefix. Every version lives in its own immutable keg and becomes
//! visible through one atomic link swap, so upgrades and rollbacks never leave a half-installed
//! formula behind.
//!
//! ## Modules Overview
//! - [`formula`] – The formula manifest and its validation
//! - [`store`] – Known formulas by name and version, with a current version per name
//! - [`resolver`] – Dependency-ordered install plans, cycle and conflict detection
//! - [`digest`] – SHA-256 computation and constant-time verification
//! - [`fetch`] – Pluggable transports and the verifying [`Fetcher`]
//! - [`cache`] – Digest-keyed download cache
//! - [`stage`] – Unpacking payloads and assembling kegs
//! - [`link`] – Namespace layout and symlink primitives
//! - [`record`] – Persisted install records
//! - [`lock`] – Exclusive namespace lock
//! - [`installer`] – Atomic install, upgrade, rollback and uninstall
//! - [`validator`] – Post-install smoke tests
//! - [`engine`] – Orchestration of all of the above
//! - [`config`] – User configuration and default directories
//! - [`error`] – The engine error type

pub mod cache;
pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod formula;
pub mod installer;
pub mod link;
pub mod lock;
pub mod record;
pub mod resolver;
pub mod stage;
pub mod store;
pub mod validator;

pub use cache::{ArtifactCache, CacheEntry};
pub use config::Config;
pub use engine::{Engine, Report};
pub use error::{EngineError, EngineResult};
pub use fetch::{CancelToken, DefaultTransport, FileTransport, Fetcher, HttpTransport, Transport};
pub use formula::{Formula, InstallStep, TestCommand};
pub use installer::{Committed, InstallResult, Installer};
pub use link::Layout;
pub use lock::NamespaceLock;
pub use record::{InstallRecord, RecordFile, RecordStore};
pub use resolver::{Action, InstallPlan, PlanStep, Request, resolve};
pub use store::FormulaStore;
pub use validator::{TestResult, Validator};
