//! Error types for the formulary engine
//!
//! Every engine module returns [`EngineResult<T>`]. The CLI maps errors to exit
//! codes through [`EngineError::exit_code`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// All errors that can occur while resolving, fetching, installing or validating formulas
#[derive(Error, Debug)]
pub enum EngineError {
    // Resolution errors
    #[error("missing dependency '{name}' (required by '{required_by}')")]
    MissingDependency { name: String, required_by: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("formula not found: {0}")]
    FormulaNotFound(String),

    #[error("version {version} of '{name}' is not known")]
    VersionNotFound { name: String, version: String },

    // Integrity and transport errors
    #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
    DigestMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("network error fetching {url}: {reason}")]
    NetworkError { url: String, reason: String },

    // Install errors
    #[error("install IO error: {context}")]
    InstallIOError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path {path} is already owned by {owner}")]
    PathConflict { path: PathBuf, owner: String },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("{name} has no prior version to roll back to")]
    NoPriorVersion { name: String },

    #[error("{name} is required by installed formulas: {}", dependents.join(", "))]
    RequiredBy { name: String, dependents: Vec<String> },

    #[error("namespace {0} is locked by another installer")]
    NamespaceLocked(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    // Validation errors
    #[error("test for {name} failed: `{command}` exited with {actual} (expected {expected})")]
    ValidationFailure {
        name: String,
        command: String,
        expected: i32,
        actual: String,
    },

    // Manifest and store errors
    #[error("invalid formula '{name}': {reason}")]
    InvalidFormula { name: String, reason: String },

    #[error("formula {name}@{version} is already registered with a different definition")]
    DuplicateFormula { name: String, version: String },

    #[error("{url} at version {version} registered with digest {existing}, refusing {new}")]
    ConflictingDigest {
        url: String,
        version: String,
        existing: String,
        new: String,
    },

    #[error("invalid manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    // Serialization errors
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl EngineError {
    /// Create an install IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::InstallIOError {
            context: context.into(),
            source,
        }
    }

    /// Create a network error for a URL
    pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::NetworkError {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Only transient transport failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError { .. })
    }

    /// Process exit code for the command surface
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ValidationFailure { .. } => 2,
            Self::NoPriorVersion { .. } => 3,
            _ => 1,
        }
    }
}
