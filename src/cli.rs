use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    #[command(subcommand)]
    pub(crate) command: FormularyCommand,

    /// Increase log output (-v info, -vv debug). `RUST_LOG` takes precedence
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    /// Configuration file. Defaults to `config.toml` in the user config directory
    #[clap(long, env = "FORMULARY_CONFIG", global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Namespace to install into
    #[clap(long, env = "FORMULARY_PREFIX", global = true)]
    pub(crate) prefix: Option<PathBuf>,

    /// Directory of formula manifests
    #[clap(long, env = "FORMULARY_FORMULAS", global = true)]
    pub(crate) formulas: Option<PathBuf>,

    /// Download cache directory
    #[clap(long, env = "FORMULARY_CACHE", global = true)]
    pub(crate) cache_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum FormularyCommand {
    /// Installs formulas and their dependencies, then runs their tests
    Install {
        /// Formula names, optionally as <name>@<version>
        #[clap(required = true)]
        names: Vec<String>,
        /// Pin every named formula to this version
        #[clap(long = "version", value_name = "V")]
        pin: Option<String>,
    },
    /// Upgrades an installed formula to the current version. No-op if already current
    Upgrade {
        name: String,
    },
    /// Restores the version that was installed before the last install or upgrade
    Rollback {
        name: String,
    },
    /// Removes an installed formula and its files
    Uninstall {
        name: String,
        /// Remove even if other installed formulas depend on it
        #[clap(long)]
        force: bool,
    },
    /// Lists installed formulas
    List,
    /// Shows what `install` would do without changing anything
    Plan {
        #[clap(required = true)]
        names: Vec<String>,
        /// Print the plan as JSON
        #[clap(long)]
        json: bool,
    },
    /// Downloads sources into the cache without installing
    Fetch {
        #[clap(required = true)]
        names: Vec<String>,
    },
    /// Manages the download cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum CacheCommand {
    /// Removes every cached download
    Clean,
    /// Evicts the oldest downloads above `max_cache_bytes`
    Prune,
}
