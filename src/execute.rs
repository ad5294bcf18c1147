use std::process::ExitCode;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use semver::Version;
use formulary::{CancelToken, Config, Engine, Report, Request, digest};
use crate::cli::{CacheCommand, FormularyCommand, CLI};

pub fn execute(cli: CLI) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let engine = Engine::from_config(&config)?;
    let cancel = CancelToken::new();
    match cli.command {
        FormularyCommand::Install { names, pin } => {
            execute_install(&engine, &names, pin.as_deref(), &cancel)
        }
        FormularyCommand::Upgrade { name } => {
            execute_upgrade(&engine, &name, &cancel)
        }
        FormularyCommand::Rollback { name } => {
            let record = engine.rollback(&name, &cancel)?;
            println!("{} {}@{}", "Rolled back".green().bold(), record.name, record.version);
            Ok(ExitCode::SUCCESS)
        }
        FormularyCommand::Uninstall { name, force } => {
            let record = engine.uninstall(&name, force)?;
            println!("{} {}@{}", "Uninstalled".green().bold(), record.name, record.version);
            Ok(ExitCode::SUCCESS)
        }
        FormularyCommand::List => {
            execute_list(&engine)
        }
        FormularyCommand::Plan { names, json } => {
            execute_plan(&engine, &names, json)
        }
        FormularyCommand::Fetch { names } => {
            execute_fetch(&engine, &names, &cancel)
        }
        FormularyCommand::Cache { command } => {
            execute_cache(&engine, command)
        }
    }
}

/// The config file with command-line and environment overrides applied.
fn load_config(cli: &CLI) -> Result<Config> {
    let mut config = match cli.config.clone().or_else(Config::default_path) {
        Some(path) => Config::load_or_default(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(prefix) = &cli.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(formulas) = &cli.formulas {
        config.formula_dir = formulas.clone();
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    Ok(config)
}

fn parse_requests(engine: &Engine, names: &[String], pin: Option<&str>) -> Result<Vec<Request>> {
    let pin = pin
        .map(|v| Version::parse(v.trim_start_matches('v')))
        .transpose()
        .context("Invalid --version")?;
    let mut requests = Vec::new();
    for name in names {
        let mut request = Request::parse(name, engine.store());
        if let Some(pin) = &pin {
            if request.version.as_ref().is_some_and(|v| v != pin) {
                bail!("{} conflicts with --version {}", name, pin);
            }
            request.version = Some(pin.clone());
        }
        requests.push(request);
    }
    Ok(requests)
}

pub fn execute_install(engine: &Engine, names: &[String], pin: Option<&str>, cancel: &CancelToken) -> Result<ExitCode> {
    let requests = parse_requests(engine, names, pin)?;
    let report = engine.install(&requests, cancel)?;
    print_report(&report);
    Ok(ExitCode::from(report.exit_code()))
}

pub fn execute_upgrade(engine: &Engine, name: &str, cancel: &CancelToken) -> Result<ExitCode> {
    let report = engine.upgrade(name, cancel)?;
    if report.plan.is_noop() {
        println!("{} is already up to date", name);
        return Ok(ExitCode::SUCCESS);
    }
    print_report(&report);
    Ok(ExitCode::from(report.exit_code()))
}

pub fn execute_list(engine: &Engine) -> Result<ExitCode> {
    let installed = engine.list()?;
    if installed.is_empty() {
        println!("No formulas installed");
        return Ok(ExitCode::SUCCESS);
    }
    for (name, record) in &installed {
        println!("{}@{}", name.bold(), record.version);
        println!("  sha256: {}", digest::short(&record.digest));
        println!("  installed: {}", record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        for path in &record.installed_paths {
            println!("  {}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn execute_plan(engine: &Engine, names: &[String], json: bool) -> Result<ExitCode> {
    let requests = parse_requests(engine, names, None)?;
    let plan = engine.plan(&requests)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(ExitCode::SUCCESS);
    }
    for step in &plan.steps {
        match &step.installed {
            Some(installed) if installed != &step.formula.version => {
                println!("{:>18} {} ({} -> {})", step.action.to_string(), step.formula.name, installed, step.formula.version);
            }
            _ => println!("{:>18} {}", step.action.to_string(), step.formula),
        }
    }
    for decision in &plan.decisions {
        let demands: Vec<String> = decision
            .demands
            .iter()
            .map(|d| format!("{} wants {}", d.by, d.version))
            .collect();
        println!(
            "{} {}: selected current version {} ({})",
            "note:".yellow().bold(),
            decision.name,
            decision.selected,
            demands.join(", ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn execute_fetch(engine: &Engine, names: &[String], cancel: &CancelToken) -> Result<ExitCode> {
    let requests = parse_requests(engine, names, None)?;
    let results = engine.prefetch(&requests, cancel)?;
    let mut code = 0;
    for (name, result) in results {
        match result {
            Ok(entry) => println!("{} {} ({} bytes)", "Fetched".green().bold(), name, entry.size),
            Err(e) => {
                println!("{} {}: {}", "Failed".red().bold(), name, e);
                code = code.max(e.exit_code());
            }
        }
    }
    Ok(ExitCode::from(code))
}

pub fn execute_cache(engine: &Engine, command: CacheCommand) -> Result<ExitCode> {
    match command {
        CacheCommand::Clean => {
            engine.cache().clean()?;
            println!("Cache cleaned");
        }
        CacheCommand::Prune => {
            let evicted = engine.prune_cache()?;
            println!("Evicted {} download(s)", evicted.len());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &Report) {
    for name in &report.result.satisfied {
        if let Some(step) = report.plan.step(name) {
            println!("{} {} is already installed", "=".dimmed(), step.formula);
        }
    }
    for committed in &report.result.committed {
        println!(
            "{} {} {}@{}",
            "✓".green().bold(),
            committed.action,
            committed.name,
            committed.record.version
        );
    }
    for test in report.tests.iter().filter(|t| !t.passed) {
        println!("{} test for {} failed: {}", "✗".red().bold(), test.name, test.command);
        if !test.stderr.trim().is_empty() {
            println!("  {}", test.stderr.trim());
        }
    }
    if let Some((name, error)) = &report.result.failed {
        eprintln!("{} {}: {}", "error:".red().bold(), name, error);
        if !report.result.not_attempted.is_empty() {
            eprintln!("  not attempted: {}", report.result.not_attempted.join(", "));
        }
    }
    for committed in &report.result.committed {
        if let Some(caveats) = report.plan.step(&committed.name).and_then(|s| s.formula.caveats.as_ref()) {
            println!("{} {}", "==> Caveats for".yellow().bold(), committed.name);
            println!("{}", caveats.trim_end());
        }
    }
}
