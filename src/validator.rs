use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use serde::Serialize;
use tracing::{debug, warn};
use crate::error::EngineError;
use crate::formula::Formula;
use crate::link::Layout;

/// Outcome of a formula's post-install test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub name: String,
    /// The command as run, after placeholder expansion.
    pub command: String,
    pub expected: i32,
    /// Exit status, or `None` if the process could not run, was killed or timed out.
    pub status: Option<i32>,
    pub passed: bool,
    /// The formula declares no test.
    pub skipped: bool,
    pub stdout: String,
    pub stderr: String,
}

impl TestResult {
    /// The failure as an error, if the test did not pass.
    pub fn to_error(&self) -> Option<EngineError> {
        if self.passed {
            return None;
        }
        Some(EngineError::ValidationFailure {
            name: self.name.clone(),
            command: self.command.clone(),
            expected: self.expected,
            actual: self
                .status
                .map_or_else(|| "no status".to_string(), |s| s.to_string()),
        })
    }
}

/// Runs test commands against a prefix.
#[derive(Debug, Clone)]
pub struct Validator {
    timeout: Duration,
}

impl Validator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `formula`'s test with `{prefix}`, `{bin}` and `{opt}` expanded and
    /// `<prefix>/bin` first on `PATH`. A formula without a test passes as skipped.
    pub fn validate(&self, formula: &Formula, layout: &Layout) -> TestResult {
        let Some(test) = &formula.test else {
            return TestResult {
                name: formula.name.clone(),
                command: String::new(),
                expected: 0,
                status: Some(0),
                passed: true,
                skipped: true,
                stdout: String::new(),
                stderr: String::new(),
            };
        };
        let argv: Vec<String> = test
            .command
            .iter()
            .map(|arg| expand(arg, &formula.name, layout))
            .collect();
        let command = argv.join(" ");
        let mut result = TestResult {
            name: formula.name.clone(),
            command: command.clone(),
            expected: test.status,
            status: None,
            passed: false,
            skipped: false,
            stdout: String::new(),
            stderr: String::new(),
        };

        let Some((program, args)) = argv.split_first() else {
            result.stderr = "empty test command".to_string();
            return result;
        };
        let program = resolve_program(program, layout.prefix());
        let path = match std::env::var_os("PATH") {
            Some(path) => {
                let mut dirs = vec![layout.bin_dir()];
                dirs.extend(std::env::split_paths(&path));
                std::env::join_paths(dirs).unwrap_or(path)
            }
            None => layout.bin_dir().into_os_string(),
        };
        debug!("Testing {}: {}", formula.name, command);
        let child = Command::new(&program)
            .args(args)
            .current_dir(layout.prefix())
            .env("PATH", path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                result.stderr = format!("failed to start {}: {}", program.display(), e);
                warn!("Test for {} could not start: {}", formula.name, e);
                return result;
            }
        };

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code(),
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!("Test for {} timed out after {:?}", formula.name, self.timeout);
                    break None;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    warn!("Waiting on test for {} failed: {}", formula.name, e);
                    break None;
                }
            }
        };
        result.stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        result.stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        result.status = status;
        result.passed = status == Some(test.status);
        if !result.passed {
            warn!("Test for {} failed with status {:?}", formula.name, status);
        }
        result
    }
}

fn expand(arg: &str, name: &str, layout: &Layout) -> String {
    arg.replace("{prefix}", &layout.prefix().to_string_lossy())
        .replace("{bin}", &layout.bin_dir().to_string_lossy())
        .replace("{opt}", &layout.opt_link(name).to_string_lossy())
}

/// Relative programs with a directory part are resolved against the prefix;
/// bare names are left for `PATH` lookup.
fn resolve_program(program: &str, prefix: &Path) -> PathBuf {
    let path = PathBuf::from(program);
    if path.is_relative() && path.components().count() > 1 {
        prefix.join(path)
    } else {
        path
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}
