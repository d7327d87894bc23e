//! Finding installed runners.
//!
//! Every `runner.toml` under the runner directory describes one or more
//! runners:
//!
//! ```toml
//! version = 1
//!
//! [[runner]]
//! runner_name = "torchscript"
//! framework_version = "2.0.1"
//! runner_compat_version = 1
//! runner_interface_version = 1
//! runner_release_date = "2023-06-01T00:00:00Z"
//! runner_path = "runner"
//! platform = "x86_64-unknown-linux-gnu"
//! ```
//!
//! `runner_path` is relative to the `runner.toml` that names it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CartonError, Result};

pub const RUNNER_TOML: &str = "runner.toml";

/// Highest runner interface version this build can drive.
pub const RUNNER_INTERFACE_VERSION: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RunnerTomlFile {
    version: u64,
    #[serde(default)]
    runner: Vec<RunnerEntry>,
}

/// One installed runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEntry {
    pub runner_name: String,
    pub framework_version: semver::Version,
    pub runner_compat_version: u64,
    pub runner_interface_version: u64,
    pub runner_release_date: DateTime<Utc>,
    /// Absolute after discovery.
    pub runner_path: PathBuf,
    /// Target triple.
    pub platform: String,
}

/// Target triple of the running host, in the common rustc spelling.
pub fn host_triple() -> String {
    let arch = std::env::consts::ARCH;
    match std::env::consts::OS {
        "linux" => format!("{arch}-unknown-linux-gnu"),
        "macos" => format!("{arch}-apple-darwin"),
        "windows" => format!("{arch}-pc-windows-msvc"),
        os => format!("{arch}-unknown-{os}"),
    }
}

fn parse_runner_toml(path: &Path) -> Result<Vec<RunnerEntry>> {
    let text = std::fs::read_to_string(path)?;
    let file: RunnerTomlFile = toml::from_str(&text)?;
    if file.version != 1 {
        return Err(CartonError::Validation(format!(
            "unsupported runner.toml version {}",
            file.version
        )));
    }
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(file
        .runner
        .into_iter()
        .map(|mut entry| {
            entry.runner_path = base.join(&entry.runner_path);
            entry
        })
        .collect())
}

/// Scan `runner_dir` for runners. Unreadable `runner.toml` files are
/// skipped with a warning. A missing directory yields no runners. Blocking.
pub fn discover_runners(runner_dir: &Path) -> Result<Vec<RunnerEntry>> {
    if !runner_dir.is_dir() {
        debug!(dir = %runner_dir.display(), "Runner directory does not exist");
        return Ok(Vec::new());
    }
    let mut runners = Vec::new();
    for entry in WalkDir::new(runner_dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable path during runner discovery");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() != RUNNER_TOML {
            continue;
        }
        match parse_runner_toml(entry.path()) {
            Ok(found) => {
                debug!(path = %entry.path().display(), count = found.len(), "Found runners");
                runners.extend(found);
            }
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Ignoring invalid runner.toml"),
        }
    }
    Ok(runners)
}

/// Write a `runner.toml` into `dir`. `runner_path` of each entry should be
/// relative to `dir`.
pub fn write_runner_toml(dir: &Path, runners: &[RunnerEntry]) -> Result<PathBuf> {
    let file = RunnerTomlFile {
        version: 1,
        runner: runners.to_vec(),
    };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(RUNNER_TOML);
    std::fs::write(&path, toml::to_string_pretty(&file)?)?;
    Ok(path)
}
