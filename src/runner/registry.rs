//! Registry of installed runners and the matching rule used at load.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use semver::VersionReq;
use tracing::{debug, info};

use super::discovery::{discover_runners, host_triple, RunnerEntry, RUNNER_INTERFACE_VERSION};
use crate::error::{CartonError, Result};

/// Thread-safe set of known runners.
pub struct RunnerRegistry {
    runner_dir: PathBuf,
    runners: RwLock<Vec<RunnerEntry>>,
}

impl RunnerRegistry {
    pub fn new(runner_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner_dir: runner_dir.into(),
            runners: RwLock::new(Vec::new()),
        }
    }

    /// Build a registry populated from `runner_dir`.
    pub async fn discover(runner_dir: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self::new(runner_dir);
        registry.refresh().await?;
        Ok(registry)
    }

    pub fn runner_dir(&self) -> &Path {
        &self.runner_dir
    }

    /// Re-scan the runner directory. Explicitly registered runners are dropped.
    pub async fn refresh(&self) -> Result<usize> {
        let dir = self.runner_dir.clone();
        let found = tokio::task::spawn_blocking(move || discover_runners(&dir)).await??;
        let count = found.len();
        *self.runners.write() = found;
        info!(dir = %self.runner_dir.display(), count, "Discovered runners");
        Ok(count)
    }

    /// Add a runner that is not on disk under the runner directory.
    pub fn register(&self, runner: RunnerEntry) {
        debug!(runner = %runner.runner_name, version = %runner.framework_version, "Registered runner");
        self.runners.write().push(runner);
    }

    pub fn runners(&self) -> Vec<RunnerEntry> {
        self.runners.read().clone()
    }

    /// Pick the runner for `name` and `required`.
    ///
    /// Candidates must match the name, the version requirement, the compat
    /// version when one is pinned, the host platform, and an interface
    /// version this build supports. Among them the highest framework
    /// version wins, then the latest release.
    pub fn resolve(
        &self,
        name: &str,
        required: &VersionReq,
        compat: Option<u64>,
    ) -> Result<RunnerEntry> {
        let runners = self.runners.read();
        let named: Vec<&RunnerEntry> = runners.iter().filter(|r| r.runner_name == name).collect();
        if named.is_empty() {
            return Err(CartonError::RunnerNotFound {
                name: name.to_string(),
                searched: self.runner_dir.clone(),
            });
        }

        let host = host_triple();
        let best = named
            .iter()
            .filter(|r| r.platform == host)
            .filter(|r| r.runner_interface_version <= RUNNER_INTERFACE_VERSION)
            .filter(|r| compat.map_or(true, |c| r.runner_compat_version == c))
            .filter(|r| required.matches(&r.framework_version))
            .max_by(|a, b| {
                a.framework_version
                    .cmp(&b.framework_version)
                    .then(a.runner_release_date.cmp(&b.runner_release_date))
            });

        match best {
            Some(runner) => Ok((*runner).clone()),
            None => Err(CartonError::VersionMismatch {
                name: name.to_string(),
                required: match compat {
                    Some(c) => format!("{required} (compat {c})"),
                    None => required.to_string(),
                },
                available: named
                    .iter()
                    .map(|r| {
                        format!(
                            "{} (compat {}, {})",
                            r.framework_version, r.runner_compat_version, r.platform
                        )
                    })
                    .collect(),
            }),
        }
    }
}
