//! Carton
//!
//! Packages ML models into self-describing archives and runs them in
//! framework-specific runner processes.
//!
//! # Layout
//!
//! - [`format`]: archive reading, writing, and shrinking
//! - [`fetch`]: linked file download and the content-addressed cache
//! - [`runner`]: runner discovery, launch, and the loader/runner protocol
//! - [`model`]: a loaded model and its inference calls
//! - [`pipeline`]: overlapped seal/infer over a bounded queue
//! - [`selftest`]: running the self-tests stored in an archive
//!
//! The free functions ([`pack`], [`load`], ...) build a [`Runtime`] from
//! the environment each time. Embedders that load many models should keep
//! one `Runtime` around instead.

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod format;
pub mod model;
pub mod pipeline;
pub mod runner;
pub mod selftest;
pub mod telemetry;
pub mod types;

pub use config::CartonConfig;
pub use error::{CartonError, Result};
pub use model::{Model, SealHandle};
pub use pipeline::{InferencePipeline, PendingResult};
pub use selftest::{SelfTestOutcome, SelfTestReport, Tolerance};
pub use types::{
    CartonInfo, CartonInfoWithExtras, DataType, Device, LinkedFile, LoadOpts, PackOpts,
    RunnerInfo, Shape, Tensor, TensorMap, TensorSpec,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use fetch::{FileCache, LinkFetcher};
use format::{read_carton, validate_info, Container, MissingFile};
use runner::{
    host_triple, start_runner, ProcessLauncher, RunnerLauncher, RunnerRegistry, StartRequest,
};

/// Shared state for packing and loading: configuration, the runner
/// registry, the launcher, and the linked file fetcher.
pub struct Runtime {
    config: CartonConfig,
    registry: Arc<RunnerRegistry>,
    launcher: Arc<dyn RunnerLauncher>,
    fetcher: Arc<LinkFetcher>,
}

fn check_platform(info: &CartonInfo) -> Result<()> {
    let Some(required) = info.required_platforms.as_ref().filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let host = host_triple();
    if required.iter().any(|p| *p == host) {
        Ok(())
    } else {
        Err(CartonError::UnsupportedPlatform {
            required: required.clone(),
            host,
        })
    }
}

/// The URL in `path` if it names an http(s) archive.
fn remote_url(path: &Path) -> Option<&str> {
    path.to_str()
        .filter(|s| s.starts_with("http://") || s.starts_with("https://"))
}

/// Put a cached linked file at its place in the model directory.
async fn place_linked_file(cached: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::hard_link(cached, dest).await.is_err() {
        tokio::fs::copy(cached, dest).await?;
    }
    Ok(())
}

impl Runtime {
    /// Discover runners under `config.runner_dir` and start runners as
    /// child processes.
    pub async fn new(config: CartonConfig) -> Result<Self> {
        let registry = Arc::new(RunnerRegistry::discover(config.runner_dir.clone()).await?);
        let launcher = Arc::new(ProcessLauncher::new(
            config.handshake_timeout,
            config.runner_data_dir.clone(),
        ));
        Self::with_parts(config, registry, launcher)
    }

    /// Build a runtime from explicit parts.
    pub fn with_parts(
        config: CartonConfig,
        registry: Arc<RunnerRegistry>,
        launcher: Arc<dyn RunnerLauncher>,
    ) -> Result<Self> {
        let fetcher = Arc::new(LinkFetcher::new(
            FileCache::new(&config.cache_dir),
            config.fetch.clone(),
        )?);
        Ok(Self {
            config,
            registry,
            launcher,
            fetcher,
        })
    }

    pub fn config(&self) -> &CartonConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn fetcher(&self) -> &LinkFetcher {
        &self.fetcher
    }

    /// Pack `source_dir` into an archive and return its path.
    ///
    /// Without an explicit `runner_compat_version`, the compat version of
    /// the best installed runner is recorded, or 1 when none is installed.
    pub async fn pack(&self, source_dir: impl AsRef<Path>, opts: PackOpts) -> Result<PathBuf> {
        let source_dir = source_dir.as_ref().to_path_buf();
        let runner = &opts.info.runner;
        let compat = match runner.runner_compat_version {
            Some(c) => c,
            None => match self
                .registry
                .resolve(&runner.runner_name, &runner.required_framework_version, None)
            {
                Ok(entry) => entry.runner_compat_version,
                Err(e) => {
                    warn!(runner = %runner.runner_name, error = %e, "No matching runner installed; recording compat version 1");
                    1
                }
            },
        };
        let path = tokio::task::spawn_blocking(move || {
            format::pack_dir(
                &source_dir,
                &opts.info,
                opts.linked_files.as_deref().unwrap_or_default(),
                compat,
                opts.output_path.as_deref(),
            )
        })
        .await??;
        info!(path = %path.display(), "Packed carton");
        Ok(path)
    }

    /// Local path for an archive locator. http(s) URLs are downloaded
    /// into the cache first.
    async fn locate(&self, path: &Path) -> Result<PathBuf> {
        match remote_url(path) {
            Some(url) => self.fetcher.fetch_archive(url).await,
            None => Ok(path.to_path_buf()),
        }
    }

    /// Read metadata without loading the model. `path` may be an http(s) URL.
    pub async fn get_model_info(&self, path: impl AsRef<Path>) -> Result<CartonInfoWithExtras> {
        let path = self.locate(path.as_ref()).await?;
        let parsed = tokio::task::spawn_blocking(move || {
            let mut container = Container::open(&path)?;
            read_carton(&mut container)
        })
        .await??;
        Ok(CartonInfoWithExtras {
            info: parsed.info,
            manifest_sha256: parsed.manifest_sha256,
        })
    }

    /// Apply overrides and pick a runner for `info`.
    fn prepare(&self, info: &mut CartonInfo, opts: &LoadOpts) -> Result<runner::RunnerEntry> {
        info.runner.apply_overrides(opts);
        if opts.override_runner_name.is_some() {
            // The archive's compat version belongs to the runner it was packed for.
            info.runner.runner_compat_version = None;
        }
        check_platform(info)?;
        self.registry.resolve(
            &info.runner.runner_name,
            &info.runner.required_framework_version,
            info.runner.runner_compat_version,
        )
    }

    /// Load an archive (packed or unpacked) and start its runner.
    ///
    /// `path` may also be an http(s) URL; the archive is downloaded into
    /// the cache and loaded from there.
    pub async fn load(&self, path: impl AsRef<Path>, opts: LoadOpts) -> Result<Model> {
        let path = self.locate(path.as_ref()).await?;
        let open_path = path.clone();
        let (mut container, parsed) = tokio::task::spawn_blocking(move || {
            let mut container = Container::open(&open_path)?;
            let parsed = read_carton(&mut container)?;
            Ok::<_, CartonError>((container, parsed))
        })
        .await??;

        let mut info = parsed.info;
        let entry = self.prepare(&mut info, &opts)?;
        debug!(
            archive = %path.display(),
            runner = %entry.runner_name,
            version = %entry.framework_version,
            "Resolved runner"
        );

        let workdir = tempfile::Builder::new().prefix("carton-model-").tempdir()?;
        let model_dir = workdir.path().join("model");
        std::fs::create_dir_all(&model_dir)?;
        let manifest = parsed.manifest;
        let dest = model_dir.clone();
        let missing: Vec<MissingFile> = tokio::task::spawn_blocking(move || {
            container.extract_model(manifest.as_ref(), &dest)
        })
        .await??;

        if !missing.is_empty() {
            info!(archive = %path.display(), count = missing.len(), "Fetching linked files");
        }
        let links = &parsed.links;
        let archive_path = path.as_path();
        let fetches = missing.iter().map(|file| async move {
            let urls = links.get(&file.sha256).ok_or_else(|| {
                CartonError::invalid_archive(
                    archive_path,
                    format!("{} is not stored and has no URLs in LINKS", file.sha256),
                )
            })?;
            let cached = self.fetcher.fetch(&file.sha256, urls).await?;
            place_linked_file(&cached, &file.dest).await
        });
        futures::future::try_join_all(fetches).await?;

        let started = start_runner(
            self.launcher.as_ref(),
            StartRequest {
                entry: &entry,
                device: opts.visible_device,
                runner: &info.runner,
                model_dir,
                manifest_sha256: parsed.manifest_sha256.clone(),
                handshake_timeout: self.config.handshake_timeout,
                max_frame: self.config.max_frame_size,
            },
        )
        .await?;

        Ok(Model::new(
            info,
            started,
            opts.visible_device,
            parsed.manifest_sha256,
            self.config.call_timeout,
            Some(workdir),
        ))
    }

    /// Load a model straight from a payload directory with metadata
    /// supplied by the caller. Nothing is packed or copied.
    pub async fn load_unpacked(
        &self,
        dir: impl AsRef<Path>,
        pack_opts: PackOpts,
        load_opts: LoadOpts,
    ) -> Result<Model> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CartonError::Validation(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let mut info = pack_opts.info;
        validate_info(&info)?;
        let entry = self.prepare(&mut info, &load_opts)?;
        let model_dir = tokio::fs::canonicalize(dir).await?;

        let started = start_runner(
            self.launcher.as_ref(),
            StartRequest {
                entry: &entry,
                device: load_opts.visible_device,
                runner: &info.runner,
                model_dir,
                manifest_sha256: None,
                handshake_timeout: self.config.handshake_timeout,
                max_frame: self.config.max_frame_size,
            },
        )
        .await?;

        Ok(Model::new(
            info,
            started,
            load_opts.visible_device,
            None,
            self.config.call_timeout,
            None,
        ))
    }

    /// Write a smaller copy of `path` with `linked_files` stored by
    /// reference. The copy is written to a new temporary path.
    pub async fn shrink(&self, path: impl AsRef<Path>, linked_files: Vec<LinkedFile>) -> Result<PathBuf> {
        self.shrink_to(path, linked_files, None).await
    }

    pub async fn shrink_to(
        &self,
        path: impl AsRef<Path>,
        linked_files: Vec<LinkedFile>,
        output_path: Option<PathBuf>,
    ) -> Result<PathBuf> {
        let path = self.locate(path.as_ref()).await?;
        Ok(tokio::task::spawn_blocking(move || {
            format::shrink_archive(&path, &linked_files, output_path.as_deref())
        })
        .await??)
    }

    /// Load `path`, run its self-tests, and unload it.
    pub async fn self_test(
        &self,
        path: impl AsRef<Path>,
        opts: LoadOpts,
        tolerance: Tolerance,
    ) -> Result<SelfTestReport> {
        let model = self.load(path, opts).await?;
        let report = selftest::run_self_tests(&model, tolerance).await;
        if let Err(e) = model.unload().await {
            warn!(error = %e, "Unload after self-test failed");
        }
        Ok(report)
    }

    /// A seal/infer pipeline sized by the configured queue capacity.
    pub fn pipeline(&self, model: Arc<Model>) -> InferencePipeline {
        InferencePipeline::new(model, self.config.input_queue_capacity)
    }
}

async fn default_runtime() -> Result<Runtime> {
    Runtime::new(config::load()).await
}

/// Pack a model directory. See [`Runtime::pack`].
pub async fn pack(source_dir: impl AsRef<Path>, opts: PackOpts) -> Result<PathBuf> {
    default_runtime().await?.pack(source_dir, opts).await
}

/// Load an archive. See [`Runtime::load`].
pub async fn load(path: impl AsRef<Path>, opts: LoadOpts) -> Result<Model> {
    default_runtime().await?.load(path, opts).await
}

/// See [`Runtime::load_unpacked`].
pub async fn load_unpacked(
    dir: impl AsRef<Path>,
    pack_opts: PackOpts,
    load_opts: LoadOpts,
) -> Result<Model> {
    default_runtime()
        .await?
        .load_unpacked(dir, pack_opts, load_opts)
        .await
}

/// See [`Runtime::shrink`].
pub async fn shrink(path: impl AsRef<Path>, linked_files: Vec<LinkedFile>) -> Result<PathBuf> {
    default_runtime().await?.shrink(path, linked_files).await
}

/// See [`Runtime::get_model_info`].
pub async fn get_model_info(path: impl AsRef<Path>) -> Result<CartonInfoWithExtras> {
    default_runtime().await?.get_model_info(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::VersionReq;

    #[test]
    fn test_remote_url_detection() {
        assert_eq!(
            remote_url(Path::new("https://models.example/a.carton")),
            Some("https://models.example/a.carton")
        );
        assert!(remote_url(Path::new("http://host/a.carton")).is_some());
        assert!(remote_url(Path::new("/tmp/http/a.carton")).is_none());
        assert!(remote_url(Path::new("file:///tmp/a.carton")).is_none());
    }

    #[test]
    fn test_platform_check() {
        let mut info = CartonInfo::new(RunnerInfo::new("echo", VersionReq::STAR));
        assert!(check_platform(&info).is_ok());
        info.required_platforms = Some(vec![]);
        assert!(check_platform(&info).is_ok());
        info.required_platforms = Some(vec![host_triple()]);
        assert!(check_platform(&info).is_ok());
        info.required_platforms = Some(vec!["wasm32-unknown-unknown".into()]);
        assert!(matches!(
            check_platform(&info),
            Err(CartonError::UnsupportedPlatform { .. })
        ));
    }
}
