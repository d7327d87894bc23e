//! A runner that returns its inputs. Used to exercise the loader end to
//! end without a real framework.
//!
//! Recognized runner options:
//! - `fail_load = true` makes `load` fail.
//! - `delay_ms = N` sleeps before answering each `infer`.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::server::{LoadRequest, ModelBackend};
use crate::error::{CartonError, Result};
use crate::types::{RunnerOpt, TensorMap};

/// Overrides the version the echo runner reports.
pub const ECHO_VERSION_ENV: &str = "CARTON_ECHO_FRAMEWORK_VERSION";

#[derive(Debug, Default)]
struct EchoState {
    loaded: bool,
    delay: Option<Duration>,
}

#[derive(Debug)]
pub struct EchoBackend {
    framework_version: semver::Version,
    state: Mutex<EchoState>,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::with_version(semver::Version::new(1, 0, 0))
    }

    pub fn with_version(framework_version: semver::Version) -> Self {
        Self {
            framework_version,
            state: Mutex::new(EchoState::default()),
        }
    }

    /// Version from `CARTON_ECHO_FRAMEWORK_VERSION`, else 1.0.0.
    pub fn from_env() -> Self {
        match std::env::var(ECHO_VERSION_ENV)
            .ok()
            .and_then(|v| semver::Version::parse(&v).ok())
        {
            Some(version) => Self::with_version(version),
            None => Self::new(),
        }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for EchoBackend {
    fn runner_name(&self) -> &str {
        "echo"
    }

    fn framework_version(&self) -> semver::Version {
        self.framework_version.clone()
    }

    async fn load(&self, request: LoadRequest) -> Result<()> {
        let opts = request.runner_opts.unwrap_or_default();
        if opts.get("fail_load") == Some(&RunnerOpt::Boolean(true)) {
            return Err(CartonError::Inference("load failed (fail_load is set)".to_string()));
        }
        if !request.model_dir.is_dir() {
            return Err(CartonError::Inference(format!(
                "model directory {} does not exist",
                request.model_dir.display()
            )));
        }
        let delay = match opts.get("delay_ms") {
            Some(RunnerOpt::Integer(ms)) if *ms > 0 => Some(Duration::from_millis(*ms as u64)),
            _ => None,
        };
        let mut state = self.state.lock();
        state.loaded = true;
        state.delay = delay;
        info!(model_dir = %request.model_dir.display(), device = %request.visible_device, "Echo model loaded");
        Ok(())
    }

    async fn infer(&self, tensors: TensorMap) -> Result<TensorMap> {
        let delay = {
            let state = self.state.lock();
            if !state.loaded {
                return Err(CartonError::Inference("no model loaded".to_string()));
            }
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(tensors)
    }

    async fn unload(&self) -> Result<()> {
        self.state.lock().loaded = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Device, Tensor};
    use std::collections::BTreeMap;

    fn request(opts: Option<crate::types::RunnerOpts>) -> LoadRequest {
        LoadRequest {
            model_dir: std::env::temp_dir(),
            runner_opts: opts,
            visible_device: Device::Cpu,
            manifest_sha256: None,
        }
    }

    #[tokio::test]
    async fn test_infer_requires_load() {
        let echo = EchoBackend::new();
        assert!(echo.infer(TensorMap::new()).await.is_err());
        echo.load(request(None)).await.unwrap();
        let inputs = BTreeMap::from([("x".to_string(), Tensor::new(vec![], vec!["hi".to_string()]).unwrap())]);
        assert_eq!(echo.infer(inputs.clone()).await.unwrap(), inputs);
    }

    #[tokio::test]
    async fn test_fail_load_option() {
        let echo = EchoBackend::new();
        let opts = BTreeMap::from([("fail_load".to_string(), RunnerOpt::Boolean(true))]);
        assert!(echo.load(request(Some(opts))).await.is_err());
    }
}
