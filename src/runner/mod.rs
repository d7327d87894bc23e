//! Runner dispatch: discovery, launch, and the loader/runner protocol.
//!
//! Every framework lives in its own runner process. The loader talks to
//! it over a framed socket with a fixed capability set: handshake, load,
//! seal, infer, and unload.

pub mod client;
pub mod cuda;
pub mod discovery;
pub mod echo;
pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{PendingCall, RunnerClient, RunnerStream};
pub use discovery::{discover_runners, host_triple, write_runner_toml, RunnerEntry};
pub use launcher::{ProcessLauncher, RunnerConnection, RunnerLauncher, RunnerProcess};
pub use registry::RunnerRegistry;
pub use server::{serve, LoadRequest, ModelBackend};

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{CartonError, Result};
use crate::telemetry;
use crate::types::{Device, RunnerInfo};
use protocol::{is_supported_version, RequestData, ResponseData, PROTOCOL_VERSION};

/// What a runner reported about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerIdentity {
    pub runner_name: String,
    pub framework_version: semver::Version,
    pub runner_compat_version: u64,
    pub protocol_version: u32,
}

/// A started runner with a model loaded.
pub struct StartedRunner {
    pub client: RunnerClient,
    pub process: Option<RunnerProcess>,
    pub identity: RunnerIdentity,
}

/// Everything needed to start a runner for one model.
pub struct StartRequest<'a> {
    pub entry: &'a RunnerEntry,
    pub device: Device,
    pub runner: &'a RunnerInfo,
    pub model_dir: PathBuf,
    pub manifest_sha256: Option<String>,
    pub handshake_timeout: Duration,
    pub max_frame: usize,
}

fn check_ack(request: &StartRequest<'_>, ack: ResponseData) -> std::result::Result<RunnerIdentity, String> {
    let ResponseData::HandshakeAck {
        protocol_version,
        runner_name,
        framework_version,
        runner_compat_version,
    } = ack
    else {
        return Err(format!("expected HandshakeAck, got {}", ack.kind()));
    };
    if !is_supported_version(protocol_version) {
        return Err(format!(
            "runner speaks protocol {protocol_version}, loader speaks {PROTOCOL_VERSION}"
        ));
    }
    if runner_name != request.runner.runner_name {
        return Err(format!(
            "expected runner '{}' but '{runner_name}' answered",
            request.runner.runner_name
        ));
    }
    let framework_version = semver::Version::parse(&framework_version)
        .map_err(|e| format!("runner reported invalid version '{framework_version}': {e}"))?;
    if !request.runner.required_framework_version.matches(&framework_version) {
        return Err(format!(
            "runner reported version {framework_version}, which does not satisfy {}",
            request.runner.required_framework_version
        ));
    }
    if let Some(compat) = request.runner.runner_compat_version {
        if compat != runner_compat_version {
            warn!(
                runner = %runner_name,
                expected = compat,
                reported = runner_compat_version,
                "Runner compat version differs from the archive"
            );
        }
    }
    Ok(RunnerIdentity {
        runner_name,
        framework_version,
        runner_compat_version,
        protocol_version,
    })
}

async fn handshake_and_load(
    client: &RunnerClient,
    request: &StartRequest<'_>,
) -> std::result::Result<RunnerIdentity, String> {
    let ack = client
        .call(RequestData::Handshake {
            protocol_version: PROTOCOL_VERSION,
            runner_opts: request.runner.opts.clone(),
            visible_device: request.device,
        })
        .await
        .map_err(|e| e.to_string())?;
    let identity = check_ack(request, ack)?;

    let loaded = client
        .call(RequestData::Load {
            model_dir: request.model_dir.clone(),
            runner_name: request.runner.runner_name.clone(),
            required_framework_version: request.runner.required_framework_version.to_string(),
            runner_compat_version: identity.runner_compat_version,
            manifest_sha256: request.manifest_sha256.clone(),
        })
        .await
        .map_err(|e| format!("load failed: {e}"))?;
    match loaded {
        ResponseData::Loaded => Ok(identity),
        other => Err(format!("expected Loaded, got {}", other.kind())),
    }
}

/// Launch a runner, handshake, and load the model.
///
/// Any failure kills the process and is reported as `Handshake`.
pub async fn start_runner(launcher: &dyn RunnerLauncher, request: StartRequest<'_>) -> Result<StartedRunner> {
    let runner_name = request.entry.runner_name.clone();
    let connection = match launcher.launch(request.entry, request.device).await {
        Ok(c) => c,
        Err(e) => {
            telemetry::record_runner_launch(&runner_name, false);
            return Err(e);
        }
    };
    let mut process = connection.process;
    let client = RunnerClient::new(connection.stream, runner_name.clone(), request.max_frame);

    let outcome = tokio::time::timeout(request.handshake_timeout, handshake_and_load(&client, &request))
        .await
        .unwrap_or_else(|_| {
            Err(format!(
                "no handshake and load within {:?}",
                request.handshake_timeout
            ))
        });

    match outcome {
        Ok(identity) => {
            telemetry::record_runner_launch(&runner_name, true);
            info!(
                runner = %identity.runner_name,
                version = %identity.framework_version,
                device = %request.device,
                "Runner ready"
            );
            Ok(StartedRunner {
                client,
                process,
                identity,
            })
        }
        Err(reason) => {
            telemetry::record_runner_launch(&runner_name, false);
            client.mark_dead(&reason);
            if let Some(p) = process.as_mut() {
                p.kill();
            }
            Err(CartonError::Handshake {
                runner: runner_name,
                reason,
            })
        }
    }
}
