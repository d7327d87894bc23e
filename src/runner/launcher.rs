//! Starting runner processes and connecting to them.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::client::RunnerStream;
use super::discovery::RunnerEntry;
use crate::error::{CartonError, Result};
use crate::types::Device;

/// Environment variable naming the per-runner data directory.
pub const RUNNER_DATA_DIR_ENV: &str = "CARTON_RUNNER_DATA_DIR";

/// Flag carrying the socket path on the runner command line.
pub const UDS_PATH_ARG: &str = "--uds-path";

/// A connected runner: the byte stream plus the process behind it, if any.
pub struct RunnerConnection {
    pub stream: Box<dyn RunnerStream>,
    pub process: Option<RunnerProcess>,
}

/// Produces connections to runners. The default starts a child process;
/// tests substitute in-process runners.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    async fn launch(&self, runner: &RunnerEntry, device: Device) -> Result<RunnerConnection>;
}

/// A runner child process. Killed on drop.
pub struct RunnerProcess {
    child: tokio::process::Child,
    // Holds the socket directory until the runner is gone.
    _socket_dir: tempfile::TempDir,
}

impl RunnerProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Ask the OS to kill the runner. Does not wait.
    pub fn kill(&mut self) {
        let _ = self.child.start_kill();
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

/// Launches runner executables with `--uds-path` and waits for them to
/// connect back over a Unix socket.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub connect_timeout: Duration,
    pub runner_data_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(connect_timeout: Duration, runner_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            connect_timeout,
            runner_data_dir: runner_data_dir.into(),
        }
    }
}

#[async_trait]
impl RunnerLauncher for ProcessLauncher {
    #[cfg(unix)]
    async fn launch(&self, runner: &RunnerEntry, device: Device) -> Result<RunnerConnection> {
        use std::process::Stdio;
        use tokio::net::UnixListener;
        use tracing::{debug, info};

        let handshake_err = |reason: String| CartonError::Handshake {
            runner: runner.runner_name.clone(),
            reason,
        };

        let socket_dir = tempfile::Builder::new().prefix("carton-runner-").tempdir()?;
        let socket_path = socket_dir.path().join("runner.sock");
        let listener = UnixListener::bind(&socket_path)?;

        let data_dir = self.runner_data_dir.join(&runner.runner_name);
        std::fs::create_dir_all(&data_dir)?;

        let mut command = tokio::process::Command::new(&runner.runner_path);
        command
            .arg(UDS_PATH_ARG)
            .arg(&socket_path)
            .env("CUDA_VISIBLE_DEVICES", device.cuda_visible_devices())
            .env(RUNNER_DATA_DIR_ENV, &data_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if device.is_gpu() {
            if let Some(path) =
                super::cuda::library_path_with_cuda(std::env::var_os("LD_LIBRARY_PATH"))
            {
                command.env("LD_LIBRARY_PATH", path);
            }
        }

        let mut child = command.spawn().map_err(|e| {
            handshake_err(format!(
                "failed to start {}: {e}",
                runner.runner_path.display()
            ))
        })?;
        debug!(
            runner = %runner.runner_name,
            pid = child.id(),
            socket = %socket_path.display(),
            "Spawned runner"
        );

        let connected = tokio::select! {
            accepted = listener.accept() => accepted
                .map(|(stream, _)| stream)
                .map_err(|e| format!("accept failed: {e}")),
            status = child.wait() => {
                let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                Err(format!("runner exited before connecting ({status})"))
            }
            _ = tokio::time::sleep(self.connect_timeout) => Err(format!(
                "runner did not connect within {:?}",
                self.connect_timeout
            )),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(reason) => {
                let _ = child.start_kill();
                return Err(handshake_err(reason));
            }
        };

        info!(runner = %runner.runner_name, version = %runner.framework_version, %device, "Runner connected");
        Ok(RunnerConnection {
            stream: Box::new(stream),
            process: Some(RunnerProcess {
                child,
                _socket_dir: socket_dir,
            }),
        })
    }

    #[cfg(not(unix))]
    async fn launch(&self, runner: &RunnerEntry, _device: Device) -> Result<RunnerConnection> {
        Err(CartonError::Handshake {
            runner: runner.runner_name.clone(),
            reason: "process runners require Unix domain sockets".to_string(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::discovery::host_triple;

    fn entry(path: &str) -> RunnerEntry {
        RunnerEntry {
            runner_name: "missing".into(),
            framework_version: semver::Version::new(1, 0, 0),
            runner_compat_version: 1,
            runner_interface_version: 1,
            runner_release_date: "2023-06-01T00:00:00Z".parse().unwrap(),
            runner_path: PathBuf::from(path),
            platform: host_triple(),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_handshake_error() {
        let data = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_secs(5), data.path());
        let err = launcher
            .launch(&entry("/nonexistent/carton-runner"), Device::Cpu)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CartonError::Handshake { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_runner_exiting_early_is_handshake_error() {
        let data = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_secs(10), data.path());
        let err = launcher
            .launch(&entry("/bin/true"), Device::Cpu)
            .await
            .err()
            .unwrap();
        match err {
            CartonError::Handshake { reason, .. } => assert!(reason.contains("exited"), "{reason}"),
            other => panic!("unexpected {other}"),
        }
    }
}
