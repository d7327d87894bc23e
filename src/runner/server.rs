//! Runner side of the protocol.
//!
//! A runner binary implements [`ModelBackend`] for its framework and hands
//! it to [`run_runner`], which connects back to the loader and serves
//! requests until `Unload` or disconnect.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::client::RunnerStream;
use super::launcher::UDS_PATH_ARG;
use super::protocol::{
    is_supported_version, read_frame, write_frame, RequestData, ResponseData, RpcRequest,
    RpcResponse, SealHandleId, PROTOCOL_VERSION,
};
use crate::error::{CartonError, Result};
use crate::telemetry::{init_logging, LogConfig, LogError};
use crate::types::{Device, RunnerOpts, TensorMap};

const RESPONSE_QUEUE_DEPTH: usize = 32;

/// What a backend gets when asked to load a model.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Directory holding the extracted `model/` contents.
    pub model_dir: PathBuf,
    pub runner_opts: Option<RunnerOpts>,
    pub visible_device: Device,
    pub manifest_sha256: Option<String>,
}

/// A framework integration, driven by [`serve`].
///
/// `seal` and `infer` may be called concurrently; the loader guarantees
/// at most one `infer` at a time per model.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    fn runner_name(&self) -> &str;

    fn framework_version(&self) -> semver::Version;

    fn runner_compat_version(&self) -> u64 {
        1
    }

    async fn load(&self, request: LoadRequest) -> Result<()>;

    /// Prepare inputs ahead of `infer`. The default keeps them as given.
    async fn seal(&self, tensors: TensorMap) -> Result<TensorMap> {
        Ok(tensors)
    }

    async fn infer(&self, tensors: TensorMap) -> Result<TensorMap>;

    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Session {
    runner_opts: Option<RunnerOpts>,
    visible_device: Device,
}

struct ServerState {
    backend: Arc<dyn ModelBackend>,
    session: Mutex<Option<Session>>,
    sealed: DashMap<u64, TensorMap>,
    next_handle: AtomicU64,
}

fn error_response(e: CartonError) -> ResponseData {
    let e = match e {
        CartonError::Inference(msg) => msg,
        other => other.to_string(),
    };
    ResponseData::Error { e }
}

impl ServerState {
    async fn handle(&self, data: RequestData) -> ResponseData {
        match data {
            RequestData::Load {
                model_dir,
                runner_name,
                manifest_sha256,
                ..
            } => {
                let Some(session) = self.session.lock().clone() else {
                    return ResponseData::Error {
                        e: "Load received before Handshake".to_string(),
                    };
                };
                if runner_name != self.backend.runner_name() {
                    warn!(
                        requested = %runner_name,
                        serving = self.backend.runner_name(),
                        "Load names a different runner"
                    );
                }
                let request = LoadRequest {
                    model_dir,
                    runner_opts: session.runner_opts,
                    visible_device: session.visible_device,
                    manifest_sha256,
                };
                match self.backend.load(request).await {
                    Ok(()) => ResponseData::Loaded,
                    Err(e) => error_response(e),
                }
            }
            RequestData::Seal { tensors } => match self.backend.seal(tensors).await {
                Ok(sealed) => {
                    let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
                    self.sealed.insert(id, sealed);
                    ResponseData::Sealed {
                        handle: SealHandleId(id),
                    }
                }
                Err(e) => error_response(e),
            },
            RequestData::InferWithTensors { tensors } => self.infer(tensors).await,
            RequestData::InferWithHandle { handle } => match self.sealed.remove(&handle.0) {
                Some((_, tensors)) => self.infer(tensors).await,
                None => ResponseData::Error {
                    e: format!("unknown seal handle {}", handle.0),
                },
            },
            RequestData::Discard { handle } => {
                self.sealed.remove(&handle.0);
                ResponseData::Discarded
            }
            RequestData::Handshake { .. } | RequestData::Unload => ResponseData::Error {
                e: "request must be handled in order".to_string(),
            },
        }
    }

    async fn infer(&self, tensors: TensorMap) -> ResponseData {
        match self.backend.infer(tensors).await {
            Ok(tensors) => ResponseData::Infer { tensors },
            Err(e) => error_response(e),
        }
    }

    fn handshake(
        &self,
        protocol_version: u32,
        runner_opts: Option<RunnerOpts>,
        visible_device: Device,
    ) -> ResponseData {
        if !is_supported_version(protocol_version) {
            return ResponseData::Error {
                e: format!(
                    "protocol version {protocol_version} is not supported (runner speaks {PROTOCOL_VERSION})"
                ),
            };
        }
        *self.session.lock() = Some(Session {
            runner_opts,
            visible_device,
        });
        ResponseData::HandshakeAck {
            protocol_version: PROTOCOL_VERSION,
            runner_name: self.backend.runner_name().to_string(),
            framework_version: self.backend.framework_version().to_string(),
            runner_compat_version: self.backend.runner_compat_version(),
        }
    }
}

/// Serve one loader connection until `Unload` or EOF.
///
/// `Handshake` and `Unload` are answered in order. Everything else runs
/// on its own task so a `Seal` can proceed while an `Infer` is running.
pub async fn serve<S: RunnerStream>(
    stream: S,
    backend: Arc<dyn ModelBackend>,
    max_frame: usize,
) -> Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<RpcResponse>(RESPONSE_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &response, max_frame).await {
                warn!(error = %e, "Failed to write response");
                break;
            }
        }
    });

    let state = Arc::new(ServerState {
        backend,
        session: Mutex::new(None),
        sealed: DashMap::new(),
        next_handle: AtomicU64::new(1),
    });

    let mut outcome = Ok(());
    loop {
        let request = match read_frame::<_, RpcRequest>(&mut reader, max_frame).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("Loader disconnected");
                break;
            }
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        };
        let id = request.id;
        match request.data {
            RequestData::Handshake {
                protocol_version,
                runner_opts,
                visible_device,
            } => {
                let data = state.handshake(protocol_version, runner_opts, visible_device);
                if tx.send(RpcResponse { id, data }).await.is_err() {
                    break;
                }
            }
            RequestData::Unload => {
                let data = match state.backend.unload().await {
                    Ok(()) => ResponseData::Unloaded,
                    Err(e) => error_response(e),
                };
                state.sealed.clear();
                let _ = tx.send(RpcResponse { id, data }).await;
                info!("Model unloaded");
                break;
            }
            data => {
                let state = state.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let data = state.handle(data).await;
                    let _ = tx.send(RpcResponse { id, data }).await;
                });
            }
        }
    }

    drop(tx);
    // Outstanding request tasks still hold senders; the writer exits once
    // they finish.
    if let Err(e) = writer_task.await {
        error!(error = %e, "Response writer panicked");
    }
    outcome
}

/// The socket path given on the command line.
pub fn uds_path_from_args<I: IntoIterator<Item = String>>(args: I) -> Option<PathBuf> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == UDS_PATH_ARG {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--uds-path=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// Entry point for runner binaries: set up logging, connect to the
/// loader, and serve until unloaded.
pub async fn run_runner(backend: Arc<dyn ModelBackend>) -> ExitCode {
    match init_logging(&LogConfig::from_env()) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let Some(path) = uds_path_from_args(std::env::args().skip(1)) else {
        eprintln!("Usage: {} {} <socket>", backend.runner_name(), UDS_PATH_ARG);
        return ExitCode::FAILURE;
    };

    match connect_and_serve(&path, backend).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Runner failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn connect_and_serve(path: &std::path::Path, backend: Arc<dyn ModelBackend>) -> Result<()> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    info!(
        runner = backend.runner_name(),
        version = %backend.framework_version(),
        socket = %path.display(),
        "Connected to loader"
    );
    serve(stream, backend, crate::config::load().max_frame_size).await
}

#[cfg(not(unix))]
async fn connect_and_serve(_path: &std::path::Path, _backend: Arc<dyn ModelBackend>) -> Result<()> {
    Err(CartonError::Internal(
        "runners require Unix domain sockets".to_string(),
    ))
}
