//! Shared fixtures: in-process runners over duplex pipes.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use semver::{Version, VersionReq};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use carton::runner::echo::EchoBackend;
use carton::runner::{
    host_triple, serve, LoadRequest, ModelBackend, RunnerConnection, RunnerEntry, RunnerLauncher,
    RunnerRegistry,
};
use carton::types::{Dimension, RunnerOpt};
use carton::{
    CartonConfig, CartonError, CartonInfo, DataType, Device, Result, RunnerInfo, Runtime, Shape,
    Tensor, TensorMap, TensorSpec,
};

pub const MAX_FRAME: usize = 64 * 1024 * 1024;

type BackendFactory = dyn Fn(&RunnerEntry) -> Arc<dyn ModelBackend> + Send + Sync;

/// Serves each launch with a fresh backend on a duplex pipe.
pub struct InProcessLauncher {
    factory: Box<BackendFactory>,
    launches: Mutex<Vec<(String, Device)>>,
}

impl InProcessLauncher {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&RunnerEntry) -> Arc<dyn ModelBackend> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Echo for "echo", tts for "tts", each reporting the entry's version.
    pub fn standard() -> Self {
        Self::new(|entry| -> Arc<dyn ModelBackend> {
            match entry.runner_name.as_str() {
                "tts" => Arc::new(TtsBackend::new(entry.framework_version.clone())),
                _ => Arc::new(EchoBackend::with_version(entry.framework_version.clone())),
            }
        })
    }

    pub fn launches(&self) -> Vec<(String, Device)> {
        self.launches.lock().clone()
    }
}

#[async_trait]
impl RunnerLauncher for InProcessLauncher {
    async fn launch(&self, runner: &RunnerEntry, device: Device) -> Result<RunnerConnection> {
        self.launches
            .lock()
            .push((runner.runner_name.clone(), device));
        let backend = (self.factory)(runner);
        let (loader_side, runner_side) = tokio::io::duplex(1024 * 1024);
        tokio::spawn(async move {
            let _ = serve(runner_side, backend, MAX_FRAME).await;
        });
        Ok(RunnerConnection {
            stream: Box::new(loader_side),
            process: None,
        })
    }
}

/// Text-to-speech stand-in: a string prompt in, float32 "audio" out with
/// ten samples per prompt byte.
pub struct TtsBackend {
    version: Version,
    loaded: Mutex<bool>,
}

impl TtsBackend {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            loaded: Mutex::new(false),
        }
    }
}

pub fn synthesize(prompt: &str) -> Tensor {
    let samples = prompt.len() * 10;
    Tensor::new(vec![samples as u64], vec![0.25f32; samples]).unwrap()
}

#[async_trait]
impl ModelBackend for TtsBackend {
    fn runner_name(&self) -> &str {
        "tts"
    }

    fn framework_version(&self) -> Version {
        self.version.clone()
    }

    async fn load(&self, request: LoadRequest) -> Result<()> {
        if !request.model_dir.join("weights.bin").is_file() {
            return Err(CartonError::Inference("weights.bin missing".into()));
        }
        *self.loaded.lock() = true;
        Ok(())
    }

    async fn infer(&self, tensors: TensorMap) -> Result<TensorMap> {
        if !*self.loaded.lock() {
            return Err(CartonError::Inference("not loaded".into()));
        }
        let prompt = match tensors.get("prompt").map(|t| &t.data) {
            Some(carton::types::TensorData::String(v)) if v.len() == 1 => v[0].clone(),
            _ => return Err(CartonError::Inference("expected a string prompt".into())),
        };
        Ok(BTreeMap::from([("audio".to_string(), synthesize(&prompt))]))
    }
}

pub fn runner_entry(name: &str, version: &str, compat: u64) -> RunnerEntry {
    RunnerEntry {
        runner_name: name.into(),
        framework_version: Version::parse(version).unwrap(),
        runner_compat_version: compat,
        runner_interface_version: 1,
        runner_release_date: "2024-01-01T00:00:00Z".parse().unwrap(),
        runner_path: PathBuf::from("/nonexistent/runner"),
        platform: host_triple(),
    }
}

pub fn test_config(root: &Path) -> CartonConfig {
    CartonConfig {
        runner_dir: root.join("runners"),
        runner_data_dir: root.join("runner_data"),
        cache_dir: root.join("cache"),
        handshake_timeout: Duration::from_secs(10),
        max_frame_size: MAX_FRAME,
        input_queue_capacity: 4,
        ..CartonConfig::default()
    }
}

/// A runtime with in-process runners registered for `entries`.
pub struct TestEnv {
    pub dir: TempDir,
    pub runtime: Runtime,
    pub launcher: Arc<InProcessLauncher>,
}

impl TestEnv {
    pub fn new(entries: Vec<RunnerEntry>) -> Self {
        Self::with_launcher(entries, InProcessLauncher::standard())
    }

    pub fn with_launcher(entries: Vec<RunnerEntry>, launcher: InProcessLauncher) -> Self {
        Self::build(entries, launcher, |_| {})
    }

    pub fn build(
        entries: Vec<RunnerEntry>,
        launcher: InProcessLauncher,
        configure: impl FnOnce(&mut CartonConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        configure(&mut config);
        let registry = Arc::new(RunnerRegistry::new(config.runner_dir.clone()));
        for entry in entries {
            registry.register(entry);
        }
        let launcher = Arc::new(launcher);
        let runtime = Runtime::with_parts(config, registry, launcher.clone()).unwrap();
        Self {
            dir,
            runtime,
            launcher,
        }
    }

    /// A payload directory with the given files.
    pub fn model_dir(&self, files: &[(&str, &[u8])]) -> PathBuf {
        let dir = tempfile::tempdir_in(self.dir.path()).unwrap().into_path();
        for (name, bytes) in files {
            let path = dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, bytes).unwrap();
        }
        dir
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Serves `files` by request path over plain HTTP/1.1 on a loopback port.
/// Unknown paths get a 404.
pub async fn serve_http(files: Vec<(&str, Vec<u8>)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let files: Arc<HashMap<String, Vec<u8>>> = Arc::new(
        files
            .into_iter()
            .map(|(path, body)| (path.to_string(), body))
            .collect(),
    );
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let files = files.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let path = head.split_whitespace().nth(1).unwrap_or("/");
                let response = match files.get(path) {
                    Some(body) => {
                        let mut r = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        r.extend_from_slice(body);
                        r
                    }
                    None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

pub fn req(s: &str) -> VersionReq {
    VersionReq::parse(s).unwrap()
}

/// Metadata for the text-to-speech model.
pub fn tts_info(required: &str) -> CartonInfo {
    let mut info = CartonInfo::new(RunnerInfo::new("tts", req(required)));
    info.model_name = Some("tiny-tts".into());
    info.short_description = Some("Speaks a prompt".into());
    info.license = Some("Apache-2.0".into());
    info.inputs = Some(vec![TensorSpec {
        name: "prompt".into(),
        dtype: DataType::String,
        shape: Shape::Dims(vec![]),
        description: Some("Text to speak".into()),
        internal_name: None,
    }]);
    info.outputs = Some(vec![TensorSpec {
        name: "audio".into(),
        dtype: DataType::Float32,
        shape: Shape::Dims(vec![Dimension::Symbol("duration".into())]),
        description: None,
        internal_name: None,
    }]);
    info
}

pub fn echo_info(required: &str) -> CartonInfo {
    let mut info = CartonInfo::new(RunnerInfo::new("echo", req(required)));
    info.model_name = Some("echo".into());
    info
}

pub fn opts(pairs: &[(&str, RunnerOpt)]) -> carton::types::RunnerOpts {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn prompt(text: &str) -> TensorMap {
    BTreeMap::from([(
        "prompt".to_string(),
        Tensor::new(vec![], vec![text.to_string()]).unwrap(),
    )])
}

pub fn floats(name: &str, values: Vec<f32>) -> TensorMap {
    BTreeMap::from([(
        name.to_string(),
        Tensor::new(vec![values.len() as u64], values).unwrap(),
    )])
}
