//! A loaded model bound to a running runner.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CartonError, Result};
use crate::runner::protocol::{RequestData, ResponseData, SealHandleId};
use crate::runner::{PendingCall, RunnerClient, RunnerIdentity, RunnerProcess, StartedRunner};
use crate::telemetry;
use crate::types::{CartonInfo, Device, RunnerInfo, TensorMap, TensorSpec};

/// A batch of inputs already handed to the runner, waiting for
/// [`Model::infer_with_handle`].
///
/// At most one exists per model at a time. Dropping it unconsumed frees
/// the runner-side copy and lets the next `seal` proceed.
pub struct SealHandle {
    id: SealHandleId,
    model_id: Uuid,
    bindings: SymbolBindings,
    client: Arc<RunnerClient>,
    permit: Option<OwnedSemaphorePermit>,
    consumed: bool,
}

/// Symbol values fixed by one call's inputs.
#[derive(Debug, Default, Clone)]
struct SymbolBindings {
    dims: HashMap<String, u64>,
    shapes: HashMap<String, Vec<u64>>,
}

/// Ways `outputs` disagree with `specs`, given the symbols the inputs bound.
fn output_mismatches(
    specs: &[TensorSpec],
    outputs: &TensorMap,
    mut bindings: SymbolBindings,
) -> Vec<String> {
    let mut problems = Vec::new();
    for spec in specs {
        let Some(tensor) = outputs.get(&spec.name) else {
            problems.push(format!("declared output '{}' is missing", spec.name));
            continue;
        };
        if tensor.dtype() != spec.dtype {
            problems.push(format!(
                "output '{}' should be {} but is {}",
                spec.name,
                spec.dtype,
                tensor.dtype()
            ));
        }
        if let Err(e) = spec
            .shape
            .check(&tensor.shape, &mut bindings.dims, &mut bindings.shapes)
        {
            problems.push(format!("output '{}': {e}", spec.name));
        }
    }
    for name in outputs.keys() {
        if !specs.iter().any(|s| &s.name == name) {
            problems.push(format!("undeclared output '{name}'"));
        }
    }
    problems
}

impl SealHandle {
    pub fn model_id(&self) -> Uuid {
        self.model_id
    }
}

impl std::fmt::Debug for SealHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealHandle")
            .field("id", &self.id.0)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl Drop for SealHandle {
    fn drop(&mut self) {
        if !self.consumed && !self.client.send_detached(RequestData::Discard { handle: self.id }) {
            debug!(handle = self.id.0, "Could not discard sealed batch");
        }
    }
}

/// Kills the runner unless disarmed. Armed for the duration of a call so
/// a dropped call future leaves no half-finished request behind.
struct PoisonGuard<'a> {
    model: &'a Model,
    armed: bool,
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.model.terminate("call abandoned before the runner answered");
        }
    }
}

pub struct Model {
    id: Uuid,
    info: CartonInfo,
    identity: RunnerIdentity,
    device: Device,
    manifest_sha256: Option<String>,
    client: Arc<RunnerClient>,
    process: Mutex<Option<RunnerProcess>>,
    dead: AtomicBool,
    infer_lock: tokio::sync::Mutex<()>,
    seal_slots: Arc<Semaphore>,
    call_timeout: Option<Duration>,
    // Extracted payload; removed when the model is dropped.
    _workdir: Option<TempDir>,
}

impl Model {
    pub(crate) fn new(
        info: CartonInfo,
        started: StartedRunner,
        device: Device,
        manifest_sha256: Option<String>,
        call_timeout: Option<Duration>,
        workdir: Option<TempDir>,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(
            model_id = %id,
            model = info.model_name.as_deref().unwrap_or("<unnamed>"),
            runner = %started.identity.runner_name,
            "Model loaded"
        );
        Self {
            id,
            info,
            identity: started.identity,
            device,
            manifest_sha256,
            client: Arc::new(started.client),
            process: Mutex::new(started.process),
            dead: AtomicBool::new(false),
            infer_lock: tokio::sync::Mutex::new(()),
            seal_slots: Arc::new(Semaphore::new(1)),
            call_timeout,
            _workdir: workdir,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Model name from metadata, if any.
    pub fn name(&self) -> Option<&str> {
        self.info.model_name.as_deref()
    }

    /// Runner requirements after load overrides.
    pub fn runner(&self) -> &RunnerInfo {
        &self.info.runner
    }

    /// The runner that is actually serving this model.
    pub fn runner_identity(&self) -> &RunnerIdentity {
        &self.identity
    }

    pub fn inputs(&self) -> Option<&[TensorSpec]> {
        self.info.inputs.as_deref()
    }

    pub fn outputs(&self) -> Option<&[TensorSpec]> {
        self.info.outputs.as_deref()
    }

    pub fn info(&self) -> &CartonInfo {
        &self.info
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn manifest_sha256(&self) -> Option<&str> {
        self.manifest_sha256.as_deref()
    }

    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && self.client.is_alive()
    }

    fn label(&self) -> String {
        self.info
            .model_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(CartonError::ModelDead(self.label()))
        }
    }

    /// Kill the runner and refuse further calls.
    fn terminate(&self, reason: &str) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(model_id = %self.id, reason, "Terminating runner");
        self.client.mark_dead(reason);
        if let Some(process) = self.process.lock().as_mut() {
            process.kill();
        }
    }

    /// Wait for a queued call, applying the call timeout. Errors that
    /// leave the runner in an unknown state terminate it.
    async fn finish(&self, pending: PendingCall) -> Result<ResponseData> {
        let mut guard = PoisonGuard {
            model: self,
            armed: true,
        };
        let result = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, pending.wait()).await {
                Ok(r) => r,
                Err(_) => Err(CartonError::Timeout(limit)),
            },
            None => pending.wait().await,
        };
        guard.armed = false;
        if let Err(e) = &result {
            if e.is_fatal_to_model() {
                self.terminate(&e.to_string());
            }
        }
        result
    }

    async fn call(&self, data: RequestData) -> Result<ResponseData> {
        self.ensure_alive()?;
        let pending = self.client.start(data).await?;
        self.finish(pending).await
    }

    /// Check `inputs` against the declared input specs.
    ///
    /// Unknown names, wrong dtypes, wrong shapes, and disagreeing symbol
    /// bindings are rejected. Models without declared inputs accept
    /// anything well formed.
    pub fn validate_inputs(&self, inputs: &TensorMap) -> Result<()> {
        self.bind_inputs(inputs).map(|_| ())
    }

    fn bind_inputs(&self, inputs: &TensorMap) -> Result<SymbolBindings> {
        for (name, tensor) in inputs {
            tensor
                .check_len()
                .map_err(|e| CartonError::Validation(format!("input '{name}': {e}")))?;
        }
        let mut bindings = SymbolBindings::default();
        let Some(specs) = self.inputs() else {
            return Ok(bindings);
        };
        let declared: BTreeSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        if let Some(unknown) = inputs.keys().find(|k| !declared.contains(k.as_str())) {
            return Err(CartonError::Validation(format!(
                "unknown input '{unknown}' (declared: {})",
                declared.iter().copied().collect::<Vec<_>>().join(", ")
            )));
        }
        for spec in specs {
            let Some(tensor) = inputs.get(&spec.name) else {
                continue;
            };
            if tensor.dtype() != spec.dtype {
                return Err(CartonError::Validation(format!(
                    "input '{}' should be {} but is {}",
                    spec.name,
                    spec.dtype,
                    tensor.dtype()
                )));
            }
            spec.shape
                .check(&tensor.shape, &mut bindings.dims, &mut bindings.shapes)
                .map_err(|e| CartonError::Validation(format!("input '{}': {e}", spec.name)))?;
        }
        Ok(bindings)
    }

    /// Log outputs that disagree with the declared output specs. The
    /// runner's answer is still returned.
    fn check_outputs(&self, outputs: &TensorMap, bindings: SymbolBindings) {
        let Some(specs) = self.outputs() else {
            return;
        };
        for problem in output_mismatches(specs, outputs, bindings) {
            warn!(model_id = %self.id, runner = %self.identity.runner_name, "{problem}");
        }
    }

    fn outputs_from(&self, response: ResponseData) -> Result<TensorMap> {
        match response {
            ResponseData::Infer { tensors } => Ok(tensors),
            other => {
                let reason = format!("expected Infer, got {}", other.kind());
                self.terminate(&reason);
                Err(CartonError::Protocol(
                    crate::runner::protocol::ProtocolError::UnexpectedResponse(reason),
                ))
            }
        }
    }

    /// Run inference. Calls are serialized per model.
    pub async fn infer(&self, inputs: TensorMap) -> Result<TensorMap> {
        let bindings = self.bind_inputs(&inputs)?;
        let _slot = self.infer_lock.lock().await;
        let start = Instant::now();
        let result = match self.call(RequestData::InferWithTensors { tensors: inputs }).await {
            Ok(response) => self.outputs_from(response),
            Err(e) => Err(e),
        };
        telemetry::record_infer(&self.identity.runner_name, result.is_ok(), start.elapsed());
        if let Ok(outputs) = &result {
            self.check_outputs(outputs, bindings);
        }
        result
    }

    /// Hand `inputs` to the runner ahead of inference.
    ///
    /// Waits while another sealed batch of this model is outstanding. May
    /// run while an `infer` is in progress.
    pub async fn seal(&self, inputs: TensorMap) -> Result<SealHandle> {
        let bindings = self.bind_inputs(&inputs)?;
        let permit = self
            .seal_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CartonError::ModelDead(self.label()))?;
        match self.call(RequestData::Seal { tensors: inputs }).await? {
            ResponseData::Sealed { handle } => Ok(SealHandle {
                id: handle,
                model_id: self.id,
                bindings,
                client: self.client.clone(),
                permit: Some(permit),
                consumed: false,
            }),
            other => {
                let reason = format!("expected Sealed, got {}", other.kind());
                self.terminate(&reason);
                Err(CartonError::Protocol(
                    crate::runner::protocol::ProtocolError::UnexpectedResponse(reason),
                ))
            }
        }
    }

    /// Run inference on a sealed batch. The handle is consumed.
    pub async fn infer_with_handle(&self, mut handle: SealHandle) -> Result<TensorMap> {
        if handle.model_id != self.id {
            return Err(CartonError::Validation(
                "seal handle belongs to a different model".to_string(),
            ));
        }
        let _slot = self.infer_lock.lock().await;
        self.ensure_alive()?;
        let start = Instant::now();
        let pending = self
            .client
            .start(RequestData::InferWithHandle { handle: handle.id })
            .await;
        // Once the request is queued the runner owns the batch, so the
        // next seal may start.
        handle.consumed = true;
        drop(handle.permit.take());
        let bindings = std::mem::take(&mut handle.bindings);
        let result = match pending {
            Ok(pending) => match self.finish(pending).await {
                Ok(response) => self.outputs_from(response),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        telemetry::record_infer(&self.identity.runner_name, result.is_ok(), start.elapsed());
        if let Ok(outputs) = &result {
            self.check_outputs(outputs, bindings);
        }
        result
    }

    /// Unload the model and stop the runner.
    pub async fn unload(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let _slot = self.infer_lock.lock().await;
        let result = match self.call(RequestData::Unload).await {
            Ok(ResponseData::Unloaded) => Ok(()),
            Ok(other) => Err(CartonError::Protocol(
                crate::runner::protocol::ProtocolError::UnexpectedResponse(format!(
                    "expected Unloaded, got {}",
                    other.kind()
                )),
            )),
            Err(e) => Err(e),
        };
        self.dead.store(true, Ordering::SeqCst);
        self.seal_slots.close();
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            match tokio::time::timeout(Duration::from_secs(5), process.wait()).await {
                Ok(_) => {}
                Err(_) => process.kill(),
            }
        }
        info!(model_id = %self.id, "Model unloaded");
        result
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        if let Some(process) = self.process.get_mut().as_mut() {
            process.kill();
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("name", &self.info.model_name)
            .field("runner", &self.identity.runner_name)
            .field("device", &self.device)
            .field("alive", &self.is_alive())
            .finish()
    }
}
