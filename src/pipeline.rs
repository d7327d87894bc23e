//! Two-stage seal/infer pipeline over one model.
//!
//! Submissions enter a bounded queue. The seal stage hands each batch to
//! the runner while the infer stage runs the previous one, so input
//! transfer overlaps compute. Producers wait when the queue is full.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CartonError, Result};
use crate::model::{Model, SealHandle};
use crate::types::TensorMap;

struct Job {
    inputs: TensorMap,
    reply: oneshot::Sender<Result<TensorMap>>,
}

type Sealed = (Result<SealHandle>, oneshot::Sender<Result<TensorMap>>);

/// Outputs of one submission.
pub struct PendingResult {
    rx: oneshot::Receiver<Result<TensorMap>>,
}

impl PendingResult {
    pub async fn wait(self) -> Result<TensorMap> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(CartonError::Internal("pipeline shut down".to_string())))
    }
}

pub struct InferencePipeline {
    input_tx: Option<mpsc::Sender<Job>>,
    capacity: usize,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl InferencePipeline {
    pub fn new(model: Arc<Model>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (input_tx, mut input_rx) = mpsc::channel::<Job>(capacity);
        // One sealed batch in flight between the stages.
        let (sealed_tx, mut sealed_rx) = mpsc::channel::<Sealed>(1);
        let cancel = CancellationToken::new();

        let seal_model = model.clone();
        let seal_cancel = cancel.clone();
        let seal_task = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = seal_cancel.cancelled() => break,
                    job = input_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let sealed = seal_model.seal(job.inputs).await;
                if sealed_tx.send((sealed, job.reply)).await.is_err() {
                    break;
                }
            }
            debug!("Seal stage stopped");
        });

        let infer_cancel = cancel.clone();
        let infer_task = tokio::spawn(async move {
            loop {
                let (sealed, reply) = tokio::select! {
                    _ = infer_cancel.cancelled() => break,
                    next = sealed_rx.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                let result = match sealed {
                    Ok(handle) => model.infer_with_handle(handle).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            debug!("Infer stage stopped");
        });

        Self {
            input_tx: Some(input_tx),
            capacity,
            cancel,
            tasks: vec![seal_task, infer_task],
        }
    }

    fn sender(&self) -> Result<&mpsc::Sender<Job>> {
        self.input_tx
            .as_ref()
            .ok_or_else(|| CartonError::Internal("pipeline is closed".to_string()))
    }

    /// Queue inputs, waiting for room if the queue is full.
    pub async fn submit(&self, inputs: TensorMap) -> Result<PendingResult> {
        let (reply, rx) = oneshot::channel();
        self.sender()?
            .send(Job { inputs, reply })
            .await
            .map_err(|_| CartonError::Internal("pipeline is closed".to_string()))?;
        Ok(PendingResult { rx })
    }

    /// Queue inputs, or fail with `QueueFull` without waiting.
    pub fn try_submit(&self, inputs: TensorMap) -> Result<PendingResult> {
        let (reply, rx) = oneshot::channel();
        match self.sender()?.try_send(Job { inputs, reply }) {
            Ok(()) => Ok(PendingResult { rx }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(CartonError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(CartonError::Internal("pipeline is closed".to_string()))
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Submissions waiting for the seal stage.
    pub fn queued(&self) -> usize {
        self.input_tx
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Stop accepting work and wait for queued submissions to finish.
    pub async fn shutdown(mut self) {
        self.input_tx.take();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for InferencePipeline {
    fn drop(&mut self) {
        // Stages finish the call in progress and exit; queued work is
        // answered with an error.
        self.cancel.cancel();
    }
}
