//! Loader side of a runner connection.
//!
//! One writer task drains a bounded request queue onto the stream; one
//! reader task routes responses to waiting callers by request id. When
//! the stream closes, every pending call fails with `RunnerDied`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{read_frame, write_frame, RequestData, ResponseData, RpcRequest, RpcResponse};
use crate::error::{CartonError, Result};

/// Depth of the outgoing request queue.
const REQUEST_QUEUE_DEPTH: usize = 32;

/// Any bidirectional byte stream a runner can be reached over.
pub trait RunnerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RunnerStream for T {}

struct Shared {
    runner_name: String,
    inflight: DashMap<u64, oneshot::Sender<ResponseData>>,
    alive: AtomicBool,
    death_reason: Mutex<Option<String>>,
}

impl Shared {
    fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!(runner = %self.runner_name, reason, "Runner connection closed");
            *self.death_reason.lock() = Some(reason.to_string());
        }
        // Dropping the senders wakes every waiter with an error.
        self.inflight.clear();
    }

    fn died(&self) -> CartonError {
        CartonError::RunnerDied {
            runner: self.runner_name.clone(),
            reason: self
                .death_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "connection closed".to_string()),
        }
    }
}

/// A request that has been queued and is waiting for its response.
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<ResponseData>,
    shared: Arc<Shared>,
}

impl PendingCall {
    /// Wait for the response. Runner-reported errors become `Inference`.
    pub async fn wait(mut self) -> Result<ResponseData> {
        match (&mut self.rx).await {
            Ok(ResponseData::Error { e }) => Err(CartonError::Inference(e)),
            Ok(data) => Ok(data),
            Err(_) => Err(self.shared.died()),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.shared.inflight.remove(&self.id);
    }
}

pub struct RunnerClient {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    tx: mpsc::Sender<RpcRequest>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunnerClient {
    pub fn new<S: RunnerStream>(stream: S, runner_name: impl Into<String>, max_frame: usize) -> Self {
        let shared = Arc::new(Shared {
            runner_name: runner_name.into(),
            inflight: DashMap::new(),
            alive: AtomicBool::new(true),
            death_reason: Mutex::new(None),
        });
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<RpcRequest>(REQUEST_QUEUE_DEPTH);

        let writer_shared = shared.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &request, max_frame).await {
                    writer_shared.mark_dead(&format!("write failed: {e}"));
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame::<_, RpcResponse>(&mut reader, max_frame).await {
                    Ok(Some(response)) => {
                        match reader_shared.inflight.remove(&response.id) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(response.data);
                            }
                            None => debug!(
                                id = response.id,
                                kind = response.data.kind(),
                                "Response with no waiting caller"
                            ),
                        }
                    }
                    Ok(None) => {
                        reader_shared.mark_dead("runner closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(runner = %reader_shared.runner_name, error = %e, "Runner stream failed");
                        reader_shared.mark_dead(&format!("read failed: {e}"));
                        break;
                    }
                }
            }
        });

        Self {
            shared,
            next_id: AtomicU64::new(1),
            tx,
            tasks: vec![writer_task, reader_task],
        }
    }

    pub fn runner_name(&self) -> &str {
        &self.shared.runner_name
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Fail all pending and future calls.
    pub fn mark_dead(&self, reason: &str) {
        self.shared.mark_dead(reason);
    }

    /// Queue a request. Returns once it is in the outgoing queue, in order
    /// relative to other requests from this client.
    pub async fn start(&self, data: RequestData) -> Result<PendingCall> {
        if !self.is_alive() {
            return Err(self.shared.died());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, rx) = oneshot::channel();
        self.shared.inflight.insert(id, waiter);
        let pending = PendingCall {
            id,
            rx,
            shared: self.shared.clone(),
        };
        if !self.is_alive() {
            return Err(self.shared.died());
        }
        self.tx
            .send(RpcRequest { id, data })
            .await
            .map_err(|_| self.shared.died())?;
        Ok(pending)
    }

    pub async fn call(&self, data: RequestData) -> Result<ResponseData> {
        self.start(data).await?.wait().await
    }

    /// Queue a request without waiting, for use from `Drop`. Returns false
    /// if the queue is full or the runner is gone.
    pub fn send_detached(&self, data: RequestData) -> bool {
        if !self.is_alive() {
            return false;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx.try_send(RpcRequest { id, data }).is_ok()
    }
}

impl Drop for RunnerClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
