//! Bounded internode task queue drained by a fixed set of workers.
//!
//! Every worker pulls from the same receiver, runs one task at a time and
//! survives task errors, timeouts and panics.

use crate::operations::{InternalFetchOperation, InternalFetchOperationRequest};
use crate::{CairnError, ClusterClient, NodeInfo, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternodeTask {
    /// Ask `target` to pull `oid` from `source`.
    RequestFetch {
        target: NodeInfo,
        source: NodeInfo,
        oid: String,
    },
    /// Pull `oid` from `source` into the local store.
    PullBlob { source: NodeInfo, oid: String },
    /// Tell `target` that `oid` is the latest backup.
    MarkBackup { target: NodeInfo, oid: String },
}

impl fmt::Display for InternodeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFetch {
                target,
                source,
                oid,
            } => write!(
                f,
                "request-fetch oid={} target={} source={}",
                oid, target.node_id, source.node_id
            ),
            Self::PullBlob { source, oid } => {
                write!(f, "pull-blob oid={} source={}", oid, source.node_id)
            }
            Self::MarkBackup { target, oid } => {
                write!(f, "mark-backup oid={} target={}", oid, target.node_id)
            }
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &InternodeTask) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_per_worker: usize,
    pub task_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_per_worker: 1024,
            task_timeout: Duration::from_secs(300),
        }
    }
}

struct QueuedTask {
    task: InternodeTask,
    reply: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    tx: mpsc::Sender<QueuedTask>,
    capacity: usize,
}

impl TaskDispatcher {
    /// Spawns the workers. Must be called from inside a tokio runtime.
    pub fn start(config: DispatcherConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        let workers = config.workers.max(1);
        let capacity = workers * config.queue_per_worker.max(1);
        let (tx, rx) = mpsc::channel::<QueuedTask>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let executor = Arc::clone(&executor);
            let task_timeout = config.task_timeout;
            tokio::spawn(async move {
                worker_loop(worker_id, rx, executor, task_timeout).await;
            });
        }

        tracing::info!(
            "task dispatcher started: workers={} capacity={}",
            workers,
            capacity
        );

        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queues a task, waiting while the queue is full.
    pub async fn submit(&self, task: InternodeTask) -> Result<()> {
        self.tx
            .send(QueuedTask { task, reply: None })
            .await
            .map_err(|_| CairnError::Internal("task dispatcher is closed".to_string()))
    }

    /// Queues a task and waits for its outcome.
    pub async fn submit_and_wait(&self, task: InternodeTask) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueuedTask {
                task,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| CairnError::Internal("task dispatcher is closed".to_string()))?;

        reply_rx
            .await
            .map_err(|_| CairnError::Internal("task worker dropped the reply".to_string()))?
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<QueuedTask>>>,
    executor: Arc<dyn TaskExecutor>,
    task_timeout: Duration,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(QueuedTask { task, reply }) = next else {
            tracing::debug!("task worker {} stopping, queue closed", worker_id);
            return;
        };

        let label = task.to_string();
        let started = Instant::now();
        let executor = Arc::clone(&executor);
        let handle = tokio::spawn(async move {
            tokio::time::timeout(task_timeout, executor.execute(&task)).await
        });

        let result = match handle.await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(
                    "worker {} finished {} in {:?}",
                    worker_id,
                    label,
                    started.elapsed()
                );
                Ok(())
            }
            Ok(Ok(Err(error))) => {
                tracing::warn!("worker {} task {} failed: {}", worker_id, label, error);
                Err(error)
            }
            Ok(Err(_)) => {
                tracing::warn!(
                    "worker {} task {} timed out after {:?}",
                    worker_id,
                    label,
                    task_timeout
                );
                Err(CairnError::Internal(format!(
                    "task {} timed out after {:?}",
                    label, task_timeout
                )))
            }
            Err(join_error) => {
                tracing::error!("worker {} task {} panicked: {}", worker_id, label, join_error);
                Err(CairnError::Internal(format!("task {} panicked", label)))
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

/// Runs tasks against real peers.
pub struct InternodeExecutor {
    client: ClusterClient,
    fetch: InternalFetchOperation,
}

impl InternodeExecutor {
    pub fn new(client: ClusterClient, fetch: InternalFetchOperation) -> Self {
        Self { client, fetch }
    }
}

#[async_trait]
impl TaskExecutor for InternodeExecutor {
    async fn execute(&self, task: &InternodeTask) -> Result<()> {
        match task {
            InternodeTask::RequestFetch {
                target,
                source,
                oid,
            } => self.client.request_fetch(target, oid, source).await,
            InternodeTask::PullBlob { source, oid } => {
                let result = self
                    .fetch
                    .run(InternalFetchOperationRequest {
                        oid: oid.clone(),
                        source: source.clone(),
                    })
                    .await?;
                tracing::info!(
                    "pulled blob {} ({} bytes) from {} reused={}",
                    result.oid,
                    result.length,
                    source.node_id,
                    result.reused
                );
                Ok(())
            }
            InternodeTask::MarkBackup { target, oid } => self.client.mark_backup(target, oid).await,
        }
    }
}
