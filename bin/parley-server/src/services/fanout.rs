//! Supervised fan-out of persisted facts to the auxiliary subsystems.
//!
//! Turns hand jobs to a [`FanoutHandle`] and move on: submission never
//! waits, and a full queue drops the job with a warning.  A single worker
//! drains the queue.  Each attempt runs in its own task so a panic is
//! contained, failed attempts back off exponentially, and jobs that still
//! fail are logged and counted.  Nothing here can fail a turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::services::registry::ModelRegistry;
use crate::services::search::{IndexError, SearchDocument, SearchIndex};

#[derive(Debug, Clone, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FanoutJob {
    IndexMessage(SearchDocument),
    UnindexChat(String),
    RecordUsage(String),
}

#[derive(Debug, Error)]
enum FanoutError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("model catalog: {0}")]
    Catalog(#[from] sqlx::Error),
}

#[derive(Debug, Default)]
pub struct FanoutStats {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct FanoutSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl FanoutStats {
    pub fn snapshot(&self) -> FanoutSnapshot {
        FanoutSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub queue: usize,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub base_backoff: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue: 256,
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// Cheap, clonable submission side.
#[derive(Debug, Clone)]
pub struct FanoutHandle {
    tx: mpsc::Sender<FanoutJob>,
    stats: Arc<FanoutStats>,
}

impl FanoutHandle {
    /// Queue `job` without waiting.  Returns `false` when it was dropped.
    pub fn submit(&self, job: FanoutJob) -> bool {
        let kind: &'static str = (&job).into();
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(job = kind, "fan-out queue full; job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(job = kind, "fan-out worker stopped; job dropped");
                false
            }
        }
    }

    pub fn stats(&self) -> FanoutSnapshot {
        self.stats.snapshot()
    }
}

/// The running worker.  Call [`FanoutWorker::shutdown`] to drain and stop it.
#[derive(Debug)]
pub struct FanoutWorker {
    join: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct WorkerContext {
    search: Arc<dyn SearchIndex>,
    registry: Arc<ModelRegistry>,
    stats: Arc<FanoutStats>,
    cfg: FanoutConfig,
}

pub struct Fanout;

impl Fanout {
    pub fn start(
        search: Arc<dyn SearchIndex>,
        registry: Arc<ModelRegistry>,
        cfg: FanoutConfig,
    ) -> (FanoutHandle, FanoutWorker) {
        let (tx, rx) = mpsc::channel(cfg.queue.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(FanoutStats::default());
        let ctx = WorkerContext {
            search,
            registry,
            stats: stats.clone(),
            cfg,
        };
        let join = tokio::spawn(worker_loop(ctx, rx, shutdown_rx));
        (FanoutHandle { tx, stats }, FanoutWorker { join, shutdown_tx })
    }
}

impl FanoutWorker {
    /// Stop accepting jobs, finish the queued ones, and wait up to `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => info!("fan-out worker stopped"),
            Ok(Err(e)) => error!(error = %e, "fan-out worker ended abnormally"),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "fan-out drain timed out; aborting");
                self.join.abort();
            }
        }
    }
}

async fn worker_loop(
    ctx: WorkerContext,
    mut rx: mpsc::Receiver<FanoutJob>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            job = rx.recv() => match job {
                Some(job) => run_job(&ctx, job).await,
                None => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    rx.close();
                    while let Some(job) = rx.recv().await {
                        run_job(&ctx, job).await;
                    }
                    break;
                }
            }
        }
    }
    debug!("fan-out worker loop exited");
}

async fn run_job(ctx: &WorkerContext, job: FanoutJob) {
    let kind: &'static str = (&job).into();
    let max_attempts = ctx.cfg.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let attempt_ctx = ctx.clone();
        let attempt_job = job.clone();
        let result = tokio::spawn(async move { execute(&attempt_ctx, attempt_job).await }).await;

        match result {
            Ok(Ok(())) => {
                ctx.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(job = kind, attempt, "fan-out job done");
                return;
            }
            Ok(Err(e)) => warn!(job = kind, attempt, error = %e, "fan-out attempt failed"),
            Err(e) => warn!(job = kind, attempt, error = %e, "fan-out attempt panicked"),
        }

        if attempt < max_attempts {
            let backoff = ctx.cfg.base_backoff.saturating_mul(1 << (attempt - 1).min(16));
            tokio::time::sleep(backoff).await;
        }
    }

    ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
    error!(job = kind, attempts = max_attempts, "fan-out job given up");
}

async fn execute(ctx: &WorkerContext, job: FanoutJob) -> Result<(), FanoutError> {
    match job {
        FanoutJob::IndexMessage(doc) => ctx.search.index(doc).await?,
        FanoutJob::UnindexChat(chat_id) => ctx.search.remove_chat(&chat_id).await?,
        FanoutJob::RecordUsage(model_name) => {
            if !ctx.registry.record_usage(&model_name).await? {
                debug!(model = %model_name, "usage for unknown model ignored");
            }
        }
    }
    Ok(())
}
