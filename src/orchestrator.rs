//! Owns the `IngestionRun` lifecycle, wires the Fetcher/Acker pair to the
//! queue and worker pool, watches queue occupancy for backpressure, and
//! folds per-file outcomes into run-level counters.
//!
//! State machine: `STARTING → RUNNING → DRAINING → ENDED`. `STARTING` opens
//! the `IngestionRun` row; `RUNNING` feeds the queue; `DRAINING` stops the
//! fetcher but lets in-flight workers finish draining the queue; `ENDED`
//! closes the run with final counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::acker::Acker;
use crate::config::Config;
use crate::domain::audit::{IngestionRun, RunReason, RunState};
use crate::errors::ErrorKind;
use crate::fetcher::Fetcher;
use crate::mapper::RefResolver;
use crate::message::WorkItem;
use crate::persist::PersistStore;
use crate::queue::BoundedQueue;
use crate::worker::{self, PipelineOutcome};

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn PersistStore>,
    resolver: Arc<dyn RefResolver>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, store: Arc<dyn PersistStore>, resolver: Arc<dyn RefResolver>) -> Self {
        Self { config, store, resolver }
    }

    /// Drive one full run: `STARTING` → `RUNNING` → (on `shutdown`)
    /// `DRAINING` → `ENDED`. Returns the closed `IngestionRun`.
    ///
    /// `shutdown` is the caller's signal to stop pulling new work (e.g. a
    /// ctrl-c handler in `main`); in-flight and already-queued files still
    /// run to completion before the run ends.
    pub async fn run(&self, fetcher: Arc<dyn Fetcher>, acker: Arc<dyn Acker>, shutdown: Arc<Notify>) -> Result<IngestionRun, ErrorKind> {
        let run_id = Uuid::new_v4();
        let mut run = IngestionRun::new(run_id, Utc::now());
        self.store.create_run(run.clone()).await?;

        run.state = RunState::Running;
        self.store.update_run(run.clone()).await?;

        let queue = Arc::new(BoundedQueue::new(self.config.queue_capacity));

        let fetcher_handle = {
            let fetcher = fetcher.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                if let Err(e) = fetcher.run(queue).await {
                    tracing::error!(error = %e, "fetcher exited");
                }
            })
        };

        let backpressure_handle = {
            let fetcher = fetcher.clone();
            let queue = queue.clone();
            let config = self.config.clone();
            tokio::spawn(async move { backpressure_loop(fetcher, queue, config).await })
        };

        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity.max(16));
        let worker_pool_handle = tokio::spawn(worker::run_pool(
            self.config.workers,
            queue.clone(),
            self.store.clone(),
            self.resolver.clone(),
            acker.clone(),
            self.config.clone(),
            run_id,
            tx,
        ));
        // `run_pool` itself only returns once every worker task stops, which
        // only happens once `rx` is dropped — so this handle is only relevant
        // for DRAINING cleanup below, not for the steady-state select loop.

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    run.state = RunState::Draining;
                    self.store.update_run(run.clone()).await?;
                    fetcher.pause().await;
                    fetcher_handle.abort();
                    backpressure_handle.abort();
                    drain_remaining(&queue, &mut rx, &mut run).await;
                    worker_pool_handle.abort();
                    run.reason = Some(RunReason::Cancelled);
                    break;
                }
                maybe_outcome = rx.recv() => {
                    match maybe_outcome {
                        Some(outcome) => fold_outcome(&mut run, &outcome),
                        None => {
                            run.reason = Some(RunReason::FetcherExhausted);
                            break;
                        }
                    }
                }
            }
        }

        run.state = RunState::Ended;
        run.ended_at = Some(Utc::now());
        if run.reason.is_none() {
            run.reason = Some(RunReason::Completed);
        }
        self.store.update_run(run.clone()).await?;
        Ok(run)
    }
}

async fn drain_remaining(queue: &Arc<BoundedQueue<WorkItem>>, rx: &mut mpsc::Receiver<PipelineOutcome>, run: &mut IngestionRun) {
    loop {
        if queue.is_empty().await && rx.is_empty() {
            break;
        }
        match tokio::time::timeout(Duration::from_secs(30), rx.recv()).await {
            Ok(Some(outcome)) => fold_outcome(run, &outcome),
            Ok(None) | Err(_) => break,
        }
    }
}

fn fold_outcome(run: &mut IngestionRun, outcome: &PipelineOutcome) {
    use crate::domain::audit::FileAuditStatus;
    run.files_pulled += 1;
    match outcome.status {
        FileAuditStatus::Already => run.files_already += 1,
        FileAuditStatus::Ok => run.files_ok += 1,
        FileAuditStatus::Failed | FileAuditStatus::FailedTerminal => run.files_failed += 1,
    }
    if outcome.acked {
        run.acks_sent += 1;
    }
}

/// Pause the fetcher once the queue's remaining capacity drops below
/// `pause_below`, resume it once it climbs back above `resume_above`.
/// Hysteresis between the two thresholds avoids pausing and resuming on
/// every single item near the boundary.
async fn backpressure_loop(fetcher: Arc<dyn Fetcher>, queue: Arc<BoundedQueue<WorkItem>>, config: Arc<Config>) {
    let pause_below = config.pause_below();
    let resume_above = config.resume_above();
    let mut paused = false;
    loop {
        let remaining = queue.remaining_capacity().await;
        if !paused && remaining < pause_below {
            fetcher.pause().await;
            paused = true;
        } else if paused && remaining > resume_above {
            fetcher.resume().await;
            paused = false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
