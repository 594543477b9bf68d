// Background update dispatcher. Receives queued update requests, runs each
// in its own task, and guarantees one in-flight execution per target. The
// ledger prune runs here on a real-time interval.

use crate::execution_repo::ExecutionRepo;
use crate::models::ExecutionStatus;
use crate::updater::{self, CancelFlag, UpdatePolicy, UpdateRequest, UpdaterDeps};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, interval};

/// One queued update: the ledger record already exists so the enqueueing
/// caller can hand its id back to the UI immediately.
pub struct UpdateJob {
    pub execution_id: i64,
    pub request: UpdateRequest,
    pub cancel: CancelFlag,
}

pub struct WorkerDeps {
    pub updater: Arc<UpdaterDeps>,
    pub repo: Arc<ExecutionRepo>,
    pub job_rx: mpsc::Receiver<UpdateJob>,
    pub shutdown_rx: oneshot::Receiver<()>,
}

pub struct WorkerConfig {
    pub policy: UpdatePolicy,
    /// How often to log dispatcher stats (real seconds).
    pub stats_log_interval_secs: u64,
    /// How often to prune old terminal executions (real seconds).
    pub prune_interval_secs: u64,
}

pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let WorkerDeps {
        updater,
        repo,
        mut job_rx,
        mut shutdown_rx,
    } = deps;
    let policy = Arc::new(config.policy);

    tokio::spawn(async move {
        let mut stats_tick = interval(Duration::from_secs(config.stats_log_interval_secs));
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut prune_tick = interval(Duration::from_secs(config.prune_interval_secs));
        prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let completed_total = Arc::new(AtomicU64::new(0));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                maybe_job = job_rx.recv() => {
                    match maybe_job {
                        Some(job) => {
                            dispatch(
                                job,
                                &updater,
                                &policy,
                                &in_flight,
                                &completed_total,
                                &mut tasks,
                            )
                            .await;
                        }
                        None => break,
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "update task panicked");
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("Dispatcher shutting down");
                    break;
                }
                _ = stats_tick.tick() => {
                    // Awaiting inside the macro args holds a non-Send temporary.
                    let in_flight_now = in_flight.lock().await.len();
                    tracing::info!(
                        in_flight = in_flight_now,
                        executions_completed_total =
                            completed_total.load(Ordering::Relaxed),
                        "dispatcher stats"
                    );
                }
                _ = prune_tick.tick() => {
                    match repo.prune_old_data().await {
                        Ok(n) => {
                            tracing::debug!(operation = "prune_old_data", pruned = n, "Old executions pruned");
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                operation = "prune_old_data",
                                "Failed to prune old executions"
                            );
                        }
                    }
                }
            }
        }

        // In-flight updates run to completion; aborting one mid-recreation
        // could leave a container half-replaced.
        while tasks.join_next().await.is_some() {}
        tracing::debug!("Dispatcher stopped");
    })
}

async fn dispatch(
    job: UpdateJob,
    updater: &Arc<UpdaterDeps>,
    policy: &Arc<UpdatePolicy>,
    in_flight: &Arc<Mutex<HashSet<String>>>,
    completed_total: &Arc<AtomicU64>,
    tasks: &mut JoinSet<()>,
) {
    let key = format!("{}/{}", job.request.environment_id, job.request.target);
    {
        let mut guard = in_flight.lock().await;
        if !guard.insert(key.clone()) {
            tracing::warn!(target = %key, "update already in flight for target; skipping");
            if let Err(e) = updater
                .ledger
                .complete(
                    job.execution_id,
                    ExecutionStatus::Skipped,
                    Some("{\"reason\":\"update already in flight for this target\"}"),
                )
                .await
            {
                tracing::warn!(execution_id = job.execution_id, error = %e, "failed to mark duplicate as skipped");
            }
            return;
        }
    }

    let updater = updater.clone();
    let policy = policy.clone();
    let in_flight = in_flight.clone();
    let completed_total = completed_total.clone();
    tasks.spawn(async move {
        let status =
            updater::run_update(&updater, &policy, job.execution_id, &job.request, &job.cancel)
                .await;
        tracing::info!(
            execution_id = job.execution_id,
            target = %job.request.target,
            status = status.as_str(),
            "update execution finished"
        );
        completed_total.fetch_add(1, Ordering::Relaxed);
        in_flight.lock().await.remove(&key);
    });
}
