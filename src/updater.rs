// Update task pipeline: digest check, safe pull, vulnerability gate,
// compose-aware routing. Engine errors are caught at each step and mapped to
// the skip/block/fail taxonomy; none propagate past this boundary.

use crate::compose::{StackConverger, StackStore};
use crate::engine::Engine;
use crate::execution_repo::ExecutionLedger;
use crate::guard::{self, SafePullOutcome, TagLocks};
use crate::models::{ContainerSnapshot, ExecutionStatus, ImageReference, ProgressEvent, TempTag};
use crate::recreate::RecreateStep;
use crate::registry::{self, UpdateCheck};
use crate::router::{self, RouteOutcome};
use crate::scanner::{self, GateCriterion, ScanCache, ScanSummary, Scanner};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Gate configuration and timing for one update run.
#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    pub scan_enabled: bool,
    pub criterion: GateCriterion,
    /// Overall budget for the cancellable phases (check, pull, gate),
    /// distinct from any per-call engine timeout. The destructive phase is
    /// never aborted mid-flight.
    pub staging_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub target: String,
    pub environment_id: String,
    pub triggered_by: String,
    /// Plain pull for digest-pinned references. Only honored when scanning
    /// is disabled: a pinned reference cannot be safely re-tagged, so the
    /// tag guard cannot protect it.
    pub force: bool,
}

/// Cooperative cancellation. Honored only while no irreversible state
/// exists; once the recreator removes the old container the operation runs
/// to completion or failure.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct UpdaterDeps {
    pub engine: Arc<dyn Engine>,
    pub scanner: Option<Arc<dyn Scanner>>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub stack_store: Arc<dyn StackStore>,
    pub converger: Arc<dyn StackConverger>,
    pub progress: broadcast::Sender<ProgressEvent>,
    pub tag_locks: Arc<TagLocks>,
    pub scan_cache: Arc<ScanCache>,
}

impl UpdaterDeps {
    async fn log(&self, execution_id: i64, line: &str) {
        if let Err(e) = self.ledger.append_log(execution_id, line).await {
            tracing::warn!(execution_id, error = %e, "failed to append execution log");
        }
        let _ = self.progress.send(ProgressEvent::Log {
            execution_id,
            line: line.to_string(),
        });
    }

    fn step(&self, execution_id: i64, step: &str) {
        let _ = self.progress.send(ProgressEvent::Step {
            execution_id,
            step: step.to_string(),
        });
    }
}

/// Result of the cancellable staging phases.
enum Staged {
    Terminal {
        status: ExecutionStatus,
        details: serde_json::Value,
        summary: String,
    },
    Ready {
        snapshot: Box<ContainerSnapshot>,
    },
}

/// Run one update execution end to end and record its terminal status.
/// Never returns an error: every failure is converted into a `Failed` or
/// `Skipped` record.
pub async fn run_update(
    deps: &UpdaterDeps,
    policy: &UpdatePolicy,
    execution_id: i64,
    request: &UpdateRequest,
    cancel: &CancelFlag,
) -> ExecutionStatus {
    let staging_budget = Duration::from_secs(policy.staging_timeout_secs);
    let staged = match timeout(
        staging_budget,
        stage(deps, policy, execution_id, request, cancel),
    )
    .await
    {
        Ok(staged) => staged,
        Err(_) => Staged::Terminal {
            status: ExecutionStatus::Failed,
            details: serde_json::json!({ "error": "staging timed out" }),
            summary: format!(
                "staging for {} exceeded {}s budget; running container untouched",
                request.target, policy.staging_timeout_secs
            ),
        },
    };

    let (status, details, summary) = match staged {
        Staged::Terminal {
            status,
            details,
            summary,
        } => (status, details, summary),
        Staged::Ready { snapshot } => {
            if cancel.is_cancelled() {
                (
                    ExecutionStatus::Skipped,
                    serde_json::json!({ "reason": "cancelled" }),
                    format!("update of {} cancelled before recreation", request.target),
                )
            } else {
                // Past this point cancellation is no longer honored and the
                // staging timeout no longer applies: aborting a half-done
                // recreation would be worse than letting it finish.
                apply(deps, execution_id, &snapshot).await
            }
        }
    };

    deps.log(execution_id, &summary).await;
    if status == ExecutionStatus::Failed {
        let _ = deps.progress.send(ProgressEvent::Error {
            execution_id,
            message: summary.clone(),
        });
    }
    if let Err(e) = deps
        .ledger
        .complete(execution_id, status, Some(&details.to_string()))
        .await
    {
        tracing::warn!(execution_id, error = %e, "failed to record terminal status");
    }
    status
}

fn skip(reason: &str, summary: String) -> Staged {
    Staged::Terminal {
        status: ExecutionStatus::Skipped,
        details: serde_json::json!({ "reason": reason }),
        summary,
    }
}

fn fail(summary: String) -> Staged {
    Staged::Terminal {
        status: ExecutionStatus::Failed,
        details: serde_json::json!({ "error": summary }),
        summary,
    }
}

async fn stage(
    deps: &UpdaterDeps,
    policy: &UpdatePolicy,
    execution_id: i64,
    request: &UpdateRequest,
    cancel: &CancelFlag,
) -> Staged {
    deps.step(execution_id, RecreateStep::Inspecting.as_str());
    let snapshot = match deps.engine.snapshot_container(&request.target).await {
        Ok(s) => s,
        Err(e) => {
            return fail(format!("inspecting {} failed: {}", request.target, e));
        }
    };
    deps.log(
        execution_id,
        &format!("checking {} for an available update", request.target),
    )
    .await;

    if snapshot.image.is_pinned() {
        if policy.scan_enabled || !request.force {
            return skip(
                "pinned to digest",
                format!(
                    "{} is pinned to digest {}; not update-checkable",
                    request.target,
                    snapshot.image.digest.as_deref().unwrap_or_default()
                ),
            );
        }
        // Forced refresh of a pinned reference, scanning disabled: the tag
        // guard has no movable pointer to protect, so pull directly.
        deps.step(execution_id, "pulling");
        if let Err(e) = guard::plain_pull(deps.engine.as_ref(), &deps.tag_locks, &snapshot.image)
            .await
        {
            return fail(format!("forced pull of {} failed: {}", snapshot.image, e));
        }
        return Staged::Ready {
            snapshot: Box::new(snapshot),
        };
    }

    let local = match deps
        .engine
        .local_image_state(&snapshot.image.canonical())
        .await
    {
        Ok(l) => l,
        Err(e) => {
            return fail(format!("inspecting image {} failed: {}", snapshot.image, e));
        }
    };

    match registry::check_for_update(deps.engine.as_ref(), &snapshot.image, &local).await {
        UpdateCheck::UpToDate => {
            return skip(
                "up to date",
                format!("{} is already up to date", snapshot.image),
            );
        }
        UpdateCheck::LocalImage => {
            return skip(
                "local image",
                format!(
                    "{} has no registry digests (built locally); not update-checkable",
                    snapshot.image
                ),
            );
        }
        UpdateCheck::RegistryError { reason } => {
            return skip(
                "registry error",
                format!("registry check for {} failed, skipping this cycle: {}", snapshot.image, reason),
            );
        }
        UpdateCheck::UpdateAvailable { digest } => {
            deps.log(
                execution_id,
                &format!("update available for {}: {}", snapshot.image, digest),
            )
            .await;
        }
    }

    if cancel.is_cancelled() {
        return skip(
            "cancelled",
            format!("update of {} cancelled before pull", request.target),
        );
    }

    deps.step(execution_id, "pulling");
    if policy.scan_enabled {
        match gated_pull(deps, policy, execution_id, &snapshot).await {
            Ok(SafePullOutcome::Promoted { new_image_id }) => {
                deps.log(
                    execution_id,
                    &format!("{} promoted to image {}", snapshot.image, new_image_id),
                )
                .await;
            }
            Ok(SafePullOutcome::Unchanged) => {
                return skip(
                    "up to date",
                    format!("pull of {} produced the running image", snapshot.image),
                );
            }
            Ok(SafePullOutcome::Blocked { reason }) => {
                return Staged::Terminal {
                    status: ExecutionStatus::Skipped,
                    details: serde_json::json!({ "blockReason": reason }),
                    summary: format!(
                        "update of {} blocked by vulnerability gate: {}; \
                         temp image discarded, production tag unchanged",
                        snapshot.image, reason
                    ),
                };
            }
            Err(e) => {
                return fail(format!("safe pull of {} failed: {:#}", snapshot.image, e));
            }
        }
    } else {
        match guard::plain_pull(deps.engine.as_ref(), &deps.tag_locks, &snapshot.image).await {
            Ok(new_id) if new_id == snapshot.image_id => {
                return skip(
                    "up to date",
                    format!("pull of {} produced the running image", snapshot.image),
                );
            }
            Ok(new_id) => {
                deps.log(
                    execution_id,
                    &format!("pulled {} as image {}", snapshot.image, new_id),
                )
                .await;
            }
            Err(e) => {
                return fail(format!("pull of {} failed: {:#}", snapshot.image, e));
            }
        }
    }

    Staged::Ready {
        snapshot: Box::new(snapshot),
    }
}

/// Safe pull with the vulnerability gate wired in: scan the temp-tagged
/// image, fetch (or compute) the running image's baseline when the criterion
/// needs it, and decide.
async fn gated_pull(
    deps: &UpdaterDeps,
    policy: &UpdatePolicy,
    execution_id: i64,
    snapshot: &ContainerSnapshot,
) -> anyhow::Result<SafePullOutcome> {
    let scanner = deps
        .scanner
        .clone()
        .ok_or_else(|| anyhow::anyhow!("scanning enabled but no scanner configured"))?;

    let current = if policy.criterion == GateCriterion::MoreThanCurrent {
        Some(current_summary(deps, &scanner, execution_id, snapshot).await?)
    } else {
        None
    };

    let progress = deps.progress.clone();
    let scan_cache = deps.scan_cache.clone();
    let criterion = policy.criterion;
    let temp_ref = temp_reference(&snapshot.image);

    let outcome = guard::safe_pull(
        deps.engine.as_ref(),
        &deps.tag_locks,
        &snapshot.image,
        &snapshot.image_id,
        |new_image_id| {
            let scanner = scanner.clone();
            let progress = progress.clone();
            let scan_cache = scan_cache.clone();
            let current = current.clone();
            async move {
                let on_progress = move |line: String| {
                    let _ = progress.send(ProgressEvent::Log { execution_id, line });
                };
                let summary = scanner.scan(&temp_ref, &on_progress).await?;
                scan_cache.put(new_image_id, summary.clone()).await;
                Ok(scanner::evaluate(criterion, &summary, current.as_ref()))
            }
        },
    )
    .await?;

    if let SafePullOutcome::Blocked { reason } = &outcome {
        deps.log(execution_id, &format!("gate blocked: {}", reason)).await;
        let _ = deps.progress.send(ProgressEvent::Error {
            execution_id,
            message: format!("blocked: {}", reason),
        });
    }
    Ok(outcome)
}

/// Baseline summary for the currently-running image: cached by image id,
/// computed on demand when absent.
async fn current_summary(
    deps: &UpdaterDeps,
    scanner: &Arc<dyn Scanner>,
    execution_id: i64,
    snapshot: &ContainerSnapshot,
) -> anyhow::Result<ScanSummary> {
    if let Some(cached) = deps.scan_cache.get(&snapshot.image_id).await {
        return Ok(cached);
    }
    deps.log(
        execution_id,
        &format!("scanning current image {} for a baseline", snapshot.image_id),
    )
    .await;
    let progress = deps.progress.clone();
    let on_progress = move |line: String| {
        let _ = progress.send(ProgressEvent::Log { execution_id, line });
    };
    let summary = scanner.scan(&snapshot.image, &on_progress).await?;
    deps.scan_cache
        .put(snapshot.image_id.clone(), summary.clone())
        .await;
    Ok(summary)
}

fn temp_reference(image: &ImageReference) -> ImageReference {
    let temp = TempTag::derive(image);
    ImageReference {
        repository: temp.repository,
        tag: Some(temp.tag),
        digest: None,
    }
}

/// Destructive phase: compose-aware routing into stack convergence or
/// single-container recreation.
async fn apply(
    deps: &UpdaterDeps,
    execution_id: i64,
    snapshot: &ContainerSnapshot,
) -> (ExecutionStatus, serde_json::Value, String) {
    let progress = deps.progress.clone();
    let on_step = move |step: RecreateStep| {
        let _ = progress.send(ProgressEvent::Step {
            execution_id,
            step: step.as_str().to_string(),
        });
    };

    match router::route_update(
        deps.engine.as_ref(),
        deps.stack_store.as_ref(),
        deps.converger.as_ref(),
        snapshot,
        &on_step,
    )
    .await
    {
        Ok(RouteOutcome::StackConverged { services_recreated }) => (
            ExecutionStatus::Success,
            serde_json::json!({ "servicesRecreated": services_recreated }),
            format!(
                "stack re-convergence recreated {} service container(s): {}",
                services_recreated.len(),
                services_recreated.join(", ")
            ),
        ),
        Ok(RouteOutcome::Recreated {
            report,
            degraded_fidelity,
        }) => {
            for warning in &report.network_warnings {
                deps.log(execution_id, warning).await;
            }
            (
                ExecutionStatus::Success,
                serde_json::json!({
                    "newContainerId": report.new_container_id,
                    "degradedFidelity": degraded_fidelity,
                    "networkWarnings": report.network_warnings,
                }),
                format!("{} recreated as {}", snapshot.name, report.new_container_id),
            )
        }
        Err(e) => {
            let unrecoverable = e.is_unrecoverable();
            let summary = if unrecoverable {
                format!(
                    "{}; the old container was already removed and rollback is \
                     not possible, operator intervention required",
                    e
                )
            } else {
                e.to_string()
            };
            (
                ExecutionStatus::Failed,
                serde_json::json!({ "error": e.to_string(), "unrecoverable": unrecoverable }),
                summary,
            )
        }
    }
}
