// Compose-aware update router: stack re-convergence when the stack's
// definition is known, single-container recreation otherwise.

use crate::compose::{StackConverger, StackStore};
use crate::engine::Engine;
use crate::models::ContainerSnapshot;
use crate::recreate::{self, RecreateFailure, RecreateReport, RecreateStep};

#[derive(Debug)]
pub enum RouteOutcome {
    /// The stack definition was re-applied; the engine's convergence decided
    /// which services to recreate. No reconstruction was needed.
    StackConverged { services_recreated: Vec<String> },
    /// Single-container recreation. `degraded_fidelity` is set when the
    /// container belongs to a stack whose definition is not registered:
    /// stack-wide settings outside the inspected config cannot be
    /// reconstructed from inspection alone.
    Recreated {
        report: RecreateReport,
        degraded_fidelity: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("stack convergence failed: {0}")]
    Converge(#[source] anyhow::Error),

    #[error("{0}")]
    Recreate(RecreateFailure),
}

impl RouteError {
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            RouteError::Converge(_) => false,
            RouteError::Recreate(f) => f.unrecoverable,
        }
    }
}

pub async fn route_update(
    engine: &dyn Engine,
    stack_store: &dyn StackStore,
    converger: &dyn StackConverger,
    snapshot: &ContainerSnapshot,
    on_step: &(dyn Fn(RecreateStep) + Send + Sync),
) -> Result<RouteOutcome, RouteError> {
    let mut degraded_fidelity = false;

    if let Some(stack) = &snapshot.stack {
        match stack_store.get_definition(&stack.project).await {
            Some(definition) => {
                tracing::info!(
                    stack = %stack.project,
                    service = %stack.service,
                    "delegating update to stack re-convergence"
                );
                let report = converger
                    .converge(&definition)
                    .await
                    .map_err(RouteError::Converge)?;
                return Ok(RouteOutcome::StackConverged {
                    services_recreated: report.services_recreated,
                });
            }
            None => {
                tracing::warn!(
                    stack = %stack.project,
                    container = %snapshot.name,
                    "stack definition not registered; falling back to \
                     single-container recreation with reduced fidelity"
                );
                degraded_fidelity = true;
            }
        }
    }

    let report = recreate::run(engine, snapshot, on_step)
        .await
        .map_err(RouteError::Recreate)?;
    Ok(RouteOutcome::Recreated {
        report,
        degraded_fidelity,
    })
}
