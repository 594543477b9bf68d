// Container recreation as an explicit state machine. Transitions are
// strictly sequential and non-retryable within one invocation; there is no
// rollback once the old container is removed, which is why snapshot capture
// always happens before any destructive step.

use crate::engine::Engine;
use crate::models::ContainerSnapshot;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecreateStep {
    Inspecting,
    Stopping,
    Removing,
    Creating,
    NetworkReconnecting,
    Starting,
    Done,
}

impl RecreateStep {
    pub fn as_str(self) -> &'static str {
        match self {
            RecreateStep::Inspecting => "inspecting",
            RecreateStep::Stopping => "stopping",
            RecreateStep::Removing => "removing",
            RecreateStep::Creating => "creating",
            RecreateStep::NetworkReconnecting => "networkReconnecting",
            RecreateStep::Starting => "starting",
            RecreateStep::Done => "done",
        }
    }

    /// True once the old container is gone: from here the operation must
    /// succeed forward or leave the service down.
    pub fn past_point_of_no_return(self) -> bool {
        matches!(
            self,
            RecreateStep::Creating
                | RecreateStep::NetworkReconnecting
                | RecreateStep::Starting
                | RecreateStep::Done
        )
    }
}

/// Failure at a specific step, as a first-class value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecreateFailure {
    pub step: RecreateStep,
    pub reason: String,
    /// Set when the old container no longer exists and rollback is
    /// impossible. Surfaced to operators, never hidden.
    pub unrecoverable: bool,
}

impl std::fmt::Display for RecreateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "recreation failed at {}: {}", self.step.as_str(), self.reason)
    }
}

#[derive(Debug, Clone)]
pub struct RecreateReport {
    pub new_container_id: String,
    /// Networks that could not be reconnected. Partial connectivity is
    /// preferable to losing the container entirely, so these are warnings.
    pub network_warnings: Vec<String>,
}

/// Destroy the old container and create + start a replacement from its
/// snapshot, reconnecting secondary networks with their original aliases and
/// static addresses.
pub async fn run(
    engine: &dyn Engine,
    snapshot: &ContainerSnapshot,
    on_step: &(dyn Fn(RecreateStep) + Send + Sync),
) -> Result<RecreateReport, RecreateFailure> {
    on_step(RecreateStep::Stopping);
    engine
        .stop_container(&snapshot.id)
        .await
        .map_err(|e| RecreateFailure {
            step: RecreateStep::Stopping,
            reason: e.to_string(),
            unrecoverable: false,
        })?;

    // A failure here is fatal: the operation must not silently leave both
    // old and new containers absent.
    on_step(RecreateStep::Removing);
    engine
        .remove_container(&snapshot.id)
        .await
        .map_err(|e| RecreateFailure {
            step: RecreateStep::Removing,
            reason: e.to_string(),
            unrecoverable: false,
        })?;

    on_step(RecreateStep::Creating);
    let new_id = engine
        .create_container(&snapshot.name, snapshot, true)
        .await
        .map_err(|e| RecreateFailure {
            step: RecreateStep::Creating,
            reason: e.to_string(),
            unrecoverable: true,
        })?;

    on_step(RecreateStep::NetworkReconnecting);
    let mut network_warnings = Vec::new();
    for attachment in snapshot.secondary_networks() {
        if let Err(e) = engine.connect_network(&new_id, attachment).await {
            tracing::warn!(
                container = %snapshot.name,
                network = %attachment.network_name,
                error = %e,
                "failed to reconnect secondary network"
            );
            network_warnings.push(format!(
                "could not reconnect network {}: {}",
                attachment.network_name, e
            ));
        }
    }

    on_step(RecreateStep::Starting);
    engine
        .start_container(&new_id)
        .await
        .map_err(|e| RecreateFailure {
            step: RecreateStep::Starting,
            reason: e.to_string(),
            unrecoverable: true,
        })?;

    on_step(RecreateStep::Done);
    Ok(RecreateReport {
        new_container_id: new_id,
        network_warnings,
    })
}
