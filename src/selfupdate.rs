// Self-replacement handoff: replacing the orchestrator's own container.
//
// Past a certain point this process will be stopped and can no longer run
// recovery code, so the continuation (stop old, remove old, rename new,
// reconnect networks, start new) is handed to a minimal helper container via
// a fixed, versioned parameter contract rather than any in-process callback.

use crate::engine::{Engine, HelperSpec};
use crate::execution_repo::ExecutionLedger;
use crate::models::{ContainerSnapshot, ExecutionStatus, ProgressEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const HANDOFF_ENV_VERSION: &str = "CAPSTAN_HANDOFF_VERSION";
pub const HANDOFF_ENV_OLD_ID: &str = "CAPSTAN_OLD_ID";
pub const HANDOFF_ENV_NEW_ID: &str = "CAPSTAN_NEW_ID";
pub const HANDOFF_ENV_FINAL_NAME: &str = "CAPSTAN_FINAL_NAME";
pub const HANDOFF_ENV_NETWORKS: &str = "CAPSTAN_NETWORKS";
pub const HANDOFF_CONTRACT_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfUpdateStep {
    Validating,
    PullingImage,
    BuildingSpec,
    PullingHelper,
    CreatingReplacement,
    LaunchingHelper,
    Launched,
}

impl SelfUpdateStep {
    pub fn as_str(self) -> &'static str {
        match self {
            SelfUpdateStep::Validating => "validating",
            SelfUpdateStep::PullingImage => "pullingImage",
            SelfUpdateStep::BuildingSpec => "buildingSpec",
            SelfUpdateStep::PullingHelper => "pullingHelper",
            SelfUpdateStep::CreatingReplacement => "creatingReplacement",
            SelfUpdateStep::LaunchingHelper => "launchingHelper",
            SelfUpdateStep::Launched => "launched",
        }
    }
}

#[derive(Debug)]
struct StepFailure {
    step: SelfUpdateStep,
    reason: String,
}

impl StepFailure {
    fn at(step: SelfUpdateStep, reason: impl std::fmt::Display) -> Self {
        Self {
            step,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelfUpdateConfig {
    /// Image for the handoff helper. Small and fixed; pulled before the
    /// point of no return.
    pub helper_image: String,
    /// Engine socket bind handed to the helper.
    pub socket_bind: String,
    /// Explicit own container name; the container hostname (short id) is
    /// used when unset.
    pub own_container: Option<String>,
}

pub struct SelfUpdater {
    engine: Arc<dyn Engine>,
    ledger: Arc<dyn ExecutionLedger>,
    progress: broadcast::Sender<ProgressEvent>,
    config: SelfUpdateConfig,
}

impl SelfUpdater {
    pub fn new(
        engine: Arc<dyn Engine>,
        ledger: Arc<dyn ExecutionLedger>,
        progress: broadcast::Sender<ProgressEvent>,
        config: SelfUpdateConfig,
    ) -> Self {
        Self {
            engine,
            ledger,
            progress,
            config,
        }
    }

    /// Run the handoff pipeline. `Launched` is the best terminal status this
    /// process can truthfully record: the helper performs the remaining
    /// steps after this process may already be gone.
    pub async fn run(&self, execution_id: i64) -> ExecutionStatus {
        match self.pipeline(execution_id).await {
            Ok(helper_id) => {
                let _ = self.progress.send(ProgressEvent::Launched {
                    execution_id,
                    helper_id: helper_id.clone(),
                });
                self.log(execution_id, &format!("handoff helper {} started; this process's responsibility ends here", helper_id))
                    .await;
                self.finish(execution_id, ExecutionStatus::Launched, &serde_json::json!({ "helperId": helper_id }))
                    .await;
                ExecutionStatus::Launched
            }
            Err(failure) => {
                let summary = format!(
                    "self-replacement failed at {}: {}",
                    failure.step.as_str(),
                    failure.reason
                );
                self.log(execution_id, &summary).await;
                let _ = self.progress.send(ProgressEvent::Error {
                    execution_id,
                    message: summary.clone(),
                });
                self.finish(
                    execution_id,
                    ExecutionStatus::Failed,
                    &serde_json::json!({ "error": summary, "step": failure.step.as_str() }),
                )
                .await;
                ExecutionStatus::Failed
            }
        }
    }

    async fn pipeline(&self, execution_id: i64) -> Result<String, StepFailure> {
        self.step(execution_id, SelfUpdateStep::Validating).await;
        // Fail fast, no side effects yet.
        if !running_in_container() {
            return Err(StepFailure::at(
                SelfUpdateStep::Validating,
                "not running inside a container; self-replacement needs a container to replace",
            ));
        }
        self.engine
            .ping()
            .await
            .map_err(|e| StepFailure::at(SelfUpdateStep::Validating, format!("engine socket not usable: {}", e)))?;

        let own_name = match &self.config.own_container {
            Some(name) => name.clone(),
            None => std::env::var("HOSTNAME").map_err(|_| {
                StepFailure::at(
                    SelfUpdateStep::Validating,
                    "cannot determine own container: HOSTNAME unset and no own_container configured",
                )
            })?,
        };
        let snapshot = self
            .engine
            .snapshot_container(&own_name)
            .await
            .map_err(|e| {
                StepFailure::at(
                    SelfUpdateStep::Validating,
                    format!("inspecting own container {} failed: {}", own_name, e),
                )
            })?;

        self.step(execution_id, SelfUpdateStep::PullingImage).await;
        self.engine
            .pull_image(&snapshot.image)
            .await
            .map_err(|e| StepFailure::at(SelfUpdateStep::PullingImage, e))?;

        // The replacement is created without any network attachment to avoid
        // a static-IP collision with the still-running original; the helper
        // reattaches every network from the serialized contract.
        self.step(execution_id, SelfUpdateStep::BuildingSpec).await;
        let timestamp = chrono::Utc::now().timestamp();
        let replacement_name = format!("{}-replacement-{}", snapshot.name, timestamp);
        let networks_json = serde_json::to_string(&snapshot.networks)
            .map_err(|e| StepFailure::at(SelfUpdateStep::BuildingSpec, e))?;

        self.step(execution_id, SelfUpdateStep::PullingHelper).await;
        let helper_ref = crate::models::ImageReference::parse(&self.config.helper_image)
            .map_err(|e| StepFailure::at(SelfUpdateStep::PullingHelper, e))?;
        self.engine
            .pull_image(&helper_ref)
            .await
            .map_err(|e| StepFailure::at(SelfUpdateStep::PullingHelper, e))?;

        self.step(execution_id, SelfUpdateStep::CreatingReplacement)
            .await;
        let new_id = self
            .engine
            .create_container(&replacement_name, &snapshot, false)
            .await
            .map_err(|e| StepFailure::at(SelfUpdateStep::CreatingReplacement, e))?;
        self.log(
            execution_id,
            &format!("replacement container {} created as {}", replacement_name, new_id),
        )
        .await;

        self.step(execution_id, SelfUpdateStep::LaunchingHelper).await;
        let helper_spec = helper_spec(&self.config, &snapshot, &new_id, timestamp, &networks_json);
        match self.engine.run_helper(&helper_spec).await {
            Ok(helper_id) => Ok(helper_id),
            Err(e) => {
                // Still strictly before a running helper: the pre-created
                // replacement must not be left behind.
                if let Err(cleanup) = self.engine.remove_container(&new_id).await {
                    tracing::warn!(
                        container = %replacement_name,
                        error = %cleanup,
                        "failed to clean up pre-created replacement"
                    );
                }
                Err(StepFailure::at(SelfUpdateStep::LaunchingHelper, e))
            }
        }
    }

    async fn step(&self, execution_id: i64, step: SelfUpdateStep) {
        let _ = self.progress.send(ProgressEvent::Step {
            execution_id,
            step: step.as_str().to_string(),
        });
        self.log(execution_id, &format!("step: {}", step.as_str()))
            .await;
    }

    async fn log(&self, execution_id: i64, line: &str) {
        if let Err(e) = self.ledger.append_log(execution_id, line).await {
            tracing::warn!(execution_id, error = %e, "failed to append execution log");
        }
        let _ = self.progress.send(ProgressEvent::Log {
            execution_id,
            line: line.to_string(),
        });
    }

    async fn finish(&self, execution_id: i64, status: ExecutionStatus, details: &serde_json::Value) {
        if let Err(e) = self
            .ledger
            .complete(execution_id, status, Some(&details.to_string()))
            .await
        {
            tracing::warn!(execution_id, error = %e, "failed to record terminal status");
        }
    }
}

/// The helper's full parameter contract: discrete values, not a live API
/// handle, because the helper runs with no dependency on this process.
fn helper_spec(
    config: &SelfUpdateConfig,
    snapshot: &ContainerSnapshot,
    new_id: &str,
    timestamp: i64,
    networks_json: &str,
) -> HelperSpec {
    HelperSpec {
        image: config.helper_image.clone(),
        name: format!("{}-handoff-{}", snapshot.name, timestamp),
        env: vec![
            format!("{}={}", HANDOFF_ENV_VERSION, HANDOFF_CONTRACT_VERSION),
            format!("{}={}", HANDOFF_ENV_OLD_ID, snapshot.id),
            format!("{}={}", HANDOFF_ENV_NEW_ID, new_id),
            format!("{}={}", HANDOFF_ENV_FINAL_NAME, snapshot.name),
            format!("{}={}", HANDOFF_ENV_NETWORKS, networks_json),
        ],
        binds: vec![config.socket_bind.clone()],
    }
}

fn running_in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
        || std::env::var("CONTAINER").as_deref() == Ok("1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageReference, NetworkAttachment, ResourceLimits};
    use std::collections::HashMap;

    fn snapshot() -> ContainerSnapshot {
        ContainerSnapshot {
            id: "oldid".into(),
            name: "capstan".into(),
            image: ImageReference::parse("capstan:latest").unwrap(),
            image_id: "sha256:aaa".into(),
            entrypoint: None,
            cmd: None,
            env: vec![],
            labels: HashMap::new(),
            binds: vec![],
            anonymous_volumes: vec![],
            exposed_ports: vec![],
            port_bindings: HashMap::new(),
            resources: ResourceLimits::default(),
            restart_policy: None,
            health_check: None,
            devices: vec![],
            network_mode: None,
            privileged: false,
            cap_add: vec![],
            cap_drop: vec![],
            networks: vec![NetworkAttachment {
                network_name: "frontend".into(),
                aliases: vec!["capstan".into()],
                ipv4: Some("172.20.0.9".into()),
                ipv6: None,
                gateway_priority: None,
                is_primary: true,
            }],
            stack: None,
        }
    }

    #[test]
    fn helper_contract_carries_discrete_parameters() {
        let config = SelfUpdateConfig {
            helper_image: "capstan-handoff:1".into(),
            socket_bind: "/var/run/docker.sock:/var/run/docker.sock".into(),
            own_container: None,
        };
        let snap = snapshot();
        let networks_json = serde_json::to_string(&snap.networks).unwrap();
        let spec = helper_spec(&config, &snap, "newid", 1_700_000_000, &networks_json);

        assert_eq!(spec.image, "capstan-handoff:1");
        assert!(spec.name.starts_with("capstan-handoff-"));
        assert!(spec.env.contains(&format!("{}=1", HANDOFF_ENV_VERSION)));
        assert!(spec.env.contains(&format!("{}=oldid", HANDOFF_ENV_OLD_ID)));
        assert!(spec.env.contains(&format!("{}=newid", HANDOFF_ENV_NEW_ID)));
        assert!(spec.env.contains(&format!("{}=capstan", HANDOFF_ENV_FINAL_NAME)));

        // The network contract round-trips to full attachments.
        let networks_env = spec
            .env
            .iter()
            .find(|e| e.starts_with(HANDOFF_ENV_NETWORKS))
            .unwrap();
        let json = networks_env.split_once('=').unwrap().1;
        let back: Vec<NetworkAttachment> = serde_json::from_str(json).unwrap();
        assert_eq!(back, snap.networks);
        assert_eq!(spec.binds, vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()]);
    }
}
