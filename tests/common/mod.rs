// Shared test doubles: in-memory engine, ledger, scanner, and stack
// collaborators used across the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use capstan::compose::{ConvergeReport, StackConverger, StackDefinition, StackStore};
use capstan::engine::{Engine, EngineError, HelperSpec, LocalImageState};
use capstan::execution_repo::ExecutionLedger;
use capstan::models::{
    ContainerSnapshot, ExecutionStatus, ImageReference, NetworkAttachment, ResourceLimits,
    StackMembership, UpdateExecution,
};
use capstan::scanner::{ScanSummary, Scanner};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

/// In-memory engine: tag pointers and containers as plain maps, every call
/// recorded in order, failures injectable per operation.
#[derive(Default)]
pub struct FakeEngine {
    /// Tag pointer: canonical reference -> image id.
    pub images: Mutex<HashMap<String, String>>,
    /// Image id -> repo digests.
    pub repo_digests: Mutex<HashMap<String, Vec<String>>>,
    /// Canonical reference -> current remote manifest digest.
    pub remote_digests: Mutex<HashMap<String, String>>,
    /// Image id a pull of the canonical reference installs.
    pub pull_produces: Mutex<HashMap<String, String>>,
    /// Containers by name.
    pub containers: Mutex<HashMap<String, ContainerSnapshot>>,
    pub calls: Mutex<Vec<String>>,
    /// Helper specs handed to run_helper.
    pub helpers: Mutex<Vec<HelperSpec>>,
    /// Operation names that fail with an injected API error.
    pub fail_on: Mutex<HashSet<&'static str>>,
    /// Operation name -> 1-based invocation that fails (earlier ones succeed).
    pub fail_on_call: Mutex<HashMap<&'static str, usize>>,
    op_counts: Mutex<HashMap<&'static str, usize>>,
    /// Extra latency for snapshot_container, to hold a run in staging.
    pub snapshot_delay_ms: Mutex<u64>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_on(&self, op: &'static str) {
        self.fail_on.lock().unwrap().insert(op);
    }

    /// Fail only the `nth` invocation of `op` (1-based).
    pub fn fail_on_nth(&self, op: &'static str, nth: usize) {
        self.fail_on_call.lock().unwrap().insert(op, nth);
    }

    fn check_fail(&self, op: &'static str) -> Result<(), EngineError> {
        let nth = {
            let mut counts = self.op_counts.lock().unwrap();
            let n = counts.entry(op).or_insert(0);
            *n += 1;
            *n
        };
        if self.fail_on.lock().unwrap().contains(op)
            || self.fail_on_call.lock().unwrap().get(op) == Some(&nth)
        {
            return Err(EngineError::Api(format!("injected {} failure", op)));
        }
        Ok(())
    }

    /// Register a container plus the image state its tag resolves to.
    pub fn add_container(&self, snapshot: ContainerSnapshot, repo_digests: Vec<String>) {
        self.images
            .lock()
            .unwrap()
            .insert(snapshot.image.canonical(), snapshot.image_id.clone());
        self.repo_digests
            .lock()
            .unwrap()
            .insert(snapshot.image_id.clone(), repo_digests);
        self.containers
            .lock()
            .unwrap()
            .insert(snapshot.name.clone(), snapshot);
    }

    pub fn set_remote_digest(&self, reference: &str, digest: &str) {
        self.remote_digests
            .lock()
            .unwrap()
            .insert(reference.to_string(), digest.to_string());
    }

    /// A pull of `reference` installs `image_id` under that tag, carrying
    /// `digest` in its repo digests.
    pub fn set_pull_result(&self, reference: &ImageReference, image_id: &str, digest: &str) {
        self.pull_produces
            .lock()
            .unwrap()
            .insert(reference.canonical(), image_id.to_string());
        self.repo_digests.lock().unwrap().insert(
            image_id.to_string(),
            vec![format!("{}@{}", reference.repository, digest)],
        );
    }

    /// What the given reference currently resolves to, if anything.
    pub fn resolve_tag(&self, reference: &str) -> Option<String> {
        self.images.lock().unwrap().get(reference).cloned()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.check_fail("ping")
    }

    async fn snapshot_container(&self, name: &str) -> Result<ContainerSnapshot, EngineError> {
        let delay = *self.snapshot_delay_ms.lock().unwrap();
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.record(format!("snapshot_container {}", name));
        self.check_fail("snapshot_container")?;
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {}", name)))
    }

    async fn local_image_state(&self, reference: &str) -> Result<LocalImageState, EngineError> {
        self.record(format!("local_image_state {}", reference));
        self.check_fail("local_image_state")?;
        let id = self
            .images
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no such image: {}", reference)))?;
        let repo_digests = self
            .repo_digests
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        Ok(LocalImageState { id, repo_digests })
    }

    async fn remote_manifest_digest(
        &self,
        reference: &ImageReference,
    ) -> Result<String, EngineError> {
        self.record(format!("remote_manifest_digest {}", reference));
        self.check_fail("remote_manifest_digest")?;
        self.remote_digests
            .lock()
            .unwrap()
            .get(&reference.canonical())
            .cloned()
            .ok_or_else(|| EngineError::Registry("registry unreachable".to_string()))
    }

    async fn pull_image(&self, reference: &ImageReference) -> Result<(), EngineError> {
        self.record(format!("pull_image {}", reference));
        self.check_fail("pull_image")?;
        // A pull moves the local tag pointer.
        if let Some(new_id) = self
            .pull_produces
            .lock()
            .unwrap()
            .get(&reference.canonical())
            .cloned()
        {
            self.images
                .lock()
                .unwrap()
                .insert(reference.canonical(), new_id);
        }
        Ok(())
    }

    async fn tag_image(
        &self,
        image_id: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), EngineError> {
        self.record(format!("tag_image {} {}:{}", image_id, repository, tag));
        self.check_fail("tag_image")?;
        self.images
            .lock()
            .unwrap()
            .insert(format!("{}:{}", repository, tag), image_id.to_string());
        Ok(())
    }

    async fn remove_image(&self, reference: &str, force: bool) -> Result<(), EngineError> {
        self.record(format!("remove_image {} force={}", reference, force));
        self.check_fail("remove_image")?;
        self.images.lock().unwrap().remove(reference);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("stop_container {}", id));
        self.check_fail("stop_container")
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("remove_container {}", id));
        self.check_fail("remove_container")?;
        self.containers
            .lock()
            .unwrap()
            .retain(|_, snapshot| snapshot.id != id);
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        snapshot: &ContainerSnapshot,
        with_primary_network: bool,
    ) -> Result<String, EngineError> {
        self.record(format!(
            "create_container {} primary_network={}",
            name, with_primary_network
        ));
        self.check_fail("create_container")?;
        let new_id = format!("new-{}", name);
        let mut created = snapshot.clone();
        created.id = new_id.clone();
        created.name = name.to_string();
        if !with_primary_network {
            created.networks.clear();
        }
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), created);
        Ok(new_id)
    }

    async fn connect_network(
        &self,
        container_id: &str,
        attachment: &NetworkAttachment,
    ) -> Result<(), EngineError> {
        self.record(format!(
            "connect_network {} {}",
            container_id, attachment.network_name
        ));
        self.check_fail("connect_network")
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("start_container {}", id));
        self.check_fail("start_container")
    }

    async fn run_helper(&self, spec: &HelperSpec) -> Result<String, EngineError> {
        self.record(format!("run_helper {}", spec.name));
        self.check_fail("run_helper")?;
        self.helpers.lock().unwrap().push(spec.clone());
        Ok(format!("helper-{}", spec.name))
    }
}

/// In-memory execution ledger with the same terminal-immutability contract
/// as the SQLite one.
#[derive(Default)]
pub struct MemoryLedger {
    next_id: AtomicI64,
    pub executions: Mutex<HashMap<i64, UpdateExecution>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, id: i64) -> Option<ExecutionStatus> {
        self.executions.lock().unwrap().get(&id).map(|e| e.status)
    }

    pub fn details_of(&self, id: i64) -> Option<String> {
        self.executions
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|e| e.result_details.clone())
    }

    pub fn logs_of(&self, id: i64) -> Vec<String> {
        self.executions
            .lock()
            .unwrap()
            .get(&id)
            .map(|e| e.log_lines.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionLedger for MemoryLedger {
    async fn begin(
        &self,
        target_name: &str,
        environment_id: &str,
        triggered_by: &str,
    ) -> anyhow::Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.executions.lock().unwrap().insert(
            id,
            UpdateExecution {
                id,
                target_name: target_name.to_string(),
                environment_id: environment_id.to_string(),
                triggered_by: triggered_by.to_string(),
                status: ExecutionStatus::Running,
                started_at: chrono::Utc::now().timestamp_millis(),
                completed_at: None,
                log_lines: vec![],
                result_details: None,
            },
        );
        Ok(id)
    }

    async fn append_log(&self, execution_id: i64, line: &str) -> anyhow::Result<()> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or_else(|| anyhow::anyhow!("no such execution {}", execution_id))?;
        execution.log_lines.push(line.to_string());
        Ok(())
    }

    async fn complete(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        details: Option<&str>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(status.is_terminal(), "complete() requires a terminal status");
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or_else(|| anyhow::anyhow!("no such execution {}", execution_id))?;
        anyhow::ensure!(
            execution.status == ExecutionStatus::Running,
            "execution {} is already terminal",
            execution_id
        );
        execution.status = status;
        execution.completed_at = Some(chrono::Utc::now().timestamp_millis());
        execution.result_details = details.map(String::from);
        Ok(())
    }

    async fn get(&self, execution_id: i64) -> anyhow::Result<Option<UpdateExecution>> {
        Ok(self.executions.lock().unwrap().get(&execution_id).cloned())
    }

    async fn recent(&self, limit: i64) -> anyhow::Result<Vec<UpdateExecution>> {
        let mut all: Vec<_> = self.executions.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|e| std::cmp::Reverse(e.id));
        all.truncate(limit as usize);
        Ok(all)
    }
}

/// Scanner returning a fixed summary per image repository.
#[derive(Default)]
pub struct FakeScanner {
    pub summaries: Mutex<HashMap<String, ScanSummary>>,
    pub scans: Mutex<Vec<String>>,
}

impl FakeScanner {
    pub fn with_summary(repository: &str, summary: ScanSummary) -> Self {
        let scanner = Self::default();
        scanner
            .summaries
            .lock()
            .unwrap()
            .insert(repository.to_string(), summary);
        scanner
    }
}

#[async_trait]
impl Scanner for FakeScanner {
    async fn scan(
        &self,
        reference: &ImageReference,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> anyhow::Result<ScanSummary> {
        self.scans.lock().unwrap().push(reference.canonical());
        progress(format!("scanning {}", reference));
        self.summaries
            .lock()
            .unwrap()
            .get(&reference.repository)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scan result configured for {}", reference))
    }
}

#[derive(Default)]
pub struct FakeStackStore {
    pub known: Mutex<HashMap<String, StackDefinition>>,
}

impl FakeStackStore {
    pub fn with_stack(name: &str) -> Self {
        let store = Self::default();
        store.known.lock().unwrap().insert(
            name.to_string(),
            StackDefinition {
                name: name.to_string(),
                file: std::path::PathBuf::from(format!("/stacks/{}/compose.yaml", name)),
            },
        );
        store
    }
}

#[async_trait]
impl StackStore for FakeStackStore {
    async fn get_definition(&self, stack_name: &str) -> Option<StackDefinition> {
        self.known.lock().unwrap().get(stack_name).cloned()
    }
}

#[derive(Default)]
pub struct FakeConverger {
    pub services: Vec<String>,
    pub converged: Mutex<Vec<String>>,
    pub fail: bool,
}

impl FakeConverger {
    pub fn recreating(services: &[&str]) -> Self {
        Self {
            services: services.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl StackConverger for FakeConverger {
    async fn converge(&self, definition: &StackDefinition) -> anyhow::Result<ConvergeReport> {
        self.converged.lock().unwrap().push(definition.name.clone());
        anyhow::ensure!(!self.fail, "compose up for stack {} exited with 1", definition.name);
        Ok(ConvergeReport {
            services_recreated: self.services.clone(),
        })
    }
}

pub fn attachment(name: &str, primary: bool) -> NetworkAttachment {
    NetworkAttachment {
        network_name: name.to_string(),
        aliases: vec![],
        ipv4: None,
        ipv6: None,
        gateway_priority: None,
        is_primary: primary,
    }
}

/// Minimal running-container snapshot with one primary and one secondary
/// network.
pub fn snapshot(name: &str, image: &str, image_id: &str) -> ContainerSnapshot {
    ContainerSnapshot {
        id: format!("id-{}", name),
        name: name.to_string(),
        image: ImageReference::parse(image).unwrap(),
        image_id: image_id.to_string(),
        entrypoint: None,
        cmd: None,
        env: vec!["MODE=prod".to_string()],
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
        networks: vec![attachment("frontend", true), attachment("backend", false)],
        stack: None,
    }
}

/// Snapshot labeled as a member of a compose stack.
pub fn stack_snapshot(
    name: &str,
    image: &str,
    image_id: &str,
    project: &str,
    service: &str,
) -> ContainerSnapshot {
    let mut snap = snapshot(name, image, image_id);
    snap.labels.insert(
        "com.docker.compose.project".to_string(),
        project.to_string(),
    );
    snap.labels.insert(
        "com.docker.compose.service".to_string(),
        service.to_string(),
    );
    snap.stack = Some(StackMembership {
        project: project.to_string(),
        service: service.to_string(),
    });
    snap
}
