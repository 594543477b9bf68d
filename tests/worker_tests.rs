mod common;

use capstan::execution_repo::{ExecutionLedger, ExecutionRepo};
use capstan::guard::TagLocks;
use capstan::models::{ExecutionStatus, ImageReference};
use capstan::scanner::{GateCriterion, ScanCache};
use capstan::updater::{CancelFlag, UpdatePolicy, UpdateRequest, UpdaterDeps};
use capstan::worker::{self, UpdateJob, WorkerConfig, WorkerDeps};
use common::{FakeConverger, FakeEngine, FakeStackStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

struct Rig {
    engine: Arc<FakeEngine>,
    repo: Arc<ExecutionRepo>,
    job_tx: mpsc::Sender<UpdateJob>,
    shutdown_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

async fn rig(dir: &tempfile::TempDir, engine: FakeEngine) -> Rig {
    let path = dir.path().join("capstan.db");
    let repo = Arc::new(
        ExecutionRepo::connect(path.to_str().unwrap(), 30)
            .await
            .unwrap(),
    );
    repo.init().await.unwrap();

    let engine = Arc::new(engine);
    let (progress, _progress_rx) = broadcast::channel(64);
    let updater = Arc::new(UpdaterDeps {
        engine: engine.clone(),
        scanner: None,
        ledger: repo.clone(),
        stack_store: Arc::new(FakeStackStore::default()),
        converger: Arc::new(FakeConverger::default()),
        progress,
        tag_locks: TagLocks::new(),
        scan_cache: ScanCache::new(),
    });

    let (job_tx, job_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = worker::spawn(
        WorkerDeps {
            updater,
            repo: repo.clone(),
            job_rx,
            shutdown_rx,
        },
        WorkerConfig {
            policy: UpdatePolicy {
                scan_enabled: false,
                criterion: GateCriterion::Never,
                staging_timeout_secs: 30,
            },
            stats_log_interval_secs: 3600,
            prune_interval_secs: 3600,
        },
    );

    Rig {
        engine,
        repo,
        job_tx,
        shutdown_tx,
        handle,
    }
}

fn engine_with_update() -> FakeEngine {
    let engine = FakeEngine::new();
    let snap = common::snapshot("web", "app:1.0", "sha256:old");
    engine.add_container(snap, vec!["app@sha256:olddigest".to_string()]);
    engine.set_remote_digest("app:1.0", "sha256:newdigest");
    engine.set_pull_result(
        &ImageReference::parse("app:1.0").unwrap(),
        "sha256:new",
        "sha256:newdigest",
    );
    engine
}

fn request(target: &str) -> UpdateRequest {
    UpdateRequest {
        target: target.to_string(),
        environment_id: "local".to_string(),
        triggered_by: "test".to_string(),
        force: false,
    }
}

async fn wait_terminal(repo: &ExecutionRepo, id: i64) -> ExecutionStatus {
    for _ in 0..200 {
        let execution = repo.get(id).await.unwrap().unwrap();
        if execution.status.is_terminal() {
            return execution.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached a terminal status", id);
}

#[tokio::test]
async fn queued_update_runs_to_completion() {
    let dir = tempfile::TempDir::new().unwrap();
    let rig = rig(&dir, engine_with_update()).await;

    let id = rig.repo.begin("web", "local", "test").await.unwrap();
    rig.job_tx
        .send(UpdateJob {
            execution_id: id,
            request: request("web"),
            cancel: CancelFlag::new(),
        })
        .await
        .unwrap();

    assert_eq!(wait_terminal(&rig.repo, id).await, ExecutionStatus::Success);
    assert!(
        rig.engine
            .recorded()
            .contains(&"start_container new-web".to_string())
    );

    rig.shutdown_tx.send(()).unwrap();
    rig.handle.await.unwrap();
}

#[tokio::test]
async fn duplicate_in_flight_target_is_skipped() {
    let engine = engine_with_update();
    // Hold the first job in staging long enough for the second to arrive.
    *engine.snapshot_delay_ms.lock().unwrap() = 300;
    let dir = tempfile::TempDir::new().unwrap();
    let rig = rig(&dir, engine).await;

    let first = rig.repo.begin("web", "local", "test").await.unwrap();
    let second = rig.repo.begin("web", "local", "test").await.unwrap();
    for id in [first, second] {
        rig.job_tx
            .send(UpdateJob {
                execution_id: id,
                request: request("web"),
                cancel: CancelFlag::new(),
            })
            .await
            .unwrap();
    }

    assert_eq!(
        wait_terminal(&rig.repo, second).await,
        ExecutionStatus::Skipped
    );
    let duplicate = rig.repo.get(second).await.unwrap().unwrap();
    assert!(
        duplicate
            .result_details
            .unwrap()
            .contains("already in flight")
    );
    // The first run is unaffected by the rejected duplicate.
    assert_eq!(wait_terminal(&rig.repo, first).await, ExecutionStatus::Success);

    rig.shutdown_tx.send(()).unwrap();
    rig.handle.await.unwrap();
}

#[tokio::test]
async fn same_target_can_run_again_after_completion() {
    let dir = tempfile::TempDir::new().unwrap();
    let rig = rig(&dir, engine_with_update()).await;

    let first = rig.repo.begin("web", "local", "test").await.unwrap();
    rig.job_tx
        .send(UpdateJob {
            execution_id: first,
            request: request("web"),
            cancel: CancelFlag::new(),
        })
        .await
        .unwrap();
    assert_eq!(wait_terminal(&rig.repo, first).await, ExecutionStatus::Success);

    // The tag now points at the promoted image, so the second run skips as
    // up to date instead of being rejected as a duplicate.
    let second = rig.repo.begin("web", "local", "test").await.unwrap();
    rig.job_tx
        .send(UpdateJob {
            execution_id: second,
            request: request("web"),
            cancel: CancelFlag::new(),
        })
        .await
        .unwrap();
    let status = wait_terminal(&rig.repo, second).await;
    assert_eq!(status, ExecutionStatus::Skipped);

    rig.shutdown_tx.send(()).unwrap();
    rig.handle.await.unwrap();
}

#[tokio::test]
async fn closing_the_queue_stops_the_dispatcher() {
    let dir = tempfile::TempDir::new().unwrap();
    let rig = rig(&dir, FakeEngine::new()).await;

    drop(rig.job_tx);
    tokio::time::timeout(Duration::from_secs(5), rig.handle)
        .await
        .expect("dispatcher exits when the queue closes")
        .unwrap();
}
