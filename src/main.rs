use anyhow::Result;
use capstan::*;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;

    let engine: Arc<dyn engine::Engine> = Arc::new(engine::DockerEngine::connect(
        app_config.engine.socket.as_deref(),
        app_config.engine.timeout_secs,
    )?);
    let repo = Arc::new(
        execution_repo::ExecutionRepo::connect(
            &app_config.database.path,
            app_config.database.retention_days,
        )
        .await?,
    );
    repo.init().await?;

    let (progress_tx, _) =
        broadcast::channel::<models::ProgressEvent>(app_config.updates.broadcast_capacity);
    let (job_tx, job_rx) = mpsc::channel(app_config.updates.queue_capacity);

    let updater_deps = Arc::new(updater::UpdaterDeps {
        engine: engine.clone(),
        // No scanner collaborator is wired in this build; scan_enabled
        // requires one and fails the execution otherwise.
        scanner: None,
        ledger: repo.clone(),
        stack_store: Arc::new(compose::FsStackStore::new(&app_config.updates.stacks_dir)),
        converger: Arc::new(compose::ComposeCli::new()),
        progress: progress_tx.clone(),
        tag_locks: guard::TagLocks::new(),
        scan_cache: scanner::ScanCache::new(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let worker_handle = worker::spawn(
        worker::WorkerDeps {
            updater: updater_deps,
            repo: repo.clone(),
            job_rx,
            shutdown_rx,
        },
        worker::WorkerConfig {
            policy: updater::UpdatePolicy {
                scan_enabled: app_config.updates.scan_enabled,
                criterion: app_config.updates.criterion,
                staging_timeout_secs: app_config.updates.staging_timeout_secs,
            },
            stats_log_interval_secs: app_config.updates.stats_log_interval_secs,
            prune_interval_secs: app_config.updates.prune_interval_secs,
        },
    );

    let self_updater = Arc::new(selfupdate::SelfUpdater::new(
        engine,
        repo.clone(),
        progress_tx.clone(),
        selfupdate::SelfUpdateConfig {
            helper_image: app_config.self_update.helper_image.clone(),
            socket_bind: app_config.self_update.socket_bind.clone(),
            own_container: app_config.self_update.own_container.clone(),
        },
    ));

    let app = routes::app(
        repo,
        job_tx,
        progress_tx,
        self_updater,
        app_config.engine.environment_id.clone(),
    );
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let in_container = std::path::Path::new("/.dockerenv").exists()
        || std::env::var("CONTAINER").as_deref() == Ok("1");

    if in_container {
        // In Docker: run server until error or SIGTERM (no signal handler; avoids immediate exit)
        axum::serve(listener, app).await?;
    } else {
        tokio::select! {
            result = axum::serve(listener, app) => {
                result?;
            }
            _ = async {
                #[cfg(unix)]
                {
                    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(s) => s,
                        Err(_) => {
                            let _ = tokio::signal::ctrl_c().await;
                            return;
                        }
                    };
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                #[cfg(not(unix))]
                {
                    tokio::signal::ctrl_c().await
                }
            } => {
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx.send(());
                let _ = worker_handle.await;
            }
        }
    }

    Ok(())
}
