use crate::scanner::GateCriterion;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub updates: UpdatesConfig,
    pub self_update: SelfUpdateSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Unix socket path; bollard's default socket is used when unset.
    pub socket: Option<String>,
    /// Per-call engine timeout in seconds.
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_environment_id")]
    pub environment_id: String,
}

fn default_engine_timeout_secs() -> u64 {
    120
}

fn default_environment_id() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatesConfig {
    pub scan_enabled: bool,
    #[serde(default = "default_criterion")]
    pub criterion: GateCriterion,
    /// Budget for the cancellable staging phases (check, pull, gate) of one
    /// update, distinct from per-call engine timeouts.
    #[serde(default = "default_staging_timeout_secs")]
    pub staging_timeout_secs: u64,
    /// Directory of registered stack definitions, one subdirectory per stack.
    pub stacks_dir: String,
    /// Max number of progress events kept in the broadcast channel (slow
    /// observers may lag).
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Pending update requests before enqueueing callers see backpressure.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often to log dispatcher stats (executions finished, in flight) at
    /// INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
    /// How often to prune old terminal executions (real seconds).
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_criterion() -> GateCriterion {
    GateCriterion::AnyKnown
}

fn default_staging_timeout_secs() -> u64 {
    600
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    64
}

fn default_stats_log_interval_secs() -> u64 {
    300
}

fn default_prune_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelfUpdateSection {
    pub helper_image: String,
    #[serde(default = "default_socket_bind")]
    pub socket_bind: String,
    pub own_container: Option<String>,
}

fn default_socket_bind() -> String {
    "/var/run/docker.sock:/var/run/docker.sock".to_string()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            self.engine.timeout_secs > 0,
            "engine.timeout_secs must be > 0, got {}",
            self.engine.timeout_secs
        );
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.database.retention_days > 0,
            "database.retention_days must be > 0, got {}",
            self.database.retention_days
        );
        anyhow::ensure!(
            self.updates.staging_timeout_secs > 0,
            "updates.staging_timeout_secs must be > 0, got {}",
            self.updates.staging_timeout_secs
        );
        anyhow::ensure!(
            !self.updates.stacks_dir.is_empty(),
            "updates.stacks_dir must be non-empty"
        );
        anyhow::ensure!(
            self.updates.broadcast_capacity > 0,
            "updates.broadcast_capacity must be > 0, got {}",
            self.updates.broadcast_capacity
        );
        anyhow::ensure!(
            self.updates.queue_capacity > 0,
            "updates.queue_capacity must be > 0, got {}",
            self.updates.queue_capacity
        );
        anyhow::ensure!(
            self.updates.stats_log_interval_secs > 0,
            "updates.stats_log_interval_secs must be > 0, got {}",
            self.updates.stats_log_interval_secs
        );
        anyhow::ensure!(
            self.updates.prune_interval_secs > 0,
            "updates.prune_interval_secs must be > 0, got {}",
            self.updates.prune_interval_secs
        );
        anyhow::ensure!(
            !self.self_update.helper_image.is_empty(),
            "self_update.helper_image must be non-empty"
        );
        anyhow::ensure!(
            self.self_update.socket_bind.contains(':'),
            "self_update.socket_bind must be a host:container bind, got {}",
            self.self_update.socket_bind
        );
        Ok(())
    }
}
