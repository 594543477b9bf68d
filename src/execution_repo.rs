// SQLite-backed update execution ledger. Records are created at operation
// start, appended to for the operation's lifetime, and frozen once a
// terminal status is recorded.

use crate::models::{ExecutionStatus, UpdateExecution};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Open a new execution record; returns its handle (row id).
    async fn begin(
        &self,
        target_name: &str,
        environment_id: &str,
        triggered_by: &str,
    ) -> anyhow::Result<i64>;

    async fn append_log(&self, execution_id: i64, line: &str) -> anyhow::Result<()>;

    /// Record a terminal status. Fails if the execution already has one:
    /// terminal records are immutable.
    async fn complete(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        details: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn get(&self, execution_id: i64) -> anyhow::Result<Option<UpdateExecution>>;

    /// Most recent executions, newest first, without log lines.
    async fn recent(&self, limit: i64) -> anyhow::Result<Vec<UpdateExecution>>;
}

pub struct ExecutionRepo {
    pool: SqlitePool,
    retention_ms: i64,
}

impl ExecutionRepo {
    pub async fn connect(path: &str, retention_days: u32) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        let retention_ms = (retention_days as i64) * 24 * 60 * 60 * 1000;
        Ok(Self { pool, retention_ms })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS update_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_name TEXT NOT NULL,
                environment_id TEXT NOT NULL,
                triggered_by TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                result_details TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id INTEGER NOT NULL,
                logged_at INTEGER NOT NULL,
                line TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_logs_execution \
             ON execution_logs(execution_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_started_at \
             ON update_executions(started_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete terminal executions (and their logs) older than the retention
    /// window.
    #[instrument(skip(self), fields(repo = "execution", operation = "prune_old_data"))]
    pub async fn prune_old_data(&self) -> anyhow::Result<u64> {
        let cutoff = now_ms() - self.retention_ms;
        sqlx::query(
            "DELETE FROM execution_logs WHERE execution_id IN \
             (SELECT id FROM update_executions WHERE started_at < ? AND status != 'running')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let result = sqlx::query(
            "DELETE FROM update_executions WHERE started_at < ? AND status != 'running'",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_logs(&self, execution_id: i64) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT line FROM execution_logs WHERE execution_id = ? ORDER BY id ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("line")).collect())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> UpdateExecution {
    UpdateExecution {
        id: row.get("id"),
        target_name: row.get("target_name"),
        environment_id: row.get("environment_id"),
        triggered_by: row.get("triggered_by"),
        status: ExecutionStatus::from_db(row.get::<String, _>("status").as_str()),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        log_lines: vec![],
        result_details: row.get("result_details"),
    }
}

#[async_trait]
impl ExecutionLedger for ExecutionRepo {
    #[instrument(skip(self), fields(repo = "execution", operation = "begin"))]
    async fn begin(
        &self,
        target_name: &str,
        environment_id: &str,
        triggered_by: &str,
    ) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO update_executions \
             (target_name, environment_id, triggered_by, status, started_at) \
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(target_name)
        .bind(environment_id)
        .bind(triggered_by)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn append_log(&self, execution_id: i64, line: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO execution_logs (execution_id, logged_at, line) VALUES (?, ?, ?)")
            .bind(execution_id)
            .bind(now_ms())
            .bind(line)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, details), fields(repo = "execution", operation = "complete"))]
    async fn complete(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        details: Option<&str>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            status.is_terminal(),
            "complete() requires a terminal status, got {}",
            status.as_str()
        );
        let result = sqlx::query(
            "UPDATE update_executions SET status = ?, completed_at = ?, result_details = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(now_ms())
        .bind(details)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        anyhow::ensure!(
            result.rows_affected() == 1,
            "execution {} is missing or already terminal",
            execution_id
        );
        Ok(())
    }

    async fn get(&self, execution_id: i64) -> anyhow::Result<Option<UpdateExecution>> {
        let row = sqlx::query("SELECT * FROM update_executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut execution = execution_from_row(&row);
        execution.log_lines = self.load_logs(execution_id).await?;
        Ok(Some(execution))
    }

    async fn recent(&self, limit: i64) -> anyhow::Result<Vec<UpdateExecution>> {
        let rows = sqlx::query("SELECT * FROM update_executions ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(execution_from_row).collect())
    }
}
