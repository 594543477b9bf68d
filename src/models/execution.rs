// Update execution ledger records and progress-stream events

use serde::{Deserialize, Serialize};

/// Terminal and in-flight states of one update execution.
///
/// `Launched` is only ever recorded by the self-replacement path: once the
/// handoff helper is running, this process cannot observe the remaining
/// steps, so `Launched` is its honest last known status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Skipped,
    Failed,
    Launched,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Launched => "launched",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "success" => ExecutionStatus::Success,
            "skipped" => ExecutionStatus::Skipped,
            "failed" => ExecutionStatus::Failed,
            "launched" => ExecutionStatus::Launched,
            _ => ExecutionStatus::Running,
        }
    }
}

/// Ledger record for one update operation. Created at operation start,
/// appended to for its lifetime, never mutated after a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateExecution {
    pub id: i64,
    pub target_name: String,
    pub environment_id: String,
    pub triggered_by: String,
    pub status: ExecutionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub log_lines: Vec<String>,
    pub result_details: Option<String>,
}

/// Named server-push events for the progress stream. One-way and best
/// effort: a disconnected or lagging observer never affects the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum ProgressEvent {
    Connected,
    Step {
        execution_id: i64,
        step: String,
    },
    Log {
        execution_id: i64,
        line: String,
    },
    Error {
        execution_id: i64,
        message: String,
    },
    Launched {
        execution_id: i64,
        helper_id: String,
    },
}

impl ProgressEvent {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Connected => "connected",
            ProgressEvent::Step { .. } => "step",
            ProgressEvent::Log { .. } => "log",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Launched { .. } => "launched",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_strings() {
        for s in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Skipped,
            ExecutionStatus::Failed,
            ExecutionStatus::Launched,
        ] {
            assert_eq!(ExecutionStatus::from_db(s.as_str()), s);
        }
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Launched.is_terminal());
    }

    #[test]
    fn progress_event_names_match_stream_contract() {
        let e = ProgressEvent::Step {
            execution_id: 1,
            step: "pulling".into(),
        };
        assert_eq!(e.event_name(), "step");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"executionId\""));
        assert!(json.contains("\"kind\":\"step\""));

        let e = ProgressEvent::Launched {
            execution_id: 2,
            helper_id: "abc".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"launched\""));
        assert!(json.contains("\"helperId\":\"abc\""));
    }
}
