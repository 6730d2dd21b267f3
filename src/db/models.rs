use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Failed,
    Completed,
    Cancelled,
    Interrupted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Interrupted => "interrupted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "failed" => Some(TaskStatus::Failed),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "interrupted" => Some(TaskStatus::Interrupted),
            _ => None,
        }
    }
}

/// Lifecycle status of a TaskItem. See engine::runner for the transition DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    QaRunning,
    QaPassed,
    QaFailed,
    FixRunning,
    Fixed,
    RetestRunning,
    Verified,
    Unresolved,
    Skipped,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::QaRunning => "qa_running",
            ItemStatus::QaPassed => "qa_passed",
            ItemStatus::QaFailed => "qa_failed",
            ItemStatus::FixRunning => "fix_running",
            ItemStatus::Fixed => "fixed",
            ItemStatus::RetestRunning => "retest_running",
            ItemStatus::Verified => "verified",
            ItemStatus::Unresolved => "unresolved",
            ItemStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "qa_running" => Some(ItemStatus::QaRunning),
            "qa_passed" => Some(ItemStatus::QaPassed),
            "qa_failed" => Some(ItemStatus::QaFailed),
            "fix_running" => Some(ItemStatus::FixRunning),
            "fixed" => Some(ItemStatus::Fixed),
            "retest_running" => Some(ItemStatus::RetestRunning),
            "verified" => Some(ItemStatus::Verified),
            "unresolved" => Some(ItemStatus::Unresolved),
            "skipped" => Some(ItemStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ItemStatus::QaRunning | ItemStatus::FixRunning | ItemStatus::RetestRunning
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::QaPassed
                | ItemStatus::Fixed
                | ItemStatus::Verified
                | ItemStatus::Unresolved
                | ItemStatus::Skipped
        )
    }
}

/// The role a CommandRun plays within the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InitOnce,
    Qa,
    TicketScan,
    Fix,
    Retest,
    LoopGuard,
    Custom,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::InitOnce => "init_once",
            Phase::Qa => "qa",
            Phase::TicketScan => "ticket_scan",
            Phase::Fix => "fix",
            Phase::Retest => "retest",
            Phase::LoopGuard => "loop_guard",
            Phase::Custom => "custom",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "init_once" => Some(Phase::InitOnce),
            "qa" => Some(Phase::Qa),
            "ticket_scan" => Some(Phase::TicketScan),
            "fix" => Some(Phase::Fix),
            "retest" => Some(Phase::Retest),
            "loop_guard" => Some(Phase::LoopGuard),
            "custom" => Some(Phase::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub goal: String,
    pub workspace_id: String,
    pub workflow_id: String,
    pub config_snapshot_json: String,
    pub status: TaskStatus,
    pub total_items: i64,
    pub finished_items: i64,
    pub failed_items: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTask {
    pub name: String,
    pub goal: String,
    pub workspace_id: String,
    pub workflow_id: String,
    pub config_snapshot_json: String,
    /// Files resolved up front; empty means "discover at runner start".
    pub target_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    pub id: String,
    pub task_id: String,
    pub ordinal: i64,
    pub qa_file_path: String,
    pub status: ItemStatus,
    pub ticket_files: Vec<String>,
    pub fix_required: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRun {
    pub id: String,
    pub task_item_id: String,
    pub phase: Phase,
    pub command: String,
    pub cwd: String,
    pub agent_id: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub task_id: String,
    pub task_item_id: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVersion {
    pub version: i64,
    pub yaml: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task: Task,
    pub items: Vec<TaskItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Failed,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::Interrupted,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn item_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ItemStatus::QaRunning).unwrap(),
            "\"qa_running\""
        );
    }

    #[test]
    fn item_status_running_and_terminal_are_disjoint() {
        for s in [
            ItemStatus::Pending,
            ItemStatus::QaRunning,
            ItemStatus::QaPassed,
            ItemStatus::QaFailed,
            ItemStatus::FixRunning,
            ItemStatus::Fixed,
            ItemStatus::RetestRunning,
            ItemStatus::Verified,
            ItemStatus::Unresolved,
            ItemStatus::Skipped,
        ] {
            assert!(!(s.is_running() && s.is_terminal()));
        }
    }
}
