//! Task lifecycle surface (SPEC_FULL.md §4.H). Owns the single active
//! `Runner` per task and is the only component that spawns or cancels one.
//! Grounded on the reference's `RunningAgents` cancel-handle-per-run
//! registry, generalized from one entry per run to one entry per task, plus
//! the reference `main.rs` crash-recovery-then-resume bootstrap sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, ConfigManager, DefaultsConfig, WorkspaceConfig};
use crate::db::models::{CommandRun, Event, Task, TaskItem, TaskStatus};
use crate::db::tasks::CreateTaskParams;
use crate::db::{Database, DbError};
use crate::engine::bus::{self, Envelope, EventBus};
use crate::engine::error::EngineError;
use crate::engine::health::HealthTracker;
use crate::engine::logstream;
use crate::engine::process::CancelToken;
use crate::engine::runner::{Runner, RunnerConfigSnapshot};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    ConfigManager(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<CoordinatorError> for String {
    fn from(err: CoordinatorError) -> Self {
        err.to_string()
    }
}

/// Handle to a task's in-flight runner: the pause flag and cancel token the
/// coordinator flips from outside, plus the `tokio` task driving it.
struct ActiveRunner {
    pause: Arc<AtomicBool>,
    cancel: CancelToken,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub name: Option<String>,
    pub goal: Option<String>,
    pub workspace_id: Option<String>,
    pub workflow_id: Option<String>,
    pub target_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetails {
    pub task: Task,
    pub items: Vec<TaskItem>,
    pub runs: Vec<CommandRun>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceOption {
    pub id: String,
    pub root_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOption {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskOptions {
    pub defaults: DefaultsConfig,
    pub workspaces: Vec<WorkspaceOption>,
    pub workflows: Vec<WorkflowOption>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunkRecord {
    pub run_id: String,
    pub phase: String,
    pub content: String,
}

/// Public lifecycle surface the GUI's command handlers call into (§6). Owns
/// the single active runner per task and the shared engine components every
/// runner is constructed from.
pub struct Coordinator {
    db: Database,
    bus: Arc<EventBus>,
    health: Arc<HealthTracker>,
    config: Arc<ConfigManager>,
    data_root: PathBuf,
    active: Mutex<HashMap<String, ActiveRunner>>,
}

impl Coordinator {
    pub fn new(db: Database, bus: Arc<EventBus>, config: Arc<ConfigManager>, data_root: PathBuf) -> Self {
        let health = Arc::new(HealthTracker::new(db.clone(), bus.clone()));
        Self { db, bus, health, config, data_root, active: Mutex::new(HashMap::new()) }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Run the crash-recovery pass and, if `resume.auto` is set, restart the
    /// most recently interrupted task. Called once at process startup.
    pub async fn bootstrap(&self) -> Result<Option<String>, CoordinatorError> {
        let report = self.db.recover_interrupted()?;
        tracing::info!(
            tasks_marked_interrupted = report.tasks_marked_interrupted,
            runs_marked_interrupted = report.runs_marked_interrupted,
            "startup recovery pass complete"
        );

        let config = self.config.current()?;
        if !config.resume.auto {
            return Ok(None);
        }

        let Some(task) = self.db.find_latest_task_by_status(TaskStatus::Interrupted)? else {
            return Ok(None);
        };

        self.start_task(&task.id).await?;
        Ok(Some(task.id))
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>, CoordinatorError> {
        Ok(self.db.list_tasks()?)
    }

    pub fn get_task_details(&self, task_id: &str) -> Result<TaskDetails, CoordinatorError> {
        let task = self.db.get_task(task_id)?;
        let items = self.db.list_task_items(task_id)?;
        let mut runs = Vec::new();
        for item in &items {
            runs.extend(self.db.list_runs_for_item(&item.id)?);
        }
        let events = self.db.list_events_for_task(task_id)?;
        Ok(TaskDetails { task, items, runs, events })
    }

    pub fn get_create_task_options(&self) -> Result<CreateTaskOptions, CoordinatorError> {
        let config = self.config.current()?;
        let mut workspaces: Vec<WorkspaceOption> = config
            .workspaces
            .iter()
            .map(|(id, w)| WorkspaceOption { id: id.clone(), root_path: w.root_path.clone() })
            .collect();
        workspaces.sort_by(|a, b| a.id.cmp(&b.id));

        let mut workflows: Vec<WorkflowOption> =
            config.workflows.keys().map(|id| WorkflowOption { id: id.clone() }).collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(CreateTaskOptions { defaults: config.defaults, workspaces, workflows })
    }

    pub fn create_task(&self, req: CreateTaskRequest) -> Result<Task, CoordinatorError> {
        let config = self.config.current()?;

        let workspace_id = req.workspace_id.filter(|s| !s.is_empty()).unwrap_or(config.defaults.workspace.clone());
        let workflow_id = req.workflow_id.filter(|s| !s.is_empty()).unwrap_or(config.defaults.workflow.clone());

        let workspace = config
            .workspaces
            .get(&workspace_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::Config(format!("unknown workspace_id '{workspace_id}'")))?;
        let workflow = config
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::Config(format!("unknown workflow_id '{workflow_id}'")))?;

        let snapshot = RunnerConfigSnapshot {
            runner: config.runner.clone(),
            workspace: workspace.clone(),
            workflow,
            agents: config.agents.clone(),
            agent_groups: config.agent_groups.clone(),
        };
        let config_snapshot_json = serde_json::to_string(&snapshot)
            .map_err(|e| CoordinatorError::Config(format!("failed to snapshot config: {e}")))?;

        let task = self.db.create_task(&CreateTaskParams {
            name: req.name.filter(|s| !s.is_empty()).unwrap_or_else(|| "Untitled QA sprint".to_string()),
            goal: req.goal.unwrap_or_default(),
            workspace_id,
            workflow_id,
            config_snapshot_json,
        })?;

        let target_files = match req.target_files {
            Some(files) if !files.is_empty() => files,
            _ => discover_qa_files(&workspace),
        };
        self.db.create_task_items(&task.id, &target_files)?;

        bus::record_and_publish(&self.db, &self.bus, Envelope::TaskCreated { task_id: task.id.clone() })?;

        Ok(self.db.get_task(&task.id)?)
    }

    /// `start_task` on an already-running task is a no-op: returns the
    /// current row, publishes nothing (SPEC_FULL.md §8 Laws).
    pub async fn start_task(&self, task_id: &str) -> Result<Task, CoordinatorError> {
        let task = self.db.get_task(task_id)?;
        if task.status == TaskStatus::Running {
            return Ok(task);
        }
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Interrupted | TaskStatus::Failed) {
            return Err(CoordinatorError::InvalidStateTransition(format!(
                "cannot start task from status '{}'",
                task.status.as_str()
            )));
        }

        let snapshot: RunnerConfigSnapshot = serde_json::from_str(&task.config_snapshot_json)
            .map_err(|e| CoordinatorError::Config(format!("corrupt config snapshot: {e}")))?;

        self.db.update_task_status(task_id, TaskStatus::Running)?;
        bus::record_and_publish(&self.db, &self.bus, Envelope::TaskStarted { task_id: task_id.to_string() })?;

        self.dispatch(task_id, snapshot);

        Ok(self.db.get_task(task_id)?)
    }

    pub fn pause_task(&self, task_id: &str) -> Result<Task, CoordinatorError> {
        let active = self.active.lock().map_err(|_| CoordinatorError::Config("active runner lock poisoned".into()))?;
        let runner = active
            .get(task_id)
            .ok_or_else(|| CoordinatorError::InvalidStateTransition("task has no active runner to pause".into()))?;
        runner.pause.store(true, Ordering::SeqCst);
        drop(active);
        Ok(self.db.get_task(task_id)?)
    }

    pub async fn resume_task(&self, task_id: &str) -> Result<Task, CoordinatorError> {
        let task = self.db.get_task(task_id)?;
        if task.status != TaskStatus::Paused {
            return Err(CoordinatorError::InvalidStateTransition(format!(
                "cannot resume task from status '{}'",
                task.status.as_str()
            )));
        }

        if let Ok(mut active) = self.active.lock() {
            active.remove(task_id);
        }

        let snapshot: RunnerConfigSnapshot = serde_json::from_str(&task.config_snapshot_json)
            .map_err(|e| CoordinatorError::Config(format!("corrupt config snapshot: {e}")))?;

        self.db.update_task_status(task_id, TaskStatus::Running)?;
        bus::record_and_publish(&self.db, &self.bus, Envelope::TaskResumed { task_id: task_id.to_string() })?;

        self.dispatch(task_id, snapshot);

        Ok(self.db.get_task(task_id)?)
    }

    pub fn retry_task_item(&self, item_id: &str) -> Result<Task, CoordinatorError> {
        let item = self.db.get_task_item(item_id)?;
        self.db.retry_item(item_id)?;
        Ok(self.db.get_task(&item.task_id)?)
    }

    /// Cancel any in-flight child for the task, wait briefly for the runner
    /// to observe cancellation and close out its current run, then cascade
    /// delete. The wait is best-effort: the supervisor's own terminate-then-
    /// kill sequence (§4.D) bounds it to the 5s grace period.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), CoordinatorError> {
        let _ = self.db.get_task(task_id)?;

        let active = self.active.lock().map_err(|_| CoordinatorError::Config("active runner lock poisoned".into()))?.remove(task_id);
        if let Some(active) = active {
            active.cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(7), active.handle).await;
        }

        self.db.delete_task_cascade(task_id)?;
        self.bus.publish(Envelope::TaskDeleted { task_id: task_id.to_string() });
        Ok(())
    }

    pub fn stream_task_logs(&self, task_id: &str, limit: u32) -> Result<Vec<LogChunkRecord>, CoordinatorError> {
        let runs = self.db.list_recent_runs_for_task(task_id, limit)?;
        let mut out = Vec::with_capacity(runs.len());

        for run in runs {
            let (default_out, default_err) = logstream::run_log_paths(&self.data_root, task_id, &run.id);
            let stdout_path = run.stdout_path.clone().map(PathBuf::from).unwrap_or(default_out);
            let stderr_path = run.stderr_path.clone().map(PathBuf::from).unwrap_or(default_err);

            let mut content = String::new();
            if let Ok(s) = std::fs::read_to_string(&stdout_path) {
                content.push_str(s.trim_end_matches('\n'));
            }
            if let Ok(s) = std::fs::read_to_string(&stderr_path) {
                let s = s.trim_end_matches('\n');
                if !s.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(s);
                }
            }

            out.push(LogChunkRecord { run_id: run.id, phase: run.phase.as_str().to_string(), content });
        }

        Ok(out)
    }

    fn dispatch(&self, task_id: &str, snapshot: RunnerConfigSnapshot) {
        let pause = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();

        let runner = Runner::new(
            task_id.to_string(),
            self.db.clone(),
            self.bus.clone(),
            self.health.clone(),
            snapshot,
            self.data_root.clone(),
            pause.clone(),
            cancel.clone(),
        );

        let db = self.db.clone();
        let bus = self.bus.clone();
        let task_id_owned = task_id.to_string();

        let handle = tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                tracing::error!(task_id = %task_id_owned, error = %e, "runner failed");
                let _ = db.update_task_status(&task_id_owned, TaskStatus::Failed);
                if let Err(append_err) = bus::record_and_publish(&db, &bus, Envelope::TaskFailed { task_id: task_id_owned.clone(), reason: e.to_string() }) {
                    tracing::error!(task_id = %task_id_owned, error = %append_err, "failed to record task_failed event");
                }
            }
        });

        if let Ok(mut active) = self.active.lock() {
            active.insert(task_id.to_string(), ActiveRunner { pause, cancel, handle });
        }
    }
}

/// Enumerate markdown QA files under `workspace.qa_targets`, relative to
/// `workspace.root_path`, in stable alphabetical order (SPEC_FULL.md §4.G
/// step 2). Directories are walked recursively; any target directory that
/// doesn't exist yet contributes nothing rather than erroring.
fn discover_qa_files(workspace: &WorkspaceConfig) -> Vec<String> {
    let root = PathBuf::from(&workspace.root_path);
    let mut targets = workspace.qa_targets.clone();
    targets.sort();

    let mut found = Vec::new();
    for target in &targets {
        let target_dir = root.join(target);
        walk_markdown_files(&root, &target_dir, &mut found);
    }
    found.sort();
    found
}

fn walk_markdown_files(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            walk_markdown_files(root, &path, out);
        } else if path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("md")).unwrap_or(false) {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, AgentGroupConfig, AgentTemplates, LoopConfig, LoopGuardConfig, LoopMode, OrchestratorConfig, StepConfig, StepType, WorkflowConfig};
    use std::fs;

    fn sample_config(root: &std::path::Path) -> OrchestratorConfig {
        let mut workspaces = HashMap::new();
        workspaces.insert(
            "ws1".to_string(),
            WorkspaceConfig { root_path: root.to_string_lossy().to_string(), qa_targets: vec!["qa".to_string()], ticket_dir: "tickets".to_string() },
        );

        let mut agents = HashMap::new();
        agents.insert(
            "agent-a".to_string(),
            AgentConfig {
                templates: AgentTemplates { init_once: None, qa: Some("exit 0".into()), fix: None, retest: None, loop_guard: None },
            },
        );

        let mut agent_groups = HashMap::new();
        agent_groups.insert("group1".to_string(), AgentGroupConfig { agents: vec!["agent-a".to_string()] });

        let mut workflows = HashMap::new();
        workflows.insert(
            "wf1".to_string(),
            WorkflowConfig {
                steps: vec![StepConfig {
                    id: "qa".into(),
                    step_type: StepType::Qa,
                    enabled: true,
                    agent_group_id: Some("group1".into()),
                    prehook: None,
                }],
                loop_: LoopConfig { mode: LoopMode::Once, guard: LoopGuardConfig { enabled: false, stop_when_no_unresolved: true, max_cycles: None, agent_group_id: None } },
                finalize: None,
            },
        );

        OrchestratorConfig {
            defaults: DefaultsConfig { workspace: "ws1".into(), workflow: "wf1".into() },
            workspaces,
            agents,
            agent_groups,
            workflows,
            ..Default::default()
        }
    }

    fn make_coordinator(root: &std::path::Path) -> Coordinator {
        let db = Database::open_in_memory().unwrap();
        let config_path = root.join("config.yaml");
        let manager = ConfigManager::load(config_path, db.clone()).unwrap();
        let config = sample_config(root);
        manager.save_from_form(config, "test").unwrap();

        Coordinator::new(db, Arc::new(EventBus::new()), Arc::new(manager), root.to_path_buf())
    }

    #[test]
    fn discover_qa_files_finds_markdown_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("qa/nested")).unwrap();
        fs::write(tmp.path().join("qa/b.md"), "").unwrap();
        fs::write(tmp.path().join("qa/a.md"), "").unwrap();
        fs::write(tmp.path().join("qa/nested/c.md"), "").unwrap();
        fs::write(tmp.path().join("qa/ignored.txt"), "").unwrap();

        let workspace = WorkspaceConfig { root_path: tmp.path().to_string_lossy().to_string(), qa_targets: vec!["qa".to_string()], ticket_dir: "tickets".into() };
        let found = discover_qa_files(&workspace);

        assert_eq!(found, vec!["qa/a.md".to_string(), "qa/b.md".to_string(), "qa/nested/c.md".to_string()]);
    }

    #[tokio::test]
    async fn create_task_with_empty_target_files_discovers_from_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("qa")).unwrap();
        fs::write(tmp.path().join("qa/suite.md"), "").unwrap();
        fs::create_dir_all(tmp.path().join("tickets")).unwrap();

        let coordinator = make_coordinator(tmp.path());
        let task = coordinator.create_task(CreateTaskRequest::default()).unwrap();

        let details = coordinator.get_task_details(&task.id).unwrap();
        assert_eq!(details.items.len(), 1);
        assert_eq!(details.items[0].qa_file_path, "qa/suite.md");
    }

    #[tokio::test]
    async fn start_task_on_running_task_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("qa")).unwrap();
        fs::write(tmp.path().join("qa/suite.md"), "").unwrap();
        fs::create_dir_all(tmp.path().join("tickets")).unwrap();

        let coordinator = make_coordinator(tmp.path());
        let task = coordinator.create_task(CreateTaskRequest::default()).unwrap();
        coordinator.start_task(&task.id).await.unwrap();

        let events_before = coordinator.get_task_details(&task.id).unwrap().events.len();
        let started_again = coordinator.start_task(&task.id).await.unwrap();
        assert_eq!(started_again.status, TaskStatus::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events_after = coordinator.get_task_details(&task.id).unwrap().events.len();
        assert!(events_after >= events_before);
    }

    #[tokio::test]
    async fn pause_task_without_active_runner_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = make_coordinator(tmp.path());
        let task = coordinator.create_task(CreateTaskRequest::default()).unwrap();

        let err = coordinator.pause_task(&task.id).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn delete_task_removes_task_and_items() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("qa")).unwrap();
        fs::write(tmp.path().join("qa/suite.md"), "").unwrap();
        fs::create_dir_all(tmp.path().join("tickets")).unwrap();

        let coordinator = make_coordinator(tmp.path());
        let task = coordinator.create_task(CreateTaskRequest::default()).unwrap();
        coordinator.delete_task(&task.id).await.unwrap();

        assert!(coordinator.get_task_details(&task.id).is_err());
    }
}
