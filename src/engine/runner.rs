use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::{AgentConfig, AgentGroupConfig, RunnerConfig, StepConfig, StepType, WorkflowConfig, WorkspaceConfig};
use crate::db::{CommandRun, Database, ItemStatus, Phase, Task, TaskItem, TaskStatus};
use crate::db::runs::CreateRunParams;
use crate::engine::bus::{Envelope, EventBus};
use crate::engine::error::EngineError;
use crate::engine::health::HealthTracker;
use crate::engine::logstream::{self, RunLogFiles};
use crate::engine::predicate::{self, Bindings, Value};
use crate::engine::process::{CancelToken, ProcessSupervisor};

/// A run's exit code hasn't been observed this cycle yet. Used as the
/// predicate binding for phases that have not executed — this is what lets
/// `fix_exit_code == 0` evaluate to `false` rather than error out when fix
/// was skipped this cycle (§9 Open Question on ticket matching doesn't cover
/// this, but the same "absent identifier reads as a sentinel, not an error"
/// posture follows from the S1 scenario's stated expectation).
const NOT_RUN_SENTINEL: i64 = -1;

const STEP_ORDER: [StepType; 4] = [StepType::Qa, StepType::TicketScan, StepType::Fix, StepType::Retest];

/// Everything the runner needs about the task's config, captured as a
/// snapshot at task creation so a mid-run config edit never changes
/// behavior underneath an in-flight task.
#[derive(Debug, Clone)]
pub struct RunnerConfigSnapshot {
    pub runner: RunnerConfig,
    pub workspace: WorkspaceConfig,
    pub workflow: WorkflowConfig,
    pub agents: HashMap<String, AgentConfig>,
    pub agent_groups: HashMap<String, AgentGroupConfig>,
}

/// Snapshot of a single step evaluation's context, used both to evaluate the
/// predicate and to build the projected payload for `step_prehook_evaluated`.
struct StepContext {
    cycle: i64,
    active_ticket_count: i64,
    new_ticket_count: i64,
    qa_exit_code: i64,
    fix_exit_code: i64,
    retest_exit_code: i64,
    qa_failed: bool,
    fix_required: bool,
}

impl StepContext {
    fn bindings(&self) -> Bindings {
        Bindings::new()
            .with("cycle", Value::Int(self.cycle))
            .with("active_ticket_count", Value::Int(self.active_ticket_count))
            .with("new_ticket_count", Value::Int(self.new_ticket_count))
            .with("qa_exit_code", Value::Int(self.qa_exit_code))
            .with("fix_exit_code", Value::Int(self.fix_exit_code))
            .with("retest_exit_code", Value::Int(self.retest_exit_code))
            .with("qa_failed", Value::Bool(self.qa_failed))
            .with("fix_required", Value::Bool(self.fix_required))
    }

    /// Projection of the context limited to identifiers the expression
    /// actually references (SPEC_FULL.md §4.G step 5).
    fn projection(&self, expr: &str) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        let mut maybe_insert = |name: &str, value: serde_json::Value| {
            if expr.contains(name) {
                map.insert(name.to_string(), value);
            }
        };
        maybe_insert("cycle", json!(self.cycle));
        maybe_insert("active_ticket_count", json!(self.active_ticket_count));
        maybe_insert("new_ticket_count", json!(self.new_ticket_count));
        maybe_insert("qa_exit_code", json!(self.qa_exit_code));
        maybe_insert("fix_exit_code", json!(self.fix_exit_code));
        maybe_insert("retest_exit_code", json!(self.retest_exit_code));
        maybe_insert("qa_failed", json!(self.qa_failed));
        maybe_insert("fix_required", json!(self.fix_required));
        serde_json::Value::Object(map)
    }
}

enum Decision {
    Run,
    Skip(Option<String>),
    Error(String),
}

/// Match ticket files to task items by the stem-prefix rule: a ticket
/// filename belongs to the item whose `qa_file_path` stem it starts with
/// (§9 Open Question resolution). Each ticket maps to at most one item —
/// the first matching item in iteration order wins.
pub fn match_tickets_to_items(ticket_files: &[PathBuf], items: &[TaskItem]) -> HashMap<String, Vec<String>> {
    let mut result: HashMap<String, Vec<String>> = HashMap::new();
    for item in items {
        result.insert(item.id.clone(), Vec::new());
    }

    for ticket in ticket_files {
        let ticket_name = match ticket.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };

        for item in items {
            let stem = Path::new(&item.qa_file_path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("");
            if !stem.is_empty() && ticket_name.starts_with(stem) {
                result.get_mut(&item.id).unwrap().push(ticket.to_string_lossy().to_string());
                break;
            }
        }
    }

    result
}

/// Render a `{{var}}` template against the five supported variable names.
/// Flat substitution only, no conditionals or loops (§4.G implementation
/// note) — anything outside the supported set is a template error.
pub fn render_template(template: &str, vars: &HashMap<&str, String>) -> Result<String, EngineError> {
    let mut output = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| EngineError::TemplateError("unterminated {{".to_string()))?;
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| EngineError::TemplateError(name.to_string()))?;
        output.push_str(value);
        rest = &after[end + 2..];
    }

    output.push_str(rest);
    Ok(output)
}

/// Drives a single task's workflow to completion. One `Runner` per task,
/// spawned as a `tokio::task` by the coordinator (§4.H); owns the
/// pause/cancel signals the coordinator flips from outside.
pub struct Runner {
    task_id: String,
    db: Database,
    bus: Arc<EventBus>,
    health: Arc<HealthTracker>,
    config: RunnerConfigSnapshot,
    data_root: PathBuf,
    pause: Arc<AtomicBool>,
    cancel: CancelToken,
}

impl Runner {
    pub fn new(
        task_id: String,
        db: Database,
        bus: Arc<EventBus>,
        health: Arc<HealthTracker>,
        config: RunnerConfigSnapshot,
        data_root: PathBuf,
        pause: Arc<AtomicBool>,
        cancel: CancelToken,
    ) -> Self {
        Self { task_id, db, bus, health, config, data_root, pause, cancel }
    }

    pub async fn run(&self) -> Result<(), EngineError> {
        let task = self.db.get_task(&self.task_id)?;
        let items = self.db.list_task_items(&self.task_id)?;

        if items.is_empty() {
            self.db.update_task_status(&self.task_id, TaskStatus::Completed)?;
            crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::TaskCompleted { task_id: self.task_id.clone() })?;
            return Ok(());
        }

        if let Some(init_step) = self.config.workflow.steps.iter().find(|s| matches!(s.step_type, StepType::InitOnce))
        {
            if init_step.enabled && !self.init_once_already_ran(&items[0])? {
                self.run_init_once(init_step, &items[0], &task).await?;
            }
        }

        let mut cycle: i64 = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.pause.load(Ordering::SeqCst) {
                self.db.update_task_status(&self.task_id, TaskStatus::Paused)?;
                crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::TaskPaused { task_id: self.task_id.clone() })?;
                return Ok(());
            }

            let items = self.db.list_task_items(&self.task_id)?;
            for item in &items {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                if self.pause.load(Ordering::SeqCst) {
                    self.db.update_task_status(&self.task_id, TaskStatus::Paused)?;
                    crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::TaskPaused { task_id: self.task_id.clone() })?;
                    return Ok(());
                }
                if item.status.is_terminal() {
                    continue;
                }
                self.run_item_cycle(item, cycle, &task).await?;
            }

            self.apply_finalize_rules(cycle)?;

            match self.config.workflow.loop_.mode {
                crate::config::LoopMode::Once => break,
                crate::config::LoopMode::Infinite => {
                    let stop = self.evaluate_loop_guard(cycle, &task).await?;
                    if stop {
                        break;
                    }
                    cycle += 1;
                }
            }
        }

        self.finalize_task_status()?;
        Ok(())
    }

    fn init_once_already_ran(&self, first_item: &TaskItem) -> Result<bool, EngineError> {
        let runs = self.db.list_runs_for_item(&first_item.id)?;
        Ok(runs.iter().any(|r| r.phase == Phase::InitOnce))
    }

    async fn run_init_once(&self, step: &StepConfig, item: &TaskItem, task: &Task) -> Result<(), EngineError> {
        let Some(group_id) = &step.agent_group_id else {
            return Ok(());
        };
        let Some(agent_id) = self.pick_agent(group_id) else {
            return Ok(());
        };
        let Some(template) = self.template_for(&agent_id, StepType::InitOnce) else {
            return Ok(());
        };

        let vars = self.template_vars(item, task, 0);
        let command = render_template(&template, &vars)?;
        let _ = self.execute_command(item, Phase::InitOnce, &agent_id, &command).await?;
        Ok(())
    }

    async fn run_item_cycle(&self, item: &TaskItem, cycle: i64, task: &Task) -> Result<(), EngineError> {
        crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::ItemStarted {
            task_id: self.task_id.clone(),
            task_item_id: item.id.clone(),
        })?;

        for step_type in STEP_ORDER {
            let Some(step) = self.config.workflow.steps.iter().find(|s| same_step_type(&s.step_type, step_type))
            else {
                continue;
            };

            let current = self.db.get_task_item(&item.id)?;
            let ctx = self.build_context(&current, cycle)?;

            if !step.enabled {
                self.emit_prehook(&current, step, Decision::Skip(Some("disabled".to_string())), &ctx)?;
                continue;
            }

            let decision = match &step.prehook {
                None => Decision::Run,
                Some(p) => match predicate::eval(&p.when, &ctx.bindings()) {
                    Ok(true) => Decision::Run,
                    Ok(false) => Decision::Skip(p.reason.clone()),
                    Err(e) => Decision::Error(e.to_string()),
                },
            };

            self.emit_prehook(&current, step, clone_decision(&decision), &ctx)?;

            match decision {
                Decision::Skip(_) => continue,
                Decision::Error(msg) => {
                    self.db.update_item_status(&current.id, ItemStatus::Unresolved, Some(&msg))?;
                    crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::ItemStatusChanged {
                        task_id: self.task_id.clone(),
                        task_item_id: current.id.clone(),
                        status: ItemStatus::Unresolved.as_str().to_string(),
                    })?;
                    break;
                }
                Decision::Run => {
                    if matches!(step_type, StepType::TicketScan) {
                        self.run_builtin_ticket_scan(&current)?;
                    } else {
                        let should_abort = self.run_agent_step(&current, step, step_type, task, cycle).await?;
                        if should_abort {
                            break;
                        }
                    }
                }
            }
        }

        let reloaded = self.db.get_task_item(&item.id)?;
        if reloaded.status == ItemStatus::Pending {
            self.db.update_item_status(&reloaded.id, ItemStatus::Skipped, None)?;
            crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::ItemStatusChanged {
                task_id: self.task_id.clone(),
                task_item_id: reloaded.id.clone(),
                status: ItemStatus::Skipped.as_str().to_string(),
            })?;
        }

        Ok(())
    }

    fn emit_prehook(&self, item: &TaskItem, step: &StepConfig, decision: Decision, ctx: &StepContext) -> Result<(), EngineError> {
        let expr = step.prehook.as_ref().map(|p| p.when.clone());
        let (decision_str, reason) = match decision {
            Decision::Run => ("run".to_string(), None),
            Decision::Skip(reason) => ("skip".to_string(), reason),
            Decision::Error(msg) => ("error".to_string(), Some(msg)),
        };
        let projection = expr.as_deref().map(|e| ctx.projection(e)).unwrap_or(serde_json::Value::Null);

        self.db.append_event(&crate::db::events::AppendEventParams {
            task_id: self.task_id.clone(),
            task_item_id: Some(item.id.clone()),
            event_type: "step_prehook_evaluated".to_string(),
            payload: json!({
                "phase": step_type_str(&step.step_type),
                "expression": expr,
                "decision": decision_str,
                "reason": reason,
                "context": projection,
            }),
        })?;

        self.bus.publish(Envelope::StepPrehookEvaluated {
            task_id: self.task_id.clone(),
            task_item_id: item.id.clone(),
            phase: step_type_str(&step.step_type).to_string(),
            expression: expr,
            decision: decision_str,
            reason,
        });

        Ok(())
    }

    fn build_context(&self, item: &TaskItem, cycle: i64) -> Result<StepContext, EngineError> {
        let runs = self.db.list_runs_for_item(&item.id)?;
        let qa_exit_code = latest_exit_code(&runs, Phase::Qa).unwrap_or(NOT_RUN_SENTINEL);
        let fix_exit_code = latest_exit_code(&runs, Phase::Fix).unwrap_or(NOT_RUN_SENTINEL);
        let retest_exit_code = latest_exit_code(&runs, Phase::Retest).unwrap_or(NOT_RUN_SENTINEL);

        Ok(StepContext {
            cycle,
            active_ticket_count: item.ticket_files.len() as i64,
            new_ticket_count: item.ticket_files.len() as i64,
            qa_exit_code,
            fix_exit_code,
            retest_exit_code,
            qa_failed: qa_exit_code != 0 && qa_exit_code != NOT_RUN_SENTINEL,
            fix_required: item.fix_required,
        })
    }

    fn pick_agent(&self, group_id: &str) -> Option<String> {
        let group = self.config.agent_groups.get(group_id)?;
        self.health.pick(group_id, &group.agents)
    }

    fn template_for(&self, agent_id: &str, step_type: StepType) -> Option<String> {
        let agent = self.config.agents.get(agent_id)?;
        match step_type {
            StepType::InitOnce => agent.templates.init_once.clone(),
            StepType::Qa => agent.templates.qa.clone(),
            StepType::Fix => agent.templates.fix.clone(),
            StepType::Retest => agent.templates.retest.clone(),
            StepType::TicketScan => None,
        }
    }

    fn template_vars(&self, item: &TaskItem, task: &Task, cycle: i64) -> HashMap<&str, String> {
        let mut vars = HashMap::new();
        vars.insert("workspace_root", self.config.workspace.root_path.clone());
        vars.insert("qa_file", item.qa_file_path.clone());
        vars.insert("ticket_dir", self.config.workspace.ticket_dir.clone());
        vars.insert("task_goal", task.goal.clone());
        vars.insert("cycle", cycle.to_string());
        vars
    }

    /// Runs one of `qa`/`fix`/`retest`. Returns `true` if the item's step
    /// chain should abort for this cycle (unresolved termination).
    async fn run_agent_step(
        &self,
        item: &TaskItem,
        step: &StepConfig,
        step_type: StepType,
        task: &Task,
        cycle: i64,
    ) -> Result<bool, EngineError> {
        let Some(group_id) = &step.agent_group_id else {
            self.db.update_item_status(&item.id, ItemStatus::Unresolved, Some("step has no agent_group_id"))?;
            return Ok(true);
        };

        let Some(agent_id) = self.pick_agent(group_id) else {
            crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::RunFinished {
                task_id: self.task_id.clone(),
                task_item_id: item.id.clone(),
                run_id: String::new(),
                exit_code: Some(-2),
                interrupted: false,
            })?;
            self.db.update_item_status(&item.id, ItemStatus::Unresolved, Some("no_agent_available"))?;
            crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::ItemStatusChanged {
                task_id: self.task_id.clone(),
                task_item_id: item.id.clone(),
                status: ItemStatus::Unresolved.as_str().to_string(),
            })?;
            return Ok(true);
        };

        let Some(template) = self.template_for(&agent_id, step_type) else {
            self.db.update_item_status(&item.id, ItemStatus::Unresolved, Some("agent has no template for step"))?;
            return Ok(true);
        };

        let vars = self.template_vars(item, task, cycle);
        let command = match render_template(&template, &vars) {
            Ok(c) => c,
            Err(e) => {
                self.db.update_item_status(&item.id, ItemStatus::Unresolved, Some(&e.to_string()))?;
                return Ok(true);
            }
        };

        let running_status = match step_type {
            StepType::Qa => ItemStatus::QaRunning,
            StepType::Fix => ItemStatus::FixRunning,
            StepType::Retest => ItemStatus::RetestRunning,
            StepType::InitOnce | StepType::TicketScan => unreachable!(),
        };
        self.db.update_item_status(&item.id, running_status, None)?;
        crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::ItemStatusChanged {
            task_id: self.task_id.clone(),
            task_item_id: item.id.clone(),
            status: running_status.as_str().to_string(),
        })?;

        let phase = match step_type {
            StepType::Qa => Phase::Qa,
            StepType::Fix => Phase::Fix,
            StepType::Retest => Phase::Retest,
            _ => unreachable!(),
        };

        let outcome = self.execute_command(item, phase, &agent_id, &command).await?;

        if matches!(step_type, StepType::Qa | StepType::Fix | StepType::Retest) {
            self.rescan_tickets(item)?;
        }

        let exit_code = outcome.exit_code;
        if exit_code == Some(0) {
            self.health.report_success(&self.task_id, &agent_id)?;
        } else {
            self.health.report_failure(&self.task_id, &agent_id)?;
        }

        let next_status = match (step_type, exit_code) {
            (StepType::Qa, Some(0)) => ItemStatus::QaPassed,
            (StepType::Qa, _) => ItemStatus::QaFailed,
            (StepType::Fix, Some(0)) => ItemStatus::Fixed,
            (StepType::Fix, _) => ItemStatus::Unresolved,
            (StepType::Retest, Some(0)) => ItemStatus::Verified,
            (StepType::Retest, _) => ItemStatus::Unresolved,
            _ => unreachable!(),
        };

        self.db.update_item_status(&item.id, next_status, None)?;
        crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::ItemStatusChanged {
            task_id: self.task_id.clone(),
            task_item_id: item.id.clone(),
            status: next_status.as_str().to_string(),
        })?;

        Ok(matches!(next_status, ItemStatus::Unresolved))
    }

    async fn execute_command(
        &self,
        item: &TaskItem,
        phase: Phase,
        agent_id: &str,
        command: &str,
    ) -> Result<crate::engine::process::ProcessOutcome, EngineError> {
        let run = self.db.create_run(&CreateRunParams {
            task_item_id: item.id.clone(),
            phase,
            command: command.to_string(),
            cwd: self.config.workspace.root_path.clone(),
            agent_id: Some(agent_id.to_string()),
            stdout_path: None,
            stderr_path: None,
        })?;

        crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::RunStarted {
            task_id: self.task_id.clone(),
            task_item_id: item.id.clone(),
            run_id: run.id.clone(),
            phase: phase.as_str().to_string(),
        })?;

        let files = RunLogFiles::open(&self.data_root, &self.task_id, &run.id)
            .map_err(|e| EngineError::NotFound(format!("failed to open log files: {e}")))?;
        let files = Arc::new(std::sync::Mutex::new(files));

        let on_line = logstream::make_line_sink(
            self.bus.clone(),
            files,
            self.task_id.clone(),
            run.id.clone(),
            phase.as_str().to_string(),
        );

        let cwd = PathBuf::from(&self.config.workspace.root_path);
        let command_owned = command.to_string();
        let cancel = self.cancel.clone();
        let shell = self.config.runner.shell.clone();
        let shell_arg = self.config.runner.shell_arg.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            ProcessSupervisor::run_with_shell(&command_owned, &shell, &shell_arg, &cwd, &[], &cancel, None, Some(on_line))
        })
        .await
        .map_err(|e| EngineError::NotFound(format!("runner task join error: {e}")))??;

        self.db.finalize_run(&run.id, outcome.exit_code, outcome.interrupted)?;
        crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::RunFinished {
            task_id: self.task_id.clone(),
            task_item_id: item.id.clone(),
            run_id: run.id.clone(),
            exit_code: outcome.exit_code,
            interrupted: outcome.interrupted,
        })?;

        Ok(outcome)
    }

    fn run_builtin_ticket_scan(&self, item: &TaskItem) -> Result<(), EngineError> {
        let run = self.db.create_run(&CreateRunParams {
            task_item_id: item.id.clone(),
            phase: Phase::TicketScan,
            command: "<builtin ticket_scan>".to_string(),
            cwd: self.config.workspace.root_path.clone(),
            agent_id: None,
            stdout_path: None,
            stderr_path: None,
        })?;
        self.db.finalize_run(&run.id, Some(0), false)?;
        self.rescan_tickets(item)?;
        Ok(())
    }

    fn rescan_tickets(&self, item: &TaskItem) -> Result<(), EngineError> {
        let ticket_dir = Path::new(&self.config.workspace.root_path).join(&self.config.workspace.ticket_dir);
        let entries = list_ticket_files(&ticket_dir);
        let items = self.db.list_task_items(&self.task_id)?;
        let matched = match_tickets_to_items(&entries, &items);
        if let Some(files) = matched.get(&item.id) {
            self.db.update_item_ticket_files(&item.id, files)?;
        }
        Ok(())
    }

    fn apply_finalize_rules(&self, cycle: i64) -> Result<(), EngineError> {
        let Some(finalize) = &self.config.workflow.finalize else { return Ok(()) };
        let items = self.db.list_task_items(&self.task_id)?;

        for item in &items {
            let ctx = self.build_context(item, cycle)?;
            for rule in &finalize.rules {
                match predicate::eval(&rule.when, &ctx.bindings()) {
                    Ok(true) => {
                        if let Some(status) = ItemStatus::from_str(&rule.status) {
                            self.db.update_item_status(&item.id, status, rule.reason.as_deref())?;
                            crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::ItemFinalizeEvaluated {
                                task_id: self.task_id.clone(),
                                task_item_id: item.id.clone(),
                                rule_id: rule.id.clone(),
                                status: status.as_str().to_string(),
                                reason: rule.reason.clone(),
                            })?;
                        }
                        break;
                    }
                    Ok(false) => continue,
                    Err(_) => continue,
                }
            }
        }

        Ok(())
    }

    async fn evaluate_loop_guard(&self, cycle: i64, task: &Task) -> Result<bool, EngineError> {
        let guard = &self.config.workflow.loop_.guard;
        if !guard.enabled {
            return Ok(true);
        }

        let items = self.db.list_task_items(&self.task_id)?;
        if guard.stop_when_no_unresolved {
            let none_unresolved = items
                .iter()
                .all(|i| !matches!(i.status, ItemStatus::Unresolved | ItemStatus::QaFailed) && !i.fix_required);
            if none_unresolved {
                return Ok(true);
            }
        }

        if let Some(max_cycles) = guard.max_cycles {
            if cycle >= max_cycles as i64 {
                return Ok(true);
            }
        }

        let Some(group_id) = &guard.agent_group_id else {
            return Ok(false);
        };
        let Some(agent_id) = self.pick_agent(group_id) else {
            return Ok(true);
        };
        let Some(template) = self.config.agents.get(&agent_id).and_then(|a| a.templates.loop_guard.clone()) else {
            return Ok(false);
        };

        let first_item = &items[0];
        let vars = self.template_vars(first_item, task, cycle);
        let command = render_template(&template, &vars)?;
        let outcome = self.execute_command(first_item, Phase::LoopGuard, &agent_id, &command).await?;

        Ok(outcome.exit_code != Some(0))
    }

    fn finalize_task_status(&self) -> Result<(), EngineError> {
        let items = self.db.list_task_items(&self.task_id)?;
        let all_ok = items.iter().all(|i| {
            matches!(i.status, ItemStatus::QaPassed | ItemStatus::Fixed | ItemStatus::Verified | ItemStatus::Skipped)
        });
        let any_bad = items.iter().any(|i| matches!(i.status, ItemStatus::Unresolved | ItemStatus::QaFailed));

        if any_bad && !all_ok {
            self.db.update_task_status(&self.task_id, TaskStatus::Failed)?;
            crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::TaskFailed {
                task_id: self.task_id.clone(),
                reason: "one or more items unresolved".to_string(),
            })?;
        } else {
            self.db.update_task_status(&self.task_id, TaskStatus::Completed)?;
            crate::engine::bus::record_and_publish(&self.db, &self.bus, Envelope::TaskCompleted { task_id: self.task_id.clone() })?;
        }

        Ok(())
    }
}

fn same_step_type(a: &StepType, b: StepType) -> bool {
    matches!(
        (a, b),
        (StepType::Qa, StepType::Qa)
            | (StepType::TicketScan, StepType::TicketScan)
            | (StepType::Fix, StepType::Fix)
            | (StepType::Retest, StepType::Retest)
            | (StepType::InitOnce, StepType::InitOnce)
    )
}

fn step_type_str(t: &StepType) -> &'static str {
    match t {
        StepType::InitOnce => "init_once",
        StepType::Qa => "qa",
        StepType::TicketScan => "ticket_scan",
        StepType::Fix => "fix",
        StepType::Retest => "retest",
    }
}

fn clone_decision(d: &Decision) -> Decision {
    match d {
        Decision::Run => Decision::Run,
        Decision::Skip(r) => Decision::Skip(r.clone()),
        Decision::Error(e) => Decision::Error(e.clone()),
    }
}

fn latest_exit_code(runs: &[CommandRun], phase: Phase) -> Option<i64> {
    runs.iter()
        .rev()
        .find(|r| r.phase == phase)
        .and_then(|r| r.exit_code)
        .map(|c| c as i64)
}

fn list_ticket_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, qa_file_path: &str) -> TaskItem {
        TaskItem {
            id: id.to_string(),
            task_id: "t1".to_string(),
            ordinal: 0,
            qa_file_path: qa_file_path.to_string(),
            status: ItemStatus::Pending,
            ticket_files: vec![],
            fix_required: false,
            last_error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn match_tickets_to_items_uses_stem_prefix_rule() {
        let items = vec![item("i1", "qa/suite-a.md"), item("i2", "qa/suite-b.md")];
        let tickets = vec![
            PathBuf::from("tickets/suite-a-001.md"),
            PathBuf::from("tickets/suite-b-001.md"),
            PathBuf::from("tickets/suite-a-002.md"),
        ];

        let matched = match_tickets_to_items(&tickets, &items);
        assert_eq!(matched["i1"].len(), 2);
        assert_eq!(matched["i2"].len(), 1);
    }

    #[test]
    fn match_tickets_to_items_ignores_unmatched_files() {
        let items = vec![item("i1", "qa/suite-a.md")];
        let tickets = vec![PathBuf::from("tickets/unrelated.md")];

        let matched = match_tickets_to_items(&tickets, &items);
        assert!(matched["i1"].is_empty());
    }

    #[test]
    fn render_template_substitutes_known_variables() {
        let mut vars = HashMap::new();
        vars.insert("qa_file", "qa/a.md".to_string());
        vars.insert("cycle", "1".to_string());

        let rendered = render_template("run {{qa_file}} cycle {{cycle}}", &vars).unwrap();
        assert_eq!(rendered, "run qa/a.md cycle 1");
    }

    #[test]
    fn render_template_errors_on_unknown_variable() {
        let vars = HashMap::new();
        let err = render_template("run {{bogus}}", &vars).unwrap_err();
        assert!(matches!(err, EngineError::TemplateError(_)));
    }

    #[test]
    fn render_template_passes_through_literal_text() {
        let vars = HashMap::new();
        let rendered = render_template("no variables here", &vars).unwrap();
        assert_eq!(rendered, "no variables here");
    }
}
