use crate::db::{parse_datetime, Database, DbError};
use crate::db::models::{CommandRun, Phase};

/// Parameters for recording the start of a command invocation.
#[derive(Debug, Clone)]
pub struct CreateRunParams {
    pub task_item_id: String,
    pub phase: Phase,
    pub command: String,
    pub cwd: String,
    pub agent_id: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<CommandRun> {
    let phase_str: String = row.get(2)?;
    Ok(CommandRun {
        id: row.get(0)?,
        task_item_id: row.get(1)?,
        phase: Phase::from_str(&phase_str).unwrap_or(Phase::Custom),
        command: row.get(3)?,
        cwd: row.get(4)?,
        agent_id: row.get(5)?,
        exit_code: row.get(6)?,
        stdout_path: row.get(7)?,
        stderr_path: row.get(8)?,
        interrupted: row.get::<_, i64>(9)? != 0,
        started_at: parse_datetime(row.get(10)?),
        ended_at: row.get::<_, Option<String>>(11)?.map(parse_datetime),
    })
}

const RUN_COLUMNS: &str = "id, task_item_id, phase, command, cwd, agent_id, exit_code, \
    stdout_path, stderr_path, interrupted, started_at, ended_at";

impl Database {
    pub fn create_run(&self, params: &CreateRunParams) -> Result<CommandRun, DbError> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = chrono::Utc::now();

            conn.execute(
                r#"INSERT INTO command_runs
                   (id, task_item_id, phase, command, cwd, agent_id, stdout_path, stderr_path, started_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                rusqlite::params![
                    id,
                    params.task_item_id,
                    params.phase.as_str(),
                    params.command,
                    params.cwd,
                    params.agent_id,
                    params.stdout_path,
                    params.stderr_path,
                    now.to_rfc3339(),
                ],
            )?;

            Ok(CommandRun {
                id,
                task_item_id: params.task_item_id.clone(),
                phase: params.phase,
                command: params.command.clone(),
                cwd: params.cwd.clone(),
                agent_id: params.agent_id.clone(),
                exit_code: None,
                stdout_path: params.stdout_path.clone(),
                stderr_path: params.stderr_path.clone(),
                interrupted: false,
                started_at: now,
                ended_at: None,
            })
        })
    }

    /// Close out a run that has observed process exit. Never call this twice
    /// for the same run: command_runs are append-only once `ended_at` is set.
    pub fn finalize_run(&self, run_id: &str, exit_code: Option<i32>, interrupted: bool) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let now = chrono::Utc::now().to_rfc3339();
            let affected = conn.execute(
                "UPDATE command_runs SET exit_code = ?, interrupted = ?, ended_at = ? WHERE id = ?",
                rusqlite::params![exit_code, interrupted, now, run_id],
            )?;
            if affected == 0 {
                return Err(DbError::NotFound(format!("CommandRun {}", run_id)));
            }
            Ok(())
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<CommandRun, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM command_runs WHERE id = ?"))?;
            stmt.query_row([run_id], row_to_run).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("CommandRun {}", run_id)),
                other => DbError::Sqlite(other),
            })
        })
    }

    pub fn list_runs_for_item(&self, task_item_id: &str) -> Result<Vec<CommandRun>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM command_runs WHERE task_item_id = ? ORDER BY started_at ASC"
            ))?;
            let runs = stmt
                .query_map([task_item_id], row_to_run)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }

    /// Most recent runs across every item belonging to `task_id`, used by
    /// `stream_task_logs`. Ordered most-recent-first, capped at `limit`.
    pub fn list_recent_runs_for_task(&self, task_id: &str, limit: u32) -> Result<Vec<CommandRun>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"SELECT {RUN_COLUMNS} FROM command_runs
                   WHERE task_item_id IN (SELECT id FROM task_items WHERE task_id = ?)
                   ORDER BY started_at DESC LIMIT ?"#
            ))?;
            let runs = stmt
                .query_map(rusqlite::params![task_id, limit], row_to_run)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tasks::CreateTaskParams;

    fn create_test_item(db: &Database) -> String {
        let task = db
            .create_task(&CreateTaskParams {
                name: "t".into(),
                goal: "".into(),
                workspace_id: "w".into(),
                workflow_id: "f".into(),
                config_snapshot_json: "{}".into(),
            })
            .unwrap();
        let items = db.create_task_items(&task.id, &["qa/a.md".into()]).unwrap();
        items[0].id.clone()
    }

    fn sample_run_params(item_id: &str) -> CreateRunParams {
        CreateRunParams {
            task_item_id: item_id.to_string(),
            phase: Phase::Qa,
            command: "echo passed".to_string(),
            cwd: "/tmp".to_string(),
            agent_id: Some("agent-a".to_string()),
            stdout_path: Some("/tmp/out.log".to_string()),
            stderr_path: Some("/tmp/err.log".to_string()),
        }
    }

    #[test]
    fn create_and_get_run() {
        let db = Database::open_in_memory().unwrap();
        let item_id = create_test_item(&db);

        let run = db.create_run(&sample_run_params(&item_id)).unwrap();
        assert!(run.exit_code.is_none());
        assert!(run.ended_at.is_none());

        let fetched = db.get_run(&run.id).unwrap();
        assert_eq!(fetched.phase, Phase::Qa);
        assert_eq!(fetched.command, "echo passed");
    }

    #[test]
    fn finalize_run_sets_exit_code_and_ended_at() {
        let db = Database::open_in_memory().unwrap();
        let item_id = create_test_item(&db);
        let run = db.create_run(&sample_run_params(&item_id)).unwrap();

        db.finalize_run(&run.id, Some(0), false).unwrap();

        let fetched = db.get_run(&run.id).unwrap();
        assert_eq!(fetched.exit_code, Some(0));
        assert!(!fetched.interrupted);
        assert!(fetched.ended_at.is_some());
        assert!(fetched.ended_at.unwrap() >= fetched.started_at);
    }

    #[test]
    fn list_recent_runs_for_task_orders_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let item_id = create_test_item(&db);
        let first = db.create_run(&sample_run_params(&item_id)).unwrap();
        let second = db.create_run(&sample_run_params(&item_id)).unwrap();

        let task_id = db.get_task_item(&item_id).unwrap().task_id;
        let runs = db.list_recent_runs_for_task(&task_id, 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].id, first.id);
    }

    #[test]
    fn get_run_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_run("nope"), Err(DbError::NotFound(_))));
    }
}
