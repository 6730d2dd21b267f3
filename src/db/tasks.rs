use crate::db::{parse_datetime, Database, DbError};
use crate::db::models::{Task, TaskStatus};

/// Parameters for creating a new task row. Target file resolution and
/// initial TaskItem creation happen one layer up, in the coordinator, since
/// they may require reading the workspace's filesystem.
#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub name: String,
    pub goal: String,
    pub workspace_id: String,
    pub workflow_id: String,
    pub config_snapshot_json: String,
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status_str: String = row.get(6)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        goal: row.get(2)?,
        workspace_id: row.get(3)?,
        workflow_id: row.get(4)?,
        config_snapshot_json: row.get(5)?,
        status: TaskStatus::from_str(&status_str).unwrap_or(TaskStatus::Failed),
        total_items: row.get(7)?,
        finished_items: row.get(8)?,
        failed_items: row.get(9)?,
        created_at: parse_datetime(row.get(10)?),
        updated_at: parse_datetime(row.get(11)?),
        started_at: row.get::<_, Option<String>>(12)?.map(parse_datetime),
        completed_at: row.get::<_, Option<String>>(13)?.map(parse_datetime),
    })
}

const TASK_COLUMNS: &str = "id, name, goal, workspace_id, workflow_id, config_snapshot_json, \
    status, total_items, finished_items, failed_items, created_at, updated_at, started_at, completed_at";

impl Database {
    pub fn create_task(&self, params: &CreateTaskParams) -> Result<Task, DbError> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = chrono::Utc::now();

            conn.execute(
                r#"INSERT INTO tasks (id, name, goal, workspace_id, workflow_id, config_snapshot_json, status, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                rusqlite::params![
                    id,
                    params.name,
                    params.goal,
                    params.workspace_id,
                    params.workflow_id,
                    params.config_snapshot_json,
                    TaskStatus::Pending.as_str(),
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;

            Ok(Task {
                id,
                name: params.name.clone(),
                goal: params.goal.clone(),
                workspace_id: params.workspace_id.clone(),
                workflow_id: params.workflow_id.clone(),
                config_snapshot_json: params.config_snapshot_json.clone(),
                status: TaskStatus::Pending,
                total_items: 0,
                finished_items: 0,
                failed_items: 0,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            })
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))?;
            stmt.query_row([task_id], row_to_task).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("Task {}", task_id)),
                other => DbError::Sqlite(other),
            })
        })
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC"
            ))?;
            let tasks = stmt
                .query_map([], row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Most recently created task with the given status, if any. Used by
    /// `bootstrap` to find an interrupted task to auto-resume.
    pub fn find_latest_task_by_status(&self, status: TaskStatus) -> Result<Option<Task>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY updated_at DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query_map([status.as_str()], row_to_task)?;
            rows.next().transpose().map_err(DbError::from)
        })
    }

    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let now = chrono::Utc::now().to_rfc3339();
            let started_at_clause = if status == TaskStatus::Running {
                ", started_at = COALESCE(started_at, ?2)"
            } else {
                ""
            };
            let completed_at_clause = if matches!(
                status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ) {
                ", completed_at = ?2"
            } else {
                ""
            };
            let sql = format!(
                "UPDATE tasks SET status = ?3, updated_at = ?2{started_at_clause}{completed_at_clause} WHERE id = ?1"
            );
            let affected = conn.execute(&sql, rusqlite::params![task_id, now, status.as_str()])?;
            if affected == 0 {
                return Err(DbError::NotFound(format!("Task {}", task_id)));
            }
            Ok(())
        })
    }

    pub fn update_task_counts(
        &self,
        task_id: &str,
        total_items: i64,
        finished_items: i64,
        failed_items: i64,
    ) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET total_items = ?, finished_items = ?, failed_items = ?, updated_at = datetime('now') WHERE id = ?",
                rusqlite::params![total_items, finished_items, failed_items, task_id],
            )?;
            Ok(())
        })
    }

    /// Cascade-delete a task and everything owned by it (items, runs, events).
    pub fn delete_task_cascade(&self, task_id: &str) -> Result<(), DbError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let affected = tx.execute("DELETE FROM tasks WHERE id = ?", [task_id])?;
            if affected == 0 {
                return Err(DbError::NotFound(format!("Task {}", task_id)));
            }
            tx.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn sample_params() -> CreateTaskParams {
        CreateTaskParams {
            name: "Sprint 1".to_string(),
            goal: "fix flaky suite".to_string(),
            workspace_id: "ws-1".to_string(),
            workflow_id: "wf-1".to_string(),
            config_snapshot_json: "{}".to_string(),
        }
    }

    #[test]
    fn create_and_get_task() {
        let db = create_test_db();
        let task = db.create_task(&sample_params()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let fetched = db.get_task(&task.id).unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.name, "Sprint 1");
    }

    #[test]
    fn get_task_not_found() {
        let db = create_test_db();
        let result = db.get_task("nope");
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[test]
    fn update_task_status_sets_started_and_completed() {
        let db = create_test_db();
        let task = db.create_task(&sample_params()).unwrap();

        db.update_task_status(&task.id, TaskStatus::Running).unwrap();
        let running = db.get_task(&task.id).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        db.update_task_status(&task.id, TaskStatus::Completed).unwrap();
        let completed = db.get_task(&task.id).unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.completed_at.is_some());
    }

    #[test]
    fn list_tasks_orders_newest_first() {
        let db = create_test_db();
        let first = db.create_task(&sample_params()).unwrap();
        let second = db.create_task(&sample_params()).unwrap();

        let tasks = db.list_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, second.id);
        assert_eq!(tasks[1].id, first.id);
    }

    #[test]
    fn delete_task_cascade_removes_task() {
        let db = create_test_db();
        let task = db.create_task(&sample_params()).unwrap();
        db.delete_task_cascade(&task.id).unwrap();
        assert!(matches!(db.get_task(&task.id), Err(DbError::NotFound(_))));
    }

    #[test]
    fn find_latest_task_by_status() {
        let db = create_test_db();
        let a = db.create_task(&sample_params()).unwrap();
        let b = db.create_task(&sample_params()).unwrap();
        db.update_task_status(&a.id, TaskStatus::Interrupted).unwrap();
        db.update_task_status(&b.id, TaskStatus::Interrupted).unwrap();

        let found = db.find_latest_task_by_status(TaskStatus::Interrupted).unwrap();
        assert_eq!(found.unwrap().id, b.id);
    }
}
