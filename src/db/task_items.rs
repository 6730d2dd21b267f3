use crate::db::{parse_datetime, Database, DbError};
use crate::db::models::{ItemStatus, TaskItem};

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<TaskItem> {
    let status_str: String = row.get(3)?;
    let ticket_files_json: String = row.get(4)?;
    Ok(TaskItem {
        id: row.get(0)?,
        task_id: row.get(1)?,
        ordinal: row.get(2)?,
        status: ItemStatus::from_str(&status_str).unwrap_or(ItemStatus::Unresolved),
        ticket_files: serde_json::from_str(&ticket_files_json).unwrap_or_default(),
        fix_required: row.get::<_, i64>(5)? != 0,
        last_error: row.get(6)?,
        qa_file_path: row.get(7)?,
        created_at: parse_datetime(row.get(8)?),
        updated_at: parse_datetime(row.get(9)?),
    })
}

const ITEM_COLUMNS: &str = "id, task_id, ordinal, status, ticket_files_json, fix_required, \
    last_error, qa_file_path, created_at, updated_at";

impl Database {
    /// Insert the initial work queue for a task, one row per QA file, in
    /// ordinal order. Runs inside a single transaction so a task never ends
    /// up with a partial item list.
    pub fn create_task_items(&self, task_id: &str, qa_file_paths: &[String]) -> Result<Vec<TaskItem>, DbError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = chrono::Utc::now();
            let mut items = Vec::with_capacity(qa_file_paths.len());

            for (ordinal, qa_file_path) in qa_file_paths.iter().enumerate() {
                let id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    r#"INSERT INTO task_items (id, task_id, ordinal, qa_file_path, status, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                    rusqlite::params![
                        id,
                        task_id,
                        ordinal as i64,
                        qa_file_path,
                        ItemStatus::Pending.as_str(),
                        now.to_rfc3339(),
                        now.to_rfc3339(),
                    ],
                )?;
                items.push(TaskItem {
                    id,
                    task_id: task_id.to_string(),
                    ordinal: ordinal as i64,
                    qa_file_path: qa_file_path.clone(),
                    status: ItemStatus::Pending,
                    ticket_files: vec![],
                    fix_required: false,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                });
            }

            tx.execute(
                "UPDATE tasks SET total_items = ? WHERE id = ?",
                rusqlite::params![qa_file_paths.len() as i64, task_id],
            )?;

            tx.commit()?;
            Ok(items)
        })
    }

    pub fn get_task_item(&self, item_id: &str) -> Result<TaskItem, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM task_items WHERE id = ?"))?;
            stmt.query_row([item_id], row_to_item).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("TaskItem {}", item_id)),
                other => DbError::Sqlite(other),
            })
        })
    }

    pub fn list_task_items(&self, task_id: &str) -> Result<Vec<TaskItem>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM task_items WHERE task_id = ? ORDER BY ordinal ASC"
            ))?;
            let items = stmt
                .query_map([task_id], row_to_item)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    pub fn update_item_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE task_items SET status = ?, last_error = ?, updated_at = datetime('now') WHERE id = ?",
                rusqlite::params![status.as_str(), last_error, item_id],
            )?;
            if affected == 0 {
                return Err(DbError::NotFound(format!("TaskItem {}", item_id)));
            }
            Ok(())
        })
    }

    pub fn update_item_ticket_files(&self, item_id: &str, ticket_files: &[String]) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let json = serde_json::to_string(ticket_files).unwrap_or_else(|_| "[]".to_string());
            conn.execute(
                "UPDATE task_items SET ticket_files_json = ?, fix_required = ?, updated_at = datetime('now') WHERE id = ?",
                rusqlite::params![json, !ticket_files.is_empty(), item_id],
            )?;
            Ok(())
        })
    }

    /// Reset an item back to `pending` for a retry, preserving ticket_files.
    pub fn retry_item(&self, item_id: &str) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE task_items SET status = ?, last_error = NULL, updated_at = datetime('now') WHERE id = ?",
                rusqlite::params![ItemStatus::Pending.as_str(), item_id],
            )?;
            if affected == 0 {
                return Err(DbError::NotFound(format!("TaskItem {}", item_id)));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tasks::CreateTaskParams;

    fn create_test_task(db: &Database) -> String {
        let task = db
            .create_task(&CreateTaskParams {
                name: "t".into(),
                goal: "".into(),
                workspace_id: "w".into(),
                workflow_id: "f".into(),
                config_snapshot_json: "{}".into(),
            })
            .unwrap();
        task.id
    }

    #[test]
    fn create_task_items_preserves_order() {
        let db = Database::open_in_memory().unwrap();
        let task_id = create_test_task(&db);

        let items = db
            .create_task_items(&task_id, &["qa/a.md".into(), "qa/b.md".into(), "qa/c.md".into()])
            .unwrap();

        assert_eq!(items.len(), 3);
        let fetched = db.list_task_items(&task_id).unwrap();
        assert_eq!(fetched[0].qa_file_path, "qa/a.md");
        assert_eq!(fetched[1].qa_file_path, "qa/b.md");
        assert_eq!(fetched[2].qa_file_path, "qa/c.md");
        assert_eq!(fetched[0].ordinal, 0);
        assert_eq!(fetched[2].ordinal, 2);

        let task = db.get_task(&task_id).unwrap();
        assert_eq!(task.total_items, 3);
    }

    #[test]
    fn update_item_status_and_ticket_files() {
        let db = Database::open_in_memory().unwrap();
        let task_id = create_test_task(&db);
        let items = db.create_task_items(&task_id, &["qa/a.md".into()]).unwrap();
        let item_id = &items[0].id;

        db.update_item_status(item_id, ItemStatus::QaFailed, Some("exit 1")).unwrap();
        db.update_item_ticket_files(item_id, &["tickets/a-001.md".into()]).unwrap();

        let item = db.get_task_item(item_id).unwrap();
        assert_eq!(item.status, ItemStatus::QaFailed);
        assert_eq!(item.last_error.as_deref(), Some("exit 1"));
        assert_eq!(item.ticket_files, vec!["tickets/a-001.md".to_string()]);
        assert!(item.fix_required);
    }

    #[test]
    fn retry_item_resets_status_and_clears_error() {
        let db = Database::open_in_memory().unwrap();
        let task_id = create_test_task(&db);
        let items = db.create_task_items(&task_id, &["qa/a.md".into()]).unwrap();
        let item_id = &items[0].id;

        db.update_item_status(item_id, ItemStatus::Unresolved, Some("boom")).unwrap();
        db.retry_item(item_id).unwrap();

        let item = db.get_task_item(item_id).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.last_error.is_none());
    }
}
