use crate::db::{parse_datetime, Database, DbError};
use crate::db::models::Event;

/// Parameters for appending a durable event record. `task_item_id` is `None`
/// for task-scoped events (e.g. `task_created`).
#[derive(Debug, Clone)]
pub struct AppendEventParams {
    pub task_id: String,
    pub task_item_id: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl Database {
    pub fn append_event(&self, params: &AppendEventParams) -> Result<Event, DbError> {
        self.with_conn(|conn| {
            let payload_json = serde_json::to_string(&params.payload).unwrap_or_else(|_| "{}".to_string());
            let now = chrono::Utc::now();

            conn.execute(
                r#"INSERT INTO events (task_id, task_item_id, event_type, payload_json, created_at)
                   VALUES (?, ?, ?, ?, ?)"#,
                rusqlite::params![
                    params.task_id,
                    params.task_item_id,
                    params.event_type,
                    payload_json,
                    now.to_rfc3339(),
                ],
            )?;

            let id = conn.last_insert_rowid();

            Ok(Event {
                id,
                task_id: params.task_id.clone(),
                task_item_id: params.task_item_id.clone(),
                event_type: params.event_type.clone(),
                payload: params.payload.clone(),
                created_at: now,
            })
        })
    }

    pub fn list_events_for_task(&self, task_id: &str) -> Result<Vec<Event>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"SELECT id, task_id, task_item_id, event_type, payload_json, created_at
                   FROM events WHERE task_id = ? ORDER BY id ASC"#,
            )?;

            let events = stmt
                .query_map([task_id], |row| {
                    let event_type: String = row.get(3)?;
                    let payload_json: String = row.get(4)?;
                    let payload: serde_json::Value =
                        serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null);

                    Ok(Event {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        task_item_id: row.get(2)?,
                        event_type,
                        payload,
                        created_at: parse_datetime(row.get(5)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(events)
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
    fn append_and_list_events() {
        let db = Database::open_in_memory().unwrap();
        let task_id = create_test_task(&db);

        let event = db
            .append_event(&AppendEventParams {
                task_id: task_id.clone(),
                task_item_id: None,
                event_type: "task_created".to_string(),
                payload: serde_json::json!({"name": "Sprint 1"}),
            })
            .unwrap();

        assert_eq!(event.event_type, "task_created");

        let events = db.list_events_for_task(&task_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
        assert_eq!(events[0].payload["name"], "Sprint 1");
    }

    #[test]
    fn events_are_ordered_by_insertion() {
        let db = Database::open_in_memory().unwrap();
        let task_id = create_test_task(&db);

        for event_type in ["task_created", "task_started", "task_completed"] {
            db.append_event(&AppendEventParams {
                task_id: task_id.clone(),
                task_item_id: None,
                event_type: event_type.to_string(),
                payload: serde_json::Value::Null,
            })
            .unwrap();
        }

        let events = db.list_events_for_task(&task_id).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["task_created", "task_started", "task_completed"]);
    }
}
