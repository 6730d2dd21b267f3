pub mod schema;
pub mod models;
pub mod tasks;
pub mod task_items;
pub mod runs;
pub mod events;
pub mod config_versions;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use rusqlite::Connection;
use thiserror::Error;

pub use models::*;
pub use tasks::CreateTaskParams;
pub use runs::CreateRunParams;
use schema::{CREATE_TABLES, MIGRATION_V2, SCHEMA_VERSION};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Summary of the crash-recovery pass run on `Database::open`.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub tasks_marked_interrupted: usize,
    pub runs_marked_interrupted: usize,
}

impl Database {
    pub fn open(db_path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|_e| DbError::Validation(format!("Failed to create directory: {:?}", parent)))?;
        }

        let conn = Connection::open(&db_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;

        tracing::info!("Database opened at {:?}", db_path);
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), DbError> {
        let conn = self.conn.lock()
            .map_err(|e| DbError::Lock(e.to_string()))?;

        let current_version: i32 = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            tracing::info!(
                "Migrating database from version {} to {}",
                current_version,
                SCHEMA_VERSION
            );

            if current_version == 0 {
                conn.execute_batch(CREATE_TABLES)?;
            }

            if current_version < 2 && current_version > 0 {
                tracing::info!("Applying migration v2: interrupted column on command_runs");
                let _ = conn.execute_batch(MIGRATION_V2);
            }

            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?)",
                [SCHEMA_VERSION],
            )?;

            tracing::info!("Database migration complete");
        }

        Ok(())
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| DbError::Lock(e.to_string()))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DbError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| DbError::Lock(e.to_string()))?;
        f(&mut conn)
    }

    /// Crash-recovery pass run once at startup: any task left `running` from
    /// a previous process, and any command_run left with no `ended_at`, did
    /// not observe a clean shutdown. Mark both `interrupted` so the
    /// coordinator's `bootstrap` can decide whether to resume them.
    pub fn recover_interrupted(&self) -> Result<RecoveryReport, DbError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let runs_marked_interrupted = tx.execute(
                "UPDATE command_runs SET interrupted = 1 WHERE ended_at IS NULL",
                [],
            )?;

            let tasks_marked_interrupted = tx.execute(
                "UPDATE tasks SET status = 'interrupted', updated_at = datetime('now') WHERE status = 'running'",
                [],
            )?;

            tx.commit()?;

            Ok(RecoveryReport {
                tasks_marked_interrupted,
                runs_marked_interrupted,
            })
        })
    }
}

pub(crate) fn parse_datetime(s: String) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .with_conn(|conn| {
                conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
                    .map_err(DbError::from)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn recover_interrupted_marks_running_tasks() {
        let db = Database::open_in_memory().unwrap();
        let task = db
            .create_task(&CreateTaskParams {
                name: "t".into(),
                goal: "".into(),
                workspace_id: "w".into(),
                workflow_id: "f".into(),
                config_snapshot_json: "{}".into(),
            })
            .unwrap();
        db.update_task_status(&task.id, TaskStatus::Running).unwrap();

        let report = db.recover_interrupted().unwrap();
        assert_eq!(report.tasks_marked_interrupted, 1);

        let reloaded = db.get_task(&task.id).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Interrupted);
    }
}
