//! Database schema definitions and migrations

pub const SCHEMA_VERSION: i32 = 2;

/// Initial schema creation SQL
pub const CREATE_TABLES: &str = r#"
-- Tasks table: one QA sprint driving a workflow over a set of files
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    goal TEXT NOT NULL DEFAULT '',
    workspace_id TEXT NOT NULL,
    workflow_id TEXT NOT NULL,
    config_snapshot_json TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN
        ('pending', 'running', 'paused', 'failed', 'completed', 'cancelled', 'interrupted')),
    total_items INTEGER NOT NULL DEFAULT 0,
    finished_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

-- Task items: one QA source file's row in a task's work queue
CREATE TABLE IF NOT EXISTS task_items (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    qa_file_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN
        ('pending', 'qa_running', 'qa_passed', 'qa_failed', 'fix_running',
         'fixed', 'retest_running', 'verified', 'unresolved', 'skipped')),
    ticket_files_json TEXT NOT NULL DEFAULT '[]',
    fix_required INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(task_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_task_items_task ON task_items(task_id);
CREATE INDEX IF NOT EXISTS idx_task_items_status ON task_items(status);

-- Command runs: one invocation of an external (or built-in) command
-- Note: agent_id intentionally omits an FK constraint since agents are
-- config entities, not rows in this database.
CREATE TABLE IF NOT EXISTS command_runs (
    id TEXT PRIMARY KEY NOT NULL,
    task_item_id TEXT NOT NULL REFERENCES task_items(id) ON DELETE CASCADE,
    phase TEXT NOT NULL CHECK(phase IN
        ('init_once', 'qa', 'ticket_scan', 'fix', 'retest', 'loop_guard', 'custom')),
    command TEXT NOT NULL,
    cwd TEXT NOT NULL,
    agent_id TEXT,
    exit_code INTEGER,
    stdout_path TEXT,
    stderr_path TEXT,
    interrupted INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    ended_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_command_runs_item ON command_runs(task_item_id);
CREATE INDEX IF NOT EXISTS idx_command_runs_phase ON command_runs(phase);

-- Events: append-only record of observable engine moments
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    task_item_id TEXT REFERENCES task_items(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);
CREATE INDEX IF NOT EXISTS idx_events_item ON events(task_item_id) WHERE task_item_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

-- Config versions: immutable snapshots of the full config document
CREATE TABLE IF NOT EXISTS config_versions (
    version INTEGER PRIMARY KEY,
    yaml TEXT NOT NULL,
    author TEXT NOT NULL DEFAULT 'local',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Migration SQL for schema version 2
/// Adds the interrupted flag to command_runs for crash-recovery bookkeeping
/// on databases created before this column existed.
pub const MIGRATION_V2: &str = r#"
ALTER TABLE command_runs ADD COLUMN interrupted INTEGER NOT NULL DEFAULT 0;
"#;
