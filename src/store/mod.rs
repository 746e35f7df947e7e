//! SQLite-backed persistence for agentbox runtime data.
//!
//! One database per workspace, one writer per process. The store is the
//! durable record; the in-memory task DB is a derived index. WAL mode and
//! foreign keys are enabled at open. All timestamps are written by the
//! application as RFC 3339 text so ordering comparisons stay stable.

mod attempt;
mod journal;
mod quality;
mod report;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, instrument};

pub use attempt::Attempt;
pub use journal::{JournalEntry, JournalQuery};
pub use quality::{QualitySnapshot, ResourceUsage};
pub use report::{DashboardData, ReviewResultRow, SprintReportRow, TaskStats};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// A supervisor session row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Session {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub repo_url: String,
    pub branch_name: String,
    pub status: String,
    pub config_json: String,
}

/// A task row. JSON-bearing columns hold serialized payloads the caller
/// validates on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub session_id: i64,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: i32,
    pub complexity: u32,
    pub parent_id: String,
    pub max_attempts: u32,
    pub context_notes: String,
    pub acceptance_criteria_json: String,
    pub tags_json: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// SQLite-backed persistence layer.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database at `path` and run migrations.
    ///
    /// A database carrying a schema version newer than this build fails
    /// with an explicit "newer schema" error.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;

        // journal_mode returns a result row, so query instead of execute.
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
            .context("set WAL mode")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate().context("run migrations")?;
        debug!("store opened");
        Ok(store)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store mutex poisoned"))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        let has_version_table: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("check schema version table")?;

        if has_version_table.is_none() {
            conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![CURRENT_SCHEMA_VERSION],
            )
            .context("record schema version")?;
            return Ok(());
        }

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .context("read schema version")?;

        if version > CURRENT_SCHEMA_VERSION {
            bail!(
                "database has newer schema version {version} (this build supports {CURRENT_SCHEMA_VERSION})"
            );
        }
        if version < CURRENT_SCHEMA_VERSION {
            // Sequential forward migrations land here as the schema grows.
            bail!("schema version {version} is older than {CURRENT_SCHEMA_VERSION} and no migration path exists");
        }
        Ok(())
    }

    /// Current schema version as recorded in the database.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .context("read schema version")
    }

    // --- Sessions ---

    /// Insert a session with status `running` and return its id.
    pub fn create_session(&self, repo_url: &str, branch_name: &str, config_json: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (started_at, repo_url, branch_name, status, config_json)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![Utc::now(), repo_url, branch_name, config_json],
        )
        .context("create session")?;
        Ok(conn.last_insert_rowid())
    }

    /// Set the session status. Transitions are unchecked; the supervisor
    /// owns the policy.
    pub fn update_session_status(&self, id: i64, status: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![status, id],
        )
        .context("update session status")?;
        Ok(())
    }

    pub fn get_session(&self, id: i64) -> Result<Session> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, started_at, repo_url, branch_name, status, COALESCE(config_json, '')
             FROM sessions WHERE id = ?1",
            params![id],
            session_from_row,
        )
        .optional()
        .context("query session")?
        .ok_or_else(|| anyhow!("session {id} not found"))
    }

    pub fn latest_session(&self) -> Result<Session> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, started_at, repo_url, branch_name, status, COALESCE(config_json, '')
             FROM sessions ORDER BY id DESC LIMIT 1",
            [],
            session_from_row,
        )
        .optional()
        .context("query latest session")?
        .ok_or_else(|| anyhow!("no sessions found"))
    }

    // --- Tasks ---

    /// Insert a task. Fails if the identifier is already present.
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, session_id, title, description, status, priority, complexity,
             parent_id, max_attempts, context_notes, acceptance_criteria_json, tags_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULLIF(?8, ''), ?9, ?10, ?11, ?12, ?13)",
            params![
                task.id,
                task.session_id,
                task.title,
                task.description,
                task.status,
                task.priority,
                task.complexity,
                task.parent_id,
                task.max_attempts,
                task.context_notes,
                task.acceptance_criteria_json,
                task.tags_json,
                task.created_at,
            ],
        )
        .with_context(|| format!("insert task {}", task.id))?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()
        .context("query task")?
        .ok_or_else(|| anyhow!("task {id} not found"))
    }

    /// Set a task's status, stamping completed_at iff completed.
    pub fn update_task_status(&self, task_id: &str, status: &str) -> Result<()> {
        let conn = self.conn()?;
        if status == "completed" {
            conn.execute(
                "UPDATE tasks SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status, Utc::now(), task_id],
            )
        } else {
            conn.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2",
                params![status, task_id],
            )
        }
        .with_context(|| format!("update status of task {task_id}"))?;
        Ok(())
    }

    pub fn update_task_context_notes(&self, task_id: &str, context_notes: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET context_notes = ?1 WHERE id = ?2",
            params![context_notes, task_id],
        )
        .with_context(|| format!("update context notes of task {task_id}"))?;
        Ok(())
    }

    /// All tasks for a session, ordered by (priority asc, created_at asc).
    pub fn list_tasks(&self, session_id: i64) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{TASK_COLUMNS} FROM tasks WHERE session_id = ?1 ORDER BY priority ASC, created_at ASC"
        ))?;
        let tasks = stmt
            .query_map(params![session_id], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("list tasks")?;
        Ok(tasks)
    }

    /// Add a dependency edge. Idempotent; acyclicity is the task DB's
    /// responsibility before the write reaches here.
    pub fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
            params![task_id, depends_on],
        )
        .with_context(|| format!("add dependency {task_id} -> {depends_on}"))?;
        Ok(())
    }

    /// Upstream identifiers of a task.
    pub fn get_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on",
        )?;
        let deps = stmt
            .query_map(params![task_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("query dependencies")?;
        Ok(deps)
    }

    /// All dependency edges for a session, keyed by task id.
    pub fn get_all_dependencies(
        &self,
        session_id: i64,
    ) -> Result<std::collections::BTreeMap<String, Vec<String>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT td.task_id, td.depends_on FROM task_dependencies td
             JOIN tasks t ON td.task_id = t.id WHERE t.session_id = ?1
             ORDER BY td.task_id, td.depends_on",
        )?;
        let mut deps: std::collections::BTreeMap<String, Vec<String>> = Default::default();
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (task_id, depends_on) = row.context("scan dependency edge")?;
            deps.entry(task_id).or_default().push(depends_on);
        }
        Ok(deps)
    }

    /// SQL mirror of the in-memory scheduler, used when the task DB is not
    /// available: the highest-priority unblocked pending/in_progress task
    /// that has not exhausted its attempt budget.
    pub fn next_task(&self, session_id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "{TASK_COLUMNS} FROM tasks t
                 WHERE t.session_id = ?1
                   AND t.status IN ('pending', 'in_progress')
                   AND NOT EXISTS (
                       SELECT 1 FROM task_dependencies td
                       JOIN tasks dep ON td.depends_on = dep.id
                       WHERE td.task_id = t.id AND dep.status != 'completed'
                   )
                   AND (
                       SELECT COUNT(*) FROM attempts a WHERE a.task_id = t.id
                   ) < t.max_attempts
                 ORDER BY t.priority ASC, t.created_at ASC
                 LIMIT 1"
            ),
            params![session_id],
            task_from_row,
        )
        .optional()
        .context("query next task")
    }

    /// Number of recorded attempts for a task.
    pub fn task_attempt_count(&self, task_id: &str) -> Result<u32> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM attempts WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .context("count attempts")
    }
}

const TASK_COLUMNS: &str = "SELECT id, session_id, title, description, status, priority,
 complexity, COALESCE(parent_id, ''), max_attempts, COALESCE(context_notes, ''),
 COALESCE(acceptance_criteria_json, ''), COALESCE(tags_json, ''), created_at, completed_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        started_at: row.get(1)?,
        repo_url: row.get(2)?,
        branch_name: row.get(3)?,
        status: row.get(4)?,
        config_json: row.get(5)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        complexity: row.get(6)?,
        parent_id: row.get(7)?,
        max_attempts: row.get(8)?,
        context_notes: row.get(9)?,
        acceptance_criteria_json: row.get(10)?,
        tags_json: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}
