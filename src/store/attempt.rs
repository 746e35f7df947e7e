//! Attempt rows and transcript storage.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::Store;

/// A single execution of a task by a named agent. `success` is tri-state:
/// `None` while the attempt is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attempt {
    pub id: i64,
    pub task_id: String,
    pub session_id: i64,
    /// 1-based, monotonic per task.
    pub number: u32,
    pub agent_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error_msg: String,
    pub git_commit: String,
    pub git_rollback: String,
    pub tokens_used: u64,
    pub duration_ms: u64,
}

impl Store {
    /// Insert an attempt and return its synthetic id.
    pub fn record_attempt(&self, attempt: &Attempt) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO attempts (task_id, session_id, number, agent_name, started_at,
             completed_at, success, error_msg, git_commit, git_rollback, tokens_used, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                attempt.task_id,
                attempt.session_id,
                attempt.number,
                attempt.agent_name,
                attempt.started_at.unwrap_or_else(Utc::now),
                attempt.completed_at,
                attempt.success,
                attempt.error_msg,
                attempt.git_commit,
                attempt.git_rollback,
                attempt.tokens_used,
                attempt.duration_ms,
            ],
        )
        .with_context(|| format!("record attempt for task {}", attempt.task_id))?;
        Ok(conn.last_insert_rowid())
    }

    /// Update the outcome fields of an attempt once it finishes.
    pub fn finish_attempt(
        &self,
        attempt_id: i64,
        success: bool,
        error_msg: &str,
        duration_ms: u64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE attempts SET success = ?1, error_msg = ?2, duration_ms = ?3, completed_at = ?4
             WHERE id = ?5",
            params![success, error_msg, duration_ms, Utc::now(), attempt_id],
        )
        .with_context(|| format!("finish attempt {attempt_id}"))?;
        Ok(())
    }

    /// All attempts for a task, ordered by attempt number.
    pub fn get_attempts(&self, task_id: &str) -> Result<Vec<Attempt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, session_id, number, agent_name, started_at, completed_at,
             success, COALESCE(error_msg, ''), COALESCE(git_commit, ''),
             COALESCE(git_rollback, ''), tokens_used, duration_ms
             FROM attempts WHERE task_id = ?1 ORDER BY number ASC",
        )?;
        let attempts = stmt
            .query_map(params![task_id], attempt_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query attempts")?;
        Ok(attempts)
    }

    /// Store the full agent transcript for an attempt.
    pub fn save_transcript(&self, attempt_id: i64, transcript: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE attempts SET transcript = ?1 WHERE id = ?2",
            params![transcript, attempt_id],
        )
        .with_context(|| format!("save transcript for attempt {attempt_id}"))?;
        Ok(())
    }

    /// Retrieve an attempt's transcript. Empty string when none was saved.
    pub fn get_transcript(&self, attempt_id: i64) -> Result<String> {
        let conn = self.conn()?;
        let transcript: Option<Option<String>> = conn
            .query_row(
                "SELECT transcript FROM attempts WHERE id = ?1",
                params![attempt_id],
                |row| row.get(0),
            )
            .optional()
            .context("query transcript")?;
        match transcript {
            Some(value) => Ok(value.unwrap_or_default()),
            None => Err(anyhow!("attempt {attempt_id} not found")),
        }
    }
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<Attempt> {
    Ok(Attempt {
        id: row.get(0)?,
        task_id: row.get(1)?,
        session_id: row.get(2)?,
        number: row.get(3)?,
        agent_name: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        success: row.get(7)?,
        error_msg: row.get(8)?,
        git_commit: row.get(9)?,
        git_rollback: row.get(10)?,
        tokens_used: row.get(11)?,
        duration_ms: row.get(12)?,
    })
}
