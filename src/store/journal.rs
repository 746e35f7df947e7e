//! Journal entry persistence.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::Store;

/// An append-only narrative record of the session.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct JournalEntry {
    pub id: i64,
    pub session_id: i64,
    pub kind: String,
    pub task_id: String,
    pub sprint: u32,
    pub iteration: u32,
    pub summary: String,
    pub reflection: String,
    /// 1-5 self-ratings; 0 means unset.
    pub confidence: u8,
    pub difficulty: u8,
    pub momentum: u8,
    pub duration_ms: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Filters for querying journal entries.
#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
    pub kind: Option<String>,
    pub sprint: Option<u32>,
    pub limit: Option<u32>,
}

impl Store {
    /// Append a journal entry. The timestamp is stamped at insert.
    pub fn add_journal_entry(&self, entry: &JournalEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO journal_entries (session_id, kind, task_id, sprint, iteration,
             summary, reflection, confidence, difficulty, momentum, duration_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.session_id,
                entry.kind,
                entry.task_id,
                entry.sprint,
                entry.iteration,
                entry.summary,
                entry.reflection,
                entry.confidence,
                entry.difficulty,
                entry.momentum,
                entry.duration_ms,
                entry.timestamp.unwrap_or_else(Utc::now),
            ],
        )
        .context("add journal entry")?;
        Ok(())
    }

    /// Journal entries for a session in ascending timestamp order,
    /// optionally filtered by kind, sprint, and limit.
    pub fn journal_entries(&self, session_id: i64, query: &JournalQuery) -> Result<Vec<JournalEntry>> {
        let mut sql = String::from(
            "SELECT id, session_id, kind, COALESCE(task_id, ''), sprint, iteration, summary,
             reflection, confidence, difficulty, momentum, duration_ms, timestamp
             FROM journal_entries WHERE session_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(session_id)];

        if let Some(kind) = &query.kind {
            sql.push_str(&format!(" AND kind = ?{}", args.len() + 1));
            args.push(Box::new(kind.clone()));
        }
        if let Some(sprint) = query.sprint {
            sql.push_str(&format!(" AND sprint = ?{}", args.len() + 1));
            args.push(Box::new(sprint));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
            args.push(Box::new(limit));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
        let entries = stmt
            .query_map(params, journal_entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query journal entries")?;
        Ok(entries)
    }
}

fn journal_entry_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: row.get(2)?,
        task_id: row.get(3)?,
        sprint: row.get(4)?,
        iteration: row.get(5)?,
        summary: row.get(6)?,
        reflection: row.get(7)?,
        confidence: row.get(8)?,
        difficulty: row.get(9)?,
        momentum: row.get(10)?,
        duration_ms: row.get(11)?,
        timestamp: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;

    fn entry(session_id: i64, kind: &str, sprint: u32, iteration: u32) -> JournalEntry {
        JournalEntry {
            session_id,
            kind: kind.to_string(),
            sprint,
            iteration,
            summary: format!("{kind} at iteration {iteration}"),
            reflection: "reflection".to_string(),
            ..JournalEntry::default()
        }
    }

    #[test]
    fn entries_come_back_in_ascending_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");

        for iteration in 1..=3 {
            store
                .add_journal_entry(&entry(session, "task_start", 1, iteration))
                .expect("add");
        }

        let entries = store
            .journal_entries(session, &JournalQuery::default())
            .expect("query");
        let iterations: Vec<u32> = entries.iter().map(|e| e.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
    }

    #[test]
    fn combined_filters_narrow_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");

        store.add_journal_entry(&entry(session, "task_start", 1, 1)).expect("add");
        store.add_journal_entry(&entry(session, "task_complete", 1, 1)).expect("add");
        store.add_journal_entry(&entry(session, "task_start", 2, 2)).expect("add");
        store.add_journal_entry(&entry(session, "sprint_retro", 2, 2)).expect("add");

        let entries = store
            .journal_entries(
                session,
                &JournalQuery {
                    kind: Some("task_start".to_string()),
                    sprint: Some(2),
                    limit: None,
                },
            )
            .expect("query");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sprint, 2);

        let limited = store
            .journal_entries(
                session,
                &JournalQuery {
                    limit: Some(2),
                    ..JournalQuery::default()
                },
            )
            .expect("query");
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn ratings_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");

        store
            .add_journal_entry(&JournalEntry {
                confidence: 4,
                difficulty: 2,
                momentum: 5,
                duration_ms: 1500,
                ..entry(session, "reflection", 0, 0)
            })
            .expect("add");

        let entries = store
            .journal_entries(session, &JournalQuery::default())
            .expect("query");
        assert_eq!(entries[0].confidence, 4);
        assert_eq!(entries[0].difficulty, 2);
        assert_eq!(entries[0].momentum, 5);
        assert_eq!(entries[0].duration_ms, 1500);
        assert!(entries[0].timestamp.is_some());
    }
}
