//! Sprint report and review result persistence, plus the dashboard export.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{JournalEntry, JournalQuery, ResourceUsage, Session, Store};

/// A persisted sprint retrospective. Patterns and recommendations cross the
/// persistence boundary as JSON strings.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize)]
pub struct SprintReportRow {
    pub id: i64,
    pub session_id: i64,
    pub sprint_number: u32,
    pub start_iteration: u32,
    pub end_iteration: u32,
    pub tasks_attempted: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub velocity: f64,
    pub quality_trend: String,
    pub test_pass_rate: f64,
    pub patterns_json: String,
    pub recommendations_json: String,
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A persisted review gate outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReviewResultRow {
    pub id: i64,
    pub session_id: i64,
    pub sprint: u32,
    pub review_agent: String,
    pub findings_json: String,
    pub summary: String,
    pub approved: bool,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Task counts per status for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct TaskStats {
    pub total: u32,
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub failed: u32,
    pub deferred: u32,
}

/// Aggregated session view for human display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DashboardData {
    pub session: Session,
    pub task_stats: TaskStats,
    pub total_usage: ResourceUsage,
    pub quality_trend: String,
    pub test_pass_rate: f64,
    pub sprint_reports: Vec<SprintReportRow>,
    pub recent_journal: Vec<JournalEntry>,
}

impl Store {
    /// Insert a sprint report.
    pub fn save_sprint_report(&self, report: &SprintReportRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sprint_reports (session_id, sprint_number, start_iteration,
             end_iteration, tasks_attempted, tasks_completed, tasks_failed, velocity,
             quality_trend, test_pass_rate, patterns_json, recommendations_json,
             total_tokens, duration_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                report.session_id,
                report.sprint_number,
                report.start_iteration,
                report.end_iteration,
                report.tasks_attempted,
                report.tasks_completed,
                report.tasks_failed,
                report.velocity,
                report.quality_trend,
                report.test_pass_rate,
                report.patterns_json,
                report.recommendations_json,
                report.total_tokens,
                report.duration_ms,
                Utc::now(),
            ],
        )
        .context("save sprint report")?;
        Ok(())
    }

    /// All sprint reports for a session in ascending sprint order.
    pub fn sprint_reports(&self, session_id: i64) -> Result<Vec<SprintReportRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sprint_number, start_iteration, end_iteration,
             tasks_attempted, tasks_completed, tasks_failed, velocity,
             COALESCE(quality_trend, ''), test_pass_rate, COALESCE(patterns_json, ''),
             COALESCE(recommendations_json, ''), total_tokens, duration_ms, timestamp
             FROM sprint_reports WHERE session_id = ?1 ORDER BY sprint_number ASC",
        )?;
        let reports = stmt
            .query_map(params![session_id], sprint_report_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query sprint reports")?;
        Ok(reports)
    }

    /// Insert a review result.
    pub fn save_review_result(&self, result: &ReviewResultRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO review_results (session_id, sprint, review_agent, findings_json,
             summary, approved, reviewed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.session_id,
                result.sprint,
                result.review_agent,
                result.findings_json,
                result.summary,
                result.approved,
                result.reviewed_at.unwrap_or_else(Utc::now),
            ],
        )
        .context("save review result")?;
        Ok(())
    }

    /// All review results for a session in insertion order.
    pub fn review_results(&self, session_id: i64) -> Result<Vec<ReviewResultRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sprint, review_agent, COALESCE(findings_json, ''),
             summary, approved, reviewed_at
             FROM review_results WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let results = stmt
            .query_map(params![session_id], |row| {
                Ok(ReviewResultRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    sprint: row.get(2)?,
                    review_agent: row.get(3)?,
                    findings_json: row.get(4)?,
                    summary: row.get(5)?,
                    approved: row.get(6)?,
                    reviewed_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query review results")?;
        Ok(results)
    }

    /// Task counts per status for a session.
    pub fn task_stats(&self, session_id: i64) -> Result<TaskStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM tasks WHERE session_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut stats = TaskStats::default();
        for row in rows {
            let (status, count) = row.context("scan task stats")?;
            stats.total += count;
            match status.as_str() {
                "pending" => stats.pending = count,
                "in_progress" => stats.in_progress = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "deferred" => stats.deferred = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Aggregate everything the dashboard needs for a session.
    pub fn export_dashboard_data(&self, session_id: i64) -> Result<DashboardData> {
        let session = self.get_session(session_id)?;
        let task_stats = self.task_stats(session_id)?;
        let total_usage = self.total_usage(session_id)?;
        let quality_trend = self.quality_trend(session_id, 10)?;
        let test_pass_rate = self.test_pass_rate(session_id, 10)?;
        let sprint_reports = self.sprint_reports(session_id)?;
        let recent_journal = self.journal_entries(
            session_id,
            &JournalQuery {
                limit: Some(5),
                ..JournalQuery::default()
            },
        )?;

        Ok(DashboardData {
            session,
            task_stats,
            total_usage,
            quality_trend,
            test_pass_rate,
            sprint_reports,
            recent_journal,
        })
    }
}

fn sprint_report_from_row(row: &Row<'_>) -> rusqlite::Result<SprintReportRow> {
    Ok(SprintReportRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        sprint_number: row.get(2)?,
        start_iteration: row.get(3)?,
        end_iteration: row.get(4)?,
        tasks_attempted: row.get(5)?,
        tasks_completed: row.get(6)?,
        tasks_failed: row.get(7)?,
        velocity: row.get(8)?,
        quality_trend: row.get(9)?,
        test_pass_rate: row.get(10)?,
        patterns_json: row.get(11)?,
        recommendations_json: row.get(12)?,
        total_tokens: row.get(13)?,
        duration_ms: row.get(14)?,
        timestamp: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::QualitySnapshot;
    use crate::test_support::{insert_store_task, open_store};

    #[test]
    fn sprint_reports_come_back_in_sprint_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");

        for sprint_number in [2, 1, 3] {
            store
                .save_sprint_report(&SprintReportRow {
                    session_id: session,
                    sprint_number,
                    start_iteration: 1,
                    end_iteration: 5,
                    velocity: 0.5,
                    quality_trend: "stable".to_string(),
                    ..SprintReportRow::default()
                })
                .expect("save");
        }

        let reports = store.sprint_reports(session).expect("reports");
        let numbers: Vec<u32> = reports.iter().map(|r| r.sprint_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn review_results_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");

        store
            .save_review_result(&ReviewResultRow {
                session_id: session,
                sprint: 1,
                review_agent: "claude".to_string(),
                findings_json: r#"[{"severity":"minor"}]"#.to_string(),
                summary: "looks fine".to_string(),
                approved: true,
                reviewed_at: None,
                ..ReviewResultRow::default()
            })
            .expect("save");

        let results = store.review_results(session).expect("results");
        assert_eq!(results.len(), 1);
        assert!(results[0].approved);
        assert_eq!(results[0].review_agent, "claude");
    }

    #[test]
    fn dashboard_aggregates_session_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "feat/x", "").expect("session");

        insert_store_task(&store, session, "t1", 1).expect("insert");
        insert_store_task(&store, session, "t2", 2).expect("insert");
        store.update_task_status("t1", "completed").expect("status");

        store
            .record_usage(&ResourceUsage {
                session_id: session,
                iteration: 1,
                container_time_ms: 100,
                estimated_tokens: 42,
                ..ResourceUsage::default()
            })
            .expect("usage");
        store
            .record_quality(&QualitySnapshot {
                session_id: session,
                overall_pass: true,
                test_total: 4,
                test_passed: 4,
                ..QualitySnapshot::default()
            })
            .expect("quality");
        store
            .save_sprint_report(&SprintReportRow {
                session_id: session,
                sprint_number: 1,
                ..SprintReportRow::default()
            })
            .expect("report");
        for iteration in 1..=7 {
            store
                .add_journal_entry(&JournalEntry {
                    session_id: session,
                    kind: "task_start".to_string(),
                    iteration,
                    ..JournalEntry::default()
                })
                .expect("journal");
        }

        let data = store.export_dashboard_data(session).expect("dashboard");
        assert_eq!(data.session.branch_name, "feat/x");
        assert_eq!(data.task_stats.total, 2);
        assert_eq!(data.task_stats.completed, 1);
        assert_eq!(data.task_stats.pending, 1);
        assert_eq!(data.total_usage.estimated_tokens, 42);
        assert_eq!(data.quality_trend, "stable");
        assert!((data.test_pass_rate - 1.0).abs() < 1e-9);
        assert_eq!(data.sprint_reports.len(), 1);
        assert_eq!(data.recent_journal.len(), 5);
    }
}
