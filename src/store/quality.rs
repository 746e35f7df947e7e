//! Quality snapshots, resource usage, and the derived trend queries.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use super::Store;

/// A per-iteration quality measurement. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QualitySnapshot {
    pub id: i64,
    pub session_id: i64,
    pub attempt_id: Option<i64>,
    pub iteration: u32,
    pub task_id: String,
    pub overall_pass: bool,
    pub checks_json: String,
    pub test_total: u32,
    pub test_passed: u32,
    pub test_failed: u32,
    pub test_skipped: u32,
    pub failed_tests_json: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A per-iteration resource usage record. Append-only; aggregates are
/// computed by query.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct ResourceUsage {
    pub id: i64,
    pub session_id: i64,
    pub attempt_id: Option<i64>,
    /// In `total_usage` this carries the usage-row count instead.
    pub iteration: u32,
    pub task_id: String,
    pub agent_name: String,
    pub container_time_ms: u64,
    pub estimated_tokens: u64,
}

impl Store {
    /// Append a quality snapshot.
    pub fn record_quality(&self, snapshot: &QualitySnapshot) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO quality_snapshots (session_id, attempt_id, iteration, task_id,
             overall_pass, checks_json, test_total, test_passed, test_failed, test_skipped,
             failed_tests_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                snapshot.session_id,
                snapshot.attempt_id,
                snapshot.iteration,
                snapshot.task_id,
                snapshot.overall_pass,
                snapshot.checks_json,
                snapshot.test_total,
                snapshot.test_passed,
                snapshot.test_failed,
                snapshot.test_skipped,
                snapshot.failed_tests_json,
                snapshot.timestamp.unwrap_or_else(Utc::now),
            ],
        )
        .context("record quality snapshot")?;
        Ok(())
    }

    /// Test pass rate over the most recent `last_n` snapshots:
    /// Σ passed / Σ total, or 0 with no data.
    pub fn test_pass_rate(&self, session_id: i64, last_n: u32) -> Result<f64> {
        let conn = self.conn()?;
        let (total, passed): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(test_total), 0), COALESCE(SUM(test_passed), 0)
             FROM (
                 SELECT test_total, test_passed FROM quality_snapshots
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![session_id, last_n],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("query test pass rate")?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(passed as f64 / total as f64)
    }

    /// Failure counts per test name over the most recent `last_n`
    /// snapshots. Rows whose failed-tests payload is not a JSON string
    /// array are skipped; the query never fails on bad payloads.
    pub fn failing_test_trend(&self, session_id: i64, last_n: u32) -> Result<BTreeMap<String, u32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT failed_tests_json FROM quality_snapshots
             WHERE session_id = ?1 AND failed_tests_json IS NOT NULL AND failed_tests_json != ''
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![session_id, last_n], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query failing tests")?;

        let mut counts = BTreeMap::new();
        for raw in rows {
            let tests: Vec<String> = match serde_json::from_str(&raw) {
                Ok(tests) => tests,
                Err(err) => {
                    debug!(%err, "skipping malformed failed_tests payload");
                    continue;
                }
            };
            for test in tests {
                *counts.entry(test).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Coarse trend over the most recent `last_n` snapshots: "improving",
    /// "stable", or "degrading".
    ///
    /// Snapshots are read newest-first and split into halves; with an odd
    /// count the middle sample goes to the older half to avoid biasing
    /// toward recency. Fewer than two samples is always "stable".
    pub fn quality_trend(&self, session_id: i64, last_n: u32) -> Result<String> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT overall_pass FROM quality_snapshots
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let results = stmt
            .query_map(params![session_id, last_n], |row| row.get::<_, bool>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query quality trend")?;

        if results.len() < 2 {
            return Ok("stable".to_string());
        }

        let recent_count = results.len() / 2;
        let older_count = results.len() - recent_count;
        let recent_passes = results[..recent_count].iter().filter(|p| **p).count();
        let older_passes = results[recent_count..].iter().filter(|p| **p).count();

        let recent_rate = recent_passes as f64 / recent_count as f64;
        let older_rate = older_passes as f64 / older_count as f64;

        if recent_rate > older_rate + 0.2 {
            Ok("improving".to_string())
        } else if recent_rate < older_rate - 0.2 {
            Ok("degrading".to_string())
        } else {
            Ok("stable".to_string())
        }
    }

    /// Append a resource usage record.
    pub fn record_usage(&self, usage: &ResourceUsage) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO resource_usage (session_id, attempt_id, iteration, task_id,
             agent_name, container_time_ms, estimated_tokens, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                usage.session_id,
                usage.attempt_id,
                usage.iteration,
                usage.task_id,
                usage.agent_name,
                usage.container_time_ms,
                usage.estimated_tokens,
                Utc::now(),
            ],
        )
        .context("record resource usage")?;
        Ok(())
    }

    /// Aggregate resource usage for a session. The `iteration` field of the
    /// result carries the usage-row count.
    pub fn total_usage(&self, session_id: i64) -> Result<ResourceUsage> {
        let conn = self.conn()?;
        let (container_time_ms, estimated_tokens, iterations): (u64, u64, u32) = conn
            .query_row(
                "SELECT COALESCE(SUM(container_time_ms), 0), COALESCE(SUM(estimated_tokens), 0),
                 COUNT(*) FROM resource_usage WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("query total usage")?;
        Ok(ResourceUsage {
            session_id,
            iteration: iterations,
            container_time_ms,
            estimated_tokens,
            ..ResourceUsage::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;

    fn snapshot(session_id: i64, pass: bool) -> QualitySnapshot {
        QualitySnapshot {
            session_id,
            overall_pass: pass,
            ..QualitySnapshot::default()
        }
    }

    fn seeded_store() -> (tempfile::TempDir, Store, i64) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");
        (temp, store, session)
    }

    #[test]
    fn pass_rate_sums_over_recent_snapshots() {
        let (_temp, store, session) = seeded_store();
        store
            .record_quality(&QualitySnapshot {
                test_total: 10,
                test_passed: 8,
                test_failed: 2,
                ..snapshot(session, false)
            })
            .expect("record");
        store
            .record_quality(&QualitySnapshot {
                test_total: 10,
                test_passed: 10,
                ..snapshot(session, true)
            })
            .expect("record");

        let rate = store.test_pass_rate(session, 10).expect("rate");
        assert!((rate - 0.9).abs() < 1e-9);
    }

    #[test]
    fn pass_rate_is_zero_without_snapshots() {
        let (_temp, store, session) = seeded_store();
        assert_eq!(store.test_pass_rate(session, 10).expect("rate"), 0.0);
    }

    #[test]
    fn failing_test_trend_counts_and_skips_malformed_payloads() {
        let (_temp, store, session) = seeded_store();
        store
            .record_quality(&QualitySnapshot {
                failed_tests_json: r#"["test_a","test_b"]"#.to_string(),
                ..snapshot(session, false)
            })
            .expect("record");
        store
            .record_quality(&QualitySnapshot {
                failed_tests_json: "{not json".to_string(),
                ..snapshot(session, false)
            })
            .expect("record");
        store
            .record_quality(&QualitySnapshot {
                failed_tests_json: r#"["test_a"]"#.to_string(),
                ..snapshot(session, false)
            })
            .expect("record");

        let trend = store.failing_test_trend(session, 10).expect("trend");
        assert_eq!(trend.get("test_a"), Some(&2));
        assert_eq!(trend.get("test_b"), Some(&1));
    }

    #[test]
    fn quality_trend_degrading_when_recent_half_fails() {
        let (_temp, store, session) = seeded_store();
        // Inserted oldest-first: passes first, then failures (most recent).
        for _ in 0..3 {
            store.record_quality(&snapshot(session, true)).expect("record");
        }
        for _ in 0..3 {
            store.record_quality(&snapshot(session, false)).expect("record");
        }
        assert_eq!(store.quality_trend(session, 6).expect("trend"), "degrading");
    }

    #[test]
    fn quality_trend_improving_when_recent_half_passes() {
        let (_temp, store, session) = seeded_store();
        for _ in 0..3 {
            store.record_quality(&snapshot(session, false)).expect("record");
        }
        for _ in 0..3 {
            store.record_quality(&snapshot(session, true)).expect("record");
        }
        assert_eq!(store.quality_trend(session, 6).expect("trend"), "improving");
    }

    #[test]
    fn quality_trend_stable_when_uniform_or_sparse() {
        let (_temp, store, session) = seeded_store();
        assert_eq!(store.quality_trend(session, 10).expect("trend"), "stable");

        store.record_quality(&snapshot(session, true)).expect("record");
        assert_eq!(store.quality_trend(session, 10).expect("trend"), "stable");

        for _ in 0..5 {
            store.record_quality(&snapshot(session, true)).expect("record");
        }
        assert_eq!(store.quality_trend(session, 10).expect("trend"), "stable");
    }

    #[test]
    fn quality_trend_odd_count_assigns_middle_to_older_half() {
        let (_temp, store, session) = seeded_store();
        // Oldest-first: fail, fail, pass, pass, pass. Newest-first this is
        // [pass, pass, pass, fail, fail]: recent half = 2 passes, older
        // half = 1 pass + 2 fails.
        store.record_quality(&snapshot(session, false)).expect("record");
        store.record_quality(&snapshot(session, false)).expect("record");
        for _ in 0..3 {
            store.record_quality(&snapshot(session, true)).expect("record");
        }
        assert_eq!(store.quality_trend(session, 5).expect("trend"), "improving");
    }

    #[test]
    fn total_usage_aggregates_and_counts_rows() {
        let (_temp, store, session) = seeded_store();
        store
            .record_usage(&ResourceUsage {
                session_id: session,
                iteration: 1,
                container_time_ms: 1000,
                estimated_tokens: 500,
                ..ResourceUsage::default()
            })
            .expect("record");
        store
            .record_usage(&ResourceUsage {
                session_id: session,
                iteration: 2,
                container_time_ms: 2000,
                estimated_tokens: 700,
                ..ResourceUsage::default()
            })
            .expect("record");

        let usage = store.total_usage(session).expect("usage");
        assert_eq!(usage.container_time_ms, 3000);
        assert_eq!(usage.estimated_tokens, 1200);
        assert_eq!(usage.iteration, 2);
    }
}
