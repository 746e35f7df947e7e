//! Sprint retrospective analysis and pattern detection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{SprintReportRow, Store};

/// Category of a detected pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RepeatedFailure,
    SameTestFailing,
    QualityDegradation,
    Stuck,
    #[serde(other)]
    Unknown,
}

/// A pattern detected in the sprint data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    /// "high", "medium", or "low".
    pub severity: String,
}

/// Category of an adaptive action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ReorderTasks,
    SplitTask,
    SwitchAgent,
    Rollback,
    UpdateContext,
    Escalate,
    SkipTask,
    DeferTask,
    /// Unrecognized kinds deserialize here and are skipped by the
    /// controller (forward compatibility).
    #[serde(other)]
    Unknown,
}

/// A suggested action derived from detected patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: RecommendationKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    pub description: String,
    /// 1 = highest.
    #[serde(default)]
    pub priority: u8,
}

/// A sprint retrospective before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintReport {
    pub sprint_number: u32,
    pub start_iteration: u32,
    pub end_iteration: u32,
    pub tasks_attempted: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    /// completed / attempted.
    pub velocity: f64,
    pub quality_trend: String,
    pub test_pass_rate: f64,
    pub patterns: Vec<Pattern>,
    pub recommendations: Vec<Recommendation>,
    pub total_tokens: u64,
    #[serde(skip)]
    pub duration: Duration,
}

/// Performs retrospective analysis over a sprint's iteration window.
pub struct Analyzer {
    store: Arc<Store>,
    session_id: i64,
}

impl Analyzer {
    pub fn new(store: Arc<Store>, session_id: i64) -> Self {
        Self { store, session_id }
    }

    /// Analyze the iteration window [start_iter, end_iter].
    pub fn analyze(&self, sprint_num: u32, start_iter: u32, end_iter: u32) -> Result<SprintReport> {
        let tasks = self.store.list_tasks(self.session_id).context("list tasks")?;
        let window = end_iter.saturating_sub(start_iter) + 1;

        let mut attempted = Vec::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for task in &tasks {
            let Ok(attempts) = self.store.get_attempts(&task.id) else {
                continue;
            };
            for attempt in &attempts {
                if attempt.number >= start_iter && attempt.number <= end_iter {
                    push_unique(&mut attempted, &task.id);
                    if attempt.success == Some(true) {
                        push_unique(&mut completed, &task.id);
                    } else {
                        push_unique(&mut failed, &task.id);
                    }
                }
            }
        }

        let velocity = if attempted.is_empty() {
            0.0
        } else {
            completed.len() as f64 / attempted.len() as f64
        };

        let quality_trend = self
            .store
            .quality_trend(self.session_id, window)
            .unwrap_or_else(|_| "stable".to_string());
        let test_pass_rate = self.store.test_pass_rate(self.session_id, window).unwrap_or(0.0);
        let total_tokens = self
            .store
            .total_usage(self.session_id)
            .map(|u| u.estimated_tokens)
            .unwrap_or(0);

        let patterns = self.detect_patterns(&tasks, window, &quality_trend);
        let recommendations = generate_recommendations(&patterns);
        debug!(
            patterns = patterns.len(),
            recommendations = recommendations.len(),
            "retro analysis complete"
        );

        Ok(SprintReport {
            sprint_number: sprint_num,
            start_iteration: start_iter,
            end_iteration: end_iter,
            tasks_attempted: attempted.len() as u32,
            tasks_completed: completed.len() as u32,
            tasks_failed: failed.len() as u32,
            velocity,
            quality_trend,
            test_pass_rate,
            patterns,
            recommendations,
            total_tokens,
            duration: Duration::ZERO,
        })
    }

    fn detect_patterns(
        &self,
        tasks: &[crate::store::Task],
        window: u32,
        quality_trend: &str,
    ) -> Vec<Pattern> {
        let mut patterns = Vec::new();

        // Repeated failures on the same task.
        for task in tasks {
            let Ok(attempts) = self.store.get_attempts(&task.id) else {
                continue;
            };
            let fail_count = attempts.iter().filter(|a| a.success == Some(false)).count();
            if fail_count >= 2 {
                patterns.push(Pattern {
                    kind: PatternKind::RepeatedFailure,
                    description: format!("Task {:?} has failed {fail_count} times", task.title),
                    task_ids: vec![task.id.clone()],
                    tests: Vec::new(),
                    severity: severity_from_fail_count(fail_count).to_string(),
                });
            }
        }

        // The same test failing across snapshots.
        if let Ok(failing) = self.store.failing_test_trend(self.session_id, window) {
            for (test, count) in failing {
                if count >= 3 {
                    patterns.push(Pattern {
                        kind: PatternKind::SameTestFailing,
                        description: format!("Test {test:?} has failed in {count} snapshots"),
                        task_ids: Vec::new(),
                        tests: vec![test],
                        severity: "high".to_string(),
                    });
                }
            }
        }

        // Overall quality heading downward.
        if quality_trend == "degrading" {
            patterns.push(Pattern {
                kind: PatternKind::QualityDegradation,
                description: "Overall quality is degrading across iterations".to_string(),
                task_ids: Vec::new(),
                tests: Vec::new(),
                severity: "high".to_string(),
            });
        }

        // Stuck: the most recent attempts across every task all failed.
        // Deliberately considers all attempts, not just the window.
        if self.is_stuck(tasks) {
            patterns.push(Pattern {
                kind: PatternKind::Stuck,
                description: "Multiple consecutive iterations have failed".to_string(),
                task_ids: Vec::new(),
                tests: Vec::new(),
                severity: "high".to_string(),
            });
        }

        patterns
    }

    fn is_stuck(&self, tasks: &[crate::store::Task]) -> bool {
        let mut all: Vec<(Option<DateTime<Utc>>, Option<bool>)> = Vec::new();
        for task in tasks {
            let Ok(attempts) = self.store.get_attempts(&task.id) else {
                continue;
            };
            for attempt in attempts {
                all.push((attempt.started_at, attempt.success));
            }
        }

        // Newest first; count the leading run of failures.
        all.sort_by(|a, b| b.0.cmp(&a.0));
        let mut consecutive = 0;
        for (_, success) in all {
            if success == Some(false) {
                consecutive += 1;
            } else {
                break;
            }
        }
        consecutive >= 3
    }

    /// Persist a report, serializing patterns and recommendations as JSON.
    pub fn save_report(&self, report: &SprintReport) -> Result<()> {
        let patterns_json = serde_json::to_string(&report.patterns).context("serialize patterns")?;
        let recommendations_json =
            serde_json::to_string(&report.recommendations).context("serialize recommendations")?;

        self.store.save_sprint_report(&SprintReportRow {
            id: 0,
            session_id: self.session_id,
            sprint_number: report.sprint_number,
            start_iteration: report.start_iteration,
            end_iteration: report.end_iteration,
            tasks_attempted: report.tasks_attempted,
            tasks_completed: report.tasks_completed,
            tasks_failed: report.tasks_failed,
            velocity: report.velocity,
            quality_trend: report.quality_trend.clone(),
            test_pass_rate: report.test_pass_rate,
            patterns_json,
            recommendations_json,
            total_tokens: report.total_tokens,
            duration_ms: report.duration.as_millis() as u64,
            timestamp: None,
        })
    }
}

fn generate_recommendations(patterns: &[Pattern]) -> Vec<Recommendation> {
    let mut recs = Vec::new();

    for pattern in patterns {
        match pattern.kind {
            PatternKind::RepeatedFailure => {
                if pattern.severity == "high" {
                    for task_id in &pattern.task_ids {
                        recs.push(Recommendation {
                            action: RecommendationKind::DeferTask,
                            task_id: task_id.clone(),
                            description: format!(
                                "Defer task after repeated failures: {}",
                                pattern.description
                            ),
                            priority: 1,
                        });
                    }
                } else {
                    for task_id in &pattern.task_ids {
                        recs.push(Recommendation {
                            action: RecommendationKind::UpdateContext,
                            task_id: task_id.clone(),
                            description: format!(
                                "Add failure context to avoid repeating: {}",
                                pattern.description
                            ),
                            priority: 2,
                        });
                    }
                }
            }
            PatternKind::SameTestFailing => {
                recs.push(Recommendation {
                    action: RecommendationKind::UpdateContext,
                    task_id: String::new(),
                    description: format!(
                        "Focus on fixing persistently failing tests: {:?}",
                        pattern.tests
                    ),
                    priority: 1,
                });
            }
            PatternKind::QualityDegradation => {
                recs.push(Recommendation {
                    action: RecommendationKind::Rollback,
                    task_id: String::new(),
                    description:
                        "Quality is degrading; consider rolling back to last known-good state"
                            .to_string(),
                    priority: 1,
                });
            }
            PatternKind::Stuck => {
                recs.push(Recommendation {
                    action: RecommendationKind::SwitchAgent,
                    task_id: String::new(),
                    description: "Multiple consecutive failures; try switching to fallback agent"
                        .to_string(),
                    priority: 1,
                });
                recs.push(Recommendation {
                    action: RecommendationKind::Escalate,
                    task_id: String::new(),
                    description: "System appears stuck; escalate for human review".to_string(),
                    priority: 2,
                });
            }
            PatternKind::Unknown => {}
        }
    }

    recs
}

fn severity_from_fail_count(count: usize) -> &'static str {
    if count >= 3 {
        "high"
    } else if count >= 2 {
        "medium"
    } else {
        "low"
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_string());
    }
}
