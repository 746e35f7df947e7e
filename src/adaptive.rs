//! Applies retrospective recommendations to live session state.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::retro::{Recommendation, RecommendationKind};
use crate::store::Store;
use crate::taskdb::{TaskDb, TaskStatus};

/// Applies recommendations as store/task-DB mutations or advisories.
pub struct AdaptiveController {
    store: Arc<Store>,
    task_db: Arc<TaskDb>,
}

impl AdaptiveController {
    pub fn new(store: Arc<Store>, task_db: Arc<TaskDb>) -> Self {
        Self { store, task_db }
    }

    /// Process recommendations, returning human-readable action strings
    /// for logging. Unknown kinds are silently skipped.
    pub fn apply(&self, recommendations: &[Recommendation]) -> Vec<String> {
        let mut actions = Vec::new();

        for rec in recommendations {
            match rec.action {
                RecommendationKind::DeferTask => {
                    if !rec.task_id.is_empty() && self.defer(&rec.task_id).is_ok() {
                        actions.push(format!("Deferred task {}: {}", rec.task_id, rec.description));
                        info!(task_id = %rec.task_id, "deferred task");
                    }
                }
                RecommendationKind::SkipTask => {
                    if !rec.task_id.is_empty() && self.defer(&rec.task_id).is_ok() {
                        actions.push(format!("Skipped task {}: {}", rec.task_id, rec.description));
                        info!(task_id = %rec.task_id, "skipped task");
                    }
                }
                RecommendationKind::UpdateContext => {
                    if !rec.task_id.is_empty() {
                        match self.append_context_note(&rec.task_id, &rec.description) {
                            Ok(()) => {
                                actions.push(format!("Updated context for task {}", rec.task_id));
                                info!(task_id = %rec.task_id, "updated task context");
                            }
                            Err(err) => {
                                warn!(task_id = %rec.task_id, %err, "context update failed");
                            }
                        }
                    }
                }
                RecommendationKind::SwitchAgent => {
                    actions.push(format!("Recommendation: switch agent: {}", rec.description));
                    warn!(reason = %rec.description, "agent switch recommended");
                }
                RecommendationKind::Rollback => {
                    actions.push(format!("Recommendation: rollback: {}", rec.description));
                    warn!(reason = %rec.description, "rollback recommended");
                }
                RecommendationKind::Escalate => {
                    actions.push(format!("Escalation: {}", rec.description));
                    warn!(reason = %rec.description, "escalation needed");
                }
                RecommendationKind::ReorderTasks => {
                    actions.push(format!("Recommendation: reorder tasks: {}", rec.description));
                }
                RecommendationKind::SplitTask => {
                    actions.push(format!("Recommendation: split task: {}", rec.description));
                }
                RecommendationKind::Unknown => {}
            }
        }

        actions
    }

    fn defer(&self, task_id: &str) -> Result<()> {
        self.store.update_task_status(task_id, "deferred")?;
        // Keep the in-memory view in lockstep; the task may predate the
        // current DAG after a merge, so a miss is tolerated.
        let _ = self.task_db.set_status(task_id, TaskStatus::Deferred);
        Ok(())
    }

    fn append_context_note(&self, task_id: &str, description: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        let note = format!(
            "\n[Retro {}] {description}",
            Utc::now().format("%Y-%m-%d %H:%M")
        );
        let new_notes = format!("{}{note}", task.context_notes);
        self.store.update_task_context_notes(task_id, &new_notes)
    }
}

/// Append an escalation message to `<workdir>/.agentbox/escalations.md`,
/// creating the directory if missing.
pub fn write_escalation(workdir: &Path, message: &str) -> Result<()> {
    let dir = workdir.join(".agentbox");
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join("escalations.md");

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let entry = format!("\n## {}\n\n{message}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"));
    file.write_all(entry.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    Ok(())
}
