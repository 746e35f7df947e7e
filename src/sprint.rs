//! The inner sprint loop: a bounded run of task iterations followed by a
//! retrospective.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::adaptive::AdaptiveController;
use crate::agent::{AgentRunner, TaskView};
use crate::cancel::CancelToken;
use crate::config::SupervisorConfig;
use crate::context::ContextBuilder;
use crate::journal::{EntryKind, Journal};
use crate::metrics::{run_quality_checks, BudgetEnforcer, Collector};
use crate::retro::{Analyzer, SprintReport};
use crate::store::{self, JournalEntry, QualitySnapshot, ResourceUsage, Store};
use crate::taskdb::{self, Task, TaskDb, TaskStatus};
use crate::workflow::GitWorkflow;

/// Outcome of one sprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SprintResult {
    pub sprint_number: u32,
    pub tasks_attempted: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub budget_exceeded: bool,
    pub aborted_early: bool,
    pub abort_reason: String,
}

/// Executes one sprint: up to `sprint_size` iterations, then a
/// retrospective whose recommendations are applied before the next
/// sprint.
pub struct SprintRunner<'a> {
    cfg: &'a SupervisorConfig,
    store: Arc<Store>,
    session_id: i64,
    workflow: &'a dyn GitWorkflow,
    task_db: Arc<TaskDb>,
    collector: Collector,
    budget: &'a BudgetEnforcer,
    journal: Journal,
    ctx_builder: ContextBuilder,
    adaptive: AdaptiveController,
    runner: &'a dyn AgentRunner,

    sprint_num: u32,
    iteration: u32,
    consecutive_fails: u32,
}

impl<'a> SprintRunner<'a> {
    pub fn new(
        cfg: &'a SupervisorConfig,
        store: Arc<Store>,
        session_id: i64,
        workflow: &'a dyn GitWorkflow,
        task_db: Arc<TaskDb>,
        budget: &'a BudgetEnforcer,
        runner: &'a dyn AgentRunner,
    ) -> Self {
        Self {
            cfg,
            collector: Collector::new(store.clone(), session_id),
            journal: Journal::new(store.clone(), session_id),
            ctx_builder: ContextBuilder::new(store.clone(), session_id),
            adaptive: AdaptiveController::new(store.clone(), task_db.clone()),
            store,
            session_id,
            workflow,
            task_db,
            budget,
            runner,
            sprint_num: 0,
            iteration: 0,
            consecutive_fails: 0,
        }
    }

    /// Iteration counter after the last completed iteration.
    pub fn current_iteration(&self) -> u32 {
        self.iteration
    }

    /// Run a single sprint starting at `start_iter`.
    ///
    /// Cancellation before an iteration aborts the sprint without a
    /// retrospective; every other exit path analyzes the window and
    /// applies the resulting recommendations.
    pub fn run_sprint(
        &mut self,
        cancel: &CancelToken,
        sprint_num: u32,
        start_iter: u32,
    ) -> Result<SprintResult> {
        self.sprint_num = sprint_num;
        self.iteration = start_iter;
        self.consecutive_fails = 0;

        let mut result = SprintResult {
            sprint_number: sprint_num,
            ..SprintResult::default()
        };
        let sprint_start = Instant::now();

        info!(
            sprint = sprint_num,
            start_iteration = start_iter,
            sprint_size = self.cfg.sprint_size,
            "starting sprint"
        );

        for _ in 0..self.cfg.sprint_size {
            if cancel.is_cancelled() {
                result.aborted_early = true;
                result.abort_reason = "context cancelled".to_string();
                return Ok(result);
            }

            let tokens = self
                .collector
                .total_usage()
                .map(|u| u.estimated_tokens)
                .unwrap_or(0);
            let budget_status = self.budget.check(tokens, self.iteration);
            if budget_status.exceeded {
                result.budget_exceeded = true;
                result.aborted_early = true;
                result.abort_reason = budget_status.reason.clone();
                warn!(reason = %budget_status.reason, "budget exceeded");
                break;
            }
            if budget_status.warning {
                warn!(reason = %budget_status.reason, "budget warning");
            }

            if self.consecutive_fails >= self.cfg.max_consecutive_fails {
                result.aborted_early = true;
                result.abort_reason = format!("{} consecutive failures", self.consecutive_fails);
                warn!(consecutive_fails = self.consecutive_fails, "aborting sprint early");
                break;
            }

            let Some(task) = self.task_db.next_task() else {
                info!("no more tasks available");
                break;
            };

            let success = self.run_iteration(cancel, &task);
            result.tasks_attempted += 1;
            if success {
                result.tasks_completed += 1;
                self.consecutive_fails = 0;
            } else {
                result.tasks_failed += 1;
                self.consecutive_fails += 1;
            }

            self.iteration += 1;
        }

        // Retrospective.
        let analyzer = Analyzer::new(self.store.clone(), self.session_id);
        match analyzer.analyze(sprint_num, start_iter, self.iteration) {
            Ok(mut report) => {
                report.duration = sprint_start.elapsed();
                if let Err(err) = analyzer.save_report(&report) {
                    warn!(%err, "could not save sprint report");
                }

                if !report.recommendations.is_empty() {
                    for action in self.adaptive.apply(&report.recommendations) {
                        info!(action = %action, "retro action");
                        if action.starts_with("Escalation:") {
                            let workdir = self.workflow.worktree_path();
                            if let Err(err) = crate::adaptive::write_escalation(&workdir, &action) {
                                warn!(%err, "could not write escalation");
                            }
                        }
                    }
                }

                if self.cfg.journal_enabled {
                    self.write_sprint_retro_entry(&report);
                }
            }
            Err(err) => warn!(%err, "retro analysis failed"),
        }

        Ok(result)
    }

    /// Execute a single task iteration. Returns the agent's success flag.
    fn run_iteration(&mut self, cancel: &CancelToken, task: &Task) -> bool {
        let attempt_number = task.attempts.len() as u32 + 1;
        info!(
            iteration = self.iteration,
            task = %task.id,
            title = %task.title,
            attempt = attempt_number,
            "starting iteration"
        );
        let iter_start = Instant::now();

        if self.cfg.journal_enabled {
            let _ = self.journal.add(&JournalEntry {
                kind: EntryKind::TaskStart.as_str().to_string(),
                task_id: task.id.clone(),
                sprint: self.sprint_num,
                iteration: self.iteration,
                summary: format!("Starting: {}", task.title),
                reflection: format!(
                    "Beginning work on {} (attempt {attempt_number} of {})",
                    task.title, task.max_attempts
                ),
                ..JournalEntry::default()
            });
        }

        let prompt = match self.ctx_builder.build_prompt(task, &self.project_label()) {
            Ok(prompt) => prompt,
            Err(err) => {
                error!(%err, "failed to build prompt");
                return false;
            }
        };

        // Pre-attempt commit SHA, kept for a potential rollback.
        let before_sha = self.workflow.current_commit().unwrap_or_default();

        let attempt_id = match self.store.record_attempt(&store::Attempt {
            task_id: task.id.clone(),
            session_id: self.session_id,
            number: attempt_number,
            agent_name: self.cfg.agent.clone(),
            started_at: Some(Utc::now()),
            ..store::Attempt::default()
        }) {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "failed to record attempt");
                return false;
            }
        };

        let view = TaskView {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
        };
        let agent_result = self.runner.run_task(cancel, &view, &prompt);
        let success = agent_result.success;
        let duration_ms = iter_start.elapsed().as_millis() as u64;

        if let Err(err) = self.collector.record_usage(&ResourceUsage {
            attempt_id: Some(attempt_id),
            iteration: self.iteration,
            task_id: task.id.clone(),
            agent_name: self.cfg.agent.clone(),
            container_time_ms: duration_ms,
            estimated_tokens: estimate_tokens(&agent_result.output),
            ..ResourceUsage::default()
        }) {
            warn!(%err, "could not record resource usage");
        }

        if let Err(err) =
            self.store
                .finish_attempt(attempt_id, success, &agent_result.error, duration_ms)
        {
            warn!(%err, "could not update attempt row");
        }

        let transcript = if agent_result.output.is_empty() {
            format!(
                "Prompt sent for task {} (iteration {}). Error: {}",
                task.id, self.iteration, agent_result.error
            )
        } else {
            agent_result.output.clone()
        };
        if let Err(err) = self.store.save_transcript(attempt_id, &transcript) {
            warn!(%err, "could not save transcript");
        }

        if success {
            self.record_quality_snapshot(attempt_id, &task.id);
        }

        let _ = self.task_db.record_attempt(
            &task.id,
            taskdb::Attempt {
                number: attempt_number,
                agent_name: self.cfg.agent.clone(),
                success,
                error_msg: agent_result.error.clone(),
                git_commit: before_sha,
                git_rollback: String::new(),
                tokens_used: estimate_tokens(&agent_result.output),
                duration_ms,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
            },
        );

        if success {
            let _ = self.task_db.set_status(&task.id, TaskStatus::Completed);
            if let Err(err) = self.store.update_task_status(&task.id, "completed") {
                warn!(%err, "could not mark task completed");
            }
        }

        if self.cfg.journal_enabled {
            let kind = if success {
                EntryKind::TaskComplete
            } else {
                EntryKind::TaskFailed
            };
            let status = if success { "completed" } else { "failed" };
            let _ = self.journal.add(&JournalEntry {
                kind: kind.as_str().to_string(),
                task_id: task.id.clone(),
                sprint: self.sprint_num,
                iteration: self.iteration,
                summary: format!("{status}: {}", task.title),
                reflection: format!(
                    "Attempt {attempt_number} on {} completed. Success: {success}",
                    task.title
                ),
                duration_ms,
                ..JournalEntry::default()
            });
        }

        if success && self.cfg.auto_commit {
            let message = format!("feat({}): {}", task.id, task.title);
            if let Err(err) = self.workflow.commit(&message, &[]) {
                warn!(%err, "commit failed");
            }
        }

        success
    }

    fn record_quality_snapshot(&self, attempt_id: i64, task_id: &str) {
        if self.cfg.quality_checks.is_empty() {
            return;
        }
        let workdir = self.workflow.worktree_path();
        let timeout = std::time::Duration::from_secs(self.cfg.quality_check_timeout_secs);
        match run_quality_checks(&workdir, &self.cfg.quality_checks, timeout) {
            Ok(outcome) => {
                let snapshot = QualitySnapshot {
                    attempt_id: Some(attempt_id),
                    iteration: self.iteration,
                    task_id: task_id.to_string(),
                    overall_pass: outcome.overall_pass,
                    checks_json: serde_json::to_string(&outcome.checks).unwrap_or_default(),
                    test_total: outcome.stats.total,
                    test_passed: outcome.stats.passed,
                    test_failed: outcome.stats.failed,
                    test_skipped: outcome.stats.skipped,
                    failed_tests_json: serde_json::to_string(&outcome.stats.failed_tests)
                        .unwrap_or_default(),
                    ..QualitySnapshot::default()
                };
                if let Err(err) = self.collector.record_quality(&snapshot) {
                    warn!(%err, "could not record quality snapshot");
                }
            }
            Err(err) => warn!(%err, "quality checks could not run"),
        }
    }

    fn write_sprint_retro_entry(&self, report: &SprintReport) {
        let mut patterns_desc = String::new();
        for pattern in &report.patterns {
            patterns_desc.push_str(&format!(
                "- [{:?}] {}\n",
                pattern.kind, pattern.description
            ));
        }
        let mut recs_desc = String::new();
        for rec in &report.recommendations {
            recs_desc.push_str(&format!("- [{:?}] {}\n", rec.action, rec.description));
        }

        let mut reflection = format!(
            "Sprint {} completed. Velocity: {:.1}% ({}/{} tasks). Quality: {}. Pass rate: {:.1}%.\n\n",
            report.sprint_number,
            report.velocity * 100.0,
            report.tasks_completed,
            report.tasks_attempted,
            report.quality_trend,
            report.test_pass_rate * 100.0,
        );
        if !patterns_desc.is_empty() {
            reflection.push_str("Patterns detected:\n");
            reflection.push_str(&patterns_desc);
            reflection.push('\n');
        }
        if !recs_desc.is_empty() {
            reflection.push_str("Recommendations:\n");
            reflection.push_str(&recs_desc);
        }

        let _ = self.journal.add(&JournalEntry {
            kind: EntryKind::SprintRetro.as_str().to_string(),
            sprint: self.sprint_num,
            iteration: self.iteration,
            summary: format!("Sprint {} Retrospective", report.sprint_number),
            reflection,
            ..JournalEntry::default()
        });
    }

    fn project_label(&self) -> String {
        if !self.cfg.repo_url.is_empty() {
            return self.cfg.repo_url.clone();
        }
        self.workflow
            .worktree_path()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string())
    }
}

/// Rough token estimate from output length. The agent runtime is opaque,
/// so a character heuristic stands in for real usage numbers.
fn estimate_tokens(output: &str) -> u64 {
    (output.len() / 4) as u64
}
