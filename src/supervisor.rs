//! The outer supervisor: setup, sprint sequencing, review gating, and
//! finalization for one autonomous session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::agent::AgentRunner;
use crate::cancel::CancelToken;
use crate::config::{SupervisorConfig, REVIEW_AFTER_PR, REVIEW_AFTER_SPRINT};
use crate::journal::{EntryKind, Journal};
use crate::metrics::{BudgetEnforcer, Collector};
use crate::review::{ReviewResult, Reviewer};
use crate::sprint::SprintRunner;
use crate::store::{self, JournalEntry, ReviewResultRow, Store};
use crate::taskdb::{Task, TaskDb, TaskStatus};
use crate::workflow::GitWorkflow;

/// Orchestrates the full autonomous development lifecycle.
pub struct Supervisor {
    cfg: SupervisorConfig,
    store: Arc<Store>,
    session_id: i64,
    workflow: Box<dyn GitWorkflow>,
    task_db: Arc<TaskDb>,
    collector: Collector,
    budget: BudgetEnforcer,
    journal: Journal,
    runner: Box<dyn AgentRunner>,
    reviewer: Option<Box<dyn Reviewer>>,
}

impl Supervisor {
    /// Open the workspace store, create a session row, and assemble the
    /// component graph. Nothing touches the repository until [`run`].
    ///
    /// [`run`]: Supervisor::run
    pub fn new(
        cfg: SupervisorConfig,
        workflow: Box<dyn GitWorkflow>,
        runner: Box<dyn AgentRunner>,
        reviewer: Option<Box<dyn Reviewer>>,
    ) -> Result<Self> {
        let mut cfg = cfg;
        cfg.validate()?;
        cfg.parse_budget_duration()?;

        let workdir = if cfg.work_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&cfg.work_dir)
        };
        let agentbox_dir = workdir.join(".agentbox");
        std::fs::create_dir_all(&agentbox_dir)
            .with_context(|| format!("create {}", agentbox_dir.display()))?;

        let store = Arc::new(Store::open(&agentbox_dir.join("agentbox.db")).context("open store")?);

        let config_json = serde_json::to_string(&cfg).unwrap_or_default();
        let session_id = store
            .create_session(&cfg.repo_url, &cfg.branch_name, &config_json)
            .context("create session")?;

        Ok(Self {
            collector: Collector::new(store.clone(), session_id),
            budget: BudgetEnforcer::new(cfg.budget.to_budget()),
            journal: Journal::new(store.clone(), session_id),
            task_db: Arc::new(TaskDb::new()),
            store,
            session_id,
            cfg,
            workflow,
            runner,
            reviewer,
        })
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Execute the full lifecycle. Setup errors mark the session failed;
    /// cancellation marks it cancelled; everything else finalizes to
    /// completed.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        info!(
            repo = %self.cfg.repo_url,
            agent = %self.cfg.agent,
            max_sprints = self.cfg.max_sprints,
            sprint_size = self.cfg.sprint_size,
            "supervisor starting"
        );

        if let Err(err) = self.setup(cancel) {
            let _ = self.store.update_session_status(self.session_id, "failed");
            return Err(err.context("setup"));
        }

        let mut iteration = 1u32;
        for sprint in 1..=self.cfg.max_sprints {
            if cancel.is_cancelled() {
                let _ = self.store.update_session_status(self.session_id, "cancelled");
                bail!("context cancelled");
            }

            if self.task_db.is_complete() {
                info!("all tasks completed");
                break;
            }

            let mut runner = SprintRunner::new(
                &self.cfg,
                self.store.clone(),
                self.session_id,
                self.workflow.as_ref(),
                self.task_db.clone(),
                &self.budget,
                self.runner.as_ref(),
            );
            // Budget, consecutive-fail, and cancellation exits all come
            // back as Ok results; an Err here is a hard internal failure
            // and ends the session the same way a setup error does.
            let result = match runner.run_sprint(cancel, sprint, iteration) {
                Ok(result) => result,
                Err(err) => {
                    let _ = self.store.update_session_status(self.session_id, "failed");
                    return Err(err.context(format!("sprint {sprint}")));
                }
            };
            iteration = runner.current_iteration();

            if result.budget_exceeded {
                warn!("stopping: budget exceeded");
                break;
            }
            if result.aborted_early {
                warn!(reason = %result.abort_reason, "sprint aborted");
                if result.abort_reason == "context cancelled" {
                    let _ = self.store.update_session_status(self.session_id, "cancelled");
                    bail!("context cancelled");
                }
            }

            if self.cfg.review_enabled && self.cfg.review_after == REVIEW_AFTER_SPRINT {
                self.run_review_gate(cancel, sprint);
            }
        }

        self.finalize(cancel)
    }

    /// Phase 1: open the repository, create the worktree, import the PRD,
    /// and scaffold the workspace.
    fn setup(&mut self, _cancel: &CancelToken) -> Result<()> {
        info!("phase 1: setup");

        let branch = self.cfg.branch_name.clone();
        self.workflow.clone_or_open().context("opening repository")?;
        self.workflow
            .create_worktree(&branch)
            .context("creating worktree")?;

        self.import_prd().context("importing PRD")?;

        let agentbox_dir = self.workflow.worktree_path().join(".agentbox");
        std::fs::create_dir_all(&agentbox_dir)
            .with_context(|| format!("create {}", agentbox_dir.display()))?;

        if self.cfg.journal_enabled {
            let stats = self.task_db.stats();
            let _ = self.journal.add(&JournalEntry {
                kind: EntryKind::Reflection.as_str().to_string(),
                summary: "Session started".to_string(),
                reflection: format!(
                    "Starting new sprint session with {} tasks. Agent: {}. Let's see how this goes.",
                    stats.total, self.cfg.agent
                ),
                confidence: 3,
                momentum: 3,
                ..JournalEntry::default()
            });
        }

        Ok(())
    }

    /// Import the PRD into both the task DB and the store. Duplicate ids
    /// and cycle-creating dependencies are fatal.
    fn import_prd(&self) -> Result<()> {
        let prd_path = {
            let configured = Path::new(&self.cfg.prd_file);
            if configured.is_absolute() {
                configured.to_path_buf()
            } else {
                self.workflow.worktree_path().join(configured)
            }
        };

        let prd = crate::prd::Prd::load(&prd_path)?;
        let flat_tasks = prd.export_tasks();

        for flat in &flat_tasks {
            let status = TaskStatus::parse(&flat.status).unwrap_or(TaskStatus::Pending);
            let mut task = Task::new(&flat.id, &flat.title);
            task.description = flat.description.clone();
            task.status = status;
            task.priority = flat.priority;
            task.parent_id = flat.parent_id.clone();
            task.max_attempts = 3;
            task.complexity = 3;
            self.task_db
                .add(task)
                .with_context(|| format!("adding task {} to task db", flat.id))?;

            self.store
                .insert_task(&store::Task {
                    id: flat.id.clone(),
                    session_id: self.session_id,
                    title: flat.title.clone(),
                    description: flat.description.clone(),
                    status: status.as_str().to_string(),
                    priority: flat.priority,
                    complexity: 3,
                    parent_id: flat.parent_id.clone(),
                    max_attempts: 3,
                    context_notes: String::new(),
                    acceptance_criteria_json: String::new(),
                    tags_json: String::new(),
                    created_at: chrono::Utc::now(),
                    completed_at: None,
                })
                .with_context(|| format!("inserting task {} into store", flat.id))?;
        }

        // Edges go in once every endpoint exists.
        for flat in &flat_tasks {
            for dep in &flat.depends_on {
                self.task_db
                    .add_dependency(&flat.id, dep)
                    .with_context(|| format!("adding dependency {} -> {dep}", flat.id))?;
                self.store
                    .add_dependency(&flat.id, dep)
                    .with_context(|| format!("persisting dependency {} -> {dep}", flat.id))?;
            }
        }

        info!(count = flat_tasks.len(), prd = %prd.name, "imported tasks");
        Ok(())
    }

    /// Phase 3: review the diff, persist the result, and feed blocker
    /// findings back as top-priority fix tasks for the next sprint.
    fn run_review_gate(&self, cancel: &CancelToken, sprint: u32) {
        let Some(reviewer) = &self.reviewer else {
            debug!("skipping review: no reviewer configured");
            return;
        };

        info!("running review gate");

        let diff = match self.workflow.diff("origin/main") {
            Ok(diff) => diff,
            Err(err) => {
                warn!(%err, "could not get diff for review");
                return;
            }
        };
        let changed_files = self.workflow.diff_files("origin/main").unwrap_or_default();
        let metrics_summary = self.collector.summary().unwrap_or_default();

        for round in 1..=self.cfg.max_review_rounds {
            let result = match reviewer.review(
                cancel,
                &self.workflow.worktree_path(),
                &diff,
                &changed_files,
                &metrics_summary,
            ) {
                Ok(result) => result,
                Err(err) => {
                    warn!(round, %err, "review failed");
                    break;
                }
            };

            let findings_json = serde_json::to_string(&result.findings).unwrap_or_default();
            if let Err(err) = self.store.save_review_result(&ReviewResultRow {
                session_id: self.session_id,
                sprint,
                review_agent: result.review_agent.clone(),
                findings_json,
                summary: result.summary.clone(),
                approved: result.approved,
                ..ReviewResultRow::default()
            }) {
                warn!(%err, "could not save review result");
            }

            if self.cfg.journal_enabled {
                let counts = result.count_by_severity();
                let count_of = |severity| counts.get(&severity).copied().unwrap_or(0);
                let _ = self.journal.add(&JournalEntry {
                    kind: EntryKind::ReviewReceived.as_str().to_string(),
                    sprint,
                    summary: format!(
                        "Code review round {round}: {} findings",
                        result.findings.len()
                    ),
                    reflection: format!(
                        "Review by {}: {}. Approved: {}. Findings: critical={}, significant={}, minor={}, nit={}",
                        result.review_agent,
                        result.summary,
                        result.approved,
                        count_of(crate::review::Severity::Critical),
                        count_of(crate::review::Severity::Significant),
                        count_of(crate::review::Severity::Minor),
                        count_of(crate::review::Severity::Nit),
                    ),
                    ..JournalEntry::default()
                });
            }

            if result.approved {
                info!(round, "review approved");
                break;
            }
            if round >= self.cfg.max_review_rounds {
                warn!("max review rounds reached without approval");
                break;
            }

            match inject_review_fix_tasks(&self.store, &self.task_db, self.session_id, round, &result)
            {
                Ok(count) => info!(count, "injected review fix tasks"),
                Err(err) => warn!(%err, "could not inject review fix tasks"),
            }
        }
    }

    /// Phase 4: final review, wrap-up journal entry, PR, journal export,
    /// session completion.
    fn finalize(&mut self, cancel: &CancelToken) -> Result<()> {
        info!("phase 4: finalize");

        if self.cfg.review_enabled && self.cfg.review_after == REVIEW_AFTER_PR {
            self.run_review_gate(cancel, 0);
        }

        if self.cfg.journal_enabled {
            let stats = self.task_db.stats();
            let usage = self.collector.total_usage().unwrap_or_default();
            let _ = self.journal.add(&JournalEntry {
                kind: EntryKind::FinalWrapUp.as_str().to_string(),
                summary: "Session complete".to_string(),
                reflection: format!(
                    "Session finished. Tasks: {} total, {} completed, {} pending, {} failed, {} deferred. Tokens: {}. Container time: {}ms.",
                    stats.total,
                    stats.completed,
                    stats.pending,
                    stats.failed,
                    stats.deferred,
                    usage.estimated_tokens,
                    usage.container_time_ms,
                ),
                ..JournalEntry::default()
            });
        }

        let stats = self.task_db.stats();
        let pr_title = format!("agentbox: {}/{} tasks completed", stats.completed, stats.total);
        let pr_body = self.generate_pr_body();
        match self.workflow.open_pr(&pr_title, &pr_body) {
            Ok(url) => info!(url = %url, "pull request created"),
            Err(err) => warn!(%err, "could not create PR"),
        }

        match self.journal.export_markdown() {
            Ok(markdown) if !markdown.is_empty() => {
                let journal_path = self.workflow.worktree_path().join(".agentbox/journal.md");
                if let Err(err) = std::fs::write(&journal_path, markdown) {
                    warn!(%err, "could not write journal");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "could not export journal"),
        }

        if let Err(err) = self.export_retros() {
            warn!(%err, "could not export sprint retros");
        }

        self.store
            .update_session_status(self.session_id, "completed")
            .context("mark session completed")?;
        Ok(())
    }

    /// Export every sprint report as JSON under `.agentbox/retros/`.
    fn export_retros(&self) -> Result<()> {
        let reports = self.store.sprint_reports(self.session_id)?;
        if reports.is_empty() {
            return Ok(());
        }
        let retro_dir = self.workflow.worktree_path().join(".agentbox/retros");
        std::fs::create_dir_all(&retro_dir)
            .with_context(|| format!("create {}", retro_dir.display()))?;
        for report in reports {
            let path = retro_dir.join(format!("sprint-{}.json", report.sprint_number));
            let mut buf = serde_json::to_string_pretty(&report).context("serialize report")?;
            buf.push('\n');
            std::fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(())
    }

    /// Compose the PR description from task state and metrics.
    fn generate_pr_body(&self) -> String {
        let stats = self.task_db.stats();
        let mut tasks = self.task_db.tasks();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut body = format!(
            "## Summary\n\n- **{}/{}** tasks completed\n- {} pending, {} failed, {} deferred\n\n",
            stats.completed, stats.total, stats.pending, stats.failed, stats.deferred,
        );

        body.push_str("## Completed Tasks\n\n");
        for task in &tasks {
            if task.status == TaskStatus::Completed {
                body.push_str(&format!("- [x] {}: {}\n", task.id, task.title));
            }
        }
        body.push('\n');

        let unresolved: Vec<&Task> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Deferred))
            .collect();
        if !unresolved.is_empty() {
            body.push_str("## Unresolved\n\n");
            for task in unresolved {
                body.push_str(&format!(
                    "- [ ] {}: {} ({})\n",
                    task.id,
                    task.title,
                    task.status.as_str()
                ));
            }
            body.push('\n');
        }

        if let Ok(summary) = self.collector.summary() {
            if !summary.is_empty() {
                body.push_str("## Metrics\n\n");
                body.push_str(&summary);
                body.push_str("\n\n");
            }
        }

        body.push_str("---\n\nGenerated by agentbox\n");
        body
    }
}

/// Insert a top-priority fix task into both databases for every blocker
/// finding. Returns the number of tasks injected.
pub fn inject_review_fix_tasks(
    store: &Store,
    task_db: &TaskDb,
    session_id: i64,
    round: u32,
    result: &ReviewResult,
) -> Result<u32> {
    let mut injected = 0u32;
    for (index, finding) in result.blocker_findings().into_iter().enumerate() {
        let id = format!("review-fix-{round}-{}", index + 1);
        let title = format!("Fix review finding: {}", finding.description);
        let description = format!(
            "[{}] {}\nFile: {}\nSuggestion: {}",
            finding.severity.as_str(),
            finding.description,
            finding.file,
            finding.suggestion,
        );

        let mut task = Task::new(&id, &title);
        task.description = description.clone();
        task.priority = 0;
        task.max_attempts = 2;
        task_db
            .add(task)
            .with_context(|| format!("adding fix task {id}"))?;

        store
            .insert_task(&store::Task {
                id: id.clone(),
                session_id,
                title,
                description,
                status: "pending".to_string(),
                priority: 0,
                complexity: 3,
                parent_id: String::new(),
                max_attempts: 2,
                context_notes: String::new(),
                acceptance_criteria_json: String::new(),
                tags_json: String::new(),
                created_at: chrono::Utc::now(),
                completed_at: None,
            })
            .with_context(|| format!("persisting fix task {id}"))?;
        injected += 1;
    }
    Ok(injected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::parse_review_output;
    use crate::test_support::open_store;

    #[test]
    fn blocker_findings_become_top_priority_fix_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");
        let task_db = TaskDb::new();

        // The reviewer claimed approval despite a critical finding; parse
        // coerces approved to false and the blocker is injected.
        let output = r#"{"findings": [
            {"severity": "critical", "file": "src/db.rs", "description": "connection leak", "suggestion": "close it"}
        ], "summary": "one blocker", "approved": true}"#;
        let result = parse_review_output("claude", output);
        assert!(!result.approved);

        let injected =
            inject_review_fix_tasks(&store, &task_db, session, 1, &result).expect("inject");
        assert_eq!(injected, 1);

        let task = task_db.next_task().expect("fix task is schedulable");
        assert!(task.title.starts_with("Fix review finding:"));
        assert_eq!(task.priority, 0);
        assert_eq!(task.max_attempts, 2);
        assert_eq!(task.status, TaskStatus::Pending);

        let stored = store.get_task(&task.id).expect("stored");
        assert_eq!(stored.priority, 0);
        assert!(stored.description.contains("connection leak"));
        assert!(stored.description.contains("Suggestion: close it"));
    }

    #[test]
    fn non_blocker_findings_inject_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = open_store(temp.path()).expect("open");
        let session = store.create_session("repo", "branch", "").expect("session");
        let task_db = TaskDb::new();

        let output = r#"{"findings": [
            {"severity": "nit", "file": "a.rs", "description": "spacing"}
        ], "summary": "ok", "approved": true}"#;
        let result = parse_review_output("claude", output);
        assert!(result.approved);

        let injected =
            inject_review_fix_tasks(&store, &task_db, session, 1, &result).expect("inject");
        assert_eq!(injected, 0);
        assert!(task_db.is_empty());
    }
}
