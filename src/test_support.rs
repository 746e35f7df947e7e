//! Test-only helpers shared by unit and integration tests.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{ensure, Context, Result};
use chrono::Utc;

use crate::agent::{AgentResult, AgentRunner, TaskView};
use crate::cancel::CancelToken;
use crate::store::Store;
use crate::taskdb::{Attempt, Task, TaskStatus};

/// Create a pending task with deterministic defaults.
pub fn pending_task(id: &str, priority: i32) -> Task {
    let mut task = Task::new(id, format!("{id} title"));
    task.description = format!("{id} description");
    task.priority = priority;
    task
}

/// Create a failed attempt with the given number and error message.
pub fn failed_attempt(number: u32, error_msg: &str) -> Attempt {
    Attempt {
        number,
        agent_name: "test-agent".to_string(),
        success: false,
        error_msg: error_msg.to_string(),
        git_commit: String::new(),
        git_rollback: String::new(),
        tokens_used: 0,
        duration_ms: 0,
        started_at: Utc::now(),
        completed_at: None,
    }
}

/// Open a store backed by a fresh database under `dir`.
pub fn open_store(dir: &Path) -> Result<Store> {
    Store::open(&dir.join("agentbox.db"))
}

/// Agent runner that replays a scripted sequence of outcomes. Once the
/// script is exhausted, the last entry repeats.
pub struct ScriptedAgentRunner {
    script: Vec<ScriptedOutcome>,
    calls: std::sync::Mutex<usize>,
}

#[derive(Debug, Clone)]
pub struct ScriptedOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl ScriptedOutcome {
    pub fn success(output: &str) -> Self {
        Self {
            success: true,
            output: output.to_string(),
            error: String::new(),
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.to_string(),
        }
    }
}

impl ScriptedAgentRunner {
    pub fn new(script: Vec<ScriptedOutcome>) -> Self {
        assert!(!script.is_empty(), "scripted runner needs at least one outcome");
        Self {
            script,
            calls: std::sync::Mutex::new(0),
        }
    }

    pub fn always_failing(error: &str) -> Self {
        Self::new(vec![ScriptedOutcome::failure(error)])
    }

    pub fn always_succeeding() -> Self {
        Self::new(vec![ScriptedOutcome::success("done")])
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().expect("calls mutex poisoned")
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn run_task(&self, _cancel: &CancelToken, task: &TaskView, _prompt: &str) -> AgentResult {
        let mut calls = self.calls.lock().expect("calls mutex poisoned");
        let outcome = self
            .script
            .get(*calls)
            .unwrap_or_else(|| self.script.last().expect("non-empty script"))
            .clone();
        *calls += 1;
        AgentResult {
            task_id: task.id.clone(),
            success: outcome.success,
            output: outcome.output,
            error: outcome.error,
        }
    }
}

/// A scratch git repository under a temp directory, laid out as
/// `<temp>/repo` so worktrees created beside it stay inside the temp dir.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("repo");
        std::fs::create_dir_all(&root).context("create repo dir")?;

        run_git(&root, &["init"])?;
        run_git(&root, &["config", "user.email", "test@example.com"])?;
        run_git(&root, &["config", "user.name", "test"])?;
        std::fs::write(root.join("README.md"), "hi\n").context("write README")?;
        run_git(&root, &["add", "README.md"])?;
        run_git(&root, &["commit", "-m", "chore: init"])?;

        Ok(Self { temp })
    }

    /// Path to the repository working directory.
    pub fn root(&self) -> PathBuf {
        self.temp.path().join("repo")
    }

    /// Parent directory holding the repo (and any worktrees beside it).
    pub fn base(&self) -> &Path {
        self.temp.path()
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    ensure!(
        status.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&status.stderr)
    );
    Ok(())
}

/// Seed a pending task into the store with default fields.
pub fn insert_store_task(store: &Store, session_id: i64, id: &str, priority: i32) -> Result<()> {
    store.insert_task(&crate::store::Task {
        id: id.to_string(),
        session_id,
        title: format!("{id} title"),
        description: format!("{id} description"),
        status: TaskStatus::Pending.as_str().to_string(),
        priority,
        complexity: 3,
        parent_id: String::new(),
        max_attempts: 3,
        context_notes: String::new(),
        acceptance_criteria_json: String::new(),
        tags_json: String::new(),
        created_at: Utc::now(),
        completed_at: None,
    })
}
