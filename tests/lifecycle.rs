//! End-to-end supervisor lifecycle against a real scratch git repository.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use agentbox::agent::{AgentResult, AgentRunner, TaskView};
use agentbox::cancel::CancelToken;
use agentbox::config::SupervisorConfig;
use agentbox::store::JournalQuery;
use agentbox::supervisor::Supervisor;
use agentbox::workflow::GitCli;

/// Agent runner that "implements" each task by dropping a file into the
/// worktree, then reports success with the stop signal.
struct RecordingRunner {
    worktree: PathBuf,
    prompts: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn new(worktree: PathBuf) -> Self {
        Self {
            worktree,
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl AgentRunner for RecordingRunner {
    fn run_task(&self, _cancel: &CancelToken, task: &TaskView, prompt: &str) -> AgentResult {
        self.prompts.lock().expect("prompts mutex").push(prompt.to_string());
        std::fs::write(
            self.worktree.join(format!("{}.txt", task.id)),
            format!("{}\n", task.title),
        )
        .expect("write task artifact");
        AgentResult {
            task_id: task.id.clone(),
            success: true,
            output: format!("worked on {} <promise>COMPLETE</promise>", task.id),
            error: String::new(),
        }
    }
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Creates `<temp>/repo` with a committed PRD so the worktree lands
/// beside it inside the temp dir.
fn init_repo_with_prd(temp: &Path) -> PathBuf {
    let root = temp.join("repo");
    std::fs::create_dir_all(&root).expect("create repo dir");
    git(&root, &["init"]);
    git(&root, &["config", "user.email", "test@example.com"]);
    git(&root, &["config", "user.name", "test"]);

    let prd = r#"{
  "name": "demo",
  "description": "Two-task demo project",
  "tasks": [
    {"id": "t1", "title": "Scaffold", "description": "Create the module", "priority": 1},
    {"id": "t2", "title": "Wire up", "description": "Connect the pieces", "priority": 2,
     "depends_on": ["t1"]}
  ]
}"#;
    std::fs::write(root.join("prd.json"), prd).expect("write prd");
    std::fs::write(root.join("README.md"), "demo\n").expect("write readme");
    git(&root, &["add", "-A"]);
    git(&root, &["commit", "-m", "chore: init"]);
    root
}

#[test]
fn supervisor_runs_a_session_to_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = init_repo_with_prd(temp.path());

    let cfg = SupervisorConfig {
        work_dir: repo.to_string_lossy().to_string(),
        branch_name: "feat/lifecycle-test".to_string(),
        review_enabled: false,
        auto_commit: true,
        max_sprints: 3,
        ..SupervisorConfig::default()
    };

    let workflow = Box::new(GitCli::new("", repo.clone()));
    let runner = Box::new(RecordingRunner::new(temp.path().join("feat-lifecycle-test")));
    let mut supervisor =
        Supervisor::new(cfg, workflow, runner, None).expect("construct supervisor");
    let session_id = supervisor.session_id();
    let store = supervisor.store();

    supervisor.run(&CancelToken::new()).expect("run session");

    // Session completed with both tasks done in dependency order.
    let session = store.get_session(session_id).expect("session");
    assert_eq!(session.status, "completed");

    let t1 = store.get_task("t1").expect("t1");
    let t2 = store.get_task("t2").expect("t2");
    assert_eq!(t1.status, "completed");
    assert_eq!(t2.status, "completed");
    assert!(t1.completed_at.expect("t1 stamp") <= t2.completed_at.expect("t2 stamp"));

    // One attempt per task, successful, with transcripts saved.
    for id in ["t1", "t2"] {
        let attempts = store.get_attempts(id).expect("attempts");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].success, Some(true));
        assert!(store
            .get_transcript(attempts[0].id)
            .expect("transcript")
            .contains(id));
    }

    // A sprint report landed and usage was tracked per iteration.
    let reports = store.sprint_reports(session_id).expect("reports");
    assert!(!reports.is_empty());
    assert_eq!(reports[0].tasks_attempted, 2);
    assert_eq!(reports[0].tasks_completed, 2);
    let usage = store.total_usage(session_id).expect("usage");
    assert_eq!(usage.iteration, 2);

    // The journal covers the whole lifecycle in order.
    let entries = store
        .journal_entries(session_id, &JournalQuery::default())
        .expect("entries");
    let kinds: Vec<&str> = entries.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"reflection"));
    assert_eq!(kinds.last(), Some(&"final_wrap_up"));
    assert!(kinds.contains(&"task_start"));
    assert!(kinds.contains(&"task_complete"));
    assert!(kinds.contains(&"sprint_retro"));

    // The worktree was created beside the repo with the exported diary
    // and auto-commits on the session branch.
    let worktree = temp.path().join("feat-lifecycle-test");
    assert!(worktree.join(".agentbox/journal.md").exists());
    let diary = std::fs::read_to_string(worktree.join(".agentbox/journal.md")).expect("diary");
    assert!(diary.starts_with("# Agentbox Dev Diary"));

    let log = Command::new("git")
        .args(["log", "--oneline"])
        .current_dir(&worktree)
        .output()
        .expect("git log");
    let log = String::from_utf8_lossy(&log.stdout).to_string();
    assert!(log.contains("feat(t1): Scaffold"));
    assert!(log.contains("feat(t2): Wire up"));
}

#[test]
fn cancellation_marks_the_session_cancelled() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = init_repo_with_prd(temp.path());

    let cfg = SupervisorConfig {
        work_dir: repo.to_string_lossy().to_string(),
        branch_name: "feat/cancel-test".to_string(),
        review_enabled: false,
        ..SupervisorConfig::default()
    };

    let workflow = Box::new(GitCli::new("", repo));
    let runner = Box::new(RecordingRunner::new(temp.path().join("feat-cancel-test")));
    let mut supervisor =
        Supervisor::new(cfg, workflow, runner, None).expect("construct supervisor");
    let session_id = supervisor.session_id();
    let store = supervisor.store();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = supervisor.run(&cancel).expect_err("cancelled run");
    assert!(format!("{err:#}").contains("context cancelled"));

    let session = store.get_session(session_id).expect("session");
    assert_eq!(session.status, "cancelled");
}

#[test]
fn missing_prd_marks_the_session_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = init_repo_with_prd(temp.path());
    std::fs::remove_file(repo.join("prd.json")).expect("remove prd");
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-m", "chore: drop prd"]);

    let cfg = SupervisorConfig {
        work_dir: repo.to_string_lossy().to_string(),
        branch_name: "feat/failed-test".to_string(),
        review_enabled: false,
        ..SupervisorConfig::default()
    };

    let workflow = Box::new(GitCli::new("", repo));
    let runner = Box::new(RecordingRunner::new(temp.path().join("feat-failed-test")));
    let mut supervisor =
        Supervisor::new(cfg, workflow, runner, None).expect("construct supervisor");
    let session_id = supervisor.session_id();
    let store = supervisor.store();

    let err = supervisor.run(&CancelToken::new()).expect_err("failed run");
    assert!(format!("{err:#}").contains("importing PRD"));

    let session = store.get_session(session_id).expect("session");
    assert_eq!(session.status, "failed");
}
