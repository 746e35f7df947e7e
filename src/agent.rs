//! Agent execution seam.
//!
//! The [`AgentRunner`] trait decouples the sprint loop from the actual
//! agent backend (a containerized CLI, a local process, or a test double).
//! The core treats the runner as opaque: it reports success, output, and
//! an error message per task.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::process::run_captured;

/// The literal substring an agent emits to declare task completion.
pub const STOP_SIGNAL: &str = "<promise>COMPLETE</promise>";

/// True if the agent output declares completion.
pub fn contains_stop_signal(output: &str) -> bool {
    output.contains(STOP_SIGNAL)
}

/// The slice of a task an agent runner sees.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub error: String,
}

/// Abstraction over agent execution backends.
pub trait AgentRunner {
    /// Run the agent on one task with the given prompt. Implementations
    /// should honor the cancellation token where they can.
    fn run_task(&self, cancel: &CancelToken, task: &TaskView, prompt: &str) -> AgentResult;
}

/// Stub runner that always reports failure. Used for dry runs and when no
/// real agent is configured.
pub struct NoopAgentRunner;

impl AgentRunner for NoopAgentRunner {
    fn run_task(&self, _cancel: &CancelToken, task: &TaskView, _prompt: &str) -> AgentResult {
        AgentResult {
            task_id: task.id.clone(),
            success: false,
            output: String::new(),
            error: "no agent runner configured".to_string(),
        }
    }
}

/// Runner that spawns a configured command, feeds the prompt on stdin,
/// and scans the output for the stop signal.
pub struct ProcessAgentRunner {
    /// Command and arguments, e.g. `["claude", "-p"]`.
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl AgentRunner for ProcessAgentRunner {
    #[instrument(skip_all, fields(task_id = %task.id))]
    fn run_task(&self, cancel: &CancelToken, task: &TaskView, prompt: &str) -> AgentResult {
        if cancel.is_cancelled() {
            return AgentResult {
                task_id: task.id.clone(),
                success: false,
                output: String::new(),
                error: "cancelled before agent start".to_string(),
            };
        }
        let Some(program) = self.command.first() else {
            return AgentResult {
                task_id: task.id.clone(),
                success: false,
                output: String::new(),
                error: "empty agent command".to_string(),
            };
        };

        info!(agent = %program, "starting agent process");
        let mut cmd = std::process::Command::new(program);
        cmd.args(&self.command[1..]).current_dir(&self.workdir);

        let captured = match run_captured(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            "agent",
        ) {
            Ok(captured) => captured,
            Err(err) => {
                warn!(%err, "agent process failed to run");
                return AgentResult {
                    task_id: task.id.clone(),
                    success: false,
                    output: String::new(),
                    error: format!("agent process failed: {err:#}"),
                };
            }
        };

        if captured.timed_out {
            return AgentResult {
                task_id: task.id.clone(),
                success: false,
                output: captured.transcript,
                error: format!("agent timed out after {:?}", self.timeout),
            };
        }

        let success = captured.status.success() && contains_stop_signal(&captured.transcript);
        let error = if success {
            String::new()
        } else if !captured.status.success() {
            format!("agent exited with status {:?}", captured.status.code())
        } else {
            "agent finished without emitting the completion signal".to_string()
        };

        AgentResult {
            task_id: task.id.clone(),
            success,
            output: captured.transcript,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> TaskView {
        TaskView {
            id: "t1".to_string(),
            title: "Task".to_string(),
            description: "Desc".to_string(),
        }
    }

    #[test]
    fn stop_signal_is_a_substring_match() {
        assert!(contains_stop_signal("all done <promise>COMPLETE</promise> bye"));
        assert!(!contains_stop_signal("almost <promise>COMPLET"));
    }

    #[test]
    fn noop_runner_always_fails() {
        let result = NoopAgentRunner.run_task(&CancelToken::new(), &view(), "prompt");
        assert!(!result.success);
        assert_eq!(result.error, "no agent runner configured");
    }

    #[test]
    fn process_runner_succeeds_on_stop_signal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessAgentRunner {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /dev/null; echo '<promise>COMPLETE</promise>'".to_string(),
            ],
            workdir: temp.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };
        let result = runner.run_task(&CancelToken::new(), &view(), "do the thing");
        assert!(result.success, "unexpected error: {}", result.error);
        assert!(result.output.contains(STOP_SIGNAL));
    }

    #[test]
    fn process_runner_fails_without_stop_signal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessAgentRunner {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /dev/null; echo 'still working'".to_string(),
            ],
            workdir: temp.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };
        let result = runner.run_task(&CancelToken::new(), &view(), "prompt");
        assert!(!result.success);
        assert!(result.error.contains("completion signal"));
    }

    #[test]
    fn process_runner_respects_prior_cancellation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessAgentRunner {
            command: vec!["sh".to_string()],
            workdir: temp.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = runner.run_task(&cancel, &view(), "prompt");
        assert!(!result.success);
        assert!(result.error.contains("cancelled"));
    }
}
