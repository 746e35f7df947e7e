//! Task types shared between the in-memory DAG and its callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Deferred,
    Blocked,
}

impl TaskStatus {
    /// Parse a stored status string. Unknown strings map to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "deferred" => Some(TaskStatus::Deferred),
            "blocked" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Blocked => "blocked",
        }
    }
}

/// A condition for task completion, optionally verified by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub description: String,
    /// Shell command that returns 0 when the criterion is met.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
}

/// A single execution attempt on a task, cached on the owning task for
/// scheduler decisions. The store holds the durable copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based, monotonic per task.
    pub number: u32,
    pub agent_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_rollback: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A unit of work with dependencies and execution history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Lower is higher priority.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub complexity: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context_notes: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with defaults suitable for PRD import.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            complexity: 0,
            parent_id: String::new(),
            depends_on: Vec::new(),
            max_attempts: 0,
            context_notes: String::new(),
            acceptance_criteria: Vec::new(),
            tags: Vec::new(),
            attempts: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// True if the task has used all allowed attempts.
    pub fn has_exhausted_attempts(&self) -> bool {
        self.attempts.len() as u32 >= self.max_attempts
    }

    /// The most recent attempt, if any.
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Error messages from all failed attempts, oldest first.
    pub fn failure_history(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|a| !a.success && !a.error_msg.is_empty())
            .map(|a| a.error_msg.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_attempt(number: u32, msg: &str) -> Attempt {
        Attempt {
            number,
            agent_name: "claude".to_string(),
            success: false,
            error_msg: msg.to_string(),
            git_commit: String::new(),
            git_rollback: String::new(),
            tokens_used: 0,
            duration_ms: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn failure_history_skips_successes_and_empty_messages() {
        let mut task = Task::new("t1", "Task 1");
        task.attempts.push(failed_attempt(1, "first failure"));
        task.attempts.push(Attempt {
            success: true,
            error_msg: String::new(),
            ..failed_attempt(2, "")
        });
        task.attempts.push(failed_attempt(3, ""));
        task.attempts.push(failed_attempt(4, "second failure"));

        assert_eq!(task.failure_history(), vec!["first failure", "second failure"]);
    }

    #[test]
    fn exhausted_attempts_compares_against_max() {
        let mut task = Task::new("t1", "Task 1");
        task.max_attempts = 2;
        assert!(!task.has_exhausted_attempts());

        task.attempts.push(failed_attempt(1, "x"));
        task.attempts.push(failed_attempt(2, "y"));
        assert!(task.has_exhausted_attempts());
    }
}
