//! In-memory task database with DAG dependency tracking.
//!
//! The authoritative scheduling view of a session. The store holds the
//! durable copy; this index is refreshed on load and mutated in lockstep
//! with the store during structural operations. All mutations are
//! serialized under a single mutex so split/merge never expose
//! intermediate state.

mod task;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use task::{AcceptanceCriterion, Attempt, Task, TaskStatus};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_COMPLEXITY: u32 = 3;

/// Error returned when a dependency edge would close a cycle. The edge is
/// rolled back before this is returned.
#[derive(Debug, thiserror::Error)]
#[error("adding dependency {task} -> {depends_on} would create a cycle")]
pub struct CycleError {
    pub task: String,
    pub depends_on: String,
}

/// Task counts by status bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    /// pending + in_progress.
    pub pending: usize,
    pub failed: usize,
    pub deferred: usize,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Snapshot {
    tasks: HashMap<String, Task>,
}

/// In-memory DAG of tasks, safe to share across the supervisor and sprint
/// runner.
#[derive(Debug, Default)]
pub struct TaskDb {
    inner: Mutex<HashMap<String, Task>>,
}

impl TaskDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.inner.lock().expect("task db mutex poisoned")
    }

    /// Insert a task, filling defaults for max_attempts, complexity, and
    /// created_at. Fails on a duplicate id.
    pub fn add(&self, task: Task) -> Result<()> {
        let mut tasks = self.lock();
        add_locked(&mut tasks, task)
    }

    /// Return a clone of the task, if present.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot of every task, in unspecified order.
    pub fn tasks(&self) -> Vec<Task> {
        self.lock().values().cloned().collect()
    }

    /// Add a dependency edge `task -> depends_on`, then verify acyclicity.
    ///
    /// If the new edge makes `task` reachable from `depends_on`, the edge is
    /// rolled back and a [`CycleError`] is returned. Duplicate edges are
    /// idempotent.
    pub fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<()> {
        let mut tasks = self.lock();

        if !tasks.contains_key(task_id) {
            bail!("task {task_id} not found");
        }
        if !tasks.contains_key(depends_on) {
            bail!("dependency {depends_on} not found");
        }

        let task = tasks.get_mut(task_id).expect("checked above");
        if task.depends_on.iter().any(|d| d == depends_on) {
            return Ok(());
        }

        // Simulate the addition, then check reachability from the new
        // upstream back to the task.
        task.depends_on.push(depends_on.to_string());
        if reaches(&tasks, depends_on, task_id) {
            let task = tasks.get_mut(task_id).expect("checked above");
            task.depends_on.pop();
            return Err(anyhow!(CycleError {
                task: task_id.to_string(),
                depends_on: depends_on.to_string(),
            }));
        }

        Ok(())
    }

    /// Find all cycles in the dependency graph. Diagnostics only; a healthy
    /// database always returns an empty list.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let tasks = self.lock();
        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        let mut ids: Vec<&String> = tasks.keys().collect();
        ids.sort();
        for id in ids {
            if !visited.contains(id.as_str()) {
                cycle_dfs(&tasks, id, &mut visited, &mut on_stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    /// Select the next runnable task.
    ///
    /// A candidate is pending or in_progress, has strictly fewer attempts
    /// than its max_attempts, and has every upstream completed. Candidates
    /// are ordered by (priority asc, created_at asc); ties break on id for
    /// determinism. Returns `None` when nothing is runnable.
    pub fn next_task(&self) -> Option<Task> {
        let tasks = self.lock();

        let completed: HashSet<&str> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();

        let mut candidates: Vec<&Task> = tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .filter(|t| !t.has_exhausted_attempts())
            .filter(|t| t.depends_on.iter().all(|d| completed.contains(d.as_str())))
            .collect();

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.first().map(|t| (*t).clone())
    }

    /// Decompose a task into subtasks, marking the parent deferred.
    ///
    /// Each subtask inherits the parent's upstream dependencies. Edges that
    /// pointed at the parent are rewritten to the last subtask; subtasks
    /// that must depend on each other must carry those edges explicitly.
    /// Atomic: on error the database is unchanged.
    pub fn split_task(&self, parent_id: &str, subtasks: Vec<Task>) -> Result<()> {
        if subtasks.is_empty() {
            bail!("split of {parent_id} requires at least one subtask");
        }

        let mut tasks = self.lock();
        let parent_deps = match tasks.get(parent_id) {
            Some(parent) => parent.depends_on.clone(),
            None => bail!("task {parent_id} not found"),
        };
        let mut seen = HashSet::new();
        for sub in &subtasks {
            if tasks.contains_key(&sub.id) || !seen.insert(sub.id.clone()) {
                bail!("task {} already exists", sub.id);
            }
        }

        let last_id = subtasks.last().expect("non-empty").id.clone();
        for mut sub in subtasks {
            sub.parent_id = parent_id.to_string();
            for dep in &parent_deps {
                if !sub.depends_on.contains(dep) {
                    sub.depends_on.push(dep.clone());
                }
            }
            add_locked(&mut tasks, sub).expect("duplicate ids checked above");
        }

        for task in tasks.values_mut() {
            for dep in &mut task.depends_on {
                if dep == parent_id {
                    *dep = last_id.clone();
                }
            }
        }

        tasks
            .get_mut(parent_id)
            .expect("parent existence checked above")
            .status = TaskStatus::Deferred;
        Ok(())
    }

    /// Combine several tasks into one.
    ///
    /// The union of the old tasks' upstreams becomes the new task's
    /// upstreams; every edge into an old id is redirected to the new task
    /// and deduplicated; the old entries are removed. Atomic: on error the
    /// database is unchanged.
    pub fn merge_tasks(&self, mut new_task: Task, old_ids: &[String]) -> Result<()> {
        let mut tasks = self.lock();

        if tasks.contains_key(&new_task.id) {
            bail!("task {} already exists", new_task.id);
        }
        for id in old_ids {
            if !tasks.contains_key(id) {
                bail!("task {id} not found");
            }
        }

        let old_set: HashSet<&str> = old_ids.iter().map(String::as_str).collect();
        let mut merged_deps: Vec<String> = new_task.depends_on.clone();
        for id in old_ids {
            let old = tasks.get(id).expect("checked above");
            for dep in &old.depends_on {
                if dep != &new_task.id && !old_set.contains(dep.as_str()) && !merged_deps.contains(dep) {
                    merged_deps.push(dep.clone());
                }
            }
        }
        new_task.depends_on = merged_deps;

        for task in tasks.values_mut() {
            let mut seen = HashSet::new();
            let mut deduped = Vec::with_capacity(task.depends_on.len());
            for dep in task.depends_on.drain(..) {
                let dep = if old_set.contains(dep.as_str()) {
                    new_task.id.clone()
                } else {
                    dep
                };
                if seen.insert(dep.clone()) {
                    deduped.push(dep);
                }
            }
            task.depends_on = deduped;
        }

        for id in old_ids {
            tasks.remove(id);
        }

        add_locked(&mut tasks, new_task)
    }

    /// Record an attempt on a task's in-memory history.
    pub fn record_attempt(&self, task_id: &str, attempt: Attempt) -> Result<()> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("task {task_id} not found"))?;
        task.attempts.push(attempt);
        Ok(())
    }

    /// Set a task's status. Sets completed_at iff the new status is
    /// completed, and clears it otherwise.
    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("task {task_id} not found"))?;
        task.status = status;
        task.completed_at = match status {
            TaskStatus::Completed => Some(Utc::now()),
            _ => None,
        };
        Ok(())
    }

    /// True iff the database is non-empty and every task is completed or
    /// deferred.
    pub fn is_complete(&self) -> bool {
        let tasks = self.lock();
        !tasks.is_empty()
            && tasks
                .values()
                .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Deferred))
    }

    pub fn stats(&self) -> TaskStats {
        let tasks = self.lock();
        let mut stats = TaskStats::default();
        for task in tasks.values() {
            stats.total += 1;
            match task.status {
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Pending | TaskStatus::InProgress => stats.pending += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Deferred => stats.deferred += 1,
                TaskStatus::Blocked => {}
            }
        }
        stats
    }

    /// Persist the database as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tasks = self.lock();
        let snapshot = Snapshot {
            tasks: tasks.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&snapshot).context("serialize task db")?;
        buf.push('\n');
        fs::write(path, buf).with_context(|| format!("write {}", path.display()))
    }

    /// Load a database previously written by [`TaskDb::save`].
    ///
    /// Round-trip invariant: `load(save(db))` is structurally equal to `db`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let snapshot: Snapshot =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        Ok(Self {
            inner: Mutex::new(snapshot.tasks),
        })
    }

    /// Structural equality against another database (test support and the
    /// save/load invariant).
    pub fn structurally_eq(&self, other: &TaskDb) -> bool {
        *self.lock() == *other.lock()
    }
}

fn add_locked(tasks: &mut HashMap<String, Task>, mut task: Task) -> Result<()> {
    if tasks.contains_key(&task.id) {
        bail!("task {} already exists", task.id);
    }
    if task.max_attempts == 0 {
        task.max_attempts = DEFAULT_MAX_ATTEMPTS;
    }
    if task.complexity == 0 {
        task.complexity = DEFAULT_COMPLEXITY;
    }
    tasks.insert(task.id.clone(), task);
    Ok(())
}

/// True if `target` is reachable from `from` via dependency edges.
fn reaches(tasks: &HashMap<String, Task>, from: &str, target: &str) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(task) = tasks.get(id) {
            for dep in &task.depends_on {
                stack.push(dep);
            }
        }
    }
    false
}

fn cycle_dfs(
    tasks: &HashMap<String, Task>,
    id: &str,
    visited: &mut HashSet<String>,
    on_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(id.to_string());
    on_stack.insert(id.to_string());
    path.push(id.to_string());

    if let Some(task) = tasks.get(id) {
        for dep in &task.depends_on {
            if !visited.contains(dep) {
                cycle_dfs(tasks, dep, visited, on_stack, path, cycles);
            } else if on_stack.contains(dep) {
                // Found a back edge. Emit the cycle from the on-stack
                // occurrence of `dep` through the current path.
                let mut cycle = vec![dep.clone()];
                for node in path.iter().rev() {
                    cycle.push(node.clone());
                    if node == dep {
                        break;
                    }
                }
                cycles.push(cycle);
            }
        }
    }

    path.pop();
    on_stack.remove(id);
}
