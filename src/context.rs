//! Per-task prompt assembly for the coding agent.
//!
//! Sections appear in a fixed order and are omitted when empty: project,
//! task block, acceptance criteria, context notes, previous failures,
//! completed work, known failing tests, instructions.

use std::sync::Arc;

use anyhow::{Context, Result};
use minijinja::{context, Environment};
use serde::Serialize;

use crate::agent::STOP_SIGNAL;
use crate::store::Store;
use crate::taskdb::Task;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// How many recent quality snapshots feed the failing-test section.
const FAILING_TEST_WINDOW: u32 = 5;

#[derive(Debug, Serialize)]
struct TaskContext {
    id: String,
    title: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct CompletedContext {
    id: String,
    title: String,
}

#[derive(Debug, Serialize)]
struct FailingTestContext {
    name: String,
    count: u32,
}

/// Builds enriched agent prompts from task state and session history.
pub struct ContextBuilder {
    store: Arc<Store>,
    session_id: i64,
    env: Environment<'static>,
}

impl ContextBuilder {
    pub fn new(store: Arc<Store>, session_id: i64) -> Self {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        Self {
            store,
            session_id,
            env,
        }
    }

    /// Render the full prompt for a task.
    pub fn build_prompt(&self, task: &Task, project: &str) -> Result<String> {
        let completed: Vec<CompletedContext> = self
            .store
            .list_tasks(self.session_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.status == "completed")
            .map(|t| CompletedContext {
                id: t.id,
                title: t.title,
            })
            .collect();

        let failing_tests: Vec<FailingTestContext> = self
            .store
            .failing_test_trend(self.session_id, FAILING_TEST_WINDOW)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, count)| FailingTestContext { name, count })
            .collect();

        let template = self.env.get_template("task").context("load task template")?;
        let rendered = template
            .render(context! {
                project => project,
                task => TaskContext {
                    id: task.id.clone(),
                    title: task.title.clone(),
                    description: task.description.clone(),
                },
                criteria => &task.acceptance_criteria,
                context_notes => &task.context_notes,
                failures => task.failure_history(),
                completed => completed,
                failing_tests => failing_tests,
                stop_signal => STOP_SIGNAL,
            })
            .context("render task prompt")?;
        Ok(rendered)
    }
}
