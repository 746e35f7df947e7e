//! Product requirements documents: the structured task list a session
//! ingests.
//!
//! PRDs are JSON, validated against an embedded JSON Schema before
//! deserialization. Metadata is computed, never authored.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PRD_SCHEMA: &str = include_str!("../schemas/prd.schema.json");

/// A product requirements document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Prd {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<PrdTask>,
    #[serde(default)]
    pub metadata: PrdMeta,
}

/// Computed task counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrdMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_tasks: u32,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub in_progress: u32,
    #[serde(default)]
    pub pending: u32,
}

/// A single task in the PRD, possibly with nested subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrdTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<PrdTask>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub learnings: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_status() -> String {
    "pending".to_string()
}

/// A task flattened out of the PRD hierarchy for import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: i32,
    pub parent_id: String,
    pub depends_on: Vec<String>,
}

impl Prd {
    /// Read and validate a PRD JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read PRD {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse PRD {}", path.display()))?;
        validate_schema(&value)?;

        let mut prd: Prd = serde_json::from_value(value)
            .with_context(|| format!("parse PRD {} as document", path.display()))?;
        prd.update_metadata();
        Ok(prd)
    }

    /// Write the PRD back, refreshing metadata.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.metadata.updated_at = Some(Utc::now());
        self.update_metadata();

        let mut buf = serde_json::to_string_pretty(self).context("serialize PRD")?;
        buf.push('\n');
        fs::write(path, buf).with_context(|| format!("write PRD {}", path.display()))
    }

    /// Recompute task counts over the whole hierarchy.
    pub fn update_metadata(&mut self) {
        let mut total = 0;
        let mut completed = 0;
        let mut in_progress = 0;
        let mut pending = 0;

        fn count(tasks: &[PrdTask], total: &mut u32, completed: &mut u32, in_progress: &mut u32, pending: &mut u32) {
            for task in tasks {
                *total += 1;
                match task.status.as_str() {
                    "completed" => *completed += 1,
                    "in_progress" => *in_progress += 1,
                    _ => *pending += 1,
                }
                count(&task.subtasks, total, completed, in_progress, pending);
            }
        }
        count(&self.tasks, &mut total, &mut completed, &mut in_progress, &mut pending);

        self.metadata.total_tasks = total;
        self.metadata.completed = completed;
        self.metadata.in_progress = in_progress;
        self.metadata.pending = pending;
    }

    /// Flatten the hierarchy into import-ready tasks, depth first.
    /// Subtasks carry their parent's id and an implicit dependency on
    /// nothing beyond what the document declares.
    pub fn export_tasks(&self) -> Vec<FlatTask> {
        let mut out = Vec::new();
        fn walk(tasks: &[PrdTask], parent_id: &str, out: &mut Vec<FlatTask>) {
            for task in tasks {
                out.push(FlatTask {
                    id: task.id.clone(),
                    title: task.title.clone(),
                    description: task.description.clone(),
                    status: task.status.clone(),
                    priority: task.priority,
                    parent_id: parent_id.to_string(),
                    depends_on: task.depends_on.clone(),
                });
                walk(&task.subtasks, &task.id, out);
            }
        }
        walk(&self.tasks, "", &mut out);
        out
    }

    /// True if every task is completed.
    pub fn is_complete(&self) -> bool {
        self.metadata.pending == 0 && self.metadata.in_progress == 0
    }

    /// Completion percentage.
    pub fn progress(&self) -> f64 {
        if self.metadata.total_tasks == 0 {
            return 100.0;
        }
        self.metadata.completed as f64 / self.metadata.total_tasks as f64 * 100.0
    }
}

/// Validate a PRD document against the embedded schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PRD_SCHEMA).context("parse embedded PRD schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile PRD schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("PRD schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
