//! Dev diary for supervisor sessions.
//!
//! A thin, session-scoped facade over the store's journal tables plus the
//! markdown rendering used for the exported diary.

use std::sync::Arc;

use anyhow::Result;

use crate::store::{JournalEntry, JournalQuery, Store};

/// Category of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    TaskStart,
    TaskComplete,
    TaskFailed,
    SprintRetro,
    ReviewReceived,
    Reflection,
    FinalWrapUp,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::TaskStart => "task_start",
            EntryKind::TaskComplete => "task_complete",
            EntryKind::TaskFailed => "task_failed",
            EntryKind::SprintRetro => "sprint_retro",
            EntryKind::ReviewReceived => "review_received",
            EntryKind::Reflection => "reflection",
            EntryKind::FinalWrapUp => "final_wrap_up",
        }
    }
}

/// Session-scoped journal handle.
#[derive(Clone)]
pub struct Journal {
    store: Arc<Store>,
    session_id: i64,
}

impl Journal {
    pub fn new(store: Arc<Store>, session_id: i64) -> Self {
        Self { store, session_id }
    }

    /// Append an entry under this journal's session.
    pub fn add(&self, entry: &JournalEntry) -> Result<()> {
        let mut entry = entry.clone();
        entry.session_id = self.session_id;
        self.store.add_journal_entry(&entry)
    }

    pub fn entries(&self, query: &JournalQuery) -> Result<Vec<JournalEntry>> {
        self.store.journal_entries(self.session_id, query)
    }

    /// Render the whole session as a human-readable markdown diary.
    pub fn export_markdown(&self) -> Result<String> {
        let entries = self.entries(&JournalQuery::default())?;

        let mut out = String::from("# Agentbox Dev Diary\n\n");
        for entry in &entries {
            out.push_str(&render_entry(entry));
            out.push_str("\n---\n\n");
        }
        Ok(out)
    }
}

/// Format a single journal entry as markdown.
pub fn render_entry(entry: &JournalEntry) -> String {
    let mut out = String::new();
    out.push_str(&format!("## Iteration {} — {}\n", entry.iteration, entry.summary));

    let stamp = entry
        .timestamp
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    out.push_str(&format!("**{stamp} | Sprint {}", entry.sprint));
    if entry.confidence > 0 {
        out.push_str(&format!(" | Confidence: {}/5", entry.confidence));
    }
    if entry.difficulty > 0 {
        out.push_str(&format!(" | Difficulty: {}/5", entry.difficulty));
    }
    if entry.momentum > 0 {
        out.push_str(&format!(" | Momentum: {}/5", entry.momentum));
    }
    out.push_str("**\n\n");
    out.push_str(&entry.reflection);
    out.push('\n');
    out
}

/// Build a prompt asking the agent to write a diary entry about the last
/// iteration.
pub fn build_reflection_prompt(
    task_title: &str,
    success: bool,
    attempt_num: u32,
    error_msg: &str,
    quality_trend: &str,
    next_task_title: &str,
) -> String {
    let mut out = String::new();
    out.push_str("Write a brief, honest dev diary entry reflecting on what just happened.\n\n");
    out.push_str(&format!("Task: {task_title}\n"));

    if success {
        out.push_str(&format!("Result: Completed successfully on attempt {attempt_num}\n"));
    } else {
        out.push_str(&format!("Result: Failed on attempt {attempt_num}\n"));
        if !error_msg.is_empty() {
            out.push_str(&format!("Error: {error_msg}\n"));
        }
    }

    if !quality_trend.is_empty() {
        out.push_str(&format!("Quality trend: {quality_trend}\n"));
    }
    if !next_task_title.is_empty() {
        out.push_str(&format!("Next task: {next_task_title}\n"));
    }

    out.push_str("\nRespond with JSON:\n");
    out.push_str(r#"{"reflection": "Your freeform thoughts...", "confidence": N, "difficulty": N, "momentum": N}"#);
    out.push_str("\n\nconfidence/difficulty/momentum are 1-5 integers.\n");
    out.push_str("Be honest and specific. Mention what surprised you, what was hard, what you'd do differently.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;

    fn seeded() -> (tempfile::TempDir, Journal) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(open_store(temp.path()).expect("open"));
        let session = store.create_session("repo", "branch", "").expect("session");
        (temp, Journal::new(store, session))
    }

    #[test]
    fn add_then_entries_round_trips() {
        let (_temp, journal) = seeded();
        journal
            .add(&JournalEntry {
                kind: EntryKind::TaskStart.as_str().to_string(),
                iteration: 1,
                summary: "Starting: fix parser".to_string(),
                reflection: "Here we go".to_string(),
                ..JournalEntry::default()
            })
            .expect("add");

        let entries = journal.entries(&JournalQuery::default()).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "task_start");
        assert_eq!(entries[0].summary, "Starting: fix parser");
    }

    #[test]
    fn export_markdown_renders_headers_and_ratings() {
        let (_temp, journal) = seeded();
        journal
            .add(&JournalEntry {
                kind: EntryKind::Reflection.as_str().to_string(),
                sprint: 2,
                iteration: 7,
                summary: "Tough one".to_string(),
                reflection: "The dependency graph bit back today.".to_string(),
                confidence: 3,
                difficulty: 5,
                momentum: 2,
                ..JournalEntry::default()
            })
            .expect("add");

        let md = journal.export_markdown().expect("export");
        assert!(md.starts_with("# Agentbox Dev Diary"));
        assert!(md.contains("## Iteration 7 — Tough one"));
        assert!(md.contains("Sprint 2"));
        assert!(md.contains("Confidence: 3/5"));
        assert!(md.contains("Difficulty: 5/5"));
        assert!(md.contains("Momentum: 2/5"));
        assert!(md.contains("The dependency graph bit back today."));
    }

    #[test]
    fn render_entry_omits_zero_ratings() {
        let entry = JournalEntry {
            iteration: 1,
            summary: "plain".to_string(),
            reflection: "text".to_string(),
            ..JournalEntry::default()
        };
        let rendered = render_entry(&entry);
        assert!(!rendered.contains("Confidence"));
        assert!(!rendered.contains("Momentum"));
    }

    #[test]
    fn reflection_prompt_mentions_failure_details() {
        let prompt =
            build_reflection_prompt("Fix parser", false, 2, "tests exploded", "degrading", "Docs");
        assert!(prompt.contains("Task: Fix parser"));
        assert!(prompt.contains("Failed on attempt 2"));
        assert!(prompt.contains("Error: tests exploded"));
        assert!(prompt.contains("Quality trend: degrading"));
        assert!(prompt.contains("Next task: Docs"));
        assert!(prompt.contains("confidence/difficulty/momentum are 1-5 integers"));
    }

    #[test]
    fn reflection_prompt_success_has_no_error_line() {
        let prompt = build_reflection_prompt("Fix parser", true, 1, "", "", "");
        assert!(prompt.contains("Completed successfully on attempt 1"));
        assert!(!prompt.contains("Error:"));
        assert!(!prompt.contains("Next task:"));
    }
}
