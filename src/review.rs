//! Code review orchestration via a separate review agent.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;

/// Impact of a review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Significant,
    Minor,
    Nit,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Significant => "significant",
            Severity::Minor => "minor",
            Severity::Nit => "nit",
        }
    }

    /// Blockers are findings the session must fix before approval.
    pub fn is_blocker(&self) -> bool {
        matches!(self, Severity::Critical | Severity::Significant)
    }
}

/// A single issue found during review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
}

/// The complete review outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub approved: bool,
    #[serde(default = "Utc::now")]
    pub reviewed_at: DateTime<Utc>,
    #[serde(default)]
    pub review_agent: String,
}

impl ReviewResult {
    pub fn has_blockers(&self) -> bool {
        self.findings.iter().any(|f| f.severity.is_blocker())
    }

    /// Only critical and significant findings.
    pub fn blocker_findings(&self) -> Vec<&Finding> {
        self.findings.iter().filter(|f| f.severity.is_blocker()).collect()
    }

    /// Finding counts grouped by severity.
    pub fn count_by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for finding in &self.findings {
            *counts.entry(finding.severity).or_insert(0) += 1;
        }
        counts
    }
}

/// Capability interface for the review gate. Test doubles replace it
/// wholesale.
pub trait Reviewer {
    fn review(
        &self,
        cancel: &CancelToken,
        workdir: &Path,
        diff: &str,
        changed_files: &[String],
        metrics_summary: &str,
    ) -> anyhow::Result<ReviewResult>;
}

const DIFF_LIMIT_BYTES: usize = 50_000;

/// Build the prompt for the review agent.
pub fn build_review_prompt(diff: &str, changed_files: &[String], test_summary: &str) -> String {
    let mut out = String::new();
    out.push_str("You are a code reviewer. Review the following changes carefully.\n\n");
    out.push_str("Focus on:\n");
    out.push_str("1. Bugs and logic errors\n");
    out.push_str("2. Security vulnerabilities\n");
    out.push_str("3. Test coverage gaps\n");
    out.push_str("4. Architectural issues\n");
    out.push_str("5. Performance problems\n\n");

    out.push_str("Changed files:\n");
    for file in changed_files {
        out.push_str(&format!("- {file}\n"));
    }
    out.push('\n');

    if !test_summary.is_empty() {
        out.push_str("Test results:\n");
        out.push_str(test_summary);
        out.push_str("\n\n");
    }

    out.push_str("Diff:\n```\n");
    if diff.len() > DIFF_LIMIT_BYTES {
        let mut end = DIFF_LIMIT_BYTES;
        while !diff.is_char_boundary(end) {
            end -= 1;
        }
        out.push_str(&diff[..end]);
        out.push_str("\n... (truncated)\n");
    } else {
        out.push_str(diff);
    }
    out.push_str("```\n\n");

    out.push_str("Respond with JSON only:\n");
    out.push_str(
        r#"{
  "findings": [
    {"severity": "critical|significant|minor|nit", "file": "path", "line": N, "description": "...", "suggestion": "..."}
  ],
  "summary": "Overall assessment",
  "approved": true|false
}"#,
    );
    out.push_str("\n\napproved=true means no critical or significant issues.\n");
    out
}

/// Parse agent output into a [`ReviewResult`].
///
/// Tolerant by design: if no JSON object can be extracted or parsed, a
/// non-approved result with an explanatory summary is returned rather than
/// an error. An approved flag that contradicts blocker findings is coerced
/// to false.
pub fn parse_review_output(review_agent: &str, output: &str) -> ReviewResult {
    let fallback = |summary: String| ReviewResult {
        findings: Vec::new(),
        summary,
        approved: false,
        reviewed_at: Utc::now(),
        review_agent: review_agent.to_string(),
    };

    let Some(json) = extract_json(output) else {
        return fallback("Could not parse review output".to_string());
    };

    let mut result: ReviewResult = match serde_json::from_str(json) {
        Ok(result) => result,
        Err(err) => return fallback(format!("Failed to parse review JSON: {err}")),
    };

    result.reviewed_at = Utc::now();
    result.review_agent = review_agent.to_string();
    if result.has_blockers() {
        result.approved = false;
    }
    result
}

/// Find the outermost JSON object in free-form output.
fn extract_json(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&output[start..=end])
}
