//! Quality check execution behind a command allowlist.
//!
//! Checks run arbitrary project tooling after an iteration, so the first
//! token of every command must match a known build/test tool.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::process::run_captured;

use super::parsers::{parse_cargo_test_output, parse_generic_test_output, TestStats};

/// A named command to run after an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub name: String,
    pub command: String,
}

/// Outcome of a single quality check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_excerpt: String,
}

/// Outcome of running a check suite.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckOutcome {
    pub overall_pass: bool,
    pub checks: Vec<CheckResult>,
    pub stats: TestStats,
}

const ALLOWED_COMMANDS: &[&str] = &[
    "npm", "npx", "pnpm", "yarn", "bun", "go", "cargo", "rustc", "python", "python3", "pytest",
    "pip", "make", "gradle", "mvn", "eslint", "prettier", "tsc", "jest", "vitest", "mocha",
];

const OUTPUT_LIMIT_BYTES: usize = 100_000;
const EXCERPT_LIMIT_BYTES: usize = 2_000;

/// Validate that a command's first token (basename) is on the allowlist.
pub fn validate_check_command(command: &str) -> Result<()> {
    let Some(first) = command.split_whitespace().next() else {
        bail!("empty command");
    };
    let base = Path::new(first)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| first.to_string());

    if ALLOWED_COMMANDS.contains(&base.as_str()) {
        return Ok(());
    }
    bail!("command not in allowlist: {base} (allowed: {ALLOWED_COMMANDS:?})")
}

/// Run every check in `workdir`, each under `timeout`. Validation failures
/// abort before anything runs; execution failures mark the suite failed
/// but keep running remaining checks.
#[instrument(skip_all, fields(checks = checks.len()))]
pub fn run_quality_checks(
    workdir: &Path,
    checks: &[QualityCheck],
    timeout: Duration,
) -> Result<CheckOutcome> {
    for check in checks {
        validate_check_command(&check.command)
            .map_err(|err| err.context(format!("invalid quality check {}", check.name)))?;
    }

    let mut outcome = CheckOutcome {
        overall_pass: true,
        ..CheckOutcome::default()
    };

    for check in checks {
        debug!(name = %check.name, "running quality check");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &check.command]).current_dir(workdir);

        let captured = run_captured(cmd, None, timeout, OUTPUT_LIMIT_BYTES, &check.name)?;
        let passed = captured.success();

        // Prefer the cargo parser when it recognizes anything; fall back
        // to generic PASS/FAIL counting.
        let stats = {
            let cargo = parse_cargo_test_output(&captured.transcript);
            if cargo.total > 0 {
                cargo
            } else {
                parse_generic_test_output(&captured.transcript)
            }
        };
        outcome.stats.total += stats.total;
        outcome.stats.passed += stats.passed;
        outcome.stats.failed += stats.failed;
        outcome.stats.skipped += stats.skipped;
        outcome.stats.failed_tests.extend(stats.failed_tests);

        if !passed {
            outcome.overall_pass = false;
        }
        outcome.checks.push(CheckResult {
            name: check.name.clone(),
            passed,
            output_excerpt: excerpt(&captured.transcript),
        });
    }

    Ok(outcome)
}

fn excerpt(output: &str) -> String {
    if output.len() <= EXCERPT_LIMIT_BYTES {
        return output.to_string();
    }
    let mut end = EXCERPT_LIMIT_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_accepts_known_tools() {
        for command in ["cargo test", "npm run lint", "/usr/bin/make check", "pytest -x"] {
            validate_check_command(command).expect("allowed");
        }
    }

    #[test]
    fn allowlist_rejects_unknown_tools() {
        let err = validate_check_command("rm -rf /").expect_err("disallowed");
        assert!(err.to_string().contains("not in allowlist"));
        assert!(err.to_string().contains("rm"));

        let err = validate_check_command("").expect_err("empty");
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn invalid_check_aborts_before_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let checks = vec![QualityCheck {
            name: "bad".to_string(),
            command: "curl evil.example".to_string(),
        }];
        let err = run_quality_checks(temp.path(), &checks, Duration::from_secs(5))
            .expect_err("validation failure");
        assert!(format!("{err:#}").contains("invalid quality check bad"));
    }

    #[test]
    fn empty_suite_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome =
            run_quality_checks(temp.path(), &[], Duration::from_secs(5)).expect("outcome");
        assert!(outcome.overall_pass);
        assert!(outcome.checks.is_empty());
    }
}
