//! Test-runner output parsers feeding quality snapshots.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Parsed test execution results.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestStats {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_tests: Vec<String>,
}

impl TestStats {
    /// Pass rate between 0 and 1; 0 with no tests.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total as f64
    }
}

static CARGO_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^test (\S+) \.\.\. (ok|FAILED|ignored)").unwrap());
static GO_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^--- (PASS|FAIL|SKIP): (\S+)").unwrap());
static GO_SUMMARY_PASS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ok\s+").unwrap());
static GO_SUMMARY_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^FAIL\s+").unwrap());
static JEST_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tests:\s+(?:(\d+) failed,\s+)?(?:(\d+) skipped,\s+)?(?:(\d+) passed,\s+)?(\d+) total")
        .unwrap()
});
static JEST_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"●\s+(.+)").unwrap());
static GENERIC_PASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(PASS|✓|√|ok)\s").unwrap());
static GENERIC_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(FAIL|✗|✘|×|not ok)\s").unwrap());

/// Parse `cargo test` output.
pub fn parse_cargo_test_output(output: &str) -> TestStats {
    let mut stats = TestStats::default();
    for line in output.lines().map(str::trim) {
        if let Some(caps) = CARGO_TEST_RE.captures(line) {
            stats.total += 1;
            match &caps[2] {
                "ok" => stats.passed += 1,
                "FAILED" => {
                    stats.failed += 1;
                    stats.failed_tests.push(caps[1].to_string());
                }
                "ignored" => stats.skipped += 1,
                _ => {}
            }
        }
    }
    stats
}

/// Parse `go test` output. Falls back to package summary lines when no
/// per-test lines are present.
pub fn parse_go_test_output(output: &str) -> TestStats {
    let mut stats = TestStats::default();
    for line in output.lines().map(str::trim) {
        if let Some(caps) = GO_TEST_RE.captures(line) {
            stats.total += 1;
            match &caps[1] {
                "PASS" => stats.passed += 1,
                "FAIL" => {
                    stats.failed += 1;
                    stats.failed_tests.push(caps[2].to_string());
                }
                "SKIP" => stats.skipped += 1,
                _ => {}
            }
        }
    }

    if stats.total == 0 {
        for line in output.lines().map(str::trim) {
            if GO_SUMMARY_PASS_RE.is_match(line) {
                stats.total += 1;
                stats.passed += 1;
            } else if GO_SUMMARY_FAIL_RE.is_match(line) {
                stats.total += 1;
                stats.failed += 1;
            }
        }
    }

    stats
}

/// Parse Jest test runner output.
pub fn parse_jest_output(output: &str) -> TestStats {
    let mut stats = TestStats::default();
    for line in output.lines().map(str::trim) {
        if let Some(caps) = JEST_SUMMARY_RE.captures(line) {
            stats.failed = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            stats.skipped = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            stats.passed = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            stats.total = caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            break;
        }
    }

    for line in output.lines() {
        if let Some(caps) = JEST_FAIL_RE.captures(line) {
            stats.failed_tests.push(caps[1].trim().to_string());
        }
    }

    stats
}

/// Parse unknown test output by counting PASS/FAIL-shaped lines.
pub fn parse_generic_test_output(output: &str) -> TestStats {
    let mut stats = TestStats::default();
    for line in output.lines().map(str::trim) {
        if GENERIC_PASS_RE.is_match(line) {
            stats.total += 1;
            stats.passed += 1;
        } else if GENERIC_FAIL_RE.is_match(line) {
            stats.total += 1;
            stats.failed += 1;
            stats.failed_tests.push(line.to_string());
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cargo_test_lines() {
        let output = "\
running 3 tests
test store::tests::opens ... ok
test taskdb::tests::cycle ... FAILED
test slow_one ... ignored

test result: FAILED. 1 passed; 1 failed; 1 ignored; 0 measured
";
        let stats = parse_cargo_test_output(output);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed_tests, vec!["taskdb::tests::cycle"]);
    }

    #[test]
    fn parses_go_test_lines() {
        let output = "\
--- PASS: TestOne (0.00s)
--- FAIL: TestTwo (0.01s)
--- SKIP: TestThree (0.00s)
FAIL	example.com/pkg	0.012s
";
        let stats = parse_go_test_output(output);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed_tests, vec!["TestTwo"]);
    }

    #[test]
    fn go_parser_falls_back_to_summary_lines() {
        let output = "ok  \texample.com/a\t0.01s\nFAIL\texample.com/b\t0.02s\n";
        let stats = parse_go_test_output(output);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn parses_jest_summary_and_failures() {
        let output = "\
● button renders correctly

Tests:       2 failed, 1 skipped, 7 passed, 10 total
";
        let stats = parse_jest_output(output);
        assert_eq!(stats.total, 10);
        assert_eq!(stats.passed, 7);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed_tests, vec!["button renders correctly"]);
    }

    #[test]
    fn generic_parser_counts_pass_fail_lines() {
        let output = "PASS check one\nFAIL check two\nsome noise\nok check three\n";
        let stats = parse_generic_test_output(output);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.passed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn pass_rate_handles_empty_stats() {
        assert_eq!(TestStats::default().pass_rate(), 0.0);
        let stats = TestStats {
            total: 4,
            passed: 3,
            ..TestStats::default()
        };
        assert!((stats.pass_rate() - 0.75).abs() < 1e-9);
    }
}
