//! Supervisor configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::metrics::{Budget, QualityCheck};

/// When the review gate runs.
pub const REVIEW_AFTER_SPRINT: &str = "sprint";
pub const REVIEW_AFTER_PR: &str = "pr";

/// Supervisor configuration (TOML). Missing fields default to sensible
/// values so a minimal file stays minimal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Iterations per sprint.
    pub sprint_size: u32,
    pub max_sprints: u32,
    /// Consecutive failed iterations before a sprint aborts.
    pub max_consecutive_fails: u32,

    /// Primary coding agent name.
    pub agent: String,
    pub review_agent: String,
    pub fallback_agent: String,

    /// "sprint" or "pr".
    pub review_after: String,
    pub max_review_rounds: u32,

    pub budget: BudgetConfig,

    pub journal_enabled: bool,
    pub review_enabled: bool,
    pub auto_commit: bool,

    /// Repository to clone; empty means the workdir is already a checkout.
    pub repo_url: String,
    /// PRD path, relative to the worktree unless absolute.
    pub prd_file: String,
    pub work_dir: String,
    /// Branch for the session worktree; empty generates one.
    pub branch_name: String,

    /// Commands run after each successful iteration.
    pub quality_checks: Vec<QualityCheck>,
    /// Per-check timeout.
    pub quality_check_timeout_secs: u64,
}

/// Budget limits as configured. Zero means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_tokens: u64,
    pub max_duration_secs: u64,
    /// Human-readable duration ("8h", "30m"). When set, overrides
    /// `max_duration_secs` via [`SupervisorConfig::parse_budget_duration`].
    pub max_duration: String,
    pub max_iterations: u32,
    /// Warn threshold in percent (0-100); 0 falls back to 80.
    pub warn_threshold_percent: u8,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1_000_000,
            max_duration_secs: 8 * 60 * 60,
            max_duration: String::new(),
            max_iterations: 100,
            warn_threshold_percent: 80,
        }
    }
}

impl BudgetConfig {
    pub fn to_budget(&self) -> Budget {
        Budget {
            max_tokens: self.max_tokens,
            max_duration: Duration::from_secs(self.max_duration_secs),
            max_iterations: self.max_iterations,
            warn_threshold: if self.warn_threshold_percent == 0 {
                0.8
            } else {
                f64::from(self.warn_threshold_percent) / 100.0
            },
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sprint_size: 5,
            max_sprints: 20,
            max_consecutive_fails: 3,
            agent: "claude".to_string(),
            review_agent: "claude".to_string(),
            fallback_agent: String::new(),
            review_after: REVIEW_AFTER_SPRINT.to_string(),
            max_review_rounds: 2,
            budget: BudgetConfig::default(),
            journal_enabled: true,
            review_enabled: true,
            auto_commit: true,
            repo_url: String::new(),
            prd_file: "prd.json".to_string(),
            work_dir: String::new(),
            branch_name: String::new(),
            quality_checks: Vec::new(),
            quality_check_timeout_secs: 10 * 60,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sprint_size == 0 {
            bail!("sprint_size must be > 0");
        }
        if self.max_sprints == 0 {
            bail!("max_sprints must be > 0");
        }
        if self.max_consecutive_fails == 0 {
            bail!("max_consecutive_fails must be > 0");
        }
        if self.review_after != REVIEW_AFTER_SPRINT && self.review_after != REVIEW_AFTER_PR {
            bail!(
                "review_after must be {REVIEW_AFTER_SPRINT:?} or {REVIEW_AFTER_PR:?}, got {:?}",
                self.review_after
            );
        }
        if self.budget.warn_threshold_percent > 100 {
            bail!("budget.warn_threshold_percent must be <= 100");
        }
        if !self.budget.max_duration.is_empty() {
            humantime::parse_duration(&self.budget.max_duration).with_context(|| {
                format!("budget.max_duration {:?} is not a duration", self.budget.max_duration)
            })?;
        }
        for check in &self.quality_checks {
            crate::metrics::validate_check_command(&check.command)
                .with_context(|| format!("quality check {:?}", check.name))?;
        }
        Ok(())
    }

    /// Fold the human-readable `budget.max_duration` string ("8h", "30m")
    /// into `budget.max_duration_secs`. A no-op when the string is empty.
    pub fn parse_budget_duration(&mut self) -> Result<()> {
        if self.budget.max_duration.is_empty() {
            return Ok(());
        }
        let parsed = humantime::parse_duration(&self.budget.max_duration).with_context(|| {
            format!("budget.max_duration {:?} is not a duration", self.budget.max_duration)
        })?;
        self.budget.max_duration_secs = parsed.as_secs();
        Ok(())
    }
}

/// Load configuration from a TOML file. Missing file means defaults.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    cfg.parse_budget_duration()?;
    Ok(cfg)
}

/// Atomically write configuration (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');

    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SupervisorConfig::default());
        assert_eq!(cfg.sprint_size, 5);
        assert_eq!(cfg.max_sprints, 20);
        assert!(cfg.journal_enabled);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentbox.toml");
        let mut cfg = SupervisorConfig::default();
        cfg.quality_checks.push(QualityCheck {
            name: "tests".to_string(),
            command: "cargo test".to_string(),
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = SupervisorConfig {
            sprint_size: 0,
            ..SupervisorConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg.sprint_size = 5;
        cfg.review_after = "hourly".to_string();
        assert!(cfg.validate().is_err());

        cfg.review_after = REVIEW_AFTER_PR.to_string();
        cfg.quality_checks.push(QualityCheck {
            name: "bad".to_string(),
            command: "curl http://example.com".to_string(),
        });
        let err = cfg.validate().expect_err("disallowed check");
        assert!(format!("{err:#}").contains("not in allowlist"));
    }

    #[test]
    fn budget_config_converts_with_threshold_fallback() {
        let budget = BudgetConfig {
            max_tokens: 10,
            max_duration_secs: 60,
            max_iterations: 2,
            warn_threshold_percent: 0,
            ..BudgetConfig::default()
        }
        .to_budget();
        assert_eq!(budget.max_tokens, 10);
        assert_eq!(budget.max_duration, Duration::from_secs(60));
        assert!((budget.warn_threshold - 0.8).abs() < 1e-9);
    }

    #[test]
    fn parse_budget_duration_overrides_seconds() {
        let mut cfg = SupervisorConfig::default();
        cfg.budget.max_duration = "30m".to_string();
        cfg.parse_budget_duration().expect("parse");
        assert_eq!(cfg.budget.max_duration_secs, 30 * 60);

        cfg.budget.max_duration = "8h".to_string();
        cfg.parse_budget_duration().expect("parse");
        assert_eq!(cfg.budget.max_duration_secs, 8 * 60 * 60);
        assert_eq!(
            cfg.budget.to_budget().max_duration,
            Duration::from_secs(8 * 60 * 60)
        );
    }

    #[test]
    fn parse_budget_duration_empty_is_a_noop() {
        let mut cfg = SupervisorConfig::default();
        cfg.parse_budget_duration().expect("parse");
        assert_eq!(cfg.budget.max_duration_secs, 8 * 60 * 60);
    }

    #[test]
    fn bad_budget_duration_fails_validation() {
        let mut cfg = SupervisorConfig::default();
        cfg.budget.max_duration = "whenever".to_string();
        let err = cfg.validate().expect_err("bad duration");
        assert!(format!("{err:#}").contains("not a duration"));

        let err = cfg.parse_budget_duration().expect_err("bad duration");
        assert!(format!("{err:#}").contains("not a duration"));
    }
}
