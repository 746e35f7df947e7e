//! Quality trend tracking, resource monitoring, and budget enforcement.

mod budget;
mod checks;
mod parsers;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::store::{QualitySnapshot, ResourceUsage, Store};

pub use budget::{Budget, BudgetEnforcer, BudgetStatus};
pub use checks::{
    run_quality_checks, validate_check_command, CheckOutcome, CheckResult, QualityCheck,
};
pub use parsers::{
    parse_cargo_test_output, parse_generic_test_output, parse_go_test_output, parse_jest_output,
    TestStats,
};

/// Session-scoped facade over the store's metrics writes and aggregation
/// queries.
#[derive(Clone)]
pub struct Collector {
    store: Arc<Store>,
    session_id: i64,
}

impl Collector {
    pub fn new(store: Arc<Store>, session_id: i64) -> Self {
        Self { store, session_id }
    }

    pub fn test_pass_rate(&self, last_n: u32) -> Result<f64> {
        self.store.test_pass_rate(self.session_id, last_n)
    }

    pub fn failing_test_trend(&self, last_n: u32) -> Result<BTreeMap<String, u32>> {
        self.store.failing_test_trend(self.session_id, last_n)
    }

    pub fn quality_trend(&self, last_n: u32) -> Result<String> {
        self.store.quality_trend(self.session_id, last_n)
    }

    pub fn total_usage(&self) -> Result<ResourceUsage> {
        self.store.total_usage(self.session_id)
    }

    /// Record a quality snapshot under this collector's session.
    pub fn record_quality(&self, snapshot: &QualitySnapshot) -> Result<()> {
        let mut snapshot = snapshot.clone();
        snapshot.session_id = self.session_id;
        self.store.record_quality(&snapshot)
    }

    /// Record resource usage under this collector's session.
    pub fn record_usage(&self, usage: &ResourceUsage) -> Result<()> {
        let mut usage = usage.clone();
        usage.session_id = self.session_id;
        self.store.record_usage(&usage)
    }

    /// One-line metrics summary for human display.
    pub fn summary(&self) -> Result<String> {
        let usage = self.total_usage()?;
        let trend = self.quality_trend(10)?;
        let rate = self.test_pass_rate(10)?;

        Ok(format!(
            "Iterations: {} | Tokens: {} | Container: {}ms | Quality: {} | Pass Rate: {:.1}%",
            usage.iteration,
            usage.estimated_tokens,
            usage.container_time_ms,
            trend,
            rate * 100.0,
        ))
    }
}
