use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rpl_artifacts::TestSummary;
use rpl_core::{
    run_tiered, FailureKind, PipelineState, StageFailure, StageResult, TestCategory, TestId, TestOutcome, TestTier,
    TierPolicy, TieredRun,
};

use crate::cancel::CancelToken;
use crate::traits::TestExecutor;

/// Runs a suite through the tiered escalating-isolation policy.
pub struct TestRunner<'a> {
    pub executor: &'a dyn TestExecutor,
    pub cancel: &'a CancelToken,
}

impl<'a> TestRunner<'a> {
    /// Outcomes of every tier that ran. A failing suite is still `Ok`; see `test_failure`.
    pub fn run(&self, suite: &BTreeMap<TestId, TestCategory>, policy: &TierPolicy) -> StageResult<TieredRun> {
        tracing::info!(tests = suite.len(), tiers = policy.tier_count(), "running test suite");
        let run = run_tiered(policy, suite, |tier| self.run_tier(tier, suite))?;
        for report in &run.tiers {
            tracing::info!(
                tier = report.tier.level,
                parallelism = report.tier.parallelism,
                scope = report.tier.scope.len(),
                failed = report.failed.len(),
                "tier finished"
            );
        }
        Ok(run)
    }

    fn run_tier(&self, tier: &TestTier, suite: &BTreeMap<TestId, TestCategory>) -> StageResult<Vec<TestOutcome>> {
        if self.cancel.is_cancelled() {
            return Err(StageFailure::new(
                PipelineState::Testing,
                FailureKind::Cancelled,
                format!("cancelled before tier {}", tier.level),
            ));
        }
        tracing::info!(tier = tier.level, parallelism = tier.parallelism, scope = tier.scope.len(), "starting tier");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(tier.parallelism)
            .build()
            .map_err(|e| StageFailure::new(PipelineState::Testing, FailureKind::TestFailure, e.to_string()))?;
        let ids: Vec<&TestId> = tier.scope.iter().collect();
        let outcomes = pool.install(|| {
            ids.par_iter()
                .map(|id| {
                    let category = suite.get(*id).copied().unwrap_or(TestCategory::Unit);
                    self.run_one(id, tier.level, category)
                })
                .collect()
        });
        Ok(outcomes)
    }

    fn run_one(&self, id: &TestId, tier: u8, category: TestCategory) -> TestOutcome {
        let started = Instant::now();
        let passed = match self.executor.run_test(id, tier) {
            Ok(passed) => passed,
            Err(e) => {
                tracing::warn!(test = %id, tier, error = %format!("{e:#}"), "test could not run; counted as failed");
                false
            }
        };
        TestOutcome {
            test_id: id.clone(),
            tier,
            passed,
            category,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// `TestFailure` naming the ultimately failing tests by category.
pub fn test_failure(run: &TieredRun) -> StageFailure {
    let detail = run
        .failures_by_category()
        .iter()
        .map(|(category, ids)| {
            let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
            format!("{}: {}", category.as_str(), ids.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ");
    StageFailure::new(
        PipelineState::Testing,
        FailureKind::TestFailure,
        format!("failed after tier {}: {detail}", run.highest_tier()),
    )
}

pub fn summarize(suite_hash: &str, run: &TieredRun, now: DateTime<Utc>) -> TestSummary {
    TestSummary {
        suite_hash: suite_hash.to_string(),
        passed: run.passed(),
        highest_tier: run.highest_tier(),
        ultimately_failed: run.ultimately_failed().into_iter().map(|id| id.0).collect(),
        run: run.clone(),
        finished_at: now,
    }
}
