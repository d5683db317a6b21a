use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{CoreError, TestCategory, TestId};

/// Tier 1 runs wide, the last tier runs one test at a time.
pub const DEFAULT_TIER_PARALLELISM: [usize; 3] = [4, 2, 1];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTier {
    pub level: u8,
    pub parallelism: usize,
    pub scope: BTreeSet<TestId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: TestId,
    pub tier: u8,
    pub passed: bool,
    pub category: TestCategory,
    pub duration_ms: u64,
}

/// Escalating-isolation retry policy.
///
/// `parallelism[i]` is the worker count of tier `i + 1`. It must be strictly
/// decreasing and end at 1, so the final tier is fully sequential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierPolicy {
    parallelism: Vec<usize>,
    known_slow: BTreeSet<TestId>,
}

impl TierPolicy {
    pub fn new(parallelism: Vec<usize>, known_slow: BTreeSet<TestId>) -> Result<Self, CoreError> {
        if parallelism.is_empty() {
            return Err(CoreError::InvalidTierPolicy("at least one tier is required".into()));
        }
        if parallelism.len() > u8::MAX as usize {
            return Err(CoreError::InvalidTierPolicy("too many tiers".into()));
        }
        if parallelism.windows(2).any(|w| w[1] >= w[0]) {
            return Err(CoreError::InvalidTierPolicy(format!(
                "parallelism must strictly decrease between tiers: {parallelism:?}"
            )));
        }
        if parallelism.last() != Some(&1) {
            return Err(CoreError::InvalidTierPolicy("final tier must run with parallelism 1".into()));
        }
        Ok(Self { parallelism, known_slow })
    }

    pub fn standard(known_slow: BTreeSet<TestId>) -> Self {
        Self {
            parallelism: DEFAULT_TIER_PARALLELISM.to_vec(),
            known_slow,
        }
    }

    pub fn tier_count(&self) -> usize {
        self.parallelism.len()
    }

    pub fn known_slow(&self) -> &BTreeSet<TestId> {
        &self.known_slow
    }

    /// Tier for `attempt_index` (0-based) given the failures carried from the
    /// previous tier. The final tier also picks up every known-slow test that
    /// belongs to the suite.
    pub fn tier(
        &self,
        attempt_index: usize,
        carried: &BTreeSet<TestId>,
        suite: &BTreeMap<TestId, TestCategory>,
    ) -> Option<TestTier> {
        let parallelism = *self.parallelism.get(attempt_index)?;
        let mut scope = carried.clone();
        if attempt_index + 1 == self.tier_count() && attempt_index > 0 {
            scope.extend(self.known_slow.iter().filter(|id| suite.contains_key(*id)).cloned());
        }
        Some(TestTier {
            level: (attempt_index + 1) as u8,
            parallelism,
            scope,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: TestTier,
    pub outcomes: Vec<TestOutcome>,
    pub failed: BTreeSet<TestId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredRun {
    pub tiers: Vec<TierReport>,
    /// Latest outcome recorded for each test across the tiers it ran in.
    pub final_outcomes: BTreeMap<TestId, TestOutcome>,
}

impl TieredRun {
    pub fn passed(&self) -> bool {
        self.final_outcomes.values().all(|o| o.passed)
    }

    pub fn ultimately_failed(&self) -> Vec<TestId> {
        self.final_outcomes
            .values()
            .filter(|o| !o.passed)
            .map(|o| o.test_id.clone())
            .collect()
    }

    pub fn failures_by_category(&self) -> BTreeMap<TestCategory, Vec<TestId>> {
        let mut out: BTreeMap<TestCategory, Vec<TestId>> = BTreeMap::new();
        for o in self.final_outcomes.values().filter(|o| !o.passed) {
            out.entry(o.category).or_default().push(o.test_id.clone());
        }
        out
    }

    pub fn highest_tier(&self) -> u8 {
        self.tiers.last().map(|t| t.tier.level).unwrap_or(0)
    }
}

/// Generic retry-with-narrowing-scope algorithm.
///
/// `exec` runs one whole tier and returns its outcomes. A tier is complete only
/// once every test in its scope has an outcome; tests the executor did not
/// report on are recorded as failed. Tier 1 succeeding ends the run at once.
pub fn run_tiered<F, E>(
    policy: &TierPolicy,
    suite: &BTreeMap<TestId, TestCategory>,
    mut exec: F,
) -> Result<TieredRun, E>
where
    F: FnMut(&TestTier) -> Result<Vec<TestOutcome>, E>,
{
    let mut run = TieredRun::default();
    let mut carried: BTreeSet<TestId> = suite.keys().cloned().collect();

    for attempt_index in 0..policy.tier_count() {
        if attempt_index == 1 && carried.is_empty() {
            break;
        }
        let Some(tier) = policy.tier(attempt_index, &carried, suite) else {
            break;
        };
        if tier.scope.is_empty() {
            continue;
        }

        let reported = exec(&tier)?;
        let mut by_id: BTreeMap<TestId, TestOutcome> = reported
            .into_iter()
            .filter(|o| tier.scope.contains(&o.test_id))
            .map(|o| (o.test_id.clone(), o))
            .collect();

        let mut outcomes = Vec::with_capacity(tier.scope.len());
        let mut failed = BTreeSet::new();
        for id in &tier.scope {
            let outcome = by_id.remove(id).unwrap_or_else(|| TestOutcome {
                test_id: id.clone(),
                tier: tier.level,
                passed: false,
                category: suite.get(id).copied().unwrap_or(TestCategory::Unit),
                duration_ms: 0,
            });
            if !outcome.passed {
                failed.insert(id.clone());
            }
            run.final_outcomes.insert(id.clone(), outcome.clone());
            outcomes.push(outcome);
        }

        carried = failed.clone();
        run.tiers.push(TierReport { tier, outcomes, failed });
    }

    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ids(names: &[&str]) -> BTreeSet<TestId> {
        names.iter().map(|n| TestId::from_str(*n)).collect()
    }

    fn suite(names: &[&str]) -> BTreeMap<TestId, TestCategory> {
        names.iter().map(|n| (TestId::from_str(*n), TestCategory::Integration)).collect()
    }

    /// Executor that fails a test while its remaining failure budget is positive.
    fn flaky(budget: &mut HashMap<String, u32>, tier: &TestTier) -> Vec<TestOutcome> {
        tier.scope
            .iter()
            .map(|id| {
                let left = budget.entry(id.0.clone()).or_insert(0);
                let passed = *left == 0;
                if *left > 0 {
                    *left -= 1;
                }
                TestOutcome {
                    test_id: id.clone(),
                    tier: tier.level,
                    passed,
                    category: TestCategory::Integration,
                    duration_ms: 1,
                }
            })
            .collect()
    }

    #[test]
    fn policy_validation() {
        assert!(TierPolicy::new(vec![], BTreeSet::new()).is_err());
        assert!(TierPolicy::new(vec![4, 4, 1], BTreeSet::new()).is_err());
        assert!(TierPolicy::new(vec![4, 2], BTreeSet::new()).is_err());
        assert!(TierPolicy::new(vec![8, 3, 1], BTreeSet::new()).is_ok());
        assert!(TierPolicy::new(vec![1], BTreeSet::new()).is_ok());
    }

    #[test]
    fn tier_function_is_pure() {
        let policy = TierPolicy::standard(ids(&["slow"]));
        let s = suite(&["a", "b", "slow"]);
        let t1 = policy.tier(0, &ids(&["a", "b", "slow"]), &s).unwrap();
        assert_eq!((t1.level, t1.parallelism), (1, 4));
        let t2 = policy.tier(1, &ids(&["a"]), &s).unwrap();
        assert_eq!((t2.level, t2.parallelism, t2.scope.clone()), (2, 2, ids(&["a"])));
        let t3 = policy.tier(2, &ids(&["a"]), &s).unwrap();
        assert_eq!((t3.level, t3.parallelism, t3.scope), (3, 1, ids(&["a", "slow"])));
        assert!(policy.tier(3, &ids(&["a"]), &s).is_none());
    }

    #[test]
    fn all_green_tier_one_stops_immediately() {
        let policy = TierPolicy::standard(ids(&["slow"]));
        let s = suite(&["a", "b", "slow"]);
        let mut calls = 0;
        let run = run_tiered::<_, ()>(&policy, &s, |tier| {
            calls += 1;
            Ok(flaky(&mut HashMap::new(), tier))
        })
        .unwrap();
        assert!(run.passed());
        assert_eq!(calls, 1);
        assert_eq!(run.highest_tier(), 1);
    }

    #[test]
    fn contention_failures_recover_through_tiers() {
        // 50 tests, 3 fail at tier 1; one still fails at tier 2; tier 3 runs it plus 2 known-slow.
        let names: Vec<String> = (0..50).map(|i| format!("t{i:02}")).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let s = suite(&name_refs);
        let policy = TierPolicy::standard(ids(&["t40", "t41"]));
        let mut budget: HashMap<String, u32> = HashMap::new();
        budget.insert("t01".into(), 1);
        budget.insert("t02".into(), 1);
        budget.insert("t03".into(), 2);

        let run = run_tiered::<_, ()>(&policy, &s, |tier| Ok(flaky(&mut budget, tier))).unwrap();

        assert!(run.passed());
        assert_eq!(run.tiers.len(), 3);
        assert_eq!(run.tiers[0].failed, ids(&["t01", "t02", "t03"]));
        assert_eq!(run.tiers[1].tier.scope, ids(&["t01", "t02", "t03"]));
        assert_eq!(run.tiers[1].failed, ids(&["t03"]));
        assert_eq!(run.tiers[2].tier.scope, ids(&["t03", "t40", "t41"]));
        assert_eq!(run.tiers[2].tier.parallelism, 1);
    }

    #[test]
    fn tier_one_passes_never_reappear_except_known_slow() {
        let s = suite(&["a", "b", "c", "slow"]);
        let policy = TierPolicy::standard(ids(&["slow"]));
        let mut budget: HashMap<String, u32> = HashMap::new();
        budget.insert("a".into(), 2);
        let run = run_tiered::<_, ()>(&policy, &s, |tier| Ok(flaky(&mut budget, tier))).unwrap();
        let tier_one_passed: BTreeSet<TestId> = run.tiers[0]
            .outcomes
            .iter()
            .filter(|o| o.passed)
            .map(|o| o.test_id.clone())
            .collect();
        for later in &run.tiers[1..] {
            for id in &later.tier.scope {
                assert!(
                    !tier_one_passed.contains(id) || policy.known_slow().contains(id),
                    "{id} passed at tier 1 but was rerun"
                );
            }
        }
    }

    #[test]
    fn final_tier_failure_fails_the_run() {
        let s = suite(&["a", "b"]);
        let policy = TierPolicy::standard(BTreeSet::new());
        let mut budget: HashMap<String, u32> = HashMap::new();
        budget.insert("b".into(), 10);
        let run = run_tiered::<_, ()>(&policy, &s, |tier| Ok(flaky(&mut budget, tier))).unwrap();
        assert!(!run.passed());
        assert_eq!(run.ultimately_failed(), vec![TestId::from_str("b")]);
        assert_eq!(run.highest_tier(), 3);
        assert_eq!(
            run.failures_by_category().get(&TestCategory::Integration),
            Some(&vec![TestId::from_str("b")])
        );
    }

    #[test]
    fn known_slow_regression_at_final_tier_fails() {
        let s = suite(&["a", "slow"]);
        let policy = TierPolicy::standard(ids(&["slow"]));
        let run = run_tiered::<_, ()>(&policy, &s, |tier| {
            Ok(tier
                .scope
                .iter()
                .map(|id| TestOutcome {
                    test_id: id.clone(),
                    tier: tier.level,
                    passed: match (id.as_str(), tier.level) {
                        ("a", 1) => false,
                        ("slow", 3) => false,
                        _ => true,
                    },
                    category: TestCategory::Integration,
                    duration_ms: 1,
                })
                .collect())
        })
        .unwrap();
        assert!(!run.passed());
        assert_eq!(run.ultimately_failed(), vec![TestId::from_str("slow")]);
    }

    #[test]
    fn missing_outcomes_count_as_failures() {
        let s = suite(&["a", "b"]);
        let policy = TierPolicy::new(vec![1], BTreeSet::new()).unwrap();
        let run = run_tiered::<_, ()>(&policy, &s, |tier| {
            Ok(vec![TestOutcome {
                test_id: TestId::from_str("a"),
                tier: tier.level,
                passed: true,
                category: TestCategory::Unit,
                duration_ms: 1,
            }])
        })
        .unwrap();
        assert!(!run.passed());
        assert_eq!(run.ultimately_failed(), vec![TestId::from_str("b")]);
    }

    #[test]
    fn executor_errors_propagate() {
        let s = suite(&["a"]);
        let policy = TierPolicy::standard(BTreeSet::new());
        let res = run_tiered(&policy, &s, |_| Err::<Vec<TestOutcome>, _>("boom"));
        assert_eq!(res.unwrap_err(), "boom");
    }
}
