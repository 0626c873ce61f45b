//! Unit ledger: good/bad/dead animal counters for a circle.
//!
//! Counters move exclusively through report submission, revision and
//! retraction. Every mutation is guarded by a matching `check_*` call in the
//! aggregate's command handler, so `apply_delta`/`reverse_delta` themselves
//! are infallible.

use serde::{Deserialize, Serialize};

use herdbook_core::{DomainError, DomainResult, ValueObject};

/// One report's worth of mortality and cull counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDelta {
    pub dead: i64,
    pub bad: i64,
}

impl UnitDelta {
    pub fn new(dead: i64, bad: i64) -> Self {
        Self { dead, bad }
    }

    /// Units leaving the good bucket when this delta is applied.
    pub fn total(&self) -> i64 {
        self.dead + self.bad
    }
}

impl ValueObject for UnitDelta {}

/// Good/Bad/Dead counters for one circle.
///
/// Invariant: no counter is ever negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub good: i64,
    pub bad: i64,
    pub dead: i64,
}

impl UnitCounts {
    /// Counters at stocking time: every unit starts out good.
    pub fn stocked(total_unit: i64) -> Self {
        Self {
            good: total_unit,
            bad: 0,
            dead: 0,
        }
    }

    /// Units still alive (good + bad).
    pub fn live(&self) -> i64 {
        self.good + self.bad
    }

    /// Would applying `delta` drive the good counter negative?
    pub fn check_apply(&self, delta: &UnitDelta) -> DomainResult<()> {
        if self.good - delta.total() < 0 {
            return Err(DomainError::invalid_state(format!(
                "good unit count would go negative ({} good, delta removes {})",
                self.good,
                delta.total()
            )));
        }
        Ok(())
    }

    /// Move `delta.dead` units to dead, `delta.bad` to bad, both out of good.
    pub fn apply_delta(&mut self, delta: &UnitDelta) {
        self.dead += delta.dead;
        self.bad += delta.bad;
        self.good -= delta.total();
    }

    /// Would reversing `delta` drive the dead or bad counter negative?
    pub fn check_reverse(&self, delta: &UnitDelta) -> DomainResult<()> {
        if self.dead - delta.dead < 0 || self.bad - delta.bad < 0 {
            return Err(DomainError::invalid_state(format!(
                "unit counters cannot absorb reversal (dead={}, bad={}, reversing dead={}, bad={})",
                self.dead, self.bad, delta.dead, delta.bad
            )));
        }
        Ok(())
    }

    /// Undo a previously applied delta (report revision or retraction).
    pub fn reverse_delta(&mut self, delta: &UnitDelta) {
        self.dead -= delta.dead;
        self.bad -= delta.bad;
        self.good += delta.total();
    }
}

impl ValueObject for UnitCounts {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn stocked_counters_start_all_good() {
        let counts = UnitCounts::stocked(500);
        assert_eq!(counts.good, 500);
        assert_eq!(counts.bad, 0);
        assert_eq!(counts.dead, 0);
        assert_eq!(counts.live(), 500);
    }

    #[test]
    fn apply_then_reverse_restores_counters() {
        let mut counts = UnitCounts::stocked(100);
        let delta = UnitDelta::new(3, 2);

        counts.check_apply(&delta).unwrap();
        counts.apply_delta(&delta);
        assert_eq!(counts.good, 95);
        assert_eq!(counts.bad, 2);
        assert_eq!(counts.dead, 3);

        counts.check_reverse(&delta).unwrap();
        counts.reverse_delta(&delta);
        assert_eq!(counts, UnitCounts::stocked(100));
    }

    #[test]
    fn apply_exceeding_good_is_rejected() {
        let counts = UnitCounts::stocked(4);
        let err = counts.check_apply(&UnitDelta::new(3, 2)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn reverse_exceeding_counters_is_rejected() {
        let mut counts = UnitCounts::stocked(10);
        counts.apply_delta(&UnitDelta::new(1, 1));

        let err = counts.check_reverse(&UnitDelta::new(2, 0)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    proptest! {
        /// Any sequence of guarded applies and reverses keeps every counter
        /// non-negative and preserves the total unit count.
        #[test]
        fn guarded_deltas_never_go_negative(
            deltas in prop::collection::vec((0i64..20, 0i64..20, prop::bool::ANY), 1..40)
        ) {
            let total = 400i64;
            let mut counts = UnitCounts::stocked(total);
            let mut applied: Vec<UnitDelta> = Vec::new();

            for (dead, bad, reverse) in deltas {
                if reverse {
                    if let Some(delta) = applied.pop() {
                        counts.check_reverse(&delta).unwrap();
                        counts.reverse_delta(&delta);
                    }
                } else {
                    let delta = UnitDelta::new(dead, bad);
                    if counts.check_apply(&delta).is_ok() {
                        counts.apply_delta(&delta);
                        applied.push(delta);
                    }
                }

                prop_assert!(counts.good >= 0);
                prop_assert!(counts.bad >= 0);
                prop_assert!(counts.dead >= 0);
                prop_assert_eq!(counts.good + counts.bad + counts.dead, total);
            }
        }
    }
}
