//! Per-job expectations for issued-but-unobserved pod operations.
//!
//! After the reconciler issues creates or deletes, the cluster view lags
//! until the watch delivers the corresponding events. Processing another
//! trigger in that window would double-create or double-delete, so each job
//! key remembers how many operations are in flight and what pod count the
//! world should converge to. A stale expectation expires rather than wedging
//! the job forever.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// How long an expectation may stay unmet before it is assumed lost.
const EXPECTATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Expectation {
    creates: i64,
    deletes: i64,
    /// Pod count at the time the operations were issued.
    baseline: i64,
    recorded_at: Instant,
}

impl Expectation {
    fn expected_pods(&self) -> i64 {
        self.baseline + self.creates - self.deletes
    }
}

#[derive(Debug, Default)]
pub struct Expectations {
    inner: DashMap<String, Expectation>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `creates`/`deletes` issued against a job currently holding
    /// `baseline` pods. Overwrites any previous expectation for the key.
    pub fn record(&self, key: &str, baseline: i64, creates: i64, deletes: i64) {
        if creates == 0 && deletes == 0 {
            return;
        }
        self.inner.insert(
            key.to_string(),
            Expectation {
                creates,
                deletes,
                baseline,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Check whether the observed pod count has converged to the expected
    /// one. A satisfied (or expired) expectation is consumed.
    pub fn satisfied(&self, key: &str, observed_pods: i64) -> bool {
        let converged = match self.inner.get(key) {
            None => return true,
            Some(entry) => {
                observed_pods == entry.expected_pods()
                    || entry.recorded_at.elapsed() >= EXPECTATION_TIMEOUT
            }
        };
        if converged {
            self.inner.remove(key);
        }
        converged
    }

    /// Drop all state for a deleted job.
    pub fn forget(&self, key: &str) {
        self.inner.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_expectation_is_always_satisfied() {
        let exp = Expectations::new();
        assert!(exp.satisfied("ns/job", 0));
        assert!(exp.satisfied("ns/job", 17));
    }

    #[test]
    fn pending_creates_block_until_observed() {
        let exp = Expectations::new();
        exp.record("ns/job", 2, 2, 0);

        assert!(!exp.satisfied("ns/job", 2));
        assert!(!exp.satisfied("ns/job", 3));
        assert!(exp.satisfied("ns/job", 4));
        // consumed once satisfied
        assert!(exp.satisfied("ns/job", 0));
    }

    #[test]
    fn mixed_creates_and_deletes_net_out() {
        let exp = Expectations::new();
        exp.record("ns/job", 4, 1, 2);

        assert!(!exp.satisfied("ns/job", 4));
        assert!(exp.satisfied("ns/job", 3));
    }

    #[test]
    fn forget_clears_state() {
        let exp = Expectations::new();
        exp.record("ns/job", 0, 5, 0);
        exp.forget("ns/job");
        assert!(exp.satisfied("ns/job", 0));
    }

    #[test]
    fn empty_record_is_a_noop() {
        let exp = Expectations::new();
        exp.record("ns/job", 3, 0, 0);
        assert!(exp.satisfied("ns/job", 3));
    }
}
