//! Terminal outcome taxonomy and aggregation rules.
//!
//! `Disposition` is the recorded, final state of a test case, suite, or run.
//! `TestOutcome` is the richer value test bodies can return or record through
//! the disposition-emission API; it always carries a human-readable message.

use serde::{Deserialize, Serialize};

/// The terminal outcome of a test case, suite, or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Passed,
    Failed,
    ExpectedFail,
    Incomplete,
    Aborted,
    NotApplicable,
}

impl Disposition {
    /// Aggregates a set of child dispositions per the priority order observed
    /// in the source's `_aggregate_returned_results`: Failed > Incomplete >
    /// NotApplicable > Aborted > Passed > (else, including the empty set) Incomplete.
    pub fn aggregate<I: IntoIterator<Item = Disposition>>(dispositions: I) -> Disposition {
        let mut saw_failed = false;
        let mut saw_incomplete = false;
        let mut saw_na = false;
        let mut saw_aborted = false;
        let mut saw_passed = false;

        for d in dispositions {
            match d {
                Disposition::Failed => saw_failed = true,
                Disposition::Incomplete => saw_incomplete = true,
                Disposition::NotApplicable => saw_na = true,
                Disposition::Aborted => saw_aborted = true,
                Disposition::Passed => saw_passed = true,
                Disposition::ExpectedFail => {}
            }
        }

        if saw_failed {
            Disposition::Failed
        } else if saw_incomplete {
            Disposition::Incomplete
        } else if saw_na {
            Disposition::NotApplicable
        } else if saw_aborted {
            Disposition::Aborted
        } else if saw_passed {
            Disposition::Passed
        } else {
            Disposition::Incomplete
        }
    }

    /// Exit-code mapping used by the CLI, loosely following `sysexits.h`.
    pub fn exit_code(self) -> i32 {
        match self {
            Disposition::Passed | Disposition::ExpectedFail | Disposition::NotApplicable => 0,
            Disposition::Failed => 1,
            Disposition::Incomplete => 2,
            Disposition::Aborted => 3,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Disposition::Passed => "PASSED",
            Disposition::Failed => "FAILED",
            Disposition::ExpectedFail => "EXPECTED_FAIL",
            Disposition::Incomplete => "INCOMPLETE",
            Disposition::Aborted => "ABORTED",
            Disposition::NotApplicable => "NA",
        };
        f.write_str(s)
    }
}

/// The value a test body may return directly, or that the disposition-emission
/// API (`passed`/`failed`/...) records through [`crate::testcase::TestContext`].
#[derive(Debug, Clone)]
pub enum TestOutcome {
    Passed(String),
    Failed(String),
    Incomplete(String),
    ExpectedFail(String),
}

impl TestOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            TestOutcome::Passed(_) => Disposition::Passed,
            TestOutcome::Failed(_) => Disposition::Failed,
            TestOutcome::Incomplete(_) => Disposition::Incomplete,
            TestOutcome::ExpectedFail(_) => Disposition::ExpectedFail,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TestOutcome::Passed(m)
            | TestOutcome::Failed(m)
            | TestOutcome::Incomplete(m)
            | TestOutcome::ExpectedFail(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_prefers_failed() {
        let d = Disposition::aggregate([
            Disposition::Passed,
            Disposition::Aborted,
            Disposition::Failed,
        ]);
        assert_eq!(d, Disposition::Failed);
    }

    #[test]
    fn aggregate_empty_is_incomplete() {
        assert_eq!(Disposition::aggregate([]), Disposition::Incomplete);
    }

    #[test]
    fn aggregate_priority_order() {
        assert_eq!(
            Disposition::aggregate([Disposition::Incomplete, Disposition::Aborted]),
            Disposition::Incomplete
        );
        assert_eq!(
            Disposition::aggregate([Disposition::NotApplicable, Disposition::Aborted]),
            Disposition::NotApplicable
        );
        assert_eq!(
            Disposition::aggregate([Disposition::Aborted, Disposition::Passed]),
            Disposition::Aborted
        );
        assert_eq!(
            Disposition::aggregate([Disposition::Passed]),
            Disposition::Passed
        );
    }
}
