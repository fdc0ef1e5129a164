//! Labelled memory reports.
//!
//! A report is a named snapshot of the live object counters, typically taken
//! right before and right after destroying a context.

use crate::counters::{self, Counter, CounterSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A labelled snapshot of the live object counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub label: String,
    pub counters: CounterSnapshot,
}

/// Objects that outlived the teardown they should not have survived.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeakError {
    #[error("{label}: {count} {counter} still alive")]
    Leaked {
        label: String,
        counter: Counter,
        count: usize,
    },
}

impl MemoryReport {
    /// Snapshot the counters of the current thread.
    pub fn capture(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            counters: counters::snapshot(),
        }
    }

    /// Live objects per counter, excluding event counters and zero entries.
    pub fn live(&self) -> Vec<(Counter, usize)> {
        Counter::ALL
            .iter()
            .filter(|c| c.tracks_live_objects())
            .map(|c| (*c, self.counters.get(*c)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Objects alive now that were not alive in `baseline`.
    pub fn leaks_since(&self, baseline: &MemoryReport) -> Vec<(Counter, usize)> {
        Counter::ALL
            .iter()
            .filter(|c| c.tracks_live_objects())
            .map(|c| {
                let now = self.counters.get(*c);
                (*c, now.saturating_sub(baseline.counters.get(*c)))
            })
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Fail if anything is still alive.
    pub fn assert_no_leaks(&self) -> Result<(), LeakError> {
        self.to_result(self.live())
    }

    /// Fail if anything created after `baseline` is still alive.
    pub fn assert_no_leaks_since(&self, baseline: &MemoryReport) -> Result<(), LeakError> {
        self.to_result(self.leaks_since(baseline))
    }

    fn to_result(&self, leaks: Vec<(Counter, usize)>) -> Result<(), LeakError> {
        match leaks.first() {
            None => Ok(()),
            Some(&(counter, count)) => {
                for (counter, count) in &leaks {
                    log::warn!("{}: {} {} still alive", self.label, count, counter);
                }
                Err(LeakError::Leaked {
                    label: self.label.clone(),
                    counter,
                    count,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_report() {
        let before = MemoryReport::capture("before destroying context");
        counters::inc(Counter::Closures);
        counters::dec(Counter::Closures);
        let after = MemoryReport::capture("after destroying context");
        assert_eq!(after.label, "after destroying context");
        assert!(after.assert_no_leaks_since(&before).is_ok());
    }

    #[test]
    fn test_leak_is_reported() {
        let before = MemoryReport::capture("before");
        counters::inc(Counter::Callables);
        let after = MemoryReport::capture("after");
        assert_eq!(
            after.assert_no_leaks_since(&before),
            Err(LeakError::Leaked {
                label: "after".to_string(),
                counter: Counter::Callables,
                count: 1,
            })
        );
        counters::dec(Counter::Callables);
    }

    #[test]
    fn test_exceptions_are_not_leaks() {
        let before = MemoryReport::capture("before");
        counters::inc(Counter::ExceptionsReported);
        let after = MemoryReport::capture("after");
        assert!(after.leaks_since(&before).is_empty());
        assert_eq!(
            after.counters.exceptions_reported,
            before.counters.exceptions_reported + 1
        );
    }
}
