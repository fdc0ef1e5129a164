//! Live object counters.
//!
//! Every object that straddles the engine and the native side bumps a
//! counter when it is created and drops it when it is finalized, so tearing
//! down a context can be checked for leftovers.
//!
//! Counters are kept per thread. An engine and every closure attached to it
//! live on one thread, and tests running in parallel must not observe each
//! other's objects.

use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// Kinds of objects (and events) being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// Closure bridges that have not been finalized yet, on the current
    /// thread. Not a process-wide total: closures owned by other threads'
    /// engines are not included.
    Closures,
    /// Execution contexts whose global object has not been finalized yet
    Contexts,
    /// Engine callables that have not been collected yet
    Callables,
    /// Script exceptions reported to the log (monotonic)
    ExceptionsReported,
}

impl Counter {
    pub const ALL: [Counter; 4] = [
        Counter::Closures,
        Counter::Contexts,
        Counter::Callables,
        Counter::ExceptionsReported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Closures => "closures",
            Counter::Contexts => "contexts",
            Counter::Callables => "callables",
            Counter::ExceptionsReported => "exceptions_reported",
        }
    }

    /// Whether the counter tracks live objects, i.e. whether a value left
    /// over after teardown is a leak.
    pub fn tracks_live_objects(&self) -> bool {
        !matches!(self, Counter::ExceptionsReported)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

thread_local! {
    static COUNTERS: [Cell<usize>; 4] = const {
        [Cell::new(0), Cell::new(0), Cell::new(0), Cell::new(0)]
    };
}

/// Increment a counter.
pub fn inc(counter: Counter) {
    COUNTERS.with(|counters| {
        let cell = &counters[counter.index()];
        cell.set(cell.get() + 1);
    });
}

/// Decrement a counter.
///
/// Dropping a counter below zero means an object was finalized twice.
pub fn dec(counter: Counter) {
    COUNTERS.with(|counters| {
        let cell = &counters[counter.index()];
        let current = cell.get();
        debug_assert!(current > 0, "{} counter dropped below zero", counter);
        if current == 0 {
            log::error!("{} counter dropped below zero", counter);
            return;
        }
        cell.set(current - 1);
    });
}

/// Current value of a counter on this thread.
pub fn get(counter: Counter) -> usize {
    COUNTERS.with(|counters| counters[counter.index()].get())
}

/// Read every counter at once.
pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        closures: get(Counter::Closures),
        contexts: get(Counter::Contexts),
        callables: get(Counter::Callables),
        exceptions_reported: get(Counter::ExceptionsReported),
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub closures: usize,
    pub contexts: usize,
    pub callables: usize,
    pub exceptions_reported: usize,
}

impl CounterSnapshot {
    pub fn get(&self, counter: Counter) -> usize {
        match counter {
            Counter::Closures => self.closures,
            Counter::Contexts => self.contexts,
            Counter::Callables => self.callables,
            Counter::ExceptionsReported => self.exceptions_reported,
        }
    }

    /// Sum of all counters that track live objects.
    pub fn live_objects(&self) -> usize {
        Counter::ALL
            .iter()
            .filter(|c| c.tracks_live_objects())
            .map(|c| self.get(*c))
            .sum()
    }
}
