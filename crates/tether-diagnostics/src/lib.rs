//! Diagnostic infrastructure for tether.
//!
//! This crate provides leak tracking for engine-facing objects:
//! - Live object counters, bumped on creation and dropped on finalization
//! - Labelled memory reports with a leak assertion
//! - Multiple output formats (terminal, JSON)
//!
//! # Example
//!
//! ```
//! use tether_diagnostics::{counters, Counter, MemoryReport};
//!
//! let before = MemoryReport::capture("before");
//! counters::inc(Counter::Closures);
//! counters::dec(Counter::Closures);
//! MemoryReport::capture("after").assert_no_leaks_since(&before).unwrap();
//! ```

pub mod counters;
pub mod emitter;
pub mod report;

pub use counters::{Counter, CounterSnapshot};
pub use emitter::{JsonEmitter, ReportEmitter, TextEmitter};
pub use report::{LeakError, MemoryReport};
