//! Engine side of tether
//!
//! Provides everything a closure bridge needs from a scripting engine:
//! - Context and callable identities
//! - The `Engine` trait: liveness queries, calls, pending exceptions, finalizers
//! - The per-context finalization registry
//! - A reference engine (`Runtime`) whose callables are Rust closures
//! - Runtime configuration

pub mod config;
pub mod engine;
pub mod error;
pub mod exception;
pub mod handle;
pub mod registry;
pub mod runtime;
pub mod value;

pub use config::{FinalizeOrder, GcConfig, RuntimeConfig};
pub use engine::{Engine, EngineHandle};
pub use error::RuntimeError;
pub use exception::Exception;
pub use handle::{CallableRef, ContextId};
pub use registry::{CallableWatcher, FinalizationRegistry, GlobalWatcher, RegistryEntry, WatcherKey};
pub use runtime::{CallScope, EngineStats, Runtime};
pub use value::Value;
