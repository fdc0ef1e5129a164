//! Closure bridge
//!
//! Wraps a script callable in a native, explicitly refcounted handle that can
//! be passed anywhere a native callback is expected. The handle stays safe to
//! use whichever side goes away first:
//!
//! - the last native reference is released,
//! - the engine finalizes the callable,
//! - the context hosting the callable is torn down.
//!
//! ## Example
//!
//! ```
//! use tether_bridge::Closure;
//! use tether_runtime::{Runtime, RuntimeConfig, Value};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let ctx = runtime.new_context("main");
//! let double = runtime
//!     .define_function(ctx, "double", |_, args| {
//!         Ok(Value::Number(args[0].as_number().unwrap_or(0.0) * 2.0))
//!     })
//!     .unwrap();
//!
//! let closure = Closure::new(&runtime.handle(), ctx, double, "double").unwrap();
//! assert_eq!(closure.invoke_with((21,)).unwrap(), Value::Number(42.0));
//!
//! runtime.destroy_context(ctx).unwrap();
//! // Firing after the context died is a no-op, not an error.
//! assert_eq!(closure.invoke_with((21,)).unwrap(), Value::Undefined);
//! ```

pub mod closure;
pub mod error;
pub mod interop;
pub mod invoke;
pub mod signal;

#[cfg(test)]
mod lifetime_tests;

pub use closure::{Closure, ClosureState, NotifierId, WeakClosure};
pub use error::BridgeError;
pub use invoke::IntoArgs;
pub use signal::{HandlerId, Signal};
