//! Native-facing closure API
//!
//! Free functions in the shape native callback tables expect. A `Closure`
//! value stands for one counted reference: `closure_ref` hands out a new
//! one, `closure_unref` gives one back.

use crate::closure::Closure;
use crate::error::BridgeError;
use tether_runtime::{CallableRef, ContextId, EngineHandle, Value};

/// Wrap `callable` from the live context `context`.
pub fn closure_new(
    engine: &EngineHandle,
    context: ContextId,
    callable: CallableRef,
    description: &str,
) -> Result<Closure, BridgeError> {
    Closure::new(engine, context, callable, description)
}

pub fn closure_ref(closure: &Closure) -> Closure {
    closure.clone()
}

pub fn closure_unref(closure: Closure) {
    drop(closure);
}

/// Generic callback entry point.
///
/// Exceptions have already been reported by the time this returns, so they
/// map to `Value::Undefined` like an invalidated closure does.
pub fn closure_invoke(closure: &Closure, args: &[Value]) -> Value {
    match closure.invoke(args) {
        Ok(value) => value,
        Err(exception) => {
            log::trace!(
                target: "tether::closure",
                "closure {} returned exception {} to a native caller",
                closure.id(),
                exception
            );
            Value::Undefined
        }
    }
}

/// `None` once the closure is invalidated.
pub fn closure_get_context(closure: &Closure) -> Option<ContextId> {
    closure.context()
}

/// `None` once the closure is invalidated.
pub fn closure_get_callable(closure: &Closure) -> Option<CallableRef> {
    closure.callable()
}

pub fn closure_invalidate(closure: &Closure) {
    closure.invalidate();
}
