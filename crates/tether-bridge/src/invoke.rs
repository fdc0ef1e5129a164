//! Dispatch of a closure call into the engine and exception reporting.
//!
//! Every exception that passes through here is reported exactly once and
//! the context's pending slot is left clear.

use tether_diagnostics::counters::{self, Counter};
use tether_runtime::{CallableRef, ContextId, Engine, Exception, Value};

pub(crate) fn dispatch(
    engine: &dyn Engine,
    context: ContextId,
    callable: CallableRef,
    args: &[Value],
    closure_id: u64,
) -> Result<Value, Exception> {
    if let Some(stale) = take_pending(engine, context) {
        log::warn!(
            target: "tether::exception",
            "exception was pending before invoking closure {}",
            closure_id
        );
        report_exception(&stale, closure_id);
    }

    match engine.call_function(context, callable, args) {
        Some(value) => match take_pending(engine, context) {
            None => Ok(value),
            Some(exception) => {
                log::warn!(
                    target: "tether::exception",
                    "closure {} returned normally but left an exception pending",
                    closure_id
                );
                report_exception(&exception, closure_id);
                Err(exception)
            }
        },
        None => {
            let exception = take_pending(engine, context).unwrap_or_else(|| {
                log::warn!(
                    target: "tether::exception",
                    "closure {} failed without raising an exception",
                    closure_id
                );
                Exception::internal("call failed without an exception")
            });
            report_exception(&exception, closure_id);
            Err(exception)
        }
    }
}

fn take_pending(engine: &dyn Engine, context: ContextId) -> Option<Exception> {
    let exception = engine.pending_exception(context)?;
    engine.clear_exception(context);
    Some(exception)
}

fn report_exception(exception: &Exception, closure_id: u64) {
    log::error!(
        target: "tether::exception",
        "uncaught exception in closure {}: {}",
        closure_id,
        exception
    );
    counters::inc(Counter::ExceptionsReported);
}

/// Argument lists that can be passed to `Closure::invoke_with`.
pub trait IntoArgs {
    fn into_args(self) -> Vec<Value>;
}

impl IntoArgs for () {
    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Vec<Value> {
        self
    }
}

macro_rules! impl_into_args {
    ($($name:ident),+) => {
        impl<$($name: Into<Value>),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into()),+]
            }
        }
    };
}

impl_into_args!(A);
impl_into_args!(A, B);
impl_into_args!(A, B, C);
impl_into_args!(A, B, C, D);
