//! Lifetime tests: every teardown ordering against the reference engine.

use crate::interop::*;
use crate::{Closure, ClosureState, Signal, WeakClosure};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tether_diagnostics::counters::{self, Counter};
use tether_diagnostics::MemoryReport;
use tether_runtime::{
    CallableRef, ContextId, Engine, EngineHandle, EngineStats, Exception, FinalizeOrder, Runtime,
    RuntimeConfig, Value,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    runtime: Rc<Runtime>,
    engine: EngineHandle,
    ctx: ContextId,
    func: CallableRef,
    calls: Rc<Cell<u32>>,
}

/// A runtime with one context and one callable that sums its arguments.
fn fixture(config: RuntimeConfig) -> Fixture {
    init_logging();
    let runtime = Runtime::new(config);
    let ctx = runtime.new_context("main");
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let func = runtime
        .define_function(ctx, "sum", move |_, args| {
            counter.set(counter.get() + 1);
            Ok(Value::Number(args.iter().filter_map(Value::as_number).sum()))
        })
        .unwrap();
    Fixture {
        engine: runtime.handle(),
        runtime,
        ctx,
        func,
        calls,
    }
}

fn counting(closure: &Closure) -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
    let invalidated = Rc::new(Cell::new(0));
    let finalized = Rc::new(Cell::new(0));
    let i = invalidated.clone();
    closure.add_invalidate_notifier(move || i.set(i.get() + 1));
    let f = finalized.clone();
    closure.add_finalize_notifier(move || f.set(f.get() + 1));
    (invalidated, finalized)
}

#[derive(Debug, Clone, Copy)]
enum Event {
    /// Native side drops its last reference
    Unref,
    /// Script side drops the callable and the collector runs
    Collect,
    /// Host tears the context down, no collection
    Destroy,
}

const ORDERINGS: [[Event; 3]; 6] = [
    [Event::Unref, Event::Collect, Event::Destroy],
    [Event::Unref, Event::Destroy, Event::Collect],
    [Event::Collect, Event::Unref, Event::Destroy],
    [Event::Collect, Event::Destroy, Event::Unref],
    [Event::Destroy, Event::Unref, Event::Collect],
    [Event::Destroy, Event::Collect, Event::Unref],
];

#[test]
fn test_every_ordering_invalidates_once() {
    for finalize_order in FinalizeOrder::ALL {
        for ordering in ORDERINGS {
            let before = MemoryReport::capture("before");
            {
                let fx = fixture(RuntimeConfig::default().with_finalize_order(finalize_order));
                let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
                let (invalidated, finalized) = counting(&closure);
                let weak = closure.downgrade();

                // Engine counters at the moment of invalidation.
                let frozen: Rc<Cell<Option<EngineStats>>> = Rc::new(Cell::new(None));
                let runtime = Rc::downgrade(&fx.runtime);
                let snapshot = frozen.clone();
                closure.add_invalidate_notifier(move || {
                    snapshot.set(runtime.upgrade().map(|r| r.stats()));
                });

                let mut closure = Some(closure);
                for event in ordering {
                    match event {
                        Event::Unref => closure_unref(closure.take().unwrap()),
                        Event::Collect => {
                            fx.runtime.unroot(fx.func).unwrap();
                            fx.runtime.collect_garbage();
                        }
                        Event::Destroy => fx.runtime.destroy_context(fx.ctx).unwrap(),
                    }
                    assert!(invalidated.get() <= 1, "{:?} {:?}", finalize_order, ordering);
                }
                fx.runtime.collect_garbage();

                let label = format!("{} {:?}", finalize_order, ordering);
                assert_eq!(invalidated.get(), 1, "{}", label);
                assert_eq!(finalized.get(), 1, "{}", label);
                assert!(weak.upgrade().is_none(), "{}", label);
                assert_eq!(fx.runtime.watch_count(), 0, "{}", label);

                let at_invalidation = frozen.get().unwrap();
                let now = fx.runtime.stats();
                assert_eq!(now.context_touches, at_invalidation.context_touches, "{}", label);
                assert_eq!(now.calls, at_invalidation.calls, "{}", label);
            }
            MemoryReport::capture("after teardown")
                .assert_no_leaks_since(&before)
                .unwrap();
        }
    }
}

#[test]
fn test_invoke_passes_args_and_result() {
    let fx = fixture(RuntimeConfig::default());
    let closure = closure_new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    assert_eq!(closure.invoke_with((2, 3)).unwrap(), Value::Number(5.0));
    assert_eq!(closure_invoke(&closure, &[Value::Int(1)]), Value::Number(1.0));
    assert_eq!(fx.calls.get(), 2);
    assert_eq!(closure.state(), ClosureState::Active);
}

#[test]
fn test_invoke_after_context_death_is_benign() {
    let fx = fixture(RuntimeConfig::default());
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    let reported = counters::get(Counter::ExceptionsReported);

    // Removed from the live set; the registry has not fired yet.
    fx.runtime.destroy_context(fx.ctx).unwrap();
    assert_eq!(closure.state(), ClosureState::Active);

    assert_eq!(closure.invoke(&[Value::Int(1)]), Ok(Value::Undefined));
    assert_eq!(closure.state(), ClosureState::Invalidated);
    assert_eq!(fx.calls.get(), 0);
    assert_eq!(counters::get(Counter::ExceptionsReported), reported);
    assert_eq!(closure_get_context(&closure), None);
    assert_eq!(closure_get_callable(&closure), None);

    // A second call short-circuits without asking the engine.
    let queries = fx.runtime.stats().liveness_queries;
    assert_eq!(closure_invoke(&closure, &[]), Value::Undefined);
    assert_eq!(fx.runtime.stats().liveness_queries, queries);
}

#[test]
fn test_exception_is_reported_exactly_once() {
    let fx = fixture(RuntimeConfig::default());
    let thrower = fx
        .runtime
        .define_function(fx.ctx, "thrower", |_, _| Err(Exception::type_error("bad callback")))
        .unwrap();
    let closure = Closure::new(&fx.engine, fx.ctx, thrower, "thrower").unwrap();
    let reported = counters::get(Counter::ExceptionsReported);

    let err = closure.invoke(&[]).unwrap_err();
    assert_eq!(err.to_string(), "TypeError: bad callback");
    assert_eq!(counters::get(Counter::ExceptionsReported), reported + 1);
    assert_eq!(fx.runtime.pending_exception(fx.ctx), None);

    // The native entry point swallows it after reporting, once.
    assert_eq!(closure_invoke(&closure, &[]), Value::Undefined);
    assert_eq!(counters::get(Counter::ExceptionsReported), reported + 2);
    assert_eq!(fx.runtime.pending_exception(fx.ctx), None);
    assert_eq!(closure.state(), ClosureState::Active);
}

#[test]
fn test_exception_left_pending_after_return() {
    let fx = fixture(RuntimeConfig::default());
    let sneaky = fx
        .runtime
        .define_function(fx.ctx, "sneaky", |scope, _| {
            scope.set_pending_exception(Exception::error("left behind"));
            Ok(Value::Int(7))
        })
        .unwrap();
    let closure = Closure::new(&fx.engine, fx.ctx, sneaky, "sneaky").unwrap();
    let reported = counters::get(Counter::ExceptionsReported);

    let err = closure.invoke(&[]).unwrap_err();
    assert_eq!(err.message(), "left behind");
    assert_eq!(counters::get(Counter::ExceptionsReported), reported + 1);
    assert_eq!(fx.runtime.pending_exception(fx.ctx), None);
}

#[test]
fn test_stale_exception_reported_before_dispatch() {
    let fx = fixture(RuntimeConfig::default());
    let thrower = fx
        .runtime
        .define_function(fx.ctx, "thrower", |_, _| Err(Exception::error("stale")))
        .unwrap();
    // Called directly, so nobody picks the exception up.
    assert_eq!(fx.runtime.call_function(fx.ctx, thrower, &[]), None);

    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    let reported = counters::get(Counter::ExceptionsReported);
    assert_eq!(closure.invoke_with((4,)), Ok(Value::Number(4.0)));
    assert_eq!(counters::get(Counter::ExceptionsReported), reported + 1);
    assert_eq!(fx.runtime.pending_exception(fx.ctx), None);
}

#[test]
fn test_deferred_notifier_keeps_storage_alive() {
    let before = counters::snapshot();
    let fx = fixture(RuntimeConfig::default());
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    let (invalidated, finalized) = counting(&closure);
    let weak = closure.downgrade();

    fx.runtime.destroy_context(fx.ctx).unwrap();
    assert!(!closure.is_valid());
    assert_eq!(invalidated.get(), 1);
    assert!(closure.holds_deferred_ref());
    assert_eq!(closure.ref_count(), 2);

    // Last native reference gone, but the registry entry still points here.
    closure_unref(closure);
    assert_eq!(finalized.get(), 0);
    assert_eq!(counters::get(Counter::Closures), before.closures + 1);

    fx.runtime.collect_garbage();
    assert_eq!(invalidated.get(), 1);
    assert_eq!(finalized.get(), 1);
    assert!(weak.upgrade().is_none());
    assert_eq!(counters::get(Counter::Closures), before.closures);
}

#[test]
fn test_deferred_ref_released_while_still_referenced() {
    let fx = fixture(RuntimeConfig::default());
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    fx.runtime.destroy_context(fx.ctx).unwrap();
    assert!(!closure.is_valid());
    assert_eq!(closure.ref_count(), 2);

    fx.runtime.collect_garbage();
    assert!(!closure.holds_deferred_ref());
    assert_eq!(closure.ref_count(), 1);
    assert_eq!(closure.state(), ClosureState::Invalidated);
}

#[test]
fn test_callable_finalized_with_context_alive() {
    let fx = fixture(RuntimeConfig::default());
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    let (invalidated, _) = counting(&closure);

    fx.runtime.unroot(fx.func).unwrap();
    fx.runtime.collect_garbage();
    assert_eq!(closure.state(), ClosureState::Invalidated);
    assert!(!closure.holds_deferred_ref());
    assert_eq!(fx.runtime.watch_count(), 0);

    fx.runtime.destroy_context(fx.ctx).unwrap();
    fx.runtime.collect_garbage();
    assert_eq!(invalidated.get(), 1);
    assert_eq!(closure.ref_count(), 1);
}

#[test]
fn test_invoke_during_callable_collection() {
    let fx = fixture(RuntimeConfig::default());
    let target_calls = Rc::new(Cell::new(0));
    let counter = target_calls.clone();
    let target = fx
        .runtime
        .define_function(fx.ctx, "target", move |_, _| {
            counter.set(counter.get() + 1);
            Ok(Value::Int(7))
        })
        .unwrap();

    // `fx.func` was defined first, so its watcher fires first.
    let first = Closure::new(&fx.engine, fx.ctx, fx.func, "first").unwrap();
    let second = Closure::new(&fx.engine, fx.ctx, target, "second").unwrap();
    let seen: Rc<RefCell<Option<Result<Value, Exception>>>> = Rc::new(RefCell::new(None));
    let weak = second.downgrade();
    let record = seen.clone();
    first.add_invalidate_notifier(move || {
        if let Some(second) = weak.upgrade() {
            *record.borrow_mut() = Some(second.invoke(&[]));
        }
    });
    let reported = counters::get(Counter::ExceptionsReported);

    // Both callables are freed before either watcher is told.
    fx.runtime.unroot(fx.func).unwrap();
    fx.runtime.unroot(target).unwrap();
    fx.runtime.collect_garbage();

    assert_eq!(*seen.borrow(), Some(Ok(Value::Undefined)));
    assert_eq!(counters::get(Counter::ExceptionsReported), reported);
    assert_eq!(fx.runtime.pending_exception(fx.ctx), None);
    assert_eq!(target_calls.get(), 0);
    assert_eq!(first.state(), ClosureState::Invalidated);
    assert_eq!(second.state(), ClosureState::Invalidated);
    assert!(!second.holds_deferred_ref());
    assert_eq!(fx.runtime.watch_count(), 0);
}

#[test]
fn test_reentrant_invoke_sees_active_closure() {
    let fx = fixture(RuntimeConfig::default());
    let slot: Rc<RefCell<Option<WeakClosure>>> = Rc::new(RefCell::new(None));
    let me = slot.clone();
    let recurse = fx
        .runtime
        .define_function(fx.ctx, "recurse", move |scope, args| {
            let closure = match me.borrow().as_ref().and_then(WeakClosure::upgrade) {
                Some(closure) => closure,
                None => return Err(Exception::internal("closure gone")),
            };
            let consistent = closure.is_valid()
                && closure.state() == ClosureState::Active
                && closure.context() == Some(scope.context())
                && closure.callable() == Some(scope.callee());
            if !consistent {
                return Err(Exception::error("inconsistent closure"));
            }
            let depth = args.first().and_then(Value::as_number).unwrap_or(0.0) as i32;
            if depth == 0 {
                return Ok(Value::Int(1));
            }
            let inner = closure.invoke_with((depth - 1,))?;
            Ok(Value::Int(inner.as_number().unwrap_or(0.0) as i32 + 1))
        })
        .unwrap();

    let closure = Closure::new(&fx.engine, fx.ctx, recurse, "recurse").unwrap();
    *slot.borrow_mut() = Some(closure.downgrade());

    assert_eq!(closure.invoke_with((3,)), Ok(Value::Int(4)));
    assert_eq!(closure.ref_count(), 1);
}

#[test]
fn test_notifiers_see_cleared_target() {
    let fx = fixture(RuntimeConfig::default());
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    let seen: Rc<Cell<Option<(ClosureState, bool)>>> = Rc::new(Cell::new(None));
    let weak = closure.downgrade();
    let record = seen.clone();
    closure.add_invalidate_notifier(move || {
        if let Some(closure) = weak.upgrade() {
            record.set(Some((closure.state(), closure.callable().is_some())));
        }
    });

    closure_invalidate(&closure);
    assert_eq!(seen.get(), Some((ClosureState::Invalidated, false)));
    assert_eq!(closure.invoke(&[]), Ok(Value::Undefined));
}

#[test]
fn test_late_invalidate_notifier_runs_immediately() {
    let fx = fixture(RuntimeConfig::default());
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    closure.invalidate();
    closure.invalidate();

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    closure.add_invalidate_notifier(move || flag.set(true));
    assert!(ran.get());
    assert_eq!(fx.runtime.watch_count(), 0);
}

#[test]
fn test_concrete_scenario() {
    let before = counters::snapshot();
    let fx = fixture(RuntimeConfig::default());
    let closure = closure_new(&fx.engine, fx.ctx, fx.func, "scenario").unwrap();

    assert_eq!(
        closure_invoke(&closure, &[Value::Int(20), Value::Int(22)]),
        Value::Number(42.0)
    );
    assert_eq!(fx.calls.get(), 1);

    fx.runtime.destroy_context(fx.ctx).unwrap();
    let reported = counters::get(Counter::ExceptionsReported);
    assert_eq!(closure_invoke(&closure, &[Value::Int(1)]), Value::Undefined);
    assert_eq!(counters::get(Counter::ExceptionsReported), reported);
    assert_eq!(fx.calls.get(), 1);

    let stats = fx.runtime.stats();
    closure_unref(closure);
    fx.runtime.collect_garbage();
    let after = fx.runtime.stats();
    assert_eq!(after.context_touches, stats.context_touches);
    assert_eq!(after.calls, stats.calls);
    assert_eq!(counters::get(Counter::Closures), before.closures);
}

#[test]
fn test_collection_mid_dispatch() {
    let fx = fixture(RuntimeConfig::default().with_zeal(true));
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    let (invalidated, _) = counting(&closure);
    fx.runtime.unroot(fx.func).unwrap();

    // Validity is checked once on entry; the collector finalizes the
    // callable while the call is in flight.
    assert_eq!(closure.invoke_with((1, 2)), Ok(Value::Number(3.0)));
    assert_eq!(invalidated.get(), 1);
    assert_eq!(closure.state(), ClosureState::Invalidated);

    assert_eq!(closure.invoke_with((1, 2)), Ok(Value::Undefined));
    assert_eq!(fx.calls.get(), 1);
}

#[test]
fn test_engine_dropped_first() {
    let before = counters::snapshot();
    let closure = {
        let fx = fixture(RuntimeConfig::default());
        Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap()
    };
    assert_eq!(closure.state(), ClosureState::Invalidated);
    assert!(!closure.is_valid());
    assert!(!closure.holds_deferred_ref());
    assert_eq!(closure.invoke(&[]), Ok(Value::Undefined));

    drop(closure);
    assert_eq!(counters::snapshot(), before);
}

#[test]
fn test_signal_disconnects_dead_handlers() {
    let fx = fixture(RuntimeConfig::default());
    let signal = Signal::new("changed");
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "on-changed").unwrap();
    let id = signal.connect(&closure);
    assert_eq!(closure.ref_count(), 2);

    assert_eq!(signal.emit(&[Value::Int(5)]), vec![Value::Number(5.0)]);

    fx.runtime.destroy_context(fx.ctx).unwrap();
    // The emission notices the dead context and the handler drops out.
    assert_eq!(signal.emit(&[Value::Int(5)]), vec![Value::Undefined]);
    assert_eq!(signal.handler_count(), 0);
    assert!(!signal.disconnect(id));
    assert_eq!(fx.calls.get(), 1);

    drop(closure);
    fx.runtime.collect_garbage();
    assert_eq!(fx.runtime.watch_count(), 0);
}

#[test]
fn test_signal_disconnect_removes_notifier() {
    let fx = fixture(RuntimeConfig::default());
    let signal = Signal::new("changed");
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "on-changed").unwrap();
    for _ in 0..1000 {
        let id = signal.connect(&closure);
        assert_eq!(closure.invalidate_notifier_count(), 1);
        assert!(signal.disconnect(id));
    }
    assert_eq!(signal.handler_count(), 0);
    assert_eq!(closure.invalidate_notifier_count(), 0);
    assert_eq!(closure.ref_count(), 1);

    // A handler connected afterwards still drops out on invalidation.
    signal.connect(&closure);
    closure.invalidate();
    assert_eq!(signal.handler_count(), 0);
    assert_eq!(closure.ref_count(), 1);
}

#[test]
fn test_signal_connect_after_invalidation() {
    let fx = fixture(RuntimeConfig::default());
    let signal = Signal::new("changed");
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "late").unwrap();
    closure.invalidate();
    signal.connect(&closure);
    assert_eq!(signal.handler_count(), 0);
    assert_eq!(closure.ref_count(), 1);
}

#[test]
fn test_liveness_check_without_registry() {
    // The lazy check alone must be enough when the engine is still live.
    let fx = fixture(RuntimeConfig::default());
    let closure = Closure::new(&fx.engine, fx.ctx, fx.func, "sum").unwrap();
    assert!(fx.engine.is_context_live(fx.ctx));
    fx.runtime.destroy_context(fx.ctx).unwrap();
    assert_eq!(fx.runtime.pending_context_finalizations(), 1);
    assert_eq!(closure.context(), None);
    assert_eq!(closure.state(), ClosureState::Invalidated);
}
