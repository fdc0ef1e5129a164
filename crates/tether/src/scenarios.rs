//! Built-in lifetime scenarios
//!
//! Each scenario drives one runtime through a sequence of bridge operations
//! and records what it observed after every step. Memory reports are taken
//! at the start, at scenario-specific points, and after the runtime is gone.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt::Display;
use std::rc::Rc;
use tether_bridge::interop::{closure_invoke, closure_new, closure_unref};
use tether_bridge::{Closure, Signal, WeakClosure};
use tether_diagnostics::MemoryReport;
use tether_runtime::{CallScope, Engine, EngineStats, Exception, Runtime, RuntimeConfig, Value};

pub struct Scenario {
    pub name: &'static str,
    pub summary: &'static str,
    body: fn(&Rc<Runtime>, &mut Trace) -> Result<()>,
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "basic",
        summary: "invoke, unref, then destroy the context",
        body: basic,
    },
    Scenario {
        name: "deferred",
        summary: "destroy the context first; the closure waits for the registry",
        body: deferred,
    },
    Scenario {
        name: "collected",
        summary: "the collector finalizes the callable while the closure is held",
        body: collected,
    },
    Scenario {
        name: "signal",
        summary: "signal handlers from two contexts, one torn down between emissions",
        body: signal,
    },
    Scenario {
        name: "exception",
        summary: "a throwing callable is reported once and leaves nothing pending",
        body: exception,
    },
];

pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub action: String,
    pub outcome: String,
}

#[derive(Debug, Default)]
pub struct Trace {
    pub steps: Vec<Step>,
    pub reports: Vec<MemoryReport>,
}

impl Trace {
    fn step(&mut self, action: impl Into<String>, outcome: impl Display) {
        let step = Step {
            action: action.into(),
            outcome: outcome.to_string(),
        };
        log::info!("{}: {}", step.action, step.outcome);
        self.steps.push(step);
    }

    fn report(&mut self, label: &str) {
        self.reports.push(MemoryReport::capture(label));
    }
}

pub struct Outcome {
    pub trace: Trace,
    pub stats: EngineStats,
}

impl Outcome {
    /// Objects still alive at the end that were not alive at the start.
    pub fn leaks(&self) -> Vec<String> {
        match (self.trace.reports.first(), self.trace.reports.last()) {
            (Some(first), Some(last)) => last
                .leaks_since(first)
                .iter()
                .map(|(counter, count)| format!("{} {}", count, counter))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Scenario {
    pub fn execute(&self, config: RuntimeConfig) -> Result<Outcome> {
        let mut trace = Trace::default();
        trace.report("start");
        let stats = {
            let runtime = Runtime::new(config);
            (self.body)(&runtime, &mut trace)?;
            trace.report("before runtime teardown");
            runtime.stats()
        };
        trace.report("after runtime teardown");
        Ok(Outcome { trace, stats })
    }
}

fn sum(_: &CallScope<'_>, args: &[Value]) -> Result<Value, Exception> {
    Ok(Value::Number(args.iter().filter_map(Value::as_number).sum()))
}

fn describe(closure: &Closure) -> String {
    format!(
        "{:?}, {} ref(s){}",
        closure.state(),
        closure.ref_count(),
        if closure.holds_deferred_ref() {
            ", deferred ref held"
        } else {
            ""
        }
    )
}

fn storage(weak: &WeakClosure) -> &'static str {
    if weak.upgrade().is_some() {
        "storage alive"
    } else {
        "finalized"
    }
}

fn basic(runtime: &Rc<Runtime>, trace: &mut Trace) -> Result<()> {
    let ctx = runtime.new_context("main");
    let add = runtime.define_function(ctx, "add", sum)?;
    let closure = closure_new(&runtime.handle(), ctx, add, "add")?;
    trace.step("create closure", describe(&closure));

    let result = closure_invoke(&closure, &[Value::Int(2), Value::Int(3)]);
    trace.step("invoke add(2, 3)", result);

    let weak = closure.downgrade();
    closure_unref(closure);
    trace.step("unref closure", storage(&weak));

    trace.report("before destroying context");
    runtime.destroy_context(ctx)?;
    runtime.collect_garbage();
    trace.step("destroy context and collect", format!("{} watch(es) left", runtime.watch_count()));
    trace.report("after destroying context");
    Ok(())
}

fn deferred(runtime: &Rc<Runtime>, trace: &mut Trace) -> Result<()> {
    let ctx = runtime.new_context("main");
    let add = runtime.define_function(ctx, "add", sum)?;
    let closure = closure_new(&runtime.handle(), ctx, add, "add")?;

    runtime.destroy_context(ctx)?;
    trace.step(
        "destroy context",
        format!(
            "{} context(s) awaiting finalization",
            runtime.pending_context_finalizations()
        ),
    );

    let result = closure_invoke(&closure, &[Value::Int(1)]);
    trace.step("invoke after teardown", format!("{} ({})", result, describe(&closure)));

    let weak = closure.downgrade();
    closure_unref(closure);
    trace.step("unref closure", storage(&weak));

    trace.report("before collection");
    runtime.collect_garbage();
    trace.step("collect garbage", storage(&weak));
    trace.report("after collection");
    Ok(())
}

fn collected(runtime: &Rc<Runtime>, trace: &mut Trace) -> Result<()> {
    let ctx = runtime.new_context("main");
    let add = runtime.define_function(ctx, "add", sum)?;
    let closure = closure_new(&runtime.handle(), ctx, add, "add")?;

    runtime.unroot(add)?;
    runtime.collect_garbage();
    trace.step("unroot callable and collect", describe(&closure));

    let result = closure_invoke(&closure, &[Value::Int(1)]);
    trace.step("invoke after collection", result);

    let weak = closure.downgrade();
    closure_unref(closure);
    trace.step("unref closure", storage(&weak));

    trace.report("before destroying context");
    runtime.destroy_context(ctx)?;
    runtime.collect_garbage();
    trace.report("after destroying context");
    Ok(())
}

fn signal(runtime: &Rc<Runtime>, trace: &mut Trace) -> Result<()> {
    let window = runtime.new_context("window");
    let worker = runtime.new_context("worker");
    let on_window = runtime.define_function(window, "on-window", sum)?;
    let on_worker = runtime.define_function(worker, "on-worker", |_, args| {
        Ok(Value::Number(-args.iter().filter_map(Value::as_number).sum::<f64>()))
    })?;

    let changed = Signal::new("changed");
    for (ctx, callable, name) in [(window, on_window, "window"), (worker, on_worker, "worker")] {
        let closure = Closure::new(&runtime.handle(), ctx, callable, name)?;
        changed.connect(&closure);
        // The signal keeps its own reference.
    }
    trace.step("connect two handlers", format!("{} handler(s)", changed.handler_count()));

    let results = changed.emit(&[Value::Int(4)]);
    trace.step("emit(4)", format_values(&results));

    runtime.destroy_context(worker)?;
    trace.report("before second emission");
    let results = changed.emit(&[Value::Int(4)]);
    trace.step(
        "emit(4) after destroying worker",
        format!("{} -> {} handler(s)", format_values(&results), changed.handler_count()),
    );

    runtime.destroy_context(window)?;
    runtime.collect_garbage();
    trace.step("destroy window and collect", format!("{} handler(s)", changed.handler_count()));
    if changed.handler_count() != 0 {
        return Err(anyhow!("signal still has handlers after both contexts died"));
    }
    trace.report("after destroying both contexts");
    Ok(())
}

fn exception(runtime: &Rc<Runtime>, trace: &mut Trace) -> Result<()> {
    let ctx = runtime.new_context("main");
    let thrower = runtime.define_function(ctx, "thrower", |_, args| {
        Err(Exception::type_error(format!("rejected {} argument(s)", args.len())))
    })?;
    let closure = closure_new(&runtime.handle(), ctx, thrower, "thrower")?;

    match closure.invoke_with((1, "two")) {
        Ok(value) => trace.step("invoke thrower", format!("unexpected value {}", value)),
        Err(exception) => trace.step("invoke thrower", format!("error {}", exception)),
    }
    let pending = runtime.pending_exception(ctx);
    trace.step(
        "check pending exception",
        pending.map_or_else(|| "clear".to_string(), |e| format!("still pending: {}", e)),
    );

    closure_unref(closure);
    runtime.destroy_context(ctx)?;
    runtime.collect_garbage();
    trace.report("after destroying context");
    Ok(())
}

fn format_values(values: &[Value]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}
