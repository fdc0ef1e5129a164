//! Reference engine
//!
//! A deliberately small engine: contexts, callables implemented as Rust
//! closures, a mark-free collector driven by explicit roots, pending
//! exceptions and the two finalizer tables. It exists so the bridge can be
//! exercised against every teardown order an embedding engine may produce.
//!
//! Single-threaded. Every entry point may be re-entered from a callable or a
//! finalizer; no `RefCell` borrow is held while calling out.

use crate::config::{FinalizeOrder, RuntimeConfig};
use crate::engine::{Engine, EngineHandle};
use crate::error::RuntimeError;
use crate::exception::Exception;
use crate::handle::{CallableRef, ContextId};
use crate::registry::{CallableWatcher, FinalizationRegistry, GlobalWatcher, WatcherKey};
use crate::value::Value;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use tether_diagnostics::counters::{self, Counter};

/// Signature of a callable's body.
pub type NativeFn = dyn Fn(&CallScope<'_>, &[Value]) -> Result<Value, Exception>;

/// What a running callable can see of its caller.
pub struct CallScope<'a> {
    runtime: &'a Runtime,
    context: ContextId,
    callee: CallableRef,
}

impl<'a> CallScope<'a> {
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn callee(&self) -> CallableRef {
        self.callee
    }

    /// Leave an exception pending without failing the call.
    pub fn set_pending_exception(&self, exception: Exception) {
        self.runtime.set_pending(self.context, exception);
    }
}

/// Instrumentation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// `is_context_live` / `is_callable_live` calls
    pub liveness_queries: u64,
    /// Operations that dereferenced a context
    pub context_touches: u64,
    /// Callables actually entered
    pub calls: u64,
    pub collections: u64,
    pub callables_finalized: u64,
    pub globals_finalized: u64,
}

struct ContextSlot {
    id: ContextId,
    name: String,
    pending_exception: Option<Exception>,
    active_calls: u32,
    registry: FinalizationRegistry<dyn GlobalWatcher>,
}

struct CallableSlot {
    context: ContextId,
    name: String,
    func: Rc<NativeFn>,
    roots: u32,
}

struct RuntimeState {
    next_id: u32,
    live: Vec<ContextSlot>,
    /// Destroyed contexts whose global object awaits finalization
    doomed: Vec<ContextSlot>,
    callables: BTreeMap<CallableRef, CallableSlot>,
    callable_watches: FinalizationRegistry<dyn CallableWatcher>,
}

impl RuntimeState {
    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn live_context_mut(&mut self, ctx: ContextId) -> Option<&mut ContextSlot> {
        self.live.iter_mut().find(|c| c.id == ctx)
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    state: RefCell<RuntimeState>,
    stats: Cell<EngineStats>,
    collecting: Cell<bool>,
}

/// Clears the collecting flag even if a finalizer panics.
struct CollectGuard<'a>(&'a Cell<bool>);

impl Drop for CollectGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Rc<Self> {
        log::debug!(
            target: "tether::gc",
            "runtime created (finalize order {}, zeal {})",
            config.gc.finalize_order,
            config.gc.zeal
        );
        Rc::new(Self {
            config,
            state: RefCell::new(RuntimeState {
                next_id: 1,
                live: Vec::new(),
                doomed: Vec::new(),
                callables: BTreeMap::new(),
                callable_watches: FinalizationRegistry::new(),
            }),
            stats: Cell::new(EngineStats::default()),
            collecting: Cell::new(false),
        })
    }

    /// Type-erased handle for the bridge.
    pub fn handle(self: &Rc<Self>) -> EngineHandle {
        self.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn new_context(&self, name: &str) -> ContextId {
        let mut state = self.state.borrow_mut();
        let id = ContextId::new(state.allocate_id());
        state.live.push(ContextSlot {
            id,
            name: name.to_string(),
            pending_exception: None,
            active_calls: 0,
            registry: FinalizationRegistry::new(),
        });
        counters::inc(Counter::Contexts);
        log::debug!("created {} ({})", id, name);
        id
    }

    /// Begin teardown of `ctx`.
    ///
    /// The context stops being live immediately. Its global object, and with
    /// it the finalization registry, goes away at the next collection.
    pub fn destroy_context(&self, ctx: ContextId) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.borrow_mut();
            let index = state
                .live
                .iter()
                .position(|c| c.id == ctx)
                .ok_or(RuntimeError::ContextNotLive(ctx))?;
            if state.live[index].active_calls > 0 {
                return Err(RuntimeError::ContextBusy(ctx));
            }
            let slot = state.live.remove(index);
            log::debug!(
                "destroying {} ({}), {} watcher(s) pending",
                ctx,
                slot.name,
                slot.registry.len()
            );
            state.doomed.push(slot);
        }
        if self.config.gc.collect_on_context_destroy {
            self.collect_garbage();
        }
        Ok(())
    }

    /// Ids of the live contexts, oldest first.
    pub fn context_ids(&self) -> Vec<ContextId> {
        self.state.borrow().live.iter().map(|c| c.id).collect()
    }

    pub fn context_name(&self, ctx: ContextId) -> Option<String> {
        let state = self.state.borrow();
        state
            .live
            .iter()
            .chain(state.doomed.iter())
            .find(|c| c.id == ctx)
            .map(|c| c.name.clone())
    }

    /// Define a callable in `ctx`. It starts out rooted once.
    pub fn define_function<F>(&self, ctx: ContextId, name: &str, f: F) -> Result<CallableRef, RuntimeError>
    where
        F: Fn(&CallScope<'_>, &[Value]) -> Result<Value, Exception> + 'static,
    {
        let id = {
            let mut state = self.state.borrow_mut();
            if state.live_context_mut(ctx).is_none() {
                return Err(RuntimeError::ContextNotLive(ctx));
            }
            let id = CallableRef::new(state.allocate_id());
            state.callables.insert(
                id,
                CallableSlot {
                    context: ctx,
                    name: name.to_string(),
                    func: Rc::new(f),
                    roots: 1,
                },
            );
            id
        };
        counters::inc(Counter::Callables);
        log::trace!("defined {} ({}) in {}", id, name, ctx);
        if self.config.gc.zeal {
            self.collect_garbage();
        }
        Ok(id)
    }

    pub fn root(&self, callable: CallableRef) -> Result<(), RuntimeError> {
        let mut state = self.state.borrow_mut();
        let slot = state
            .callables
            .get_mut(&callable)
            .ok_or(RuntimeError::CallableNotLive(callable))?;
        slot.roots += 1;
        Ok(())
    }

    /// Drop one root. An unrooted callable is finalized by the next collection.
    pub fn unroot(&self, callable: CallableRef) -> Result<(), RuntimeError> {
        let mut state = self.state.borrow_mut();
        let slot = state
            .callables
            .get_mut(&callable)
            .ok_or(RuntimeError::CallableNotLive(callable))?;
        if slot.roots == 0 {
            debug_assert!(false, "unbalanced unroot of {}", callable);
            log::error!(target: "tether::gc", "unbalanced unroot of {} ({})", callable, slot.name);
            return Ok(());
        }
        slot.roots -= 1;
        Ok(())
    }

    /// Run a full collection.
    ///
    /// Finalizes every unrooted callable, every callable of a destroyed
    /// context and the global object of every destroyed context, in the
    /// configured phase order. A collection requested from inside a
    /// finalizer is skipped.
    pub fn collect_garbage(&self) {
        if self.collecting.replace(true) {
            log::trace!(target: "tether::gc", "collection already running, skipped");
            return;
        }
        let _guard = CollectGuard(&self.collecting);

        let (callables, globals) = match self.config.gc.finalize_order {
            FinalizeOrder::CallablesFirst => {
                let callables = self.finalize_callables();
                (callables, self.finalize_globals())
            }
            FinalizeOrder::GlobalsFirst => {
                let globals = self.finalize_globals();
                (self.finalize_callables(), globals)
            }
        };

        self.bump(|s| {
            s.collections += 1;
            s.callables_finalized += callables as u64;
            s.globals_finalized += globals as u64;
        });
        log::debug!(
            target: "tether::gc",
            "collection finished: {} callable(s), {} global(s) finalized",
            callables,
            globals
        );
    }

    fn finalize_callables(&self) -> usize {
        let (dead, entries) = {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            let live: Vec<ContextId> = state.live.iter().map(|c| c.id).collect();
            let doomed: Vec<CallableRef> = state
                .callables
                .iter()
                .filter(|(_, slot)| slot.roots == 0 || !live.contains(&slot.context))
                .map(|(id, _)| *id)
                .collect();

            let mut dead = Vec::with_capacity(doomed.len());
            let mut entries = Vec::new();
            for id in doomed {
                if let Some(slot) = state.callables.remove(&id) {
                    dead.push((id, slot));
                }
                entries.extend(state.callable_watches.take_watched(id));
            }
            (dead, entries)
        };

        for entry in entries {
            if let Some(watcher) = entry.watcher() {
                watcher.callable_finalized(entry.watched());
            }
        }

        // Storage goes last, after every watcher has been told.
        let count = dead.len();
        for (id, slot) in dead {
            log::trace!(target: "tether::gc", "finalized {} ({})", id, slot.name);
            drop(slot);
            counters::dec(Counter::Callables);
        }
        count
    }

    fn finalize_globals(&self) -> usize {
        let doomed = std::mem::take(&mut self.state.borrow_mut().doomed);
        let count = doomed.len();
        for mut slot in doomed {
            let entries = slot.registry.take_all();
            log::debug!(
                target: "tether::gc",
                "finalizing global of {} ({}), notifying {} watcher(s)",
                slot.id,
                slot.name,
                entries.len()
            );
            for entry in entries {
                if let Some(watcher) = entry.watcher() {
                    watcher.global_finalized(entry.watched());
                }
            }
            drop(slot);
            counters::dec(Counter::Contexts);
        }
        count
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.get()
    }

    /// Outstanding finalizer registrations of every kind.
    pub fn watch_count(&self) -> usize {
        let state = self.state.borrow();
        state.callable_watches.len()
            + state
                .live
                .iter()
                .chain(state.doomed.iter())
                .map(|c| c.registry.len())
                .sum::<usize>()
    }

    /// Destroyed contexts whose global object has not been finalized yet.
    pub fn pending_context_finalizations(&self) -> usize {
        self.state.borrow().doomed.len()
    }

    fn bump(&self, f: impl FnOnce(&mut EngineStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Record a dereference of `ctx`. Touching a context after its
    /// teardown began is a bug in the caller.
    fn touch(&self, ctx: ContextId) -> bool {
        self.bump(|s| s.context_touches += 1);
        let live = self.state.borrow().live.iter().any(|c| c.id == ctx);
        if !live {
            debug_assert!(false, "{} touched after teardown began", ctx);
            log::error!(target: "tether::gc", "{} touched after teardown began", ctx);
        }
        live
    }

    fn set_pending(&self, ctx: ContextId, exception: Exception) {
        if !self.touch(ctx) {
            return;
        }
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.live_context_mut(ctx) {
            if let Some(previous) = slot.pending_exception.replace(exception) {
                log::trace!("{} replaced pending exception {}", ctx, previous);
            }
        }
    }

    fn adjust_active_calls(&self, ctx: ContextId, entering: bool) {
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.live_context_mut(ctx) {
            if entering {
                slot.active_calls += 1;
            } else {
                slot.active_calls -= 1;
            }
        }
    }
}

impl Engine for Runtime {
    fn is_context_live(&self, ctx: ContextId) -> bool {
        self.bump(|s| s.liveness_queries += 1);
        self.state.borrow().live.iter().any(|c| c.id == ctx)
    }

    fn is_callable_live(&self, callable: CallableRef) -> bool {
        self.bump(|s| s.liveness_queries += 1);
        self.state.borrow().callables.contains_key(&callable)
    }

    fn call_function(&self, ctx: ContextId, callable: CallableRef, args: &[Value]) -> Option<Value> {
        if !self.touch(ctx) {
            return None;
        }
        let func = self
            .state
            .borrow()
            .callables
            .get(&callable)
            .map(|slot| slot.func.clone());
        let func = match func {
            Some(func) => func,
            None => {
                log::warn!("call to {} which is not live", callable);
                self.set_pending(ctx, Exception::internal(format!("{} is not live", callable)));
                return None;
            }
        };

        self.bump(|s| s.calls += 1);
        self.adjust_active_calls(ctx, true);
        if self.config.gc.zeal {
            self.collect_garbage();
        }

        let scope = CallScope {
            runtime: self,
            context: ctx,
            callee: callable,
        };
        let result = func(&scope, args);
        self.adjust_active_calls(ctx, false);

        match result {
            Ok(value) => Some(value),
            Err(exception) => {
                self.set_pending(ctx, exception);
                None
            }
        }
    }

    fn pending_exception(&self, ctx: ContextId) -> Option<Exception> {
        if !self.touch(ctx) {
            return None;
        }
        let mut state = self.state.borrow_mut();
        state
            .live_context_mut(ctx)
            .and_then(|slot| slot.pending_exception.clone())
    }

    fn clear_exception(&self, ctx: ContextId) {
        if !self.touch(ctx) {
            return;
        }
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.live_context_mut(ctx) {
            slot.pending_exception = None;
        }
    }

    fn add_callable_watch(
        &self,
        callable: CallableRef,
        watcher: Weak<dyn CallableWatcher>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.borrow_mut();
        if !state.callables.contains_key(&callable) {
            return Err(RuntimeError::CallableNotLive(callable));
        }
        state.callable_watches.add(watcher, callable)
    }

    fn remove_callable_watch(&self, callable: CallableRef, key: WatcherKey) -> bool {
        self.state.borrow_mut().callable_watches.remove(key, callable)
    }

    fn add_global_watch(
        &self,
        ctx: ContextId,
        watched: CallableRef,
        watcher: Weak<dyn GlobalWatcher>,
    ) -> Result<(), RuntimeError> {
        if !self.touch(ctx) {
            return Err(RuntimeError::ContextNotLive(ctx));
        }
        let mut state = self.state.borrow_mut();
        match state.live_context_mut(ctx) {
            Some(slot) => slot.registry.add(watcher, watched),
            None => Err(RuntimeError::ContextNotLive(ctx)),
        }
    }

    fn remove_global_watch(&self, ctx: ContextId, watched: CallableRef, key: WatcherKey) -> bool {
        if !self.touch(ctx) {
            return false;
        }
        let mut state = self.state.borrow_mut();
        state
            .live_context_mut(ctx)
            .map(|slot| slot.registry.remove(key, watched))
            .unwrap_or(false)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let state = self.state.get_mut();
        let live = std::mem::take(&mut state.live);
        state.doomed.extend(live);
        self.collect_garbage();
        debug_assert!(self.state.get_mut().callables.is_empty());
    }
}
