//! Closure state machine
//!
//! A `Closure` is one counted reference to a shared `ClosureInner`. Cloning
//! acquires, dropping releases. The inner object moves through three states
//! and never back:
//!
//! ```text
//! Active ──invalidate──▶ Invalidated ──last release──▶ Finalized
//! ```
//!
//! The (engine, context, callable) target is a single `Option`, taken in one
//! step by whichever trigger gets there first:
//!
//! - the last reference is released (or `invalidate()` is called),
//! - the engine finalizes the callable (`CallableWatcher`),
//! - the context is torn down, seen either by the registry notifier
//!   (`GlobalWatcher`) or lazily by `is_valid`.
//!
//! ## Deferred self-reference
//!
//! When invalidation happens while the context is already dead, the
//! context's registry still holds an entry for us that will fire at the next
//! collection. The closure then takes one extra reference on itself and sets
//! `unref_on_global_finalized`; the registry notifier gives it back. That
//! reference is taken and released exactly once.

use crate::error::BridgeError;
use crate::invoke::{self, IntoArgs};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tether_diagnostics::counters::{self, Counter};
use tether_runtime::{
    CallableRef, CallableWatcher, ContextId, Engine, EngineHandle, Exception, GlobalWatcher, Value,
    WatcherKey,
};

thread_local! {
    static NEXT_CLOSURE_ID: Cell<u64> = const { Cell::new(1) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureState {
    /// Target populated, invocations reach the callable
    Active,
    /// Target cleared, references may remain
    Invalidated,
    /// Last reference released
    Finalized,
}

/// What drove an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    LastUnref,
    Explicit,
    DeadContext,
    CallableFinalized,
    GlobalFinalized,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::LastUnref => "last unref",
            Trigger::Explicit => "explicit invalidation",
            Trigger::DeadContext => "dead context",
            Trigger::CallableFinalized => "callable finalizer",
            Trigger::GlobalFinalized => "global finalizer",
        }
    }
}

#[derive(Clone)]
struct Target {
    engine: Weak<dyn Engine>,
    context: ContextId,
    callable: CallableRef,
}

type Notifier = Box<dyn FnOnce()>;

/// Identifies an invalidate notifier so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

struct ClosureInner {
    id: u64,
    description: String,
    ref_count: Cell<u32>,
    state: Cell<ClosureState>,
    target: RefCell<Option<Target>>,
    unref_on_global_finalized: Cell<bool>,
    deferred_ref: RefCell<Option<Rc<ClosureInner>>>,
    next_notifier: Cell<u64>,
    invalidate_notifiers: RefCell<Vec<(NotifierId, Notifier)>>,
    finalize_notifiers: RefCell<Vec<Notifier>>,
    this: Weak<ClosureInner>,
}

impl ClosureInner {
    fn key(&self) -> WatcherKey {
        WatcherKey::of(&self.this)
    }

    fn acquire(&self) {
        debug_assert!(
            self.state.get() != ClosureState::Finalized,
            "ref on finalized closure {}",
            self.id
        );
        self.ref_count.set(self.ref_count.get() + 1);
    }

    fn release(&self) {
        let count = self.ref_count.get();
        if count == 0 {
            debug_assert!(false, "unref on finalized closure {}", self.id);
            log::error!(target: "tether::closure", "unref on finalized closure {}", self.id);
            return;
        }
        if count == 1 {
            self.invalidate(Trigger::LastUnref);
        }
        // Invalidation may have taken the deferred reference.
        let count = self.ref_count.get() - 1;
        self.ref_count.set(count);
        if count == 0 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        debug_assert!(self.target.borrow().is_none());
        self.state.set(ClosureState::Finalized);
        self.invalidate_notifiers.borrow_mut().clear();
        let notifiers = std::mem::take(&mut *self.finalize_notifiers.borrow_mut());
        log::debug!(target: "tether::closure", "closure {} ({}) finalized", self.id, self.description);
        for notify in notifiers {
            notify();
        }
        counters::dec(Counter::Closures);
    }

    /// Clear the target, detach from the engine, then notify.
    fn invalidate(&self, trigger: Trigger) {
        let target = match self.target.borrow_mut().take() {
            Some(target) => target,
            None => {
                log::trace!(
                    target: "tether::closure",
                    "closure {} already invalidated, ignoring {}",
                    self.id,
                    trigger.as_str()
                );
                return;
            }
        };
        self.state.set(ClosureState::Invalidated);
        log::debug!(
            target: "tether::closure",
            "closure {} ({}) invalidated by {}",
            self.id,
            self.description,
            trigger.as_str()
        );

        self.detach(&target, trigger);

        let notifiers = std::mem::take(&mut *self.invalidate_notifiers.borrow_mut());
        for (_, notify) in notifiers {
            notify();
        }
    }

    fn detach(&self, target: &Target, trigger: Trigger) {
        let engine = match target.engine.upgrade() {
            Some(engine) => engine,
            None => {
                log::debug!(target: "tether::closure", "closure {}: engine gone, nothing to detach", self.id);
                return;
            }
        };
        let key = self.key();

        if trigger != Trigger::CallableFinalized {
            engine.remove_callable_watch(target.callable, key);
        }

        match trigger {
            Trigger::GlobalFinalized => {}
            Trigger::DeadContext => self.hold_until_global_finalized(target.context),
            Trigger::LastUnref | Trigger::Explicit | Trigger::CallableFinalized => {
                if engine.is_context_live(target.context) {
                    engine.remove_global_watch(target.context, target.callable, key);
                } else {
                    self.hold_until_global_finalized(target.context);
                }
            }
        }
    }

    fn hold_until_global_finalized(&self, context: ContextId) {
        if self.unref_on_global_finalized.replace(true) {
            debug_assert!(false, "closure {} already holds a deferred reference", self.id);
            return;
        }
        self.ref_count.set(self.ref_count.get() + 1);
        *self.deferred_ref.borrow_mut() = self.this.upgrade();
        log::debug!(
            target: "tether::closure",
            "closure {} keeps itself alive until {} is finalized",
            self.id,
            context
        );
    }

    /// Re-check context and callable liveness, invalidating if either died.
    ///
    /// A collector frees callable storage before telling its watchers, so a
    /// reentrant call can see the callable gone while we are still Active.
    fn check_valid(&self) -> bool {
        let (engine, context, callable) = match &*self.target.borrow() {
            Some(target) => (target.engine.upgrade(), target.context, target.callable),
            None => return false,
        };
        let engine = match engine {
            Some(engine) => engine,
            None => {
                self.invalidate(Trigger::DeadContext);
                return false;
            }
        };
        if !engine.is_context_live(context) {
            log::debug!(target: "tether::closure", "closure {}: {} is gone", self.id, context);
            self.invalidate(Trigger::DeadContext);
            return false;
        }
        if !engine.is_callable_live(callable) {
            log::debug!(target: "tether::closure", "closure {}: {} is gone", self.id, callable);
            // The watch entry was already taken by the collector.
            self.invalidate(Trigger::CallableFinalized);
            return false;
        }
        true
    }
}

impl GlobalWatcher for ClosureInner {
    fn global_finalized(self: Rc<Self>, watched: CallableRef) {
        let need_unref = self.unref_on_global_finalized.replace(false);
        log::trace!(
            target: "tether::closure",
            "closure {}: global of {} finalized (deferred ref: {})",
            self.id,
            watched,
            need_unref
        );
        self.invalidate(Trigger::GlobalFinalized);
        if need_unref {
            let deferred = self.deferred_ref.borrow_mut().take();
            self.release();
            drop(deferred);
        }
    }
}

impl CallableWatcher for ClosureInner {
    fn callable_finalized(self: Rc<Self>, watched: CallableRef) {
        log::trace!(target: "tether::closure", "closure {}: {} finalized", self.id, watched);
        self.invalidate(Trigger::CallableFinalized);
    }
}

/// A counted native reference to a script callable.
pub struct Closure {
    inner: Rc<ClosureInner>,
}

impl Closure {
    /// Wrap `callable`, which must live in the live context `context`.
    ///
    /// The new closure holds the only reference.
    pub fn new(
        engine: &EngineHandle,
        context: ContextId,
        callable: CallableRef,
        description: impl Into<String>,
    ) -> Result<Closure, BridgeError> {
        if !engine.is_context_live(context) {
            return Err(BridgeError::ContextNotLive(context));
        }
        if !engine.is_callable_live(callable) {
            return Err(BridgeError::CallableNotLive(callable));
        }

        let id = NEXT_CLOSURE_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        let inner = Rc::new_cyclic(|this| ClosureInner {
            id,
            description: description.into(),
            ref_count: Cell::new(1),
            state: Cell::new(ClosureState::Active),
            target: RefCell::new(Some(Target {
                engine: Rc::downgrade(engine),
                context,
                callable,
            })),
            unref_on_global_finalized: Cell::new(false),
            deferred_ref: RefCell::new(None),
            next_notifier: Cell::new(1),
            invalidate_notifiers: RefCell::new(Vec::new()),
            finalize_notifiers: RefCell::new(Vec::new()),
            this: this.clone(),
        });

        let global: Weak<dyn GlobalWatcher> = inner.this.clone();
        engine.add_global_watch(context, callable, global)?;
        let finalizer: Weak<dyn CallableWatcher> = inner.this.clone();
        if let Err(err) = engine.add_callable_watch(callable, finalizer) {
            engine.remove_global_watch(context, callable, inner.key());
            return Err(err.into());
        }

        counters::inc(Counter::Closures);
        log::debug!(
            target: "tether::closure",
            "closure {} ({}) created for {} in {}",
            id,
            inner.description,
            callable,
            context
        );
        Ok(Closure { inner })
    }

    /// Whether the closure can still reach its callable.
    ///
    /// Notices a context that was torn down without the registry having
    /// fired yet, and invalidates in that case.
    pub fn is_valid(&self) -> bool {
        self.inner.check_valid()
    }

    /// Call the wrapped callable.
    ///
    /// An invalid closure returns `Ok(Value::Undefined)`: a callback firing
    /// after its target died is expected. A script exception comes back as
    /// `Err` and has already been reported.
    pub fn invoke(&self, args: &[Value]) -> Result<Value, Exception> {
        if !self.inner.check_valid() {
            log::debug!(
                target: "tether::closure",
                "closure {} ({}) invoked after invalidation, ignoring",
                self.inner.id,
                self.inner.description
            );
            return Ok(Value::Undefined);
        }

        // Copy the target out: the dispatch may run a collection that
        // invalidates us.
        let target = match self.inner.target.borrow().clone() {
            Some(target) => target,
            None => return Ok(Value::Undefined),
        };
        let engine = match target.engine.upgrade() {
            Some(engine) => engine,
            None => return Ok(Value::Undefined),
        };
        invoke::dispatch(&*engine, target.context, target.callable, args, self.inner.id)
    }

    pub fn invoke_with<A: IntoArgs>(&self, args: A) -> Result<Value, Exception> {
        self.invoke(&args.into_args())
    }

    /// Invalidate now, on behalf of a native reference holder.
    pub fn invalidate(&self) {
        self.inner.invalidate(Trigger::Explicit);
    }

    /// The context, or `None` once invalidated. Performs the liveness check.
    pub fn context(&self) -> Option<ContextId> {
        if !self.inner.check_valid() {
            return None;
        }
        self.inner.target.borrow().as_ref().map(|t| t.context)
    }

    /// The callable, or `None` once invalidated.
    pub fn callable(&self) -> Option<CallableRef> {
        self.inner.target.borrow().as_ref().map(|t| t.callable)
    }

    pub fn state(&self) -> ClosureState {
        self.inner.state.get()
    }

    pub fn ref_count(&self) -> u32 {
        self.inner.ref_count.get()
    }

    /// Whether the closure is waiting on a registry notification to drop
    /// its own extra reference.
    pub fn holds_deferred_ref(&self) -> bool {
        self.inner.unref_on_global_finalized.get()
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Run `notify` once the closure is invalidated, or right away if it
    /// already is.
    pub fn add_invalidate_notifier(&self, notify: impl FnOnce() + 'static) -> NotifierId {
        let id = NotifierId(self.inner.next_notifier.get());
        self.inner.next_notifier.set(id.0 + 1);
        if self.state() != ClosureState::Active {
            notify();
            return id;
        }
        self.inner
            .invalidate_notifiers
            .borrow_mut()
            .push((id, Box::new(notify)));
        id
    }

    /// Drop a notifier that has not run yet. Returns false if it already ran
    /// or was removed.
    pub fn remove_invalidate_notifier(&self, id: NotifierId) -> bool {
        let mut notifiers = self.inner.invalidate_notifiers.borrow_mut();
        match notifiers.iter().position(|(n, _)| *n == id) {
            Some(index) => {
                // Dropping a boxed notifier may release captured closures.
                let (_, notify) = notifiers.remove(index);
                drop(notifiers);
                drop(notify);
                true
            }
            None => false,
        }
    }

    /// Number of invalidate notifiers still waiting to run.
    pub fn invalidate_notifier_count(&self) -> usize {
        self.inner.invalidate_notifiers.borrow().len()
    }

    /// Run `notify` when the last reference is released.
    pub fn add_finalize_notifier(&self, notify: impl FnOnce() + 'static) {
        self.inner.finalize_notifiers.borrow_mut().push(Box::new(notify));
    }

    pub fn downgrade(&self) -> WeakClosure {
        WeakClosure {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Closure) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Clone for Closure {
    fn clone(&self) -> Self {
        self.inner.acquire();
        Closure {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Closure {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("id", &self.inner.id)
            .field("description", &self.inner.description)
            .field("state", &self.inner.state.get())
            .field("ref_count", &self.inner.ref_count.get())
            .finish()
    }
}

/// Uncounted handle, upgradable until the closure is finalized.
#[derive(Clone)]
pub struct WeakClosure {
    inner: Weak<ClosureInner>,
}

impl WeakClosure {
    pub fn upgrade(&self) -> Option<Closure> {
        let inner = self.inner.upgrade()?;
        if inner.state.get() == ClosureState::Finalized {
            return None;
        }
        inner.acquire();
        Some(Closure { inner })
    }
}

impl fmt::Debug for WeakClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(WeakClosure)")
    }
}
