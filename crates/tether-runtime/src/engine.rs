//! The engine interface the bridge is written against.
//!
//! Everything native code may ask of a scripting engine goes through this
//! trait. Apart from the two liveness queries, every method that takes a
//! context "touches" it; callers must only do so after confirming the
//! context is live.

use crate::error::RuntimeError;
use crate::exception::Exception;
use crate::handle::{CallableRef, ContextId};
use crate::registry::{CallableWatcher, GlobalWatcher, WatcherKey};
use crate::value::Value;
use std::rc::{Rc, Weak};

/// Shared handle to an engine.
pub type EngineHandle = Rc<dyn Engine>;

pub trait Engine {
    /// Whether `ctx` has not begun teardown. Safe to ask about any id.
    fn is_context_live(&self, ctx: ContextId) -> bool;

    /// Whether `callable` has not been finalized. Safe to ask about any id.
    fn is_callable_live(&self, callable: CallableRef) -> bool;

    /// Call `callable` in `ctx`.
    ///
    /// Returns `None` when the call did not complete normally; in that case
    /// the engine has usually left an exception pending on `ctx`.
    fn call_function(&self, ctx: ContextId, callable: CallableRef, args: &[Value]) -> Option<Value>;

    /// The exception pending on `ctx`, if any. Does not clear it.
    fn pending_exception(&self, ctx: ContextId) -> Option<Exception>;

    fn clear_exception(&self, ctx: ContextId);

    /// Ask to be told when `callable` is finalized.
    fn add_callable_watch(
        &self,
        callable: CallableRef,
        watcher: Weak<dyn CallableWatcher>,
    ) -> Result<(), RuntimeError>;

    /// Returns false if there was no such registration, including when it
    /// already fired.
    fn remove_callable_watch(&self, callable: CallableRef, key: WatcherKey) -> bool;

    /// Ask to be told when `ctx` is finalized, on behalf of `watched`.
    fn add_global_watch(
        &self,
        ctx: ContextId,
        watched: CallableRef,
        watcher: Weak<dyn GlobalWatcher>,
    ) -> Result<(), RuntimeError>;

    fn remove_global_watch(&self, ctx: ContextId, watched: CallableRef, key: WatcherKey) -> bool;
}
