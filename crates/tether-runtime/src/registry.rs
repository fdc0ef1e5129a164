//! Finalization registry
//!
//! Each context owns a registry of (notifier, watched callable) pairs. When
//! the context is torn down the engine drains the registry and fires every
//! notifier exactly once. A second registry, owned by the engine itself,
//! holds per-callable finalizers.
//!
//! Entries hold their notifier weakly. A notifier owner that disappears
//! without deregistering is simply skipped when the registry fires.
//!
//! The registry never calls out while borrowed: callers `take_*` the
//! entries first and fire them afterwards, so notifiers are free to
//! re-enter the engine (including removing their own entry, which is
//! then a no-op).

use crate::error::RuntimeError;
use crate::handle::CallableRef;
use std::fmt;
use std::rc::{Rc, Weak};

/// Notified when the context a callable lives in is finalized.
pub trait GlobalWatcher {
    fn global_finalized(self: Rc<Self>, watched: CallableRef);
}

/// Notified when a callable itself is finalized.
pub trait CallableWatcher {
    fn callable_finalized(self: Rc<Self>, watched: CallableRef);
}

/// Identity of a notifier, used to find its entry again on deregistration.
///
/// Two weak handles to the same allocation produce the same key no matter
/// which trait object they were coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherKey(usize);

impl WatcherKey {
    pub fn of<W: ?Sized>(watcher: &Weak<W>) -> Self {
        Self(Weak::as_ptr(watcher) as *const () as usize)
    }
}

/// One registered (notifier, watched callable) pair.
pub struct RegistryEntry<W: ?Sized> {
    key: WatcherKey,
    watched: CallableRef,
    watcher: Weak<W>,
}

impl<W: ?Sized> RegistryEntry<W> {
    pub fn key(&self) -> WatcherKey {
        self.key
    }

    pub fn watched(&self) -> CallableRef {
        self.watched
    }

    /// The notifier, if its owner is still alive.
    pub fn watcher(&self) -> Option<Rc<W>> {
        self.watcher.upgrade()
    }
}

impl<W: ?Sized> fmt::Debug for RegistryEntry<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("key", &self.key)
            .field("watched", &self.watched)
            .field("alive", &(self.watcher.strong_count() > 0))
            .finish()
    }
}

/// Registration-ordered set of notifiers.
pub struct FinalizationRegistry<W: ?Sized> {
    entries: Vec<RegistryEntry<W>>,
}

impl<W: ?Sized> Default for FinalizationRegistry<W> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<W: ?Sized> fmt::Debug for FinalizationRegistry<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

impl<W: ?Sized> FinalizationRegistry<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `watcher` for `watched`.
    ///
    /// A notifier may be registered at most once per callable.
    pub fn add(&mut self, watcher: Weak<W>, watched: CallableRef) -> Result<(), RuntimeError> {
        let key = WatcherKey::of(&watcher);
        if self.contains(key, watched) {
            debug_assert!(false, "{} already watched by this notifier", watched);
            log::error!(target: "tether::gc", "duplicate finalizer registration for {}", watched);
            return Err(RuntimeError::DuplicateWatch { watched });
        }
        self.entries.push(RegistryEntry { key, watched, watcher });
        Ok(())
    }

    /// Deregister. Returns false if no such entry exists, which is the normal
    /// outcome when the entry was already drained and fired.
    pub fn remove(&mut self, key: WatcherKey, watched: CallableRef) -> bool {
        match self
            .entries
            .iter()
            .position(|e| e.key == key && e.watched == watched)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: WatcherKey, watched: CallableRef) -> bool {
        self.entries
            .iter()
            .any(|e| e.key == key && e.watched == watched)
    }

    /// Drain every entry, in registration order.
    pub fn take_all(&mut self) -> Vec<RegistryEntry<W>> {
        std::mem::take(&mut self.entries)
    }

    /// Drain the entries watching `callable`, in registration order.
    pub fn take_watched(&mut self, callable: CallableRef) -> Vec<RegistryEntry<W>> {
        let (taken, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.watched == callable);
        self.entries = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl GlobalWatcher for Recorder {
        fn global_finalized(self: Rc<Self>, watched: CallableRef) {
            self.log
                .borrow_mut()
                .push(format!("{} saw {}", self.name, watched));
        }
    }

    fn recorder(name: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Rc<Recorder> {
        Rc::new(Recorder { name, log: log.clone() })
    }

    fn fire(entries: Vec<RegistryEntry<dyn GlobalWatcher>>) {
        for entry in entries {
            if let Some(w) = entry.watcher() {
                w.global_finalized(entry.watched());
            }
        }
    }

    #[test]
    fn test_fires_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder("a", &log);
        let b = recorder("b", &log);
        let mut registry: FinalizationRegistry<dyn GlobalWatcher> = FinalizationRegistry::new();

        let wa: Weak<dyn GlobalWatcher> = Rc::downgrade(&a) as Weak<dyn GlobalWatcher>;
        let wb: Weak<dyn GlobalWatcher> = Rc::downgrade(&b) as Weak<dyn GlobalWatcher>;
        registry.add(wb, CallableRef::new(2)).unwrap();
        registry.add(wa, CallableRef::new(1)).unwrap();

        fire(registry.take_all());
        assert!(registry.is_empty());
        assert_eq!(*log.borrow(), vec!["b saw callable#2", "a saw callable#1"]);
    }

    #[test]
    fn test_remove_after_drain_is_noop() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder("a", &log);
        let weak: Weak<dyn GlobalWatcher> = Rc::downgrade(&a) as Weak<dyn GlobalWatcher>;
        let key = WatcherKey::of(&weak);

        let mut registry = FinalizationRegistry::new();
        registry.add(weak, CallableRef::new(1)).unwrap();
        let drained = registry.take_all();
        assert_eq!(drained.len(), 1);

        assert!(!registry.remove(key, CallableRef::new(1)));
    }

    #[test]
    fn test_key_ignores_trait_object_type() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder("a", &log);
        let concrete = Rc::downgrade(&a);
        let erased: Weak<dyn GlobalWatcher> = concrete.clone() as Weak<dyn GlobalWatcher>;
        assert_eq!(WatcherKey::of(&concrete), WatcherKey::of(&erased));
    }

    #[test]
    fn test_take_watched_keeps_others() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder("a", &log);
        let mut registry: FinalizationRegistry<dyn GlobalWatcher> = FinalizationRegistry::new();
        registry
            .add(Rc::downgrade(&a) as Weak<dyn GlobalWatcher>, CallableRef::new(1))
            .unwrap();
        registry
            .add(Rc::downgrade(&a) as Weak<dyn GlobalWatcher>, CallableRef::new(2))
            .unwrap();

        let taken = registry.take_watched(CallableRef::new(1));
        assert_eq!(taken.len(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(WatcherKey::of(&Rc::downgrade(&a)), CallableRef::new(2)));
    }

    #[test]
    fn test_dead_watcher_is_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry: FinalizationRegistry<dyn GlobalWatcher> = FinalizationRegistry::new();
        {
            let a = recorder("a", &log);
            registry
                .add(Rc::downgrade(&a) as Weak<dyn GlobalWatcher>, CallableRef::new(1))
                .unwrap();
        }
        fire(registry.take_all());
        assert!(log.borrow().is_empty());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "already watched"))]
    fn test_duplicate_registration() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder("a", &log);
        let mut registry: FinalizationRegistry<dyn GlobalWatcher> = FinalizationRegistry::new();
        registry
            .add(Rc::downgrade(&a) as Weak<dyn GlobalWatcher>, CallableRef::new(1))
            .unwrap();
        let second = registry.add(Rc::downgrade(&a) as Weak<dyn GlobalWatcher>, CallableRef::new(1));
        assert!(matches!(second, Err(RuntimeError::DuplicateWatch { .. })));
        assert_eq!(registry.len(), 1);
    }
}
