//! A native signal holding closures as handlers.
//!
//! Handlers disconnect themselves when their closure is invalidated, so a
//! signal never keeps firing into a dead context.

use crate::closure::{Closure, NotifierId};
use crate::interop::closure_invoke;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tether_runtime::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

struct Handler {
    id: HandlerId,
    closure: Closure,
    notifier: Option<NotifierId>,
}

pub struct Signal {
    name: String,
    next_id: Cell<u64>,
    handlers: RefCell<Vec<Handler>>,
}

impl Signal {
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            next_id: Cell::new(1),
            handlers: RefCell::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect `closure`, taking a reference to it.
    pub fn connect(self: &Rc<Self>, closure: &Closure) -> HandlerId {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.handlers.borrow_mut().push(Handler {
            id,
            closure: closure.clone(),
            notifier: None,
        });
        log::debug!(
            target: "tether::signal",
            "{}: connected closure {} as {}",
            self.name,
            closure.id(),
            id
        );

        let signal = Rc::downgrade(self);
        let notifier = closure.add_invalidate_notifier(move || {
            if let Some(signal) = signal.upgrade() {
                signal.disconnect(id);
            }
        });
        // An already invalid closure ran the notifier and is gone again.
        if let Some(handler) = self.handlers.borrow_mut().iter_mut().find(|h| h.id == id) {
            handler.notifier = Some(notifier);
        }
        id
    }

    /// Returns false if `id` is not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let removed = {
            let mut handlers = self.handlers.borrow_mut();
            match handlers.iter().position(|h| h.id == id) {
                Some(index) => Some(handlers.remove(index)),
                None => None,
            }
        };
        match removed {
            Some(handler) => {
                log::debug!(target: "tether::signal", "{}: disconnected {}", self.name, id);
                if let Some(notifier) = handler.notifier {
                    handler.closure.remove_invalidate_notifier(notifier);
                }
                // Releasing may finalize the closure; no borrow is held here.
                drop(handler);
                true
            }
            None => false,
        }
    }

    /// Invoke every connected handler in connection order.
    pub fn emit(&self, args: &[Value]) -> Vec<Value> {
        let closures: Vec<Closure> = self
            .handlers
            .borrow()
            .iter()
            .map(|h| h.closure.clone())
            .collect();
        log::trace!(target: "tether::signal", "{}: emitting to {} handler(s)", self.name, closures.len());
        closures.iter().map(|c| closure_invoke(c, args)).collect()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }
}
