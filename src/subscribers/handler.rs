//! # Level-triggered event handler.
//!
//! [`EventHandler`] is a [`Listener`] that maps conditions to callbacks. Unlike
//! a routine it never suspends: every matching event calls the callback of the
//! condition it matched, and the registration stays in place until removed.
//!
//! ## Rules
//! - Callbacks may register/unregister conditions (including their own) while
//!   being dispatched; the table is not borrowed during a callback.
//! - A callback `Err` goes to the exception hook (default: returned to the bus).
//! - A bus quit goes to the quit hook (default: [`EventHandler::close`]).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::bus::{BusRef, Interrupt, Listener, ListenerId};
use crate::error::{BusError, RoutineError};
use crate::events::{EventRef, Matcher, WaitSet};

/// Callback invoked for a matched event.
pub type Callback = Rc<dyn Fn(&EventRef, &Matcher) -> Result<(), RoutineError>>;

type ExceptionHook = Rc<dyn Fn(&EventHandler, RoutineError) -> Result<(), RoutineError>>;
type QuitHook = Rc<dyn Fn(&EventHandler)>;

struct HandlerInner {
    id: ListenerId,
    bus: BusRef,
    me: Weak<HandlerInner>,
    table: RefCell<HashMap<Matcher, Callback>>,
    exception_hook: RefCell<Option<ExceptionHook>>,
    quit_hook: RefCell<Option<QuitHook>>,
}

/// Dispatches matched events to per-condition callbacks; cheap to clone.
#[derive(Clone)]
pub struct EventHandler {
    inner: Rc<HandlerInner>,
}

impl EventHandler {
    pub fn new(bus: BusRef) -> Self {
        let inner = Rc::new_cyclic(|me| HandlerInner {
            id: ListenerId::next(),
            bus,
            me: me.clone(),
            table: RefCell::new(HashMap::new()),
            exception_hook: RefCell::new(None),
            quit_hook: RefCell::new(None),
        });
        Self { inner }
    }

    #[inline]
    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    /// Calls `callback` for every event matching `matcher`.
    ///
    /// Replaces the callback if `matcher` is already registered.
    pub fn register<F>(&self, matcher: Matcher, callback: F) -> Result<(), BusError>
    where
        F: Fn(&EventRef, &Matcher) -> Result<(), RoutineError> + 'static,
    {
        self.register_all([(matcher, Rc::new(callback) as Callback)])
    }

    /// Registers several conditions at once.
    pub fn register_all<I>(&self, entries: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = (Matcher, Callback)>,
    {
        let mut fresh = WaitSet::new();
        {
            let mut table = self.inner.table.borrow_mut();
            for (matcher, callback) in entries {
                if table.insert(matcher.clone(), callback).is_none() {
                    fresh.push(matcher);
                }
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        let listener: Rc<dyn Listener> = self.inner.clone();
        if let Err(err) = self.inner.bus.register(&fresh, listener) {
            let mut table = self.inner.table.borrow_mut();
            for m in &fresh {
                table.remove(m);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes `matcher`; unknown conditions are ignored.
    pub fn unregister(&self, matcher: &Matcher) {
        let removed = self.inner.table.borrow_mut().remove(matcher);
        if removed.is_some() {
            self.inner
                .bus
                .unregister(&WaitSet::from(matcher.clone()), self.inner.id);
        }
    }

    /// Removes every condition.
    pub fn close(&self) {
        let table = std::mem::take(&mut *self.inner.table.borrow_mut());
        self.inner.bus.unregister_all(self.inner.id);
        tracing::debug!(handler = %self.inner.id, conditions = table.len(), "event handler closed");
    }

    /// Conditions currently registered.
    pub fn registered(&self) -> Vec<Matcher> {
        self.inner.table.borrow().keys().cloned().collect()
    }

    /// Replaces the hook called with callback errors and errors forwarded by the bus.
    ///
    /// The hook's `Err` is returned to the bus.
    pub fn set_exception_hook<F>(&self, hook: F)
    where
        F: Fn(&EventHandler, RoutineError) -> Result<(), RoutineError> + 'static,
    {
        *self.inner.exception_hook.borrow_mut() = Some(Rc::new(hook));
    }

    /// Replaces the hook called when the bus quits.
    pub fn set_quit_hook<F>(&self, hook: F)
    where
        F: Fn(&EventHandler) + 'static,
    {
        *self.inner.quit_hook.borrow_mut() = Some(Rc::new(hook));
    }
}

impl HandlerInner {
    fn handle(&self) -> Option<EventHandler> {
        self.me.upgrade().map(|inner| EventHandler { inner })
    }

    fn raise(&self, err: RoutineError) -> Result<(), RoutineError> {
        let hook = self.exception_hook.borrow().clone();
        match (hook, self.handle()) {
            (Some(hook), Some(handler)) => hook(&handler, err),
            _ => Err(err),
        }
    }
}

impl Listener for HandlerInner {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn deliver(&self, event: &EventRef, matcher: &Matcher) -> Result<(), RoutineError> {
        let callback = self.table.borrow().get(matcher).cloned();
        match callback {
            Some(callback) => callback(event, matcher).or_else(|err| self.raise(err)),
            None => Ok(()),
        }
    }

    fn interrupt(&self, interrupt: Interrupt) -> Result<(), RoutineError> {
        let Some(handler) = self.handle() else {
            return Ok(());
        };
        match interrupt {
            Interrupt::Quit => {
                let hook = self.quit_hook.borrow().clone();
                match hook {
                    Some(hook) => hook(&handler),
                    None => handler.close(),
                }
                Ok(())
            }
            Interrupt::Error(err) => self.raise(err),
        }
    }
}
