//! # Event bus contract and reference scheduler.
//!
//! Routines and event handlers never talk to each other directly: they
//! register wait-sets with an [`EventBus`] and get called back through the
//! [`Listener`] trait when a matching event is delivered.
//!
//! ## Architecture
//! ```text
//!   Routine / EventHandler                         EventBus
//!   ──────────────────────                         ────────
//!   register(waitset, Rc<dyn Listener>)  ───────►  registration table
//!   send(EventRef) ─► None | Some(backpressure)    queue ─► match ─┐
//!                                                                  │
//!   Listener::deliver(&event, &matcher)  ◄─────────────────────────┘
//!   Listener::interrupt(Quit | Error)    ◄──────── quit / forwarded errors
//! ```
//!
//! ## Rules
//! - Delivery is never synchronous with `send`: a listener is only called from
//!   the bus's own processing loop, never from inside another listener's call to the bus.
//! - A listener receives at most one delivery per event.
//! - An event that matches nothing is dropped when `canignore` is set, parked otherwise.
//!
//! [`Scheduler`] is the single-threaded implementation shipped with the crate.

mod scheduler;

use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use crate::error::{BusError, RoutineError};
use crate::events::{EventRef, Matcher, WaitSet};

pub use scheduler::Scheduler;

static LISTENER_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of a listener (routine or event handler); the bus's registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        Self(LISTENER_SEQ.fetch_add(1, AtomicOrdering::Relaxed))
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Non-event signal the bus forwards to a listener.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// The bus is shutting down.
    Quit,
    /// An error addressed to the listener.
    Error(RoutineError),
}

/// Function executed by the bus in its privileged context.
///
/// The result is delivered later as a [`control::SYSCALL`](crate::events::control::SYSCALL)
/// event carrying either a `retvalue` or an `exception`.
pub type SyscallFn = Box<dyn FnOnce() -> Result<Box<dyn Any>, RoutineError>>;

/// Shared handle to a bus.
pub type BusRef = Rc<dyn EventBus>;

/// Callback side of a registration.
pub trait Listener {
    /// Registration key.
    fn id(&self) -> ListenerId;

    /// Called once per matching event; `matcher` is the registered condition that matched.
    ///
    /// An `Err` is reported by the bus (it is not retried).
    fn deliver(&self, event: &EventRef, matcher: &Matcher) -> Result<(), RoutineError>;

    /// Called instead of `deliver` when the bus forwards an error or quits.
    fn interrupt(&self, interrupt: Interrupt) -> Result<(), RoutineError>;
}

/// Contract the routine driver and combinators require from the event bus.
///
/// All methods take `&self`: the bus is shared (`Rc`) by every routine and is
/// re-entered from inside listener callbacks.
pub trait EventBus {
    /// Subscribes `listener` to every condition in `matchers`.
    fn register(&self, matchers: &WaitSet, listener: Rc<dyn Listener>) -> Result<(), BusError>;

    /// Removes one registration per condition in `matchers`.
    fn unregister(&self, matchers: &WaitSet, listener: ListenerId);

    /// Removes every registration of `listener`.
    fn unregister_all(&self, listener: ListenerId);

    /// Queues `event` for delivery.
    ///
    /// Returns `None` when the event was accepted, or a backpressure condition to
    /// wait on before retrying the same event.
    fn send(&self, event: EventRef) -> Option<Matcher>;

    /// Starts a timer; its expiry is delivered as a [`control::TIMER`](crate::events::control::TIMER) event.
    fn set_timer(&self, after: Duration) -> TimerHandle;

    /// Cancels a timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel_timer(&self, timer: TimerHandle);

    /// Schedules `func` in the privileged context; returns the condition of its result event.
    fn syscall(&self, func: SyscallFn) -> Matcher;

    /// Arms a one-shot "continue" event, delivered after the currently ready events.
    fn want_continue(&self);

    /// Daemon listeners do not keep the bus running.
    fn set_daemon(&self, listener: ListenerId, daemon: bool);

    /// Permits silent drop of pending events matching `matcher`.
    fn ignore(&self, matcher: &Matcher);
}

/// Queue-like collaborator that can report when it is drained.
pub trait Drainable {
    /// Returns a condition that fires when the queue may have become empty,
    /// or `None` if it is already empty.
    fn wait_for_empty(&self) -> Option<Matcher>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_ids_are_unique() {
        let a = ListenerId::next();
        let b = ListenerId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
        assert_eq!(format!("{a}"), format!("#{}", a.get()));
    }
}
