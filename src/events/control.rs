//! # Built-in control events.
//!
//! Event kinds the crate itself sends and waits on:
//! - [`ROUTINE_CONTROL`]: task-started and delegate-finished signals, scoped to one routine.
//! - [`SYSTEM_CONTROL`]: the one-shot "continue" signal armed by [`EventBus::want_continue`](crate::EventBus::want_continue).
//! - [`TIMER`]: a timer set with [`EventBus::set_timer`](crate::EventBus::set_timer) fired.
//! - [`SYSCALL`]: result of a privileged call, carrying `retvalue` or `exception`.
//! - [`QUEUE`]: the bus can accept events again after reporting backpressure.
//!
//! Routine-scoped events are keyed by the routine's [`ListenerId`], so a
//! stale signal never wakes another task.

use crate::bus::{ListenerId, TimerHandle};
use crate::events::event::{Event, EventKind, Matcher};

pub const ROUTINE_CONTROL: EventKind = EventKind::new("routine-control");
pub const SYSTEM_CONTROL: EventKind = EventKind::new("system-control");
pub const TIMER: EventKind = EventKind::new("timer");
pub const SYSCALL: EventKind = EventKind::new("syscall");
pub const QUEUE: EventKind = EventKind::new("queue");

/// Routine control signal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineControl {
    /// The routine may start running its body.
    AsyncStart,
    /// A delegated sub-task finished (successfully or not).
    DelegateFinished,
}

impl RoutineControl {
    pub const fn as_str(self) -> &'static str {
        match self {
            RoutineControl::AsyncStart => "asyncstart",
            RoutineControl::DelegateFinished => "delegatefinished",
        }
    }

    /// Condition matching this signal for `routine` only.
    pub fn matcher(self, routine: ListenerId) -> Matcher {
        Matcher::new(ROUTINE_CONTROL)
            .with("type", self.as_str())
            .with("routine", routine)
    }

    /// Signal addressed to `routine`.
    pub fn event(self, routine: ListenerId) -> Event {
        Event::new(ROUTINE_CONTROL)
            .with("type", self.as_str())
            .with("routine", routine)
    }
}

/// Condition for the "continue" signal.
pub fn continue_matcher() -> Matcher {
    Matcher::new(SYSTEM_CONTROL).with("type", "continue")
}

pub(crate) fn continue_event() -> Event {
    Event::new(SYSTEM_CONTROL)
        .with("type", "continue")
        .with_canignore(true)
}

/// Condition for the expiry of `timer`.
pub fn timer_matcher(timer: TimerHandle) -> Matcher {
    Matcher::new(TIMER).with("timer", timer.get())
}

pub(crate) fn timer_event(timer: TimerHandle) -> Event {
    Event::new(TIMER)
        .with("timer", timer.get())
        .with_canignore(true)
}

/// Condition for the result of syscall number `id`.
pub fn syscall_matcher(id: u64) -> Matcher {
    Matcher::new(SYSCALL).with("id", id)
}

pub(crate) fn syscall_event(id: u64) -> Event {
    Event::new(SYSCALL).with("id", id).with_canignore(true)
}

/// Condition returned as backpressure token when the bus queue is full.
pub fn can_write_matcher() -> Matcher {
    Matcher::new(QUEUE).with("type", "canwrite")
}

pub(crate) fn can_write_event() -> Event {
    Event::new(QUEUE).with("type", "canwrite").with_canignore(true)
}
