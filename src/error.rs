//! Error types used by routines and the event bus.
//!
//! This module defines two error enums:
//!
//! - [`RoutineError`]: errors observed by (and raised out of) routine computations.
//! - [`BusError`]: reasons a wait-set was rejected, by the [`EventBus`](crate::EventBus) or the routine driver.
//!
//! Both types provide `as_label` / `as_message` helpers for logs.
//! `RoutineError` is `Clone`: the same error may be injected into a computation,
//! stored on the terminated routine, and carried as an event payload.

use thiserror::Error;

use crate::events::{EventRef, Matcher, WaitSet};

/// # Reasons a wait-set is rejected.
///
/// Returned from [`EventBus::register`](crate::EventBus::register), or detected by
/// the routine driver before registering. Both end up in
/// [`RoutineError::IllegalWaitSet`].
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The wait-set contains no conditions; nothing could ever wake the listener.
    #[error("wait-set is empty")]
    EmptyWaitSet,

    /// The bus has quit and no longer accepts registrations.
    #[error("bus is shut down")]
    ShutDown,

    /// The computation suspended on more than one wait point in the same step.
    #[error("more than one wait point suspended at once")]
    MultipleWaitPoints,

    /// The computation suspended on something that is not a wait point.
    #[error("suspended outside a wait point")]
    NoWaitPoint,
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::EmptyWaitSet => "bus_empty_wait_set",
            BusError::ShutDown => "bus_shut_down",
            BusError::MultipleWaitPoints => "bus_multiple_wait_points",
            BusError::NoWaitPoint => "bus_no_wait_point",
        }
    }
}

/// # Errors observed by routine computations.
///
/// These are injected at a computation's suspension point (the pending
/// [`RoutineCtx::wait_for`](crate::RoutineCtx::wait_for) resolves to `Err`) or
/// raised by combinators. Unhandled, they terminate the routine.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum RoutineError {
    /// A yielded wait-set could not be registered with the bus.
    #[error("illegal wait-set {waitset}: {reason}")]
    IllegalWaitSet {
        /// The rejected wait-set.
        waitset: WaitSet,
        /// Why the bus rejected it.
        reason: BusError,
    },

    /// An abort condition fired (see [`RoutineCtx::with_exception`](crate::RoutineCtx::with_exception)).
    #[error("routine interrupted by {matcher}")]
    Routine {
        /// The abort condition that matched.
        matcher: Matcher,
        /// The event that matched it.
        event: EventRef,
    },

    /// The routine was closed; unwinds the computation through its cleanup code.
    #[error("routine closed")]
    Closed,

    /// The bus is quitting.
    #[error("bus quit")]
    Quit,

    /// A payload had a different type than the receiver expected.
    #[error("unexpected payload type, expected {expected}")]
    UnexpectedPayload {
        /// Type name the receiver asked for.
        expected: &'static str,
    },

    /// Application-level failure.
    #[error("routine failed: {error}")]
    Failed {
        /// The underlying error message.
        error: String,
    },
}

impl RoutineError {
    /// Builds a [`RoutineError::Failed`] from anything displayable.
    pub fn failed(error: impl std::fmt::Display) -> Self {
        RoutineError::Failed {
            error: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use cotask::RoutineError;
    ///
    /// assert_eq!(RoutineError::Closed.as_label(), "routine_closed");
    /// assert_eq!(RoutineError::failed("boom").as_label(), "routine_failed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RoutineError::IllegalWaitSet { .. } => "routine_illegal_wait_set",
            RoutineError::Routine { .. } => "routine_exception",
            RoutineError::Closed => "routine_closed",
            RoutineError::Quit => "routine_quit",
            RoutineError::UnexpectedPayload { .. } => "routine_unexpected_payload",
            RoutineError::Failed { .. } => "routine_failed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RoutineError::IllegalWaitSet { waitset, reason } => {
                format!("illegal wait-set: {waitset} ({})", reason.as_label())
            }
            RoutineError::Routine { matcher, .. } => format!("interrupted by {matcher}"),
            RoutineError::Closed => "closed".to_string(),
            RoutineError::Quit => "quit".to_string(),
            RoutineError::UnexpectedPayload { expected } => {
                format!("unexpected payload, expected {expected}")
            }
            RoutineError::Failed { error } => format!("error: {error}"),
        }
    }

    /// Indicates whether the error is a termination signal rather than a failure.
    ///
    /// ```
    /// use cotask::RoutineError;
    ///
    /// assert!(RoutineError::Closed.is_termination());
    /// assert!(RoutineError::Quit.is_termination());
    /// assert!(!RoutineError::failed("x").is_termination());
    /// ```
    pub fn is_termination(&self) -> bool {
        matches!(self, RoutineError::Closed | RoutineError::Quit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind};
    use std::rc::Rc;

    #[test]
    fn test_labels_are_stable() {
        let m = Matcher::new(EventKind::new("tick"));
        let err = RoutineError::Routine {
            matcher: m.clone(),
            event: Rc::new(Event::new(EventKind::new("tick"))),
        };
        assert_eq!(err.as_label(), "routine_exception");
        assert_eq!(err.as_message(), format!("interrupted by {m}"));

        let illegal = RoutineError::IllegalWaitSet {
            waitset: WaitSet::new(),
            reason: BusError::EmptyWaitSet,
        };
        assert_eq!(illegal.as_label(), "routine_illegal_wait_set");
        assert!(illegal.to_string().contains("wait-set is empty"));
    }

    #[test]
    fn test_failed_keeps_message() {
        let err = RoutineError::failed("disk full");
        assert_eq!(err.to_string(), "routine failed: disk full");
        assert!(!err.is_termination());
    }
}
