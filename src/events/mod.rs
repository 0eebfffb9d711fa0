//! Condition/event model and built-in control events.
//!
//! ## Contents
//! - [`Event`], [`EventKind`], [`Value`] typed event values
//! - [`Matcher`] wait-conditions (kind + field filter, missing fields are wildcards)
//! - [`WaitSet`] the conditions one routine is suspended on
//! - [`control`] events the crate sends to itself (start, delegate, timers, syscalls)

pub mod control;
mod event;

pub use control::RoutineControl;
pub use event::{Event, EventKind, EventRef, Matcher, Value, WaitSet};
