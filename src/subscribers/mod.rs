//! # Callback-style listeners.
//!
//! Routines suspend and resume; the types here do not. They are plain
//! [`Listener`](crate::Listener)s that react to every matching event.
//!
//! ## Architecture
//! ```text
//! EventBus ── deliver(&event, &matcher) ──► EventHandler
//!                                              │ table lookup (matcher → callback)
//!                                              ▼
//!                                       callback(&event, &matcher)
//!                                              │ Err
//!                                              ▼
//!                                       exception hook ──► bus (take_errors)
//! ```
//!
//! - [`EventHandler`]: level-triggered callbacks per condition
//! - [`LogWriter`] (feature `logging`): prints matched events

mod handler;
#[cfg(feature = "logging")]
mod log;

pub use handler::{Callback, EventHandler};
#[cfg(feature = "logging")]
pub use log::LogWriter;
