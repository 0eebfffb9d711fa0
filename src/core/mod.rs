//! Routine core: driver, per-task context, combinators and container.
//!
//! Internal modules:
//! - [`routine`]: drives one computation; the bus's [`Listener`](crate::Listener) for it;
//! - [`ctx`]: per-task context and the `wait_for` suspension primitive;
//! - [`combinators`]: timeouts, interrupt layers, barriers, syscalls, delegation;
//! - [`container`]: owner of a main routine and named sub-routines.

mod combinators;
mod container;
mod ctx;
mod routine;

pub use container::Container;
pub use ctx::{Barrier, Delivery, RoutineCtx, Signal, WaitFor};
pub use routine::{Routine, RoutineOptions, RoutineState};
