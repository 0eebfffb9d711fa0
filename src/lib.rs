//! # cotask
//!
//! **cotask** runs cooperative routines over a pattern-matching event bus.
//!
//! A routine is an `async` body that suspends only by waiting on a set of
//! conditions ([`Matcher`]s). The bus delivers the first matching event, the
//! routine resumes, and it either waits again or terminates. On top of that
//! primitive the crate provides timeouts, interrupt layers, barriers,
//! backpressured sends, privileged calls and delegation.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │   Container  │   │   Container  │   │ EventHandler │
//!     │ main + named │   │ main + named │   │  (callbacks) │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  │
//!     ┌──────────────┐   ┌──────────────┐          │
//!     │   Routine    │   │   Routine    │          │
//!     │  (driver)    │   │  (driver)    │          │
//!     └┬─────────────┘   └┬─────────────┘          │
//!      │ register(ws)     │ register(ws)           │ register(matcher)
//!      │ send(ev)         │ set_timer / syscall    │
//!      ▼                  ▼                        ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                 EventBus (reference: Scheduler)                   │
//! │  - registration index by event kind                               │
//! │  - main queue (bounded, backpressure) + control queue             │
//! │  - timers, syscalls, continue, parked events                      │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                  Listener::deliver(&event, &matcher)
//!                   (one delivery per event per listener)
//! ```
//!
//! ### Routine step
//! ```text
//! deliver(event, matcher)
//!   ├─► unregister previous wait-set
//!   ├─► record event/matcher on ctx and container
//!   ├─► poll body ── wait_for(ws) resolves ──► ... ──► next wait_for(ws')
//!   │       │
//!   │       ├─ Pending ──► register ws' (rejected ─► IllegalWaitSet thrown in, terminate)
//!   │       └─ Ready   ──► teardown: ignore start event, drop body, unregister_all
//!   └─► deferred close/throw from the body itself
//! ```
//!
//! ## Features
//! | Area            | Description                                                 | Key types                               |
//! |-----------------|-------------------------------------------------------------|-----------------------------------------|
//! | **Events**      | Typed events, conditions and wait-sets.                     | [`Event`], [`Matcher`], [`WaitSet`]     |
//! | **Routines**    | Drive one async body per routine over the bus.              | [`Routine`], [`RoutineCtx`]             |
//! | **Containers**  | Main + named sub-routines, delegation, terminate.           | [`Container`]                           |
//! | **Bus**         | Contract plus a single-threaded reference implementation.   | [`EventBus`], [`Scheduler`]             |
//! | **Handlers**    | Level-triggered callbacks.                                  | [`EventHandler`]                        |
//! | **Errors**      | Typed errors for routines and wait-set rejection.           | [`RoutineError`], [`BusError`]          |
//! | **Configuration** | Scheduler queue limits and idle behaviour.                | [`SchedulerConfig`]                     |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use cotask::{Container, Event, EventKind, Matcher, Scheduler, SchedulerConfig};
//!
//! const JOB: EventKind = EventKind::new("job");
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sched = Scheduler::new(SchedulerConfig::default());
//!     let container = Container::new(sched.bus());
//!
//!     container.start(true, |ctx| async move {
//!         // Wait for a job, give up after one second.
//!         match ctx.wait_with_timeout(Some(Duration::from_secs(1)), Matcher::new(JOB)).await? {
//!             Some(job) => println!("got job #{}", job.event.seq()),
//!             None => println!("no job"),
//!         }
//!         Ok(())
//!     })?;
//!
//!     sched.send_event(Event::new(JOB));
//!     sched.run().await;
//!     Ok(())
//! }
//! ```
mod bus;
mod config;
mod core;
mod error;
pub mod events;
mod subscribers;

// ---- Public re-exports ----

pub use bus::{
    BusRef, Drainable, EventBus, Interrupt, Listener, ListenerId, Scheduler, SyscallFn, TimerHandle,
};
pub use config::SchedulerConfig;
pub use crate::core::{
    Barrier, Container, Delivery, Routine, RoutineCtx, RoutineOptions, RoutineState, Signal, WaitFor,
};
pub use error::{BusError, RoutineError};
pub use events::{Event, EventKind, EventRef, Matcher, RoutineControl, Value, WaitSet};
pub use subscribers::{Callback, EventHandler};

// Optional: expose a simple built-in logging handler (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
