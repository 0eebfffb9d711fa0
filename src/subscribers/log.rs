//! # Simple logging handler for debugging and demos.
//!
//! [`LogWriter`] prints every event matching its conditions to stdout.
//!
//! ## Output format
//! ```text
//! [conn] seq=12 matched=conn(type="up")
//! [routine-control] seq=13 matched=routine-control(routine=#4, type="asyncstart")
//! ```
//!
//! ## Example
//! ```no_run
//! # use cotask::{EventKind, LogWriter, Matcher, Scheduler, SchedulerConfig};
//! let sched = Scheduler::new(SchedulerConfig::default());
//! let log = LogWriter::new(sched.bus());
//! log.watch(Matcher::new(EventKind::new("conn"))).unwrap();
//! ```

use crate::bus::BusRef;
use crate::error::BusError;
use crate::events::Matcher;
use crate::subscribers::EventHandler;

/// Stdout logging handler.
///
/// Enabled via the `logging` feature. Not intended for production use;
/// register an [`EventHandler`] with `tracing` calls for structured logging.
pub struct LogWriter {
    handler: EventHandler,
}

impl LogWriter {
    pub fn new(bus: BusRef) -> Self {
        Self {
            handler: EventHandler::new(bus),
        }
    }

    /// Prints every event matching `matcher`.
    pub fn watch(&self, matcher: Matcher) -> Result<(), BusError> {
        self.handler.register(matcher, |event, matched| {
            println!("[{}] seq={} matched={matched}", event.kind(), event.seq());
            Ok(())
        })
    }

    /// Stops printing events matching `matcher`.
    pub fn unwatch(&self, matcher: &Matcher) {
        self.handler.unregister(matcher);
    }

    pub fn close(&self) {
        self.handler.close();
    }
}
