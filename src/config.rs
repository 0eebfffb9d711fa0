//! # Scheduler configuration.
//!
//! Provides [`SchedulerConfig`], the settings of the reference [`Scheduler`](crate::Scheduler).
//!
//! ## Sentinel values
//! - `queue_capacity = 0` → unbounded main queue (`send` never reports backpressure)
//! - `max_parked = 0` → unlimited parked (unmatched, non-ignorable) events
//! - `max_errors = 0` → every listener error is kept until `take_errors`

/// Configuration of the reference scheduler.
///
/// ## Field semantics
/// - `queue_capacity`: events `send` accepts before reporting backpressure (`0` = unbounded)
/// - `max_parked`: unmatched non-ignorable events kept for later listeners (`0` = unlimited)
/// - `max_errors`: listener errors kept until `take_errors` (`0` = unlimited)
/// - `quit_when_idle`: `run()` returns once no non-daemon listener is registered
///
/// ## Notes
/// Control events (timers, syscall results, continue, can-write) bypass
/// `queue_capacity`: they must be deliverable while the queue is full.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Capacity of the main event queue.
    pub queue_capacity: usize,

    /// Maximum number of parked events; the oldest is dropped beyond it.
    pub max_parked: usize,

    /// Maximum number of collected listener errors; the oldest is dropped beyond it.
    pub max_errors: usize,

    /// Whether `run()` returns when only daemon listeners remain.
    pub quit_when_idle: bool,
}

impl SchedulerConfig {
    /// Returns the main queue capacity as an `Option`.
    ///
    /// - `None` → unbounded
    /// - `Some(n)` → `send` reports backpressure once `n` events are queued
    #[inline]
    pub fn queue_limit(&self) -> Option<usize> {
        if self.queue_capacity == 0 {
            None
        } else {
            Some(self.queue_capacity)
        }
    }

    /// Returns the parked-event limit as an `Option`.
    #[inline]
    pub fn parked_limit(&self) -> Option<usize> {
        if self.max_parked == 0 {
            None
        } else {
            Some(self.max_parked)
        }
    }

    /// Returns the collected-error limit as an `Option`.
    #[inline]
    pub fn error_limit(&self) -> Option<usize> {
        if self.max_errors == 0 {
            None
        } else {
            Some(self.max_errors)
        }
    }
}

impl Default for SchedulerConfig {
    /// Default configuration:
    ///
    /// - `queue_capacity = 1024`
    /// - `max_parked = 0` (unlimited)
    /// - `max_errors = 256`
    /// - `quit_when_idle = true`
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_parked: 0,
            max_errors: 256,
            quit_when_idle: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        let mut cfg = SchedulerConfig::default();
        assert_eq!(cfg.queue_limit(), Some(1024));
        assert_eq!(cfg.parked_limit(), None);
        assert_eq!(cfg.error_limit(), Some(256));

        cfg.queue_capacity = 0;
        cfg.max_parked = 3;
        assert_eq!(cfg.queue_limit(), None);
        assert_eq!(cfg.parked_limit(), Some(3));

        cfg.max_errors = 0;
        assert_eq!(cfg.error_limit(), None);
    }
}
