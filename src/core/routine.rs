//! # Routine: drives one cooperative computation over the event bus.
//!
//! A [`Routine`] owns a computation (an `async` body receiving a
//! [`RoutineCtx`]) and acts as its [`Listener`]: the bus calls back into the
//! routine, which resumes the computation until it suspends again on a new
//! wait-set, or terminates.
//!
//! ## Lifecycle
//! ```text
//! spawn ─► Created ─┬─ manual_start ─► AwaitingManualStart ── start() ──┐
//!                   └───────────────────────────────────────────────────┤
//!                                                                       ▼
//!                    async_start: register start matcher, send start event
//!                     ├─► AwaitingAsyncStart ── start event ──┐
//!                     └─► (sync) ─────────────────────────────┤
//!                                                             ▼
//!                                  Active ◄─► suspended on exactly one wait-set
//!                                    │ close()
//!                                    ▼
//!                                  Closing ── second close() drops the body
//!                                    │
//!                        ┌───────────┼────────────┐
//!                        ▼           ▼            ▼
//!                     Finished     Failed       Closed
//! ```
//!
//! ## Rules
//! - The wait-set of the previous suspension is unregistered before the body
//!   is resumed; the new one is registered after it suspends.
//! - A wait-set the bus rejects is thrown back into the body as
//!   [`RoutineError::IllegalWaitSet`]; the routine terminates regardless.
//!   A rejection because the bus shut down is a quit instead: the body sees
//!   [`RoutineError::Quit`] once and the routine ends `Closed`.
//! - Teardown runs exactly once: it marks a pending start event ignorable,
//!   drops the body (closing nested futures), and removes every registration.
//! - `close()`/`throw()` issued by the routine's own body take effect at its
//!   next suspension point.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use futures::FutureExt;

use crate::bus::{BusRef, Interrupt, Listener, ListenerId};
use crate::core::container::{Container, ContainerInner};
use crate::core::ctx::{Offer, RoutineCtx, Signal};
use crate::error::{BusError, RoutineError};
use crate::events::{EventRef, Matcher, RoutineControl, WaitSet};

type Computation = LocalBoxFuture<'static, Result<(), RoutineError>>;

/// Start options of a routine.
///
/// Defaults: asynchronous start, automatic start, non-daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineOptions {
    /// Run the first step after a start event round-trips through the bus.
    pub async_start: bool,
    /// Wait for [`Routine::start`] before doing anything.
    pub manual_start: bool,
    /// Daemon routines do not keep the bus running.
    pub daemon: bool,
}

impl Default for RoutineOptions {
    fn default() -> Self {
        Self {
            async_start: true,
            manual_start: false,
            daemon: false,
        }
    }
}

impl RoutineOptions {
    /// Options for a body that runs its first step synchronously.
    pub fn sync() -> Self {
        Self {
            async_start: false,
            ..Self::default()
        }
    }
}

/// Observable state of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineState {
    Created,
    AwaitingManualStart,
    AwaitingAsyncStart,
    Active,
    /// Close was injected; the body is running its cleanup.
    Closing,
    Finished,
    Failed,
    Closed,
}

impl RoutineState {
    /// Returns `true` for `Finished`, `Failed` and `Closed`.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RoutineState::Finished | RoutineState::Failed | RoutineState::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoutineState::Created => "created",
            RoutineState::AwaitingManualStart => "awaiting_manual_start",
            RoutineState::AwaitingAsyncStart => "awaiting_async_start",
            RoutineState::Active => "active",
            RoutineState::Closing => "closing",
            RoutineState::Finished => "finished",
            RoutineState::Failed => "failed",
            RoutineState::Closed => "closed",
        }
    }
}

impl fmt::Display for RoutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct RoutineInner {
    id: ListenerId,
    bus: BusRef,
    container: Option<Weak<ContainerInner>>,
    options: RoutineOptions,
    ctx: RoutineCtx,
    me: Weak<RoutineInner>,

    state: Cell<RoutineState>,
    computation: RefCell<Option<Computation>>,
    waitset: RefCell<Option<WaitSet>>,
    start_event: RefCell<Option<EventRef>>,
    start_retry: RefCell<Option<Routine>>,
    error: RefCell<Option<RoutineError>>,
    polling: Cell<bool>,
    deferred: RefCell<Option<Signal>>,
}

/// Handle to a routine; cheap to clone.
#[derive(Clone)]
pub struct Routine {
    inner: Rc<RoutineInner>,
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl PartialEq for Routine {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Routine {}

impl Routine {
    /// Creates a routine running `body` on `bus`.
    ///
    /// With `async_start = false` (and no manual start) the first step of the
    /// body runs before this returns; if that step fails, the error is returned
    /// and the routine is already terminated.
    pub fn spawn<F, Fut>(
        bus: BusRef,
        options: RoutineOptions,
        container: Option<&Container>,
        body: F,
    ) -> Result<Routine, RoutineError>
    where
        F: FnOnce(RoutineCtx) -> Fut,
        Fut: Future<Output = Result<(), RoutineError>> + 'static,
    {
        let routine = Self::create(bus, options, container.map(Container::downgrade), body);
        if !options.manual_start {
            routine.inner.begin()?;
        } else {
            routine.inner.state.set(RoutineState::AwaitingManualStart);
        }
        Ok(routine)
    }

    fn create<F, Fut>(
        bus: BusRef,
        options: RoutineOptions,
        container: Option<Weak<ContainerInner>>,
        body: F,
    ) -> Routine
    where
        F: FnOnce(RoutineCtx) -> Fut,
        Fut: Future<Output = Result<(), RoutineError>> + 'static,
    {
        let id = ListenerId::next();
        let inner = Rc::new_cyclic(|me: &Weak<RoutineInner>| {
            let ctx = RoutineCtx::new(id, bus.clone(), container.clone(), me.clone());
            let computation = body(ctx.clone()).boxed_local();
            RoutineInner {
                id,
                bus,
                container,
                options,
                ctx,
                me: me.clone(),
                state: Cell::new(RoutineState::Created),
                computation: RefCell::new(Some(computation)),
                waitset: RefCell::new(None),
                start_event: RefCell::new(None),
                start_retry: RefCell::new(None),
                error: RefCell::new(None),
                polling: Cell::new(false),
                deferred: RefCell::new(None),
            }
        });
        tracing::trace!(routine = %id, async_start = options.async_start, "routine created");
        Routine { inner }
    }

    pub(crate) fn from_inner(inner: Rc<RoutineInner>) -> Self {
        Self { inner }
    }

    /// Starts a routine created with `manual_start`; a no-op otherwise.
    pub fn start(&self) -> Result<(), RoutineError> {
        if self.inner.state.get() != RoutineState::AwaitingManualStart {
            return Ok(());
        }
        self.inner.begin()
    }

    /// Closes the routine.
    ///
    /// The first call injects [`RoutineError::Closed`] at the suspension point so
    /// the body can run its cleanup (it may wait again). A second call while the
    /// body is still closing, or a close before the body ever ran, drops the body.
    pub fn close(&self) -> Result<(), RoutineError> {
        self.inner.interrupt_with(Signal::Close)
    }

    /// Injects `error` at the suspension point.
    pub fn throw(&self, error: RoutineError) -> Result<(), RoutineError> {
        self.inner.interrupt_with(Signal::Error(error))
    }

    #[inline]
    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    #[inline]
    pub fn state(&self) -> RoutineState {
        self.inner.state.get()
    }

    /// Returns `true` once the routine has terminated.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.inner.state.get().is_terminal()
    }

    #[inline]
    pub fn is_daemon(&self) -> bool {
        self.inner.options.daemon
    }

    /// The error the routine failed with, if any.
    pub fn error(&self) -> Option<RoutineError> {
        self.inner.error.borrow().clone()
    }

    /// The wait-set the routine is currently suspended on.
    pub fn waitset(&self) -> Option<WaitSet> {
        self.inner.waitset.borrow().clone()
    }

    pub fn ctx(&self) -> &RoutineCtx {
        &self.inner.ctx
    }
}

impl RoutineInner {
    fn listener(&self) -> Option<Rc<dyn Listener>> {
        self.me.upgrade().map(|rc| rc as Rc<dyn Listener>)
    }

    fn start_matcher(&self) -> Matcher {
        RoutineControl::AsyncStart.matcher(self.id)
    }

    fn touch_container(&self, delivery: Option<(&EventRef, &Matcher)>) {
        if let Some(container) = self.container.as_ref().and_then(Weak::upgrade) {
            container.set_current(self.id, delivery);
        }
    }

    fn begin(&self) -> Result<(), RoutineError> {
        if self.options.daemon {
            self.bus.set_daemon(self.id, true);
        }
        if !self.options.async_start {
            self.state.set(RoutineState::Active);
            return self.resume(None);
        }

        let start = WaitSet::from(self.start_matcher());
        let Some(listener) = self.listener() else {
            return Ok(());
        };
        if let Err(reason) = self.bus.register(&start, listener) {
            return self.finish(Err(RoutineError::IllegalWaitSet {
                waitset: start,
                reason,
            }));
        }
        self.state.set(RoutineState::AwaitingAsyncStart);

        let event: EventRef = Rc::new(RoutineControl::AsyncStart.event(self.id));
        *self.start_event.borrow_mut() = Some(event.clone());
        if let Some(waiter) = self.bus.send(event.clone()) {
            tracing::debug!(routine = %self.id, "start event backpressured, retrying");
            self.spawn_start_retry(event, waiter);
        }
        Ok(())
    }

    /// Resends the start event each time the bus reports room, until the owner
    /// has started or terminated.
    fn spawn_start_retry(&self, event: EventRef, waiter: Matcher) {
        let owner = self.me.clone();
        let options = RoutineOptions {
            daemon: self.options.daemon,
            ..RoutineOptions::sync()
        };
        let retry = Routine::spawn(self.bus.clone(), options, None, move |ctx| async move {
            let mut waiter = waiter;
            loop {
                ctx.wait_for(waiter).await?;
                let pending = owner
                    .upgrade()
                    .is_some_and(|o| o.state.get() == RoutineState::AwaitingAsyncStart);
                if !pending {
                    return Ok(());
                }
                match ctx.bus().send(event.clone()) {
                    None => return Ok(()),
                    Some(next) => waiter = next,
                }
            }
        });
        match retry {
            Ok(routine) => *self.start_retry.borrow_mut() = Some(routine),
            Err(err) => {
                tracing::warn!(routine = %self.id, error = %err, "start retry could not be scheduled")
            }
        }
    }

    /// Polls the body once with `signal` available at its wait point, then
    /// registers whatever it suspended on.
    fn resume(&self, signal: Option<Signal>) -> Result<(), RoutineError> {
        let Some(mut computation) = self.computation.borrow_mut().take() else {
            return Ok(());
        };

        self.touch_container(None);
        let slot = self.ctx.slot();
        slot.clear();
        if let Some(signal) = signal {
            slot.put_signal(signal);
        }

        self.polling.set(true);
        let poll = computation
            .as_mut()
            .poll(&mut Context::from_waker(noop_waker_ref()));
        self.polling.set(false);

        let offer = slot.take_offer();
        slot.clear();

        match poll {
            Poll::Ready(result) => {
                drop(computation);
                self.finish(result)
            }
            Poll::Pending => {
                *self.computation.borrow_mut() = Some(computation);
                let waitset = match offer {
                    Offer::One(ws) => match self.install(ws) {
                        Err(RoutineError::IllegalWaitSet {
                            reason: BusError::ShutDown,
                            ..
                        }) => return self.shut_down(),
                        installed => installed,
                    },
                    Offer::Nothing => Err(RoutineError::IllegalWaitSet {
                        waitset: WaitSet::new(),
                        reason: BusError::NoWaitPoint,
                    }),
                    Offer::Many(ws) => Err(RoutineError::IllegalWaitSet {
                        waitset: ws,
                        reason: BusError::MultipleWaitPoints,
                    }),
                };
                if let Err(illegal) = waitset {
                    return self.reject(illegal);
                }

                let deferred = self.deferred.borrow_mut().take();
                match deferred {
                    Some(signal) => self.interrupt_with(signal),
                    None => Ok(()),
                }
            }
        }
    }

    fn install(&self, waitset: WaitSet) -> Result<(), RoutineError> {
        let Some(listener) = self.listener() else {
            return Ok(());
        };
        match self.bus.register(&waitset, listener) {
            Ok(()) => {
                tracing::trace!(routine = %self.id, waitset = %waitset, "suspended");
                *self.waitset.borrow_mut() = Some(waitset);
                Ok(())
            }
            Err(reason) => Err(RoutineError::IllegalWaitSet { waitset, reason }),
        }
    }

    /// The bus quit while the body was running: the quit is delivered once,
    /// a later suspension drops the body.
    fn shut_down(&self) -> Result<(), RoutineError> {
        self.deferred.borrow_mut().take();
        if self.state.get() == RoutineState::Closing {
            tracing::debug!(routine = %self.id, "bus shut down while closing, dropping body");
            return self.finish(Err(RoutineError::Quit));
        }
        self.state.set(RoutineState::Closing);
        self.resume(Some(Signal::Error(RoutineError::Quit)))
    }

    /// Throws `illegal` into the body so it can clean up, then terminates.
    fn reject(&self, illegal: RoutineError) -> Result<(), RoutineError> {
        tracing::warn!(routine = %self.id, error = %illegal, "wait-set rejected");
        if let Some(mut computation) = self.computation.borrow_mut().take() {
            let slot = self.ctx.slot();
            slot.put_signal(Signal::Error(illegal.clone()));
            self.polling.set(true);
            let _ = computation
                .as_mut()
                .poll(&mut Context::from_waker(noop_waker_ref()));
            self.polling.set(false);
            slot.clear();
        }
        self.deferred.borrow_mut().take();
        self.finish(Err(illegal))
    }

    /// Handles close/throw requests.
    fn interrupt_with(&self, signal: Signal) -> Result<(), RoutineError> {
        if self.polling.get() {
            let mut deferred = self.deferred.borrow_mut();
            if deferred.is_none() || matches!(signal, Signal::Close) {
                *deferred = Some(signal);
            }
            return Ok(());
        }

        let closing = matches!(signal, Signal::Close | Signal::Error(RoutineError::Quit));
        match self.state.get() {
            RoutineState::Created
            | RoutineState::AwaitingManualStart
            | RoutineState::AwaitingAsyncStart => {
                let result = match signal {
                    Signal::Error(err) => Err(err),
                    _ => Err(RoutineError::Closed),
                };
                self.finish(result)
            }
            RoutineState::Active => {
                if closing {
                    self.state.set(RoutineState::Closing);
                }
                self.detach();
                self.resume(Some(signal))
            }
            RoutineState::Closing => {
                if let Signal::Close = signal {
                    tracing::debug!(routine = %self.id, "closed while closing, dropping body");
                    return self.finish(Err(RoutineError::Closed));
                }
                self.detach();
                self.resume(Some(signal))
            }
            RoutineState::Finished | RoutineState::Failed | RoutineState::Closed => Ok(()),
        }
    }

    /// Unregisters the current wait-set.
    fn detach(&self) -> Option<WaitSet> {
        let waitset = self.waitset.borrow_mut().take();
        if let Some(ws) = &waitset {
            self.bus.unregister(ws, self.id);
        }
        waitset
    }

    /// Teardown; runs once.
    fn finish(&self, outcome: Result<(), RoutineError>) -> Result<(), RoutineError> {
        let current = self.state.get();
        if current.is_terminal() {
            return Ok(());
        }
        let closing = current == RoutineState::Closing;
        let (state, error) = match outcome {
            Ok(()) if closing => (RoutineState::Closed, None),
            Ok(()) => (RoutineState::Finished, None),
            Err(err) if err.is_termination() => (RoutineState::Closed, None),
            Err(err) => (RoutineState::Failed, Some(err)),
        };
        self.state.set(state);

        let pending_start = self.start_event.borrow_mut().take();
        if let Some(event) = pending_start {
            event.set_canignore(true);
            self.bus.ignore(&self.start_matcher());
        }
        let retry = self.start_retry.borrow_mut().take();
        if let Some(retry) = retry {
            let _ = retry.close();
        }

        self.touch_container(None);
        let computation = self.computation.borrow_mut().take();
        drop(computation);
        self.waitset.borrow_mut().take();
        self.deferred.borrow_mut().take();
        self.bus.unregister_all(self.id);

        match error {
            Some(err) => {
                tracing::warn!(routine = %self.id, error = %err, label = err.as_label(), "routine failed");
                *self.error.borrow_mut() = Some(err.clone());
                Err(err)
            }
            None => {
                tracing::debug!(routine = %self.id, state = %state, "routine terminated");
                Ok(())
            }
        }
    }
}

impl Listener for RoutineInner {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn deliver(&self, event: &EventRef, matcher: &Matcher) -> Result<(), RoutineError> {
        match self.state.get() {
            RoutineState::AwaitingAsyncStart => {
                if *matcher != self.start_matcher() {
                    return Ok(());
                }
                event.set_canignore(true);
                self.bus.unregister(&WaitSet::from(matcher.clone()), self.id);
                self.start_event.borrow_mut().take();
                let retry = self.start_retry.borrow_mut().take();
                if let Some(retry) = retry {
                    let _ = retry.close();
                }
                self.state.set(RoutineState::Active);
                self.resume(None)
            }
            RoutineState::Active | RoutineState::Closing => {
                if self.detach().is_none() {
                    return Ok(());
                }
                self.ctx.record(event, matcher);
                self.touch_container(Some((event, matcher)));
                self.resume(Some(Signal::Event(event.clone(), matcher.clone())))
            }
            _ => Ok(()),
        }
    }

    fn interrupt(&self, interrupt: Interrupt) -> Result<(), RoutineError> {
        match interrupt {
            Interrupt::Quit => self.interrupt_with(Signal::Error(RoutineError::Quit)),
            Interrupt::Error(err) => self.interrupt_with(Signal::Error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Scheduler;
    use crate::config::SchedulerConfig;
    use crate::events::{Event, EventKind};

    const PING: EventKind = EventKind::new("ping");

    fn ping(n: u64) -> Event {
        Event::new(PING).with("n", n)
    }

    fn on_ping(n: u64) -> Matcher {
        Matcher::new(PING).with("n", n)
    }

    #[test]
    fn test_sync_start_runs_first_step_immediately() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
            ctx.wait_for(on_ping(1)).await?;
            Ok(())
        })
        .unwrap();

        assert_eq!(r.state(), RoutineState::Active);
        assert_eq!(sched.registrations(r.id()), vec![on_ping(1)]);

        sched.send_event(ping(1));
        sched.run_until_idle();
        assert_eq!(r.state(), RoutineState::Finished);
        assert_eq!(sched.listener_count(), 0);
    }

    #[test]
    fn test_async_start_waits_for_start_event() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let r = Routine::spawn(sched.bus(), RoutineOptions::default(), None, |ctx| async move {
            ctx.wait_for(on_ping(1)).await?;
            Ok(())
        })
        .unwrap();

        assert_eq!(r.state(), RoutineState::AwaitingAsyncStart);
        assert_eq!(
            sched.registrations(r.id()),
            vec![RoutineControl::AsyncStart.matcher(r.id())]
        );

        sched.run_until_idle();
        assert_eq!(r.state(), RoutineState::Active);
        assert_eq!(sched.registrations(r.id()), vec![on_ping(1)]);
    }

    #[test]
    fn test_manual_start_does_nothing_until_started() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let opts = RoutineOptions {
            manual_start: true,
            ..RoutineOptions::sync()
        };
        let r = Routine::spawn(sched.bus(), opts, None, |ctx| async move {
            ctx.wait_for(on_ping(1)).await?;
            Ok(())
        })
        .unwrap();

        assert_eq!(r.state(), RoutineState::AwaitingManualStart);
        assert_eq!(sched.listener_count(), 0);
        r.start().unwrap();
        assert_eq!(r.state(), RoutineState::Active);
    }

    #[test]
    fn test_close_runs_cleanup_and_cleans_registrations() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let cleaned = Rc::new(Cell::new(false));
        let flag = cleaned.clone();
        let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, move |ctx| async move {
            match ctx.wait_for(on_ping(1)).await {
                Err(RoutineError::Closed) => {
                    flag.set(true);
                    Err(RoutineError::Closed)
                }
                other => other.map(|_| ()),
            }
        })
        .unwrap();

        r.close().unwrap();
        assert!(cleaned.get());
        assert_eq!(r.state(), RoutineState::Closed);
        assert!(r.error().is_none());
        assert_eq!(sched.listener_count(), 0);
    }

    #[test]
    fn test_second_close_drops_body_waiting_in_cleanup() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
            if ctx.wait_for(on_ping(1)).await.is_err() {
                // Cleanup that itself waits.
                ctx.wait_for(on_ping(2)).await?;
            }
            Ok(())
        })
        .unwrap();

        r.close().unwrap();
        assert_eq!(r.state(), RoutineState::Closing);
        assert_eq!(sched.registrations(r.id()), vec![on_ping(2)]);

        r.close().unwrap();
        assert_eq!(r.state(), RoutineState::Closed);
        assert_eq!(sched.listener_count(), 0);
    }

    #[test]
    fn test_close_before_async_start_ignores_start_event() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let r = Routine::spawn(sched.bus(), RoutineOptions::default(), None, move |_ctx| async move {
            flag.set(true);
            Ok(())
        })
        .unwrap();

        r.close().unwrap();
        sched.run_until_idle();
        assert!(!ran.get());
        assert_eq!(r.state(), RoutineState::Closed);
        assert_eq!(sched.parked(), 0);
        assert_eq!(sched.listener_count(), 0);
    }

    #[test]
    fn test_failure_is_recorded_and_reported() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
            ctx.wait_for(on_ping(1)).await?;
            Err(RoutineError::failed("boom"))
        })
        .unwrap();

        sched.send_event(ping(1));
        sched.run_until_idle();
        assert_eq!(r.state(), RoutineState::Failed);
        assert_eq!(r.error().map(|e| e.as_label()), Some("routine_failed"));
        assert_eq!(sched.take_errors().len(), 1);
    }

    #[test]
    fn test_sync_start_failure_is_returned() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let res = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |_ctx| async move {
            Err::<(), _>(RoutineError::failed("early"))
        });
        assert!(matches!(res, Err(RoutineError::Failed { .. })));
    }

    #[test]
    fn test_empty_waitset_is_thrown_back() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let seen = Rc::new(RefCell::new(None));
        let out = seen.clone();
        let res = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, move |ctx| async move {
            if let Err(err) = ctx.wait_for(WaitSet::new()).await {
                *out.borrow_mut() = Some(err.clone());
                return Err(err);
            }
            Ok(())
        });

        assert!(matches!(res, Err(RoutineError::IllegalWaitSet { .. })));
        assert!(matches!(
            seen.borrow().as_ref(),
            Some(RoutineError::IllegalWaitSet {
                reason: BusError::EmptyWaitSet,
                ..
            })
        ));
        assert_eq!(sched.listener_count(), 0);
    }

    #[test]
    fn test_throw_injects_error_at_wait_point() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
            match ctx.wait_for(on_ping(1)).await {
                Err(RoutineError::Failed { .. }) => {
                    ctx.wait_for(on_ping(2)).await?;
                    Ok(())
                }
                other => other.map(|_| ()),
            }
        })
        .unwrap();

        r.throw(RoutineError::failed("poke")).unwrap();
        assert_eq!(r.state(), RoutineState::Active);
        assert_eq!(sched.registrations(r.id()), vec![on_ping(2)]);
    }

    #[test]
    fn test_self_close_takes_effect_at_next_wait() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let reached = Rc::new(Cell::new(false));
        let flag = reached.clone();
        let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, move |ctx| async move {
            if let Some(me) = ctx.routine() {
                me.close()?;
            }
            flag.set(true);
            ctx.wait_for(on_ping(1)).await?;
            Ok(())
        })
        .unwrap();

        assert!(reached.get());
        assert_eq!(r.state(), RoutineState::Closed);
        assert_eq!(sched.listener_count(), 0);
    }

    #[test]
    fn test_quit_closes_routine() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
            ctx.wait_for(on_ping(1)).await?;
            Ok(())
        })
        .unwrap();

        sched.quit();
        assert_eq!(r.state(), RoutineState::Closed);
        assert!(sched.take_errors().is_empty());
    }

    #[test]
    fn test_daemon_routine_does_not_hold_foreground() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let opts = RoutineOptions {
            daemon: true,
            ..RoutineOptions::sync()
        };
        let _r = Routine::spawn(sched.bus(), opts, None, |ctx| async move {
            ctx.wait_for(on_ping(1)).await?;
            Ok(())
        })
        .unwrap();
        assert_eq!(sched.listener_count(), 1);
        assert!(!sched.has_foreground());
    }
}
