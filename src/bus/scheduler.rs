//! # Scheduler: single-threaded reference event bus.
//!
//! [`Scheduler`] keeps the registration table, the event queues, timers and
//! pending syscalls, and delivers events to [`Listener`]s from its own loop.
//!
//! ## Architecture
//! ```text
//! send(ev) ──► queue (bounded) ─┐
//!                               ├─► next_event() ─► dispatch(ev) ─► Listener::deliver
//! timers / syscalls / continue ─┤        ▲               │
//!   can-write / parked retries ─┘        │               └─► no match: canignore ? drop : park
//!            (control, unbounded) ───────┘
//! ```
//!
//! ## Rules
//! - Control events are processed before the main queue.
//! - Matches are collected first, then each listener is re-checked before its
//!   delivery: a listener that moved on (unregistered) during the same round is skipped.
//! - Parked events are retried after the next registration.
//! - No `RefCell` borrow is held while a listener runs; listeners re-enter the
//!   scheduler freely.
//!
//! ## Example
//! ```rust
//! use std::rc::Rc;
//! use cotask::{Container, Event, EventKind, Matcher, Scheduler, SchedulerConfig};
//!
//! const PING: EventKind = EventKind::new("ping");
//!
//! let sched = Scheduler::new(SchedulerConfig::default());
//! let container = Container::new(sched.bus());
//! container
//!     .start(false, |ctx| async move {
//!         let got = ctx.wait_for(Matcher::new(PING)).await?;
//!         assert_eq!(got.event.kind(), PING);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert!(sched.send_event(Event::new(PING)).is_none());
//! sched.run_until_idle();
//! assert!(container.main_routine().unwrap().is_finished());
//! ```

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::bus::{BusRef, EventBus, Interrupt, Listener, ListenerId, SyscallFn, TimerHandle};
use crate::config::SchedulerConfig;
use crate::error::{BusError, RoutineError};
use crate::events::control;
use crate::events::{Event, EventKind, EventRef, Matcher, WaitSet};

/// Registered listener and the conditions it holds (one entry per registration).
struct Registration {
    listener: Rc<dyn Listener>,
    matchers: Vec<Matcher>,
}

#[derive(Default)]
struct State {
    listeners: HashMap<ListenerId, Registration>,
    index: HashMap<EventKind, Vec<(Matcher, ListenerId)>>,
    daemons: HashSet<ListenerId>,

    queue: VecDeque<EventRef>,
    control: VecDeque<EventRef>,
    parked: VecDeque<EventRef>,
    parked_dirty: bool,
    backpressured: bool,

    timers: BTreeSet<(Instant, u64)>,
    deadlines: HashMap<u64, Instant>,
    next_timer: u64,

    syscalls: VecDeque<(u64, SyscallFn)>,
    next_syscall: u64,

    want_continue: bool,
    shut_down: bool,
    errors: VecDeque<RoutineError>,
}

/// Single-threaded event bus with timers, syscalls and backpressure.
pub struct Scheduler {
    config: SchedulerConfig,
    state: RefCell<State>,
    quit: CancellationToken,
    wakeup: Notify,
}

impl Scheduler {
    /// Creates a scheduler.
    pub fn new(config: SchedulerConfig) -> Rc<Self> {
        Rc::new(Self {
            config,
            state: RefCell::new(State::default()),
            quit: CancellationToken::new(),
            wakeup: Notify::new(),
        })
    }

    /// Returns this scheduler as a shared [`EventBus`] handle.
    pub fn bus(self: &Rc<Self>) -> BusRef {
        self.clone()
    }

    /// Shorthand for [`EventBus::send`] with an owned event.
    pub fn send_event(&self, event: Event) -> Option<Matcher> {
        self.send(Rc::new(event))
    }

    /// Processes every ready event, due timer, syscall and continue request.
    ///
    /// Does not wait for future timers. Returns the number of deliveries made.
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        loop {
            self.run_syscalls();
            self.fire_due_timers();
            match self.next_event() {
                Some(event) => delivered += self.dispatch(event),
                None => {
                    if !self.arm_continue() {
                        break;
                    }
                }
            }
        }
        delivered
    }

    /// Runs until [`quit`](Self::quit) is called or, with
    /// [`SchedulerConfig::quit_when_idle`], until only daemon listeners remain.
    ///
    /// Sleeps until the next timer deadline or the next `send` while idle.
    pub async fn run(&self) {
        loop {
            self.run_until_idle();
            if self.quit.is_cancelled() {
                break;
            }
            if self.config.quit_when_idle && !self.has_foreground() {
                tracing::debug!("scheduler idle, no foreground listeners");
                break;
            }

            match self.next_deadline() {
                Some(at) => select! {
                    _ = time::sleep_until(at) => {}
                    _ = self.wakeup.notified() => {}
                    _ = self.quit.cancelled() => break,
                },
                None => select! {
                    _ = self.wakeup.notified() => {}
                    _ = self.quit.cancelled() => break,
                },
            }
        }
    }

    /// Interrupts every registered listener with [`Interrupt::Quit`] and stops [`run`](Self::run).
    ///
    /// Registrations made by listeners while handling the quit are accepted;
    /// later ones are rejected with [`BusError::ShutDown`].
    pub fn quit(&self) {
        if self.quit.is_cancelled() {
            return;
        }
        self.quit.cancel();

        let listeners: Vec<Rc<dyn Listener>> = {
            let st = self.state.borrow();
            st.listeners.values().map(|r| r.listener.clone()).collect()
        };
        tracing::debug!(listeners = listeners.len(), "scheduler quit");
        for listener in listeners {
            if let Err(err) = listener.interrupt(Interrupt::Quit) {
                self.report(listener.id(), err);
            }
        }
        self.state.borrow_mut().shut_down = true;
    }

    /// Forwards `error` to `listener` (see [`Listener::interrupt`]).
    ///
    /// Returns `false` if the listener is not registered.
    pub fn throw(&self, listener: ListenerId, error: RoutineError) -> bool {
        let target = {
            let st = self.state.borrow();
            st.listeners.get(&listener).map(|r| r.listener.clone())
        };
        match target {
            Some(l) => {
                if let Err(err) = l.interrupt(Interrupt::Error(error)) {
                    self.report(listener, err);
                }
                true
            }
            None => false,
        }
    }

    /// Drains the errors listeners returned to the scheduler.
    ///
    /// At most [`SchedulerConfig::max_errors`] are kept between two calls; older
    /// ones are dropped first.
    pub fn take_errors(&self) -> Vec<RoutineError> {
        std::mem::take(&mut self.state.borrow_mut().errors).into()
    }

    /// Conditions currently registered for `listener`, in registration order.
    pub fn registrations(&self, listener: ListenerId) -> Vec<Matcher> {
        self.state
            .borrow()
            .listeners
            .get(&listener)
            .map(|r| r.matchers.clone())
            .unwrap_or_default()
    }

    /// Returns `true` if `listener` holds a registration for `matcher`.
    pub fn is_registered(&self, listener: ListenerId, matcher: &Matcher) -> bool {
        self.state
            .borrow()
            .listeners
            .get(&listener)
            .is_some_and(|r| r.matchers.contains(matcher))
    }

    /// Number of listeners with at least one registration.
    pub fn listener_count(&self) -> usize {
        self.state.borrow().listeners.len()
    }

    /// Number of timers not yet fired or cancelled.
    pub fn pending_timers(&self) -> usize {
        self.state.borrow().deadlines.len()
    }

    /// Number of events in the main queue.
    pub fn queued(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Number of parked (unmatched, non-ignorable) events.
    pub fn parked(&self) -> usize {
        self.state.borrow().parked.len()
    }

    /// Returns `true` if a non-daemon listener is registered.
    pub fn has_foreground(&self) -> bool {
        let st = self.state.borrow();
        st.listeners.keys().any(|id| !st.daemons.contains(id))
    }

    // ---------------------------
    // Processing
    // ---------------------------

    fn run_syscalls(&self) {
        loop {
            let next = self.state.borrow_mut().syscalls.pop_front();
            let Some((id, func)) = next else { break };

            let event = match func() {
                Ok(value) => control::syscall_event(id).with_boxed_retvalue(value),
                Err(err) => control::syscall_event(id).with_exception(err),
            };
            self.state.borrow_mut().control.push_back(Rc::new(event));
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        let mut st = self.state.borrow_mut();
        while let Some(&(at, id)) = st.timers.first() {
            if at > now {
                break;
            }
            st.timers.remove(&(at, id));
            st.deadlines.remove(&id);
            st.control
                .push_back(Rc::new(control::timer_event(TimerHandle::new(id))));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.state.borrow().timers.first().map(|&(at, _)| at)
    }

    /// Queues the continue event if one was requested.
    fn arm_continue(&self) -> bool {
        let mut st = self.state.borrow_mut();
        if !st.want_continue {
            return false;
        }
        st.want_continue = false;
        st.control.push_back(Rc::new(control::continue_event()));
        true
    }

    fn next_event(&self) -> Option<EventRef> {
        let mut st = self.state.borrow_mut();
        if st.parked_dirty {
            st.parked_dirty = false;
            let parked = std::mem::take(&mut st.parked);
            for ev in parked.into_iter().rev() {
                st.control.push_front(ev);
            }
        }
        if let Some(ev) = st.control.pop_front() {
            return Some(ev);
        }

        let ev = st.queue.pop_front()?;
        let has_room = self
            .config
            .queue_limit()
            .map_or(true, |limit| st.queue.len() < limit);
        if st.backpressured && has_room {
            st.backpressured = false;
            st.control.push_back(Rc::new(control::can_write_event()));
        }
        Some(ev)
    }

    /// Delivers `event` to every matching listener; returns the number of deliveries.
    fn dispatch(&self, event: EventRef) -> usize {
        let targets: Vec<(Rc<dyn Listener>, Matcher)> = {
            let st = self.state.borrow();
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            if let Some(entries) = st.index.get(&event.kind()) {
                for (matcher, id) in entries {
                    if seen.contains(id) || !event.matches(matcher) {
                        continue;
                    }
                    if let Some(reg) = st.listeners.get(id) {
                        seen.insert(*id);
                        out.push((reg.listener.clone(), matcher.clone()));
                    }
                }
            }
            out
        };

        if targets.is_empty() {
            self.park_or_drop(event);
            return 0;
        }

        let mut delivered = 0;
        for (listener, matcher) in targets {
            let id = listener.id();
            if !self.is_registered(id, &matcher) {
                continue;
            }
            delivered += 1;
            tracing::trace!(listener = %id, matcher = %matcher, seq = event.seq(), "deliver");
            if let Err(err) = listener.deliver(&event, &matcher) {
                self.report(id, err);
            }
        }
        delivered
    }

    fn park_or_drop(&self, event: EventRef) {
        if event.canignore() {
            tracing::trace!(kind = %event.kind(), seq = event.seq(), "unmatched event dropped");
            return;
        }
        let mut st = self.state.borrow_mut();
        st.parked.push_back(event);
        if let Some(limit) = self.config.parked_limit() {
            while st.parked.len() > limit {
                if let Some(old) = st.parked.pop_front() {
                    tracing::warn!(kind = %old.kind(), seq = old.seq(), "parked event evicted");
                }
            }
        }
    }

    fn report(&self, listener: ListenerId, err: RoutineError) {
        tracing::error!(listener = %listener, error = %err, label = err.as_label(), "listener failed");
        let mut st = self.state.borrow_mut();
        st.errors.push_back(err);
        if let Some(limit) = self.config.error_limit() {
            while st.errors.len() > limit {
                if let Some(old) = st.errors.pop_front() {
                    tracing::warn!(label = old.as_label(), "collected error evicted");
                }
            }
        }
    }
}

impl EventBus for Scheduler {
    fn register(&self, matchers: &WaitSet, listener: Rc<dyn Listener>) -> Result<(), BusError> {
        if matchers.is_empty() {
            return Err(BusError::EmptyWaitSet);
        }
        let mut st = self.state.borrow_mut();
        if st.shut_down {
            return Err(BusError::ShutDown);
        }

        let id = listener.id();
        for m in matchers {
            st.index.entry(m.kind()).or_default().push((m.clone(), id));
        }
        let reg = st.listeners.entry(id).or_insert_with(|| Registration {
            listener: listener.clone(),
            matchers: Vec::new(),
        });
        reg.listener = listener;
        reg.matchers.extend(matchers.iter().cloned());

        if !st.parked.is_empty() {
            st.parked_dirty = true;
        }
        Ok(())
    }

    fn unregister(&self, matchers: &WaitSet, listener: ListenerId) {
        let removed = {
            let mut st = self.state.borrow_mut();
            for m in matchers {
                if let Some(entries) = st.index.get_mut(&m.kind()) {
                    if let Some(pos) = entries.iter().position(|(em, eid)| *eid == listener && em == m) {
                        entries.remove(pos);
                    }
                }
                if let Some(reg) = st.listeners.get_mut(&listener) {
                    if let Some(pos) = reg.matchers.iter().position(|em| em == m) {
                        reg.matchers.remove(pos);
                    }
                }
            }
            match st.listeners.get(&listener) {
                Some(reg) if reg.matchers.is_empty() => st.listeners.remove(&listener),
                _ => None,
            }
        };
        drop(removed);
    }

    fn unregister_all(&self, listener: ListenerId) {
        let removed = {
            let mut st = self.state.borrow_mut();
            let removed = st.listeners.remove(&listener);
            if let Some(reg) = &removed {
                for m in &reg.matchers {
                    if let Some(entries) = st.index.get_mut(&m.kind()) {
                        entries.retain(|(_, eid)| *eid != listener);
                    }
                }
            }
            st.daemons.remove(&listener);
            removed
        };
        drop(removed);
    }

    fn send(&self, event: EventRef) -> Option<Matcher> {
        {
            let mut st = self.state.borrow_mut();
            if let Some(limit) = self.config.queue_limit() {
                if st.queue.len() >= limit {
                    st.backpressured = true;
                    return Some(control::can_write_matcher());
                }
            }
            st.queue.push_back(event);
        }
        self.wakeup.notify_one();
        None
    }

    fn set_timer(&self, after: Duration) -> TimerHandle {
        let id = {
            let mut st = self.state.borrow_mut();
            st.next_timer += 1;
            let id = st.next_timer;
            let at = Instant::now() + after;
            st.timers.insert((at, id));
            st.deadlines.insert(id, at);
            id
        };
        self.wakeup.notify_one();
        TimerHandle::new(id)
    }

    fn cancel_timer(&self, timer: TimerHandle) {
        let mut st = self.state.borrow_mut();
        if let Some(at) = st.deadlines.remove(&timer.get()) {
            st.timers.remove(&(at, timer.get()));
        }
    }

    fn syscall(&self, func: SyscallFn) -> Matcher {
        let id = {
            let mut st = self.state.borrow_mut();
            st.next_syscall += 1;
            let id = st.next_syscall;
            st.syscalls.push_back((id, func));
            id
        };
        self.wakeup.notify_one();
        control::syscall_matcher(id)
    }

    fn want_continue(&self) {
        self.state.borrow_mut().want_continue = true;
        self.wakeup.notify_one();
    }

    fn set_daemon(&self, listener: ListenerId, daemon: bool) {
        let mut st = self.state.borrow_mut();
        if daemon {
            st.daemons.insert(listener);
        } else {
            st.daemons.remove(&listener);
        }
    }

    fn ignore(&self, matcher: &Matcher) {
        let mut st = self.state.borrow_mut();
        st.parked.retain(|ev| !ev.matches(matcher));
        for ev in st.queue.iter().chain(st.control.iter()) {
            if ev.matches(matcher) {
                ev.set_canignore(true);
            }
        }
    }
}
