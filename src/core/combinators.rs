//! # Combinators built on [`RoutineCtx::wait_for`].
//!
//! Every helper here is an `async` method on the routine context and composes
//! into a routine body like any other future. They only suspend through
//! `wait_for`, so the single-active-wait-set rule holds for all of them.
//!
//! | helper                        | resolves with                                   |
//! |-------------------------------|-------------------------------------------------|
//! | `wait_for_send`               | once the bus accepted the event                 |
//! | `wait_with_timeout`           | `Some(delivery)` or `None` when the timer fired |
//! | `execute_with_timeout`        | `Some(value)` or `None`; the sub-future is dropped on timeout |
//! | `with_exception`              | sub-future result, or `Err(Routine{..})` on an abort condition |
//! | `with_callback`               | sub-future result; side events go to a callback |
//! | `wait_for_all[_to_process]`   | a [`Barrier`] with one event per condition      |
//! | `syscall` / `syscall_noreturn`| result of a function run by the bus             |
//! | `delegate` / `delegate_in`    | result of a body run as a separate routine      |
//! | `do_events`                   | after the bus processed what is ready           |

use std::any::Any;
use std::future::{poll_fn, Future};
use std::pin::pin;
use std::task::Poll;
use std::time::Duration;

use crate::bus::{BusRef, Drainable, TimerHandle};
use crate::core::container::Container;
use crate::core::ctx::{Barrier, Delivery, RoutineCtx};
use crate::core::routine::{Routine, RoutineOptions};
use crate::error::RoutineError;
use crate::events::{control, EventRef, Matcher, RoutineControl, WaitSet};

/// Timer cancelled when dropped.
pub(crate) struct TimerGuard {
    bus: BusRef,
    handle: TimerHandle,
}

impl TimerGuard {
    pub(crate) fn start(bus: &BusRef, after: Duration) -> Self {
        Self {
            bus: bus.clone(),
            handle: bus.set_timer(after),
        }
    }

    pub(crate) fn matcher(&self) -> Matcher {
        control::timer_matcher(self.handle)
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.bus.cancel_timer(self.handle);
    }
}

impl RoutineCtx {
    /// Sends `event`, waiting out backpressure until the bus accepts it.
    ///
    /// The same event object is retried, so it is delivered at most once.
    pub async fn wait_for_send(&self, event: impl Into<EventRef>) -> Result<(), RoutineError> {
        let event = event.into();
        while let Some(waiter) = self.bus().send(event.clone()) {
            tracing::trace!(routine = %self.id(), seq = event.seq(), "send backpressured");
            self.wait_for(waiter).await?;
        }
        Ok(())
    }

    /// Waits for `matchers` at most `timeout`.
    ///
    /// Returns `None` (and sets [`timed_out`](Self::timed_out)) if the timer
    /// fired first. `None` for `timeout` waits without a timer.
    pub async fn wait_with_timeout(
        &self,
        timeout: Option<Duration>,
        matchers: impl Into<WaitSet>,
    ) -> Result<Option<Delivery>, RoutineError> {
        let mut waitset = matchers.into();
        let Some(after) = timeout else {
            let got = self.wait_for(waitset).await?;
            self.set_timed_out(false);
            return Ok(Some(got));
        };

        let timer = TimerGuard::start(self.bus(), after);
        let fired = timer.matcher();
        waitset.push(fired.clone());

        let got = self.wait_for(waitset).await?;
        let timed_out = got.matcher == fired;
        self.set_timed_out(timed_out);
        Ok(if timed_out { None } else { Some(got) })
    }

    /// Runs `sub` to completion unless `timeout` elapses first.
    ///
    /// On timeout `sub` is dropped (closing it) and `Ok(None)` is returned.
    pub async fn execute_with_timeout<F, T>(
        &self,
        timeout: Option<Duration>,
        sub: F,
    ) -> Result<Option<T>, RoutineError>
    where
        F: Future<Output = Result<T, RoutineError>>,
    {
        let Some(after) = timeout else {
            let value = sub.await?;
            self.set_timed_out(false);
            return Ok(Some(value));
        };

        let timer = TimerGuard::start(self.bus(), after);
        let fired = timer.matcher();
        match self.with_exception(sub, fired.clone()).await {
            Ok(value) => {
                self.set_timed_out(false);
                Ok(Some(value))
            }
            Err(RoutineError::Routine { matcher, .. }) if matcher == fired => {
                tracing::debug!(routine = %self.id(), "sub-computation timed out");
                self.set_timed_out(true);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Yields to the bus; resumes after the events ready now were processed.
    pub async fn do_events(&self) -> Result<(), RoutineError> {
        self.bus().want_continue();
        self.wait_for(control::continue_matcher()).await?;
        Ok(())
    }

    /// Runs `sub`, aborting it with [`RoutineError::Routine`] when one of
    /// `matchers` is delivered first.
    ///
    /// The abort conditions are added to every wait-set `sub` suspends on.
    pub async fn with_exception<F, T>(
        &self,
        sub: F,
        matchers: impl Into<WaitSet>,
    ) -> Result<T, RoutineError>
    where
        F: Future<Output = Result<T, RoutineError>>,
    {
        let matchers = matchers.into();
        let mut sub = pin!(sub);
        poll_fn(|cx| {
            if let Some((event, matcher)) = self.slot().take_event_in(&matchers) {
                return Poll::Ready(Err(RoutineError::Routine { matcher, event }));
            }
            let _layer = self.slot().push_layer(&matchers);
            sub.as_mut().poll(cx)
        })
        .await
    }

    /// Runs `sub`, calling `callback` for each delivery of `matchers` without
    /// disturbing `sub`'s own wait.
    ///
    /// An `Err` from the callback aborts `sub` and is returned.
    pub async fn with_callback<F, T, C>(
        &self,
        sub: F,
        mut callback: C,
        matchers: impl Into<WaitSet>,
    ) -> Result<T, RoutineError>
    where
        F: Future<Output = Result<T, RoutineError>>,
        C: FnMut(&EventRef, &Matcher) -> Result<(), RoutineError>,
    {
        let matchers = matchers.into();
        let mut sub = pin!(sub);
        poll_fn(|cx| {
            if let Some((event, matcher)) = self.slot().take_event_in(&matchers) {
                if let Err(err) = callback(&event, &matcher) {
                    return Poll::Ready(Err(err));
                }
            }
            let _layer = self.slot().push_layer(&matchers);
            sub.as_mut().poll(cx)
        })
        .await
    }

    /// Waits until `queue` reports it is empty.
    pub async fn wait_for_empty(&self, queue: &dyn Drainable) -> Result<(), RoutineError> {
        while let Some(matcher) = queue.wait_for_empty() {
            self.wait_for(matcher).await?;
        }
        Ok(())
    }

    /// Waits until every queue in `queues` is empty at the same time.
    pub async fn wait_for_all_empty(&self, queues: &[&dyn Drainable]) -> Result<(), RoutineError> {
        loop {
            let pending: WaitSet = queues.iter().filter_map(|q| q.wait_for_empty()).collect();
            if pending.is_empty() {
                return Ok(());
            }
            self.wait_for_all(pending).await?;
        }
    }

    /// Waits until every condition in `matchers` has been delivered once.
    ///
    /// Each delivery removes one occurrence of its condition; duplicated
    /// conditions need as many events. The result is also available through
    /// [`event_list`](Self::event_list) and [`event_dict`](Self::event_dict).
    pub async fn wait_for_all(&self, matchers: impl Into<WaitSet>) -> Result<Barrier, RoutineError> {
        self.collect_all(matchers.into(), false).await
    }

    /// Like [`wait_for_all`](Self::wait_for_all), and marks every collected
    /// event as processed so nothing else needs to consume it.
    pub async fn wait_for_all_to_process(
        &self,
        matchers: impl Into<WaitSet>,
    ) -> Result<Barrier, RoutineError> {
        self.collect_all(matchers.into(), true).await
    }

    async fn collect_all(&self, mut remaining: WaitSet, claim: bool) -> Result<Barrier, RoutineError> {
        let mut barrier = Barrier::default();
        while !remaining.is_empty() {
            let got = self.wait_for(remaining.clone()).await?;
            remaining.remove_one(&got.matcher);
            if claim {
                got.event.set_canignore(true);
            }
            barrier.events.push(got.event.clone());
            barrier.by_matcher.insert(got.matcher, got.event);
        }
        self.set_barrier(&barrier);
        Ok(barrier)
    }

    /// Runs `func` in the bus's privileged context and returns the raw result event.
    pub async fn syscall_noreturn<F>(&self, func: F) -> Result<EventRef, RoutineError>
    where
        F: FnOnce() -> Result<Box<dyn Any>, RoutineError> + 'static,
    {
        let matcher = self.bus().syscall(Box::new(func));
        Ok(self.wait_for(matcher).await?.event)
    }

    /// Runs `func` in the bus's privileged context and returns its value.
    ///
    /// An error returned by `func` is re-raised here.
    pub async fn syscall<F, T>(&self, func: F) -> Result<T, RoutineError>
    where
        F: FnOnce() -> Result<T, RoutineError> + 'static,
        T: 'static,
    {
        let event = self
            .syscall_noreturn(move || func().map(|v| Box::new(v) as Box<dyn Any>))
            .await?;
        if let Some(err) = event.exception() {
            return Err(err.clone());
        }
        event.take_retvalue::<T>()
    }

    /// Runs `body` as a separate routine in this routine's container and
    /// waits for its result.
    ///
    /// The delegate's failure is returned here. Closing the caller does not
    /// close the delegate.
    pub async fn delegate<F, Fut, T>(&self, body: F) -> Result<T, RoutineError>
    where
        F: FnOnce(RoutineCtx) -> Fut + 'static,
        Fut: Future<Output = Result<T, RoutineError>> + 'static,
        T: 'static,
    {
        let container = self.container();
        self.delegate_on(container.as_ref(), body).await
    }

    /// Like [`delegate`](Self::delegate), running the body in `container`.
    pub async fn delegate_in<F, Fut, T>(&self, container: &Container, body: F) -> Result<T, RoutineError>
    where
        F: FnOnce(RoutineCtx) -> Fut + 'static,
        Fut: Future<Output = Result<T, RoutineError>> + 'static,
        T: 'static,
    {
        self.delegate_on(Some(container), body).await
    }

    async fn delegate_on<F, Fut, T>(&self, container: Option<&Container>, body: F) -> Result<T, RoutineError>
    where
        F: FnOnce(RoutineCtx) -> Fut + 'static,
        Fut: Future<Output = Result<T, RoutineError>> + 'static,
        T: 'static,
    {
        let wrapped = move |sub: RoutineCtx| async move {
            let result = body(sub.clone()).await;
            let finished = RoutineControl::DelegateFinished
                .event(sub.id())
                .with_canignore(true);
            let (finished, outcome) = match result {
                Ok(value) => (finished.with_retvalue(value), Ok(())),
                Err(err) => (finished.with_exception(err.clone()), Err(err)),
            };
            sub.wait_for_send(finished).await?;
            outcome
        };

        let delegate = match container {
            Some(c) => c.spawn(wrapped)?,
            None => Routine::spawn(self.bus().clone(), RoutineOptions::default(), None, wrapped)?,
        };
        tracing::trace!(routine = %self.id(), delegate = %delegate.id(), "delegated");

        let done = self
            .wait_for(RoutineControl::DelegateFinished.matcher(delegate.id()))
            .await?;
        if let Some(err) = done.event.exception() {
            return Err(err.clone());
        }
        done.event.take_retvalue::<T>()
    }
}
