//! # Per-task execution context and the wait primitive.
//!
//! Every routine body receives a [`RoutineCtx`]. It is the only way a
//! computation suspends: [`RoutineCtx::wait_for`] offers a wait-set to the
//! driver and resolves with the delivered `(event, matcher)` pair, or with the
//! close/error signal injected instead.
//!
//! ## Suspend/resume handshake
//! ```text
//! computation                     WaitSlot                      driver
//! ───────────                     ────────                      ──────
//! wait_for(ws).poll() ── offer(ws + layers) ──►  offered   ──► take_offer() ─► bus.register
//!        Pending                                                     ...
//!                                                signal    ◄── put_signal(Event|Close|Error)
//! wait_for(ws).poll() ◄─ take_signal() ─────────                     poll again
//!        Ready(Ok(Delivery) | Err(Closed) | Err(e))
//! ```
//!
//! ## Rules
//! - Exactly one wait point may be suspended per poll; two offers in the same
//!   poll are rejected as an illegal wait-set.
//! - Interrupt layers (see `with_exception` / `with_callback`) are appended to
//!   every offered wait-set and see each delivery before the inner wait point.
//! - The bookkeeping fields (`event`, `matcher`, `timed_out`, barrier results)
//!   are rewritten on every resume; read them right after the wait that set them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::bus::{BusRef, ListenerId};
use crate::core::container::{Container, ContainerInner};
use crate::core::routine::{Routine, RoutineInner};
use crate::error::RoutineError;
use crate::events::{EventRef, Matcher, WaitSet};

/// Resume input of a computation.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A registered condition matched this event.
    Event(EventRef, Matcher),
    /// The routine is being closed.
    Close,
    /// An error injected at the suspension point.
    Error(RoutineError),
}

/// Result of a wait: the event and the condition it matched.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: EventRef,
    pub matcher: Matcher,
}

/// Events collected by a barrier (`wait_for_all`).
#[derive(Debug, Clone, Default)]
pub struct Barrier {
    /// Events in arrival order.
    pub events: Vec<EventRef>,
    /// Event received for each condition.
    pub by_matcher: HashMap<Matcher, EventRef>,
}

/// Wait-set offered by the computation and signal handed back by the driver.
#[derive(Default)]
pub(crate) struct WaitSlot {
    offered: RefCell<Option<WaitSet>>,
    offers: Cell<usize>,
    signal: RefCell<Option<Signal>>,
    layers: RefCell<Vec<WaitSet>>,
}

/// Outcome of one poll as seen by the driver.
pub(crate) enum Offer {
    /// One wait-set (layers included).
    One(WaitSet),
    /// Nothing offered: the computation awaited something that is not a wait point.
    Nothing,
    /// More than one wait point suspended during the same poll.
    Many(WaitSet),
}

impl WaitSlot {
    fn offer(&self, mut waitset: WaitSet) {
        for layer in self.layers.borrow().iter() {
            waitset.extend_from(layer);
        }
        self.offers.set(self.offers.get() + 1);
        let mut offered = self.offered.borrow_mut();
        match offered.as_mut() {
            Some(prev) => prev.extend_from(&waitset),
            None => *offered = Some(waitset),
        }
    }

    pub(crate) fn take_offer(&self) -> Offer {
        let count = self.offers.replace(0);
        match (self.offered.borrow_mut().take(), count) {
            (None, _) => Offer::Nothing,
            (Some(ws), 1) => Offer::One(ws),
            (Some(ws), _) => Offer::Many(ws),
        }
    }

    pub(crate) fn put_signal(&self, signal: Signal) {
        *self.signal.borrow_mut() = Some(signal);
    }

    pub(crate) fn clear(&self) {
        self.signal.borrow_mut().take();
        self.offered.borrow_mut().take();
        self.offers.set(0);
    }

    fn take_signal(&self) -> Option<Signal> {
        self.signal.borrow_mut().take()
    }

    /// Takes the pending delivery if it matched one of `matchers`.
    pub(crate) fn take_event_in(&self, matchers: &WaitSet) -> Option<(EventRef, Matcher)> {
        let mut signal = self.signal.borrow_mut();
        match signal.as_ref() {
            Some(Signal::Event(_, m)) if matchers.contains(m) => match signal.take() {
                Some(Signal::Event(event, matcher)) => Some((event, matcher)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Appends `matchers` to every wait-set offered until the guard drops.
    pub(crate) fn push_layer(&self, matchers: &WaitSet) -> LayerGuard<'_> {
        self.layers.borrow_mut().push(matchers.clone());
        LayerGuard { slot: self }
    }
}

pub(crate) struct LayerGuard<'a> {
    slot: &'a WaitSlot,
}

impl Drop for LayerGuard<'_> {
    fn drop(&mut self) {
        self.slot.layers.borrow_mut().pop();
    }
}

/// Future returned by [`RoutineCtx::wait_for`].
#[must_use = "a wait-set does nothing unless awaited"]
pub struct WaitFor<'a> {
    slot: &'a WaitSlot,
    waitset: WaitSet,
    offered: bool,
}

impl Future for WaitFor<'_> {
    type Output = Result<Delivery, RoutineError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.offered {
            if let Some(signal) = this.slot.take_signal() {
                return Poll::Ready(match signal {
                    Signal::Event(event, matcher) => Ok(Delivery { event, matcher }),
                    Signal::Close => Err(RoutineError::Closed),
                    Signal::Error(err) => Err(err),
                });
            }
        }
        // First poll, or re-poll after an interrupt layer consumed the delivery.
        this.slot.offer(this.waitset.clone());
        this.offered = true;
        Poll::Pending
    }
}

#[derive(Default)]
struct Bookkeeping {
    event: Option<EventRef>,
    matcher: Option<Matcher>,
    timed_out: bool,
    barrier: Barrier,
}

struct CtxInner {
    id: ListenerId,
    bus: BusRef,
    container: Option<Weak<ContainerInner>>,
    routine: Weak<RoutineInner>,
    slot: WaitSlot,
    book: RefCell<Bookkeeping>,
}

/// Execution context of one routine; cheap to clone.
///
/// All combinators are methods on the context (see the `combinators` module).
#[derive(Clone)]
pub struct RoutineCtx {
    inner: Rc<CtxInner>,
}

impl RoutineCtx {
    pub(crate) fn new(
        id: ListenerId,
        bus: BusRef,
        container: Option<Weak<ContainerInner>>,
        routine: Weak<RoutineInner>,
    ) -> Self {
        Self {
            inner: Rc::new(CtxInner {
                id,
                bus,
                container,
                routine,
                slot: WaitSlot::default(),
                book: RefCell::new(Bookkeeping::default()),
            }),
        }
    }

    /// Identity of the routine this context belongs to.
    #[inline]
    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    #[inline]
    pub fn bus(&self) -> &BusRef {
        &self.inner.bus
    }

    /// The owning container, if the routine has one and it is still alive.
    pub fn container(&self) -> Option<Container> {
        self.inner
            .container
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Container::from_inner)
    }

    /// Handle to the routine itself.
    pub fn routine(&self) -> Option<Routine> {
        self.inner.routine.upgrade().map(Routine::from_inner)
    }

    /// Suspends until one of `matchers` is delivered.
    ///
    /// Resolves to `Err(RoutineError::Closed)` if the routine is closed while
    /// waiting, or to the injected error if one is thrown in.
    pub fn wait_for(&self, matchers: impl Into<WaitSet>) -> WaitFor<'_> {
        WaitFor {
            slot: &self.inner.slot,
            waitset: matchers.into(),
            offered: false,
        }
    }

    /// Event delivered at the last resume.
    pub fn event(&self) -> Option<EventRef> {
        self.inner.book.borrow().event.clone()
    }

    /// Condition matched at the last resume.
    pub fn matcher(&self) -> Option<Matcher> {
        self.inner.book.borrow().matcher.clone()
    }

    /// Whether the last timed wait ended because its timer fired.
    pub fn timed_out(&self) -> bool {
        self.inner.book.borrow().timed_out
    }

    /// Events collected by the last barrier, in arrival order.
    pub fn event_list(&self) -> Vec<EventRef> {
        self.inner.book.borrow().barrier.events.clone()
    }

    /// Event received per condition by the last barrier.
    pub fn event_dict(&self) -> HashMap<Matcher, EventRef> {
        self.inner.book.borrow().barrier.by_matcher.clone()
    }

    pub(crate) fn slot(&self) -> &WaitSlot {
        &self.inner.slot
    }

    pub(crate) fn record(&self, event: &EventRef, matcher: &Matcher) {
        let mut book = self.inner.book.borrow_mut();
        book.event = Some(event.clone());
        book.matcher = Some(matcher.clone());
    }

    pub(crate) fn set_timed_out(&self, timed_out: bool) {
        self.inner.book.borrow_mut().timed_out = timed_out;
    }

    pub(crate) fn set_barrier(&self, barrier: &Barrier) {
        self.inner.book.borrow_mut().barrier = barrier.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind};
    use futures::task::noop_waker_ref;

    const TICK: EventKind = EventKind::new("tick");

    fn poll<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        Pin::new(fut).poll(&mut Context::from_waker(noop_waker_ref()))
    }

    #[test]
    fn test_wait_for_offers_then_resolves() {
        let slot = WaitSlot::default();
        let m = Matcher::new(TICK);
        let mut wait = WaitFor {
            slot: &slot,
            waitset: WaitSet::from(m.clone()),
            offered: false,
        };

        assert!(poll(&mut wait).is_pending());
        assert!(matches!(slot.take_offer(), Offer::One(ws) if ws == WaitSet::from(m.clone())));

        let ev: EventRef = Rc::new(Event::new(TICK));
        slot.put_signal(Signal::Event(ev.clone(), m.clone()));
        match poll(&mut wait) {
            Poll::Ready(Ok(d)) => {
                assert_eq!(d.matcher, m);
                assert_eq!(d.event.seq(), ev.seq());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_close_signal_resolves_to_closed() {
        let slot = WaitSlot::default();
        let mut wait = WaitFor {
            slot: &slot,
            waitset: WaitSet::from(Matcher::new(TICK)),
            offered: false,
        };
        assert!(poll(&mut wait).is_pending());
        slot.clear();
        slot.put_signal(Signal::Close);
        assert!(matches!(poll(&mut wait), Poll::Ready(Err(RoutineError::Closed))));
    }

    #[test]
    fn test_layers_are_appended_and_consumed() {
        let slot = WaitSlot::default();
        let inner = Matcher::new(TICK).with("n", 1u64);
        let abort = Matcher::new(TICK).with("n", 2u64);
        let layer = WaitSet::from(abort.clone());

        let mut wait = WaitFor {
            slot: &slot,
            waitset: WaitSet::from(inner.clone()),
            offered: false,
        };
        {
            let _guard = slot.push_layer(&layer);
            assert!(poll(&mut wait).is_pending());
        }
        match slot.take_offer() {
            Offer::One(ws) => assert_eq!(ws, WaitSet::from([inner.clone(), abort.clone()])),
            _ => panic!("expected one offer"),
        }

        slot.put_signal(Signal::Event(Rc::new(Event::new(TICK)), abort.clone()));
        assert!(slot.take_event_in(&WaitSet::from(inner)).is_none());
        assert!(slot.take_event_in(&layer).is_some());
        assert!(slot.take_signal().is_none());
    }

    #[test]
    fn test_two_offers_in_one_poll_are_reported() {
        let slot = WaitSlot::default();
        slot.offer(WaitSet::from(Matcher::new(TICK)));
        slot.offer(WaitSet::from(Matcher::new(TICK).with("n", 1u64)));
        assert!(matches!(slot.take_offer(), Offer::Many(ws) if ws.len() == 2));
        assert!(matches!(slot.take_offer(), Offer::Nothing));
    }
}
