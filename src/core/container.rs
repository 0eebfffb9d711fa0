//! # Container: owner of a main routine and its named sub-routines.
//!
//! A [`Container`] bundles the routines of one component. It stores the
//! handle of every routine before any of its code runs, so a body can look
//! itself (or a sibling) up from its very first step.
//!
//! The container also mirrors the last resume of any of its routines:
//! [`current_routine`](Container::current_routine), [`event`](Container::event)
//! and [`matcher`](Container::matcher). Per-routine values are on
//! [`RoutineCtx`]; the mirror is for code that only has the container.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use crate::bus::{BusRef, ListenerId};
use crate::core::ctx::RoutineCtx;
use crate::core::routine::{Routine, RoutineOptions};
use crate::error::RoutineError;
use crate::events::{EventRef, Matcher};

pub(crate) struct ContainerInner {
    bus: BusRef,
    daemon: Cell<bool>,
    main: RefCell<Option<Routine>>,
    named: RefCell<HashMap<String, Routine>>,
    current: Cell<Option<ListenerId>>,
    event: RefCell<Option<EventRef>>,
    matcher: RefCell<Option<Matcher>>,
}

impl ContainerInner {
    pub(crate) fn set_current(&self, id: ListenerId, delivery: Option<(&EventRef, &Matcher)>) {
        self.current.set(Some(id));
        if let Some((event, matcher)) = delivery {
            *self.event.borrow_mut() = Some(event.clone());
            *self.matcher.borrow_mut() = Some(matcher.clone());
        }
    }
}

/// Owner of a main routine and named sub-routines on one bus.
#[derive(Clone)]
pub struct Container {
    inner: Rc<ContainerInner>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("main", &self.inner.main.borrow())
            .field("named", &self.inner.named.borrow().len())
            .finish()
    }
}

impl Container {
    pub fn new(bus: BusRef) -> Self {
        Self {
            inner: Rc::new(ContainerInner {
                bus,
                daemon: Cell::new(false),
                main: RefCell::new(None),
                named: RefCell::new(HashMap::new()),
                current: Cell::new(None),
                event: RefCell::new(None),
                matcher: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<ContainerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContainerInner> {
        Rc::downgrade(&self.inner)
    }

    #[inline]
    pub fn bus(&self) -> &BusRef {
        &self.inner.bus
    }

    /// Makes the main routine a daemon; applies to the next [`start`](Self::start).
    pub fn set_daemon(&self, daemon: bool) {
        self.inner.daemon.set(daemon);
    }

    /// Starts `main` as the container's main routine.
    ///
    /// The handle is stored before the body runs. With `async_start = false`
    /// the first step runs before this returns and its failure is returned.
    pub fn start<F, Fut>(&self, async_start: bool, main: F) -> Result<Routine, RoutineError>
    where
        F: FnOnce(RoutineCtx) -> Fut,
        Fut: Future<Output = Result<(), RoutineError>> + 'static,
    {
        let options = RoutineOptions {
            async_start,
            manual_start: true,
            daemon: self.inner.daemon.get(),
        };
        let routine = Routine::spawn(self.inner.bus.clone(), options, Some(self), main)?;
        *self.inner.main.borrow_mut() = Some(routine.clone());
        tracing::debug!(routine = %routine.id(), async_start, "container main routine");
        routine.start()?;
        Ok(routine)
    }

    /// Starts `body` as a sub-routine.
    ///
    /// A `name` makes the routine reachable through [`routine`](Self::routine);
    /// the handle is stored before the body runs. `options.manual_start` is
    /// ignored: the routine is always started here.
    pub fn subroutine<F, Fut>(
        &self,
        options: RoutineOptions,
        name: Option<&str>,
        body: F,
    ) -> Result<Routine, RoutineError>
    where
        F: FnOnce(RoutineCtx) -> Fut,
        Fut: Future<Output = Result<(), RoutineError>> + 'static,
    {
        let options = RoutineOptions {
            manual_start: true,
            ..options
        };
        let routine = Routine::spawn(self.inner.bus.clone(), options, Some(self), body)?;
        if let Some(name) = name {
            let replaced = self
                .inner
                .named
                .borrow_mut()
                .insert(name.to_string(), routine.clone());
            if replaced.is_some() {
                tracing::debug!(name, "named sub-routine replaced");
            }
        }
        routine.start()?;
        Ok(routine)
    }

    /// Starts an anonymous sub-routine with default options (asynchronous start).
    pub fn spawn<F, Fut>(&self, body: F) -> Result<Routine, RoutineError>
    where
        F: FnOnce(RoutineCtx) -> Fut,
        Fut: Future<Output = Result<(), RoutineError>> + 'static,
    {
        self.subroutine(RoutineOptions::default(), None, body)
    }

    /// Looks up a named sub-routine.
    pub fn routine(&self, name: &str) -> Option<Routine> {
        self.inner.named.borrow().get(name).cloned()
    }

    pub fn main_routine(&self) -> Option<Routine> {
        self.inner.main.borrow().clone()
    }

    /// Closes `routine`, or the main routine when `None`.
    pub fn terminate(&self, routine: Option<&Routine>) -> Result<(), RoutineError> {
        let target = match routine {
            Some(r) => Some(r.clone()),
            None => self.main_routine(),
        };
        match target {
            Some(r) => r.close(),
            None => Ok(()),
        }
    }

    /// Routine of this container that was resumed last.
    pub fn current_routine(&self) -> Option<ListenerId> {
        self.inner.current.get()
    }

    /// Event of the last delivery to any routine of this container.
    pub fn event(&self) -> Option<EventRef> {
        self.inner.event.borrow().clone()
    }

    /// Condition of the last delivery to any routine of this container.
    pub fn matcher(&self) -> Option<Matcher> {
        self.inner.matcher.borrow().clone()
    }
}
