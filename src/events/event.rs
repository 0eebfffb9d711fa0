//! # Events, conditions and wait-sets.
//!
//! The [`Event`] struct is a typed value: an [`EventKind`] plus named [`Value`]
//! fields. A [`Matcher`] (wait-condition) names a kind and narrows it by field
//! values; fields the matcher does not mention act as wildcards.
//!
//! A [`WaitSet`] is the group of matchers a routine is suspended on.
//!
//! ## Rules
//! - Matchers are pure values: `Eq + Hash`, independent of field insertion order.
//! - Events are shared by reference ([`EventRef`]) between every listener they match.
//! - `canignore` is the only mutable part of an event visible to listeners; the
//!   one-shot `retvalue` payload is taken by whoever consumes it.
//!
//! ## Example
//! ```rust
//! use cotask::{Event, EventKind, Matcher};
//!
//! const MESSAGE: EventKind = EventKind::new("message");
//!
//! let ev = Event::new(MESSAGE).with("conn", 7u64).with("type", "data");
//! assert!(ev.matches(&Matcher::new(MESSAGE)));
//! assert!(ev.matches(&Matcher::new(MESSAGE).with("conn", 7u64)));
//! assert!(!ev.matches(&Matcher::new(MESSAGE).with("conn", 8u64)));
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::bus::ListenerId;
use crate::error::RoutineError;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Shared handle to a delivered event.
pub type EventRef = Rc<Event>;

/// Classification of events.
///
/// Applications declare their own kinds as constants; the crate's built-in
/// kinds live in [`control`](crate::events::control).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKind(&'static str);

impl EventKind {
    /// Declares an event kind.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the kind name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A field value of an event or matcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Str(Arc<str>),
    /// Identity of a routine or handler (scopes control events to one listener).
    Listener(ListenerId),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Listener(id) => write!(f, "{id}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(u64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v.into())
    }
}

impl From<ListenerId> for Value {
    fn from(v: ListenerId) -> Self {
        Value::Listener(v)
    }
}

/// Wait-condition: an event kind narrowed by field values.
///
/// Fields are kept sorted by name, so two matchers built with the same fields
/// in a different order are equal and hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Matcher {
    kind: EventKind,
    fields: Vec<(&'static str, Value)>,
}

impl Matcher {
    /// Matches every event of `kind`.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    /// Narrows the matcher to events whose field `name` equals `value`.
    ///
    /// Setting the same field twice keeps the last value.
    #[must_use]
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.fields.binary_search_by(|(n, _)| n.cmp(&name)) {
            Ok(pos) => self.fields[pos].1 = value,
            Err(pos) => self.fields.insert(pos, (name, value)),
        }
        self
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the narrowing fields, sorted by name.
    #[inline]
    pub fn fields(&self) -> &[(&'static str, Value)] {
        &self.fields
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str(")")
    }
}

/// Typed event value delivered by the bus.
///
/// - `seq`: monotonic global sequence (ordering in logs)
/// - `canignore`: the bus may drop the event silently when nothing matches it
/// - `retvalue` / `exception`: optional payload for cross-context results
pub struct Event {
    seq: u64,
    kind: EventKind,
    fields: BTreeMap<&'static str, Value>,
    canignore: Cell<bool>,
    retvalue: RefCell<Option<Box<dyn Any>>>,
    exception: Option<RoutineError>,
}

impl Event {
    /// Creates an event of `kind` with the next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            kind,
            fields: BTreeMap::new(),
            canignore: Cell::new(false),
            retvalue: RefCell::new(None),
            exception: None,
        }
    }

    /// Attaches a field.
    #[inline]
    #[must_use]
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.fields.insert(name, value.into());
        self
    }

    /// Sets the initial `canignore` flag.
    #[inline]
    #[must_use]
    pub fn with_canignore(self, canignore: bool) -> Self {
        self.canignore.set(canignore);
        self
    }

    /// Attaches a result payload.
    #[inline]
    #[must_use]
    pub fn with_retvalue<T: 'static>(self, value: T) -> Self {
        self.with_boxed_retvalue(Box::new(value))
    }

    /// Attaches an already boxed result payload.
    #[inline]
    #[must_use]
    pub fn with_boxed_retvalue(self, value: Box<dyn Any>) -> Self {
        *self.retvalue.borrow_mut() = Some(value);
        self
    }

    /// Attaches an error payload.
    #[inline]
    #[must_use]
    pub fn with_exception(mut self, error: RoutineError) -> Self {
        self.exception = Some(error);
        self
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns field `name`, if set.
    #[inline]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[inline]
    pub fn canignore(&self) -> bool {
        self.canignore.get()
    }

    /// Marks the event as safe to drop when nothing (else) matches it.
    #[inline]
    pub fn set_canignore(&self, canignore: bool) {
        self.canignore.set(canignore);
    }

    /// Returns `true` if `matcher` accepts this event.
    pub fn matches(&self, matcher: &Matcher) -> bool {
        matcher.kind == self.kind
            && matcher
                .fields
                .iter()
                .all(|(name, value)| self.fields.get(name) == Some(value))
    }

    /// Returns the error payload, if any.
    #[inline]
    pub fn exception(&self) -> Option<&RoutineError> {
        self.exception.as_ref()
    }

    /// Returns `true` while a result payload is attached and not yet taken.
    pub fn has_retvalue(&self) -> bool {
        self.retvalue.borrow().is_some()
    }

    /// Takes the result payload as `T`.
    ///
    /// Fails with [`RoutineError::UnexpectedPayload`] when the payload is missing,
    /// already taken, or of another type (a mismatched payload is left in place).
    pub fn take_retvalue<T: 'static>(&self) -> Result<T, RoutineError> {
        let mut slot = self.retvalue.borrow_mut();
        match slot.take().map(|v| v.downcast::<T>()) {
            Some(Ok(v)) => Ok(*v),
            Some(Err(v)) => {
                *slot = Some(v);
                Err(RoutineError::UnexpectedPayload {
                    expected: std::any::type_name::<T>(),
                })
            }
            None => Err(RoutineError::UnexpectedPayload {
                expected: std::any::type_name::<T>(),
            }),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("seq", &self.seq)
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .field("canignore", &self.canignore.get())
            .field("retvalue", &self.has_retvalue())
            .field("exception", &self.exception)
            .finish()
    }
}

/// The conditions a routine is suspended on.
///
/// Order is preserved; the same matcher may appear more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitSet(Vec<Matcher>);

impl WaitSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn contains(&self, matcher: &Matcher) -> bool {
        self.0.contains(matcher)
    }

    pub fn push(&mut self, matcher: Matcher) {
        self.0.push(matcher);
    }

    /// Appends every matcher of `other`.
    pub fn extend_from(&mut self, other: &WaitSet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Removes the first occurrence of `matcher`; returns whether one was found.
    pub fn remove_one(&mut self, matcher: &Matcher) -> bool {
        match self.0.iter().position(|m| m == matcher) {
            Some(pos) => {
                self.0.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Matcher> {
        self.0.iter()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Matcher] {
        &self.0
    }
}

impl fmt::Display for WaitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, m) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{m}")?;
        }
        f.write_str("}")
    }
}

impl From<Matcher> for WaitSet {
    fn from(m: Matcher) -> Self {
        Self(vec![m])
    }
}

impl From<Vec<Matcher>> for WaitSet {
    fn from(v: Vec<Matcher>) -> Self {
        Self(v)
    }
}

impl<const N: usize> From<[Matcher; N]> for WaitSet {
    fn from(v: [Matcher; N]) -> Self {
        Self(v.into())
    }
}

impl From<&[Matcher]> for WaitSet {
    fn from(v: &[Matcher]) -> Self {
        Self(v.to_vec())
    }
}

impl From<&WaitSet> for WaitSet {
    fn from(v: &WaitSet) -> Self {
        v.clone()
    }
}

impl FromIterator<Matcher> for WaitSet {
    fn from_iter<I: IntoIterator<Item = Matcher>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for WaitSet {
    type Item = Matcher;
    type IntoIter = std::vec::IntoIter<Matcher>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a WaitSet {
    type Item = &'a Matcher;
    type IntoIter = std::slice::Iter<'a, Matcher>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: EventKind = EventKind::new("data");

    #[test]
    fn test_matcher_field_order_is_irrelevant() {
        let a = Matcher::new(DATA).with("conn", 1u64).with("type", "x");
        let b = Matcher::new(DATA).with("type", "x").with("conn", 1u64);
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_omitted_fields_are_wildcards() {
        let ev = Event::new(DATA).with("conn", 1u64).with("type", "x");
        assert!(ev.matches(&Matcher::new(DATA)));
        assert!(ev.matches(&Matcher::new(DATA).with("type", "x")));
        assert!(!ev.matches(&Matcher::new(DATA).with("missing", true)));
        assert!(!ev.matches(&Matcher::new(EventKind::new("other"))));
    }

    #[test]
    fn test_retvalue_is_one_shot_and_typed() {
        let ev = Event::new(DATA).with_retvalue(42u32);
        assert!(matches!(
            ev.take_retvalue::<String>(),
            Err(RoutineError::UnexpectedPayload { .. })
        ));
        assert!(ev.has_retvalue());
        assert_eq!(ev.take_retvalue::<u32>().unwrap(), 42);
        assert!(!ev.has_retvalue());
        assert!(ev.take_retvalue::<u32>().is_err());
    }

    #[test]
    fn test_waitset_remove_one() {
        let m = Matcher::new(DATA);
        let mut ws = WaitSet::from([m.clone(), m.clone()]);
        assert!(ws.remove_one(&m));
        assert_eq!(ws.len(), 1);
        assert!(ws.remove_one(&m));
        assert!(!ws.remove_one(&m));
        assert!(ws.is_empty());
    }

    #[test]
    fn test_display() {
        let m = Matcher::new(DATA).with("conn", 3u64).with("type", "x");
        assert_eq!(m.to_string(), "data(conn=3, type=\"x\")");
        let ws = WaitSet::from([m, Matcher::new(DATA)]);
        assert_eq!(ws.to_string(), "{data(conn=3, type=\"x\"), data()}");
    }
}
