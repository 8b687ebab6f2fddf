//! Core types for the state history engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Dense integer identifier for one attribute in the namespace.
///
/// Quarks are assigned by the attribute tree the first time a path is
/// used and stay stable for the lifetime of the state system.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quark(pub u32);

impl Quark {
    /// Index into per-quark tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quark({})", self.0)
    }
}

impl fmt::Display for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point on the trace's time axis.
///
/// The engine treats timestamps as opaque ordered ticks; producers decide
/// the unit (the usual one is nanoseconds since the trace start).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The tick immediately after this one.
    pub fn next(self) -> Self {
        Timestamp(self.0 + 1)
    }

    /// The tick immediately before this one.
    pub fn prev(self) -> Self {
        Timestamp(self.0 - 1)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ts({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The value held by an attribute at an instant.
///
/// A closed tagged union; attributes are not statically typed, but the
/// variant is fixed for the duration of one open interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum StateValue {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
}

impl StateValue {
    /// Name of the variant, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Int(_) => "int",
            StateValue::Long(_) => "long",
            StateValue::Double(_) => "double",
            StateValue::Str(_) => "string",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            StateValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            StateValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Whether two values may share one open interval. Null is compatible
    /// with every variant; anything else must match exactly.
    pub fn same_type_as(&self, other: &StateValue) -> bool {
        self.is_null() || other.is_null() || self.type_name() == other.type_name()
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Str(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Str(v)
    }
}

/// A closed time range during which one attribute held one value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub quark: Quark,
    pub start: Timestamp,
    pub end: Timestamp,
    pub value: StateValue,
}

impl Interval {
    pub fn new(quark: Quark, start: Timestamp, end: Timestamp, value: StateValue) -> Self {
        Self {
            quark,
            start,
            end,
            value,
        }
    }

    /// True if `t` falls inside `[start, end]`.
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// True if this interval overlaps the closed range `[from, to]`.
    pub fn intersects(&self, from: Timestamp, to: Timestamp) -> bool {
        self.start <= to && from <= self.end
    }
}

/// A state change produced by an analysis module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replace the attribute's current value.
    Set(StateValue),
    /// Add a delta to the attribute's current numeric value.
    Increment(i64),
}

/// One timestamped attribute mutation, as fed by a producer.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub timestamp: Timestamp,
    pub path: Vec<String>,
    pub mutation: Mutation,
}

impl Event {
    pub fn set(timestamp: Timestamp, path: &[&str], value: StateValue) -> Self {
        Self {
            timestamp,
            path: path.iter().map(|s| s.to_string()).collect(),
            mutation: Mutation::Set(value),
        }
    }

    pub fn increment(timestamp: Timestamp, path: &[&str], delta: i64) -> Self {
        Self {
            timestamp,
            path: path.iter().map(|s| s.to_string()).collect(),
            mutation: Mutation::Increment(delta),
        }
    }
}

/// Cooperative cancellation for producer loops.
///
/// The engine itself is synchronous; only the production of events is
/// cancellable. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
