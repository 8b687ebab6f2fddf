//! Transient (ongoing) state held while a history is being built.
//!
//! Punctual state changes become intervals here: each attribute keeps its
//! current value and the time that value became active. When a change
//! arrives, the previous value is closed off as an interval ending one
//! tick before the change and pushed to the backend, and the new value
//! becomes the open one.

use crate::backend::HistoryBackend;
use crate::error::{Result, StateError};
use crate::types::{Interval, Quark, StateValue, Timestamp};

/// Open state of one attribute.
#[derive(Debug, Clone)]
struct Entry {
    value: StateValue,
    start: Timestamp,
    /// False until the attribute sees its first explicit change. An
    /// untouched attribute has no observable state: it is skipped at
    /// close and queries report it as having no data.
    touched: bool,
}

/// Per-attribute open intervals, one entry per known quark.
#[derive(Debug)]
pub struct TransientState {
    entries: Vec<Entry>,
    origin: Timestamp,
    latest: Timestamp,
    active: bool,
}

impl TransientState {
    /// `origin` is where new attributes' state begins: the history start
    /// for fresh systems, one past the recovered end for resumed ones.
    pub fn new(origin: Timestamp) -> Self {
        Self {
            entries: Vec::new(),
            origin,
            latest: origin,
            active: true,
        }
    }

    /// Grow the per-quark tables after the attribute tree created a new
    /// attribute, keeping both sides in sync.
    pub fn add_empty_entry(&mut self) {
        self.entries.push(Entry {
            value: StateValue::Null,
            start: self.origin,
            touched: false,
        });
    }

    /// Number of known attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_inactive(&mut self) {
        self.active = false;
    }

    /// Latest timestamp seen so far.
    pub fn latest_time(&self) -> Timestamp {
        self.latest
    }

    pub fn ongoing_value(&self, quark: Quark) -> Option<&StateValue> {
        self.entries.get(quark.index()).map(|e| &e.value)
    }

    pub fn ongoing_start(&self, quark: Quark) -> Option<Timestamp> {
        self.entries.get(quark.index()).map(|e| e.start)
    }

    /// The open interval covering `t`, as a dummy interval whose end is
    /// the latest time seen. None if the open state starts after `t`, the
    /// attribute was never changed, or building has stopped.
    pub fn interval_at(&self, quark: Quark, t: Timestamp) -> Option<Interval> {
        if !self.active {
            return None;
        }
        let entry = self.entries.get(quark.index())?;
        if !entry.touched || t < entry.start {
            return None;
        }
        Some(Interval::new(quark, entry.start, self.latest, entry.value.clone()))
    }

    /// Apply a state change: close the previous interval (if any time has
    /// passed) into `backend` and open the new value at `t`.
    pub fn process_state_change(
        &mut self,
        backend: &dyn HistoryBackend,
        quark: Quark,
        t: Timestamp,
        value: StateValue,
        merge_identical: bool,
    ) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        let entry = &mut self.entries[quark.index()];

        let out_of_order = if entry.touched {
            t <= entry.start
        } else {
            t < entry.start
        };
        if out_of_order {
            return Err(StateError::OutOfOrderTimestamp {
                quark,
                time: t,
                ongoing_start: entry.start,
            });
        }

        if merge_identical && entry.value == value {
            // Same value: keep the current interval going.
            return Ok(());
        }

        if t > entry.start {
            backend.insert(Interval::new(
                quark,
                entry.start,
                t.prev(),
                entry.value.clone(),
            ))?;
            entry.start = t;
        }
        entry.value = value;
        entry.touched = true;

        if t > self.latest {
            self.latest = t;
        }
        Ok(())
    }

    /// Replace the open value without closing the interval. The variant
    /// must stay compatible with the open one: the value type is fixed
    /// for the duration of an open interval.
    pub fn update_ongoing(&mut self, quark: Quark, value: StateValue) -> Result<()> {
        let entry = &mut self.entries[quark.index()];
        if !value.same_type_as(&entry.value) {
            return Err(StateError::StateValueTypeMismatch {
                quark,
                got: value.type_name(),
                expected: entry.value.type_name(),
            });
        }
        if !value.is_null() {
            entry.touched = true;
        }
        entry.value = value;
        Ok(())
    }

    /// Close every still-open interval at `end` and flush them to the
    /// backend. Untouched attributes never had observable state and are
    /// skipped, as are entries whose state starts after `end`.
    pub fn close(&mut self, backend: &dyn HistoryBackend, end: Timestamp) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.touched || entry.start > end {
                continue;
            }
            backend.insert(Interval::new(
                Quark(i as u32),
                entry.start,
                end,
                entry.value.clone(),
            ))?;
        }
        self.entries.clear();
        self.active = false;
        Ok(())
    }
}
