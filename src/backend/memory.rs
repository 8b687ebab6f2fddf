//! In-memory interval backend.
//!
//! A per-quark ordered sequence of closed intervals kept in a map. Pushes
//! append in O(1) amortized; point queries binary-search on start times,
//! which are sorted by construction.

use crate::backend::HistoryBackend;
use crate::error::{Result, StateError};
use crate::types::{Interval, Quark, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Interval store backed by per-quark vectors.
pub struct InMemoryBackend {
    start: Timestamp,
    end: RwLock<Timestamp>,
    intervals: RwLock<HashMap<Quark, Vec<Interval>>>,
}

impl InMemoryBackend {
    /// Create an empty store covering times from `start` on.
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            end: RwLock::new(start),
            intervals: RwLock::new(HashMap::new()),
        }
    }

    /// Total number of stored intervals, across all quarks.
    pub fn interval_count(&self) -> usize {
        self.intervals.read().values().map(Vec::len).sum()
    }
}

impl HistoryBackend for InMemoryBackend {
    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        *self.end.read()
    }

    fn insert(&self, interval: Interval) -> Result<()> {
        if interval.start > interval.end {
            return Err(StateError::InvalidRange(interval.start, interval.end));
        }
        if interval.start < self.start {
            return Err(StateError::TimeRangeOutOfBounds(
                interval.start,
                self.start,
                self.end_time(),
            ));
        }

        let mut end = self.end.write();
        if interval.end > *end {
            *end = interval.end;
        }

        self.intervals
            .write()
            .entry(interval.quark)
            .or_default()
            .push(interval);
        Ok(())
    }

    fn finish_building(&self, end: Timestamp) -> Result<()> {
        let mut current = self.end.write();
        if end > *current {
            *current = end;
        }
        Ok(())
    }

    fn max_quark(&self) -> Option<Quark> {
        self.intervals.read().keys().max().copied()
    }

    fn query_at(&self, quark: Quark, t: Timestamp) -> Result<Option<Interval>> {
        let intervals = self.intervals.read();
        let Some(seq) = intervals.get(&quark) else {
            return Ok(None);
        };

        // Index of the last interval with start <= t.
        let idx = seq.partition_point(|iv| iv.start <= t);
        if idx == 0 {
            return Ok(None);
        }
        let candidate = &seq[idx - 1];
        if candidate.contains(t) {
            Ok(Some(candidate.clone()))
        } else {
            Ok(None)
        }
    }
}
