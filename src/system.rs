//! The state system: attribute namespace, single-writer builder, and the
//! concurrent query surface, tied to one interval backend.
//!
//! Constructors return the one `StateBuilder` handle together with a
//! cloneable `StateSystem` reader. The single-writer rule is enforced by
//! construction: `StateBuilder` is not `Clone`, and closing the history
//! consumes it.

use crate::attributes::AttributeTree;
use crate::backend::memory::InMemoryBackend;
use crate::backend::tree::{HistoryTreeBackend, TreeConfig};
use crate::backend::HistoryBackend;
use crate::error::{Result, StateError};
use crate::transient::TransientState;
use crate::types::{CancellationToken, Event, Interval, Mutation, Quark, StateValue, Timestamp};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// State system configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Start of the history's time range.
    pub start_time: Timestamp,

    /// Skip interval creation when a change carries the value already
    /// held. A size optimization, not a correctness requirement.
    pub merge_identical: bool,
}

impl Config {
    pub fn new(start_time: Timestamp) -> Self {
        Self {
            start_time,
            merge_identical: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Timestamp(0))
    }
}

struct Inner {
    merge_identical: bool,
    attributes: RwLock<AttributeTree>,
    transient: RwLock<TransientState>,
    backend: Box<dyn HistoryBackend>,
    disposed: AtomicBool,
}

impl Inner {
    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StateError::StateSystemDisposed)
        } else {
            Ok(())
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.transient.write().set_inactive();
        self.backend.dispose();
    }
}

/// Read-only handle over a state system. Cheap to clone; clones stay
/// valid until the system is disposed.
#[derive(Clone)]
pub struct StateSystem {
    inner: Arc<Inner>,
}

/// The single writer of a state system.
pub struct StateBuilder {
    inner: Arc<Inner>,
}

impl StateSystem {
    /// Create a state system over the in-memory backend.
    pub fn in_memory(config: Config) -> (StateBuilder, StateSystem) {
        let backend = Box::new(InMemoryBackend::new(config.start_time));
        Self::with_backend(&config, backend, config.start_time)
    }

    /// Create a state system over a new disk-backed history tree.
    pub fn disk_backed(config: Config, tree: TreeConfig) -> Result<(StateBuilder, StateSystem)> {
        let backend = Box::new(HistoryTreeBackend::create(tree, config.start_time)?);
        Ok(Self::with_backend(&config, backend, config.start_time))
    }

    /// Reopen an existing history file for querying only.
    ///
    /// The attribute tree is not persisted in the file, so attributes are
    /// addressed by quark; path lookups resolve nothing.
    pub fn open(tree: TreeConfig) -> Result<StateSystem> {
        let backend = Box::new(HistoryTreeBackend::open(tree)?);
        let origin = backend.start_time();
        let (_builder, system) = Self::with_backend(&Config::new(origin), backend, origin);
        system.inner.transient.write().set_inactive();
        Ok(system)
    }

    /// Reopen an existing history file and resume building after its
    /// recovered end (a file truncated mid-node is trimmed back to its
    /// last complete node first). New mutations must carry timestamps
    /// past the recovered end; the producer is expected to re-register
    /// its attribute paths, which re-yields the same quarks.
    pub fn resume(config: Config, tree: TreeConfig) -> Result<(StateBuilder, StateSystem)> {
        let backend = HistoryTreeBackend::open(tree)?;
        let origin = if backend.node_count() == 0 {
            backend.start_time()
        } else {
            backend.end_time().next()
        };
        Ok(Self::with_backend(&config, Box::new(backend), origin))
    }

    fn with_backend(
        config: &Config,
        backend: Box<dyn HistoryBackend>,
        transient_origin: Timestamp,
    ) -> (StateBuilder, StateSystem) {
        let inner = Arc::new(Inner {
            merge_identical: config.merge_identical,
            attributes: RwLock::new(AttributeTree::new()),
            transient: RwLock::new(TransientState::new(transient_origin)),
            backend,
            disposed: AtomicBool::new(false),
        });
        (
            StateBuilder {
                inner: Arc::clone(&inner),
            },
            StateSystem { inner },
        )
    }

    // --- Lifecycle ---

    /// Start of the history's time range.
    pub fn start_time(&self) -> Timestamp {
        self.inner.backend.start_time()
    }

    /// The latest queryable timestamp: the latest event seen while
    /// building, or the final end once closed.
    pub fn current_end_time(&self) -> Timestamp {
        let transient = self.inner.transient.read();
        let committed = self.inner.backend.end_time();
        if transient.is_active() {
            committed.max(transient.latest_time())
        } else {
            committed
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Drop the system's data. All subsequent queries and mutations fail
    /// with `StateSystemDisposed`.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    // --- Attribute namespace (read side) ---

    pub fn get_quark(&self, path: &[&str]) -> Option<Quark> {
        self.inner.attributes.read().get_quark(path)
    }

    pub fn get_quark_relative(&self, base: Quark, path: &[&str]) -> Option<Quark> {
        self.inner.attributes.read().get_relative(base, path)
    }

    /// Direct children of `quark`, in insertion order.
    pub fn children_of(&self, quark: Quark) -> Vec<Quark> {
        self.inner.attributes.read().children_of(quark).to_vec()
    }

    /// Top-level attributes, in insertion order.
    pub fn root_attributes(&self) -> Vec<Quark> {
        self.inner.attributes.read().roots().to_vec()
    }

    pub fn parent_of(&self, quark: Quark) -> Option<Quark> {
        self.inner.attributes.read().parent_of(quark)
    }

    pub fn attribute_name(&self, quark: Quark) -> String {
        self.inner.attributes.read().name_of(quark).to_string()
    }

    /// Dotted full path of `quark`.
    pub fn full_path(&self, quark: Quark) -> String {
        self.inner.attributes.read().full_path(quark)
    }

    pub fn attribute_count(&self) -> usize {
        self.inner.attributes.read().len()
    }

    // --- Queries ---

    /// The interval covering `t` for one attribute.
    pub fn query_single_state(&self, quark: Quark, t: Timestamp) -> Result<Interval> {
        self.inner.check_disposed()?;
        let start = self.start_time();
        let end = self.current_end_time();
        if t < start || t > end {
            return Err(StateError::TimeRangeOutOfBounds(t, start, end));
        }

        {
            let transient = self.inner.transient.read();
            if let Some(interval) = transient.interval_at(quark, t) {
                return Ok(interval);
            }
        }

        match self.inner.backend.query_at(quark, t)? {
            Some(interval) => Ok(interval),
            None => Err(StateError::AttributeNotFound(quark, t)),
        }
    }

    /// One interval per quark holding data at `t`, ordered by quark.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<Interval>> {
        self.inner.check_disposed()?;
        let start = self.start_time();
        let end = self.current_end_time();
        if t < start || t > end {
            return Err(StateError::TimeRangeOutOfBounds(t, start, end));
        }
        let known = self.attribute_count();
        let stored = self
            .inner
            .backend
            .max_quark()
            .map_or(0, |q| q.index() + 1);

        let mut state = Vec::new();
        for index in 0..known.max(stored) {
            match self.query_single_state(Quark(index as u32), t) {
                Ok(interval) => state.push(interval),
                Err(StateError::AttributeNotFound(_, _)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(state)
    }

    /// Every interval of `quark` intersecting `[from, to]`, lazily, in
    /// start-time order. The iterator is restartable and can be cloned.
    pub fn query_range(&self, quark: Quark, from: Timestamp, to: Timestamp) -> Result<RangeQuery> {
        self.inner.check_disposed()?;
        if from > to {
            return Err(StateError::InvalidRange(from, to));
        }
        let start = self.start_time();
        let end = self.current_end_time();
        if from < start || to > end {
            return Err(StateError::TimeRangeOutOfBounds(
                if from < start { from } else { to },
                start,
                end,
            ));
        }
        Ok(RangeQuery {
            system: self.clone(),
            quark,
            from,
            to,
            cursor: from,
            done: false,
        })
    }
}

/// Lazy range query over one attribute. Produced by
/// [`StateSystem::query_range`].
#[derive(Clone)]
pub struct RangeQuery {
    system: StateSystem,
    quark: Quark,
    from: Timestamp,
    to: Timestamp,
    cursor: Timestamp,
    done: bool,
}

impl RangeQuery {
    /// Reset the cursor to the beginning of the range.
    pub fn restart(&mut self) {
        self.cursor = self.from;
        self.done = false;
    }
}

impl Iterator for RangeQuery {
    type Item = Result<Interval>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.system.query_single_state(self.quark, self.cursor) {
            Ok(interval) => {
                if interval.end >= self.to {
                    self.done = true;
                } else {
                    self.cursor = interval.end.next();
                }
                Some(Ok(interval))
            }
            Err(StateError::AttributeNotFound(_, _)) => {
                // No data at the cursor; the attribute has nothing more
                // inside the range.
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl StateBuilder {
    /// A reader over the same system.
    pub fn system(&self) -> StateSystem {
        StateSystem {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Resolve an attribute path, creating it on first use.
    pub fn get_or_create_quark(&mut self, path: &[&str]) -> Result<Quark> {
        self.inner.check_disposed()?;
        let mut attributes = self.inner.attributes.write();
        let before = attributes.len();
        let quark = attributes.get_or_create_quark(path);
        self.sync_new_attributes(before, attributes.len());
        Ok(quark)
    }

    /// Resolve a sub-path anchored at `base`, creating it on first use.
    pub fn get_or_create_relative(&mut self, base: Quark, path: &[&str]) -> Result<Quark> {
        self.inner.check_disposed()?;
        let mut attributes = self.inner.attributes.write();
        let before = attributes.len();
        let quark = attributes.get_or_create_relative(base, path);
        self.sync_new_attributes(before, attributes.len());
        Ok(quark)
    }

    /// Keep the transient per-quark tables in sync with newly created
    /// attributes.
    fn sync_new_attributes(&self, before: usize, after: usize) {
        if after > before {
            let mut transient = self.inner.transient.write();
            for _ in before..after {
                transient.add_empty_entry();
            }
        }
    }

    /// Change the value of an attribute at `t`, closing the interval the
    /// previous value occupied.
    pub fn modify_attribute(
        &mut self,
        quark: Quark,
        t: Timestamp,
        value: impl Into<StateValue>,
    ) -> Result<()> {
        self.inner.check_disposed()?;
        let result = self.inner.transient.write().process_state_change(
            self.inner.backend.as_ref(),
            quark,
            t,
            value.into(),
            self.inner.merge_identical,
        );
        self.fail_fatally(result)
    }

    /// Add `delta` to the attribute's current numeric value. An absent or
    /// null value counts as zero.
    pub fn increment_attribute(&mut self, quark: Quark, t: Timestamp, delta: i64) -> Result<()> {
        self.inner.check_disposed()?;

        let new_value = {
            let transient = self.inner.transient.read();
            let current = transient
                .ongoing_value(quark)
                .ok_or(StateError::AttributeNotFound(quark, t))?;
            match current {
                StateValue::Null => narrowed(delta),
                StateValue::Int(v) => narrowed(*v as i64 + delta),
                StateValue::Long(v) => StateValue::Long(v.saturating_add(delta)),
                other => {
                    let e = Err(StateError::StateValueTypeMismatch {
                        quark,
                        got: other.type_name(),
                        expected: "int or long",
                    });
                    drop(transient);
                    return self.fail_fatally(e);
                }
            }
        };

        let result = self.inner.transient.write().process_state_change(
            self.inner.backend.as_ref(),
            quark,
            t,
            new_value,
            self.inner.merge_identical,
        );
        self.fail_fatally(result)
    }

    /// Replace the open value without creating an interval. The value
    /// type must match the open interval's.
    pub fn update_ongoing(&mut self, quark: Quark, value: impl Into<StateValue>) -> Result<()> {
        self.inner.check_disposed()?;
        let result = self.inner.transient.write().update_ongoing(quark, value.into());
        self.fail_fatally(result)
    }

    /// Set the attribute and its whole subtree to null at `t`. The
    /// attribute tree itself never shrinks.
    pub fn remove_attribute(&mut self, quark: Quark, t: Timestamp) -> Result<()> {
        self.inner.check_disposed()?;
        let subtree = {
            let attributes = self.inner.attributes.read();
            let mut stack = vec![quark];
            let mut order = Vec::new();
            while let Some(q) = stack.pop() {
                // Children are nullified before their parent.
                for &child in attributes.children_of(q) {
                    stack.push(child);
                }
                order.push(q);
            }
            order
        };
        for &q in subtree.iter().rev() {
            let result = self.inner.transient.write().process_state_change(
                self.inner.backend.as_ref(),
                q,
                t,
                StateValue::Null,
                self.inner.merge_identical,
            );
            self.fail_fatally(result)?;
        }
        Ok(())
    }

    /// The attribute's current open value.
    pub fn query_ongoing(&self, quark: Quark) -> Result<StateValue> {
        self.inner.check_disposed()?;
        let transient = self.inner.transient.read();
        transient
            .ongoing_value(quark)
            .cloned()
            .ok_or_else(|| StateError::AttributeNotFound(quark, transient.latest_time()))
    }

    /// Since when the attribute has held its current open value.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<Timestamp> {
        self.inner.check_disposed()?;
        let transient = self.inner.transient.read();
        transient
            .ongoing_start(quark)
            .ok_or_else(|| StateError::AttributeNotFound(quark, transient.latest_time()))
    }

    /// Producer entry point: map the path to a quark (creating it on
    /// first use) and apply the mutation.
    pub fn apply_event(&mut self, t: Timestamp, path: &[&str], mutation: Mutation) -> Result<()> {
        let quark = self.get_or_create_quark(path)?;
        match mutation {
            Mutation::Set(value) => self.modify_attribute(quark, t, value),
            Mutation::Increment(delta) => self.increment_attribute(quark, t, delta),
        }
    }

    /// Feed a stream of events until it ends or `token` is cancelled.
    /// Returns whether the stream was fully consumed.
    pub fn drive(
        &mut self,
        events: impl IntoIterator<Item = Event>,
        token: &CancellationToken,
    ) -> Result<bool> {
        for event in events {
            if token.is_cancelled() {
                debug!("event production cancelled");
                return Ok(false);
            }
            let path: Vec<&str> = event.path.iter().map(String::as_str).collect();
            self.apply_event(event.timestamp, &path, event.mutation)?;
        }
        Ok(true)
    }

    /// Close the history at `end` (or at the latest event seen, if that
    /// is later): every still-open interval is flushed and the backend
    /// sealed. Consuming the builder makes further mutation impossible;
    /// readers keep working.
    pub fn close(self, end: Timestamp) -> Result<()> {
        self.inner.check_disposed()?;
        let effective = {
            let mut transient = self.inner.transient.write();
            let effective = end
                .max(transient.latest_time())
                .max(self.inner.backend.end_time());
            transient.close(self.inner.backend.as_ref(), effective)?;
            effective
        };
        self.inner.backend.finish_building(effective)?;
        debug!(end = %effective, "state history closed");
        Ok(())
    }

    /// Producer-side errors are fatal to the build: the system is
    /// disposed before the error is surfaced.
    fn fail_fatally(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            self.inner.dispose();
            return Err(e);
        }
        Ok(())
    }
}

/// Smallest numeric variant holding `v`: int when it fits, long
/// otherwise.
fn narrowed(v: i64) -> StateValue {
    match i32::try_from(v) {
        Ok(small) => StateValue::Int(small),
        Err(_) => StateValue::Long(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_reader_roundtrip() {
        let (mut builder, system) = StateSystem::in_memory(Config::default());
        let quark = builder.get_or_create_quark(&["CPUs", "0", "Status"]).unwrap();
        builder.modify_attribute(quark, Timestamp(10), 1i32).unwrap();
        builder.modify_attribute(quark, Timestamp(20), 2i32).unwrap();
        builder.close(Timestamp(30)).unwrap();

        let interval = system.query_single_state(quark, Timestamp(15)).unwrap();
        assert_eq!(interval.value, StateValue::Int(1));
        assert_eq!((interval.start, interval.end), (Timestamp(10), Timestamp(19)));

        let last = system.query_single_state(quark, Timestamp(30)).unwrap();
        assert_eq!(last.value, StateValue::Int(2));
        assert_eq!(last.end, Timestamp(30));
    }

    #[test]
    fn test_ongoing_query_during_build() {
        let (mut builder, system) = StateSystem::in_memory(Config::default());
        let quark = builder.get_or_create_quark(&["Threads", "7"]).unwrap();
        builder.modify_attribute(quark, Timestamp(5), "running").unwrap();

        assert_eq!(
            builder.query_ongoing(quark).unwrap(),
            StateValue::Str("running".into())
        );
        assert_eq!(builder.ongoing_start_time(quark).unwrap(), Timestamp(5));

        // Readers see the open interval up to the latest time.
        let open = system.query_single_state(quark, Timestamp(5)).unwrap();
        assert_eq!(open.value, StateValue::Str("running".into()));
    }

    #[test]
    fn test_increment_widens_to_long() {
        let (mut builder, _system) = StateSystem::in_memory(Config::default());
        let quark = builder.get_or_create_quark(&["counter"]).unwrap();
        builder
            .increment_attribute(quark, Timestamp(1), i32::MAX as i64)
            .unwrap();
        assert_eq!(
            builder.query_ongoing(quark).unwrap(),
            StateValue::Int(i32::MAX)
        );
        builder.increment_attribute(quark, Timestamp(2), 1).unwrap();
        assert_eq!(
            builder.query_ongoing(quark).unwrap(),
            StateValue::Long(i32::MAX as i64 + 1)
        );
    }

    #[test]
    fn test_increment_non_numeric_disposes() {
        let (mut builder, system) = StateSystem::in_memory(Config::default());
        let quark = builder.get_or_create_quark(&["name"]).unwrap();
        builder.modify_attribute(quark, Timestamp(1), "swapper").unwrap();

        let result = builder.increment_attribute(quark, Timestamp(2), 1);
        assert!(matches!(
            result,
            Err(StateError::StateValueTypeMismatch { .. })
        ));
        assert!(system.is_disposed());
        assert!(matches!(
            system.query_single_state(quark, Timestamp(1)),
            Err(StateError::StateSystemDisposed)
        ));
    }

    #[test]
    fn test_out_of_order_disposes() {
        let (mut builder, system) = StateSystem::in_memory(Config::default());
        let quark = builder.get_or_create_quark(&["a"]).unwrap();
        builder.modify_attribute(quark, Timestamp(10), 1i32).unwrap();
        let result = builder.modify_attribute(quark, Timestamp(10), 2i32);
        assert!(matches!(result, Err(StateError::OutOfOrderTimestamp { .. })));
        assert!(system.is_disposed());
    }

    #[test]
    fn test_remove_attribute_nullifies_subtree() {
        let (mut builder, system) = StateSystem::in_memory(Config::default());
        let parent = builder.get_or_create_quark(&["Threads", "42"]).unwrap();
        let child = builder
            .get_or_create_quark(&["Threads", "42", "Exec_name"])
            .unwrap();
        builder.modify_attribute(parent, Timestamp(10), 42i32).unwrap();
        builder.modify_attribute(child, Timestamp(10), "bash").unwrap();
        builder.remove_attribute(parent, Timestamp(20)).unwrap();
        builder.close(Timestamp(30)).unwrap();

        let gone = system.query_single_state(child, Timestamp(25)).unwrap();
        assert!(gone.value.is_null());
        let was = system.query_single_state(child, Timestamp(15)).unwrap();
        assert_eq!(was.value, StateValue::Str("bash".into()));
    }

    #[test]
    fn test_full_state_ordered_by_quark() {
        let (mut builder, system) = StateSystem::in_memory(Config::default());
        let b = builder.get_or_create_quark(&["b"]).unwrap();
        let a = builder.get_or_create_quark(&["a"]).unwrap();
        builder.modify_attribute(b, Timestamp(5), 2i32).unwrap();
        builder.modify_attribute(a, Timestamp(5), 1i32).unwrap();
        builder.close(Timestamp(10)).unwrap();

        let state = system.query_full_state(Timestamp(7)).unwrap();
        let quarks: Vec<Quark> = state.iter().map(|iv| iv.quark).collect();
        // b was created first and got the lower quark.
        assert_eq!(quarks, vec![b, a]);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_apply_event_and_drive() {
        let (mut builder, system) = StateSystem::in_memory(Config::default());
        let events = vec![
            Event::set(Timestamp(10), &["CPUs", "0"], StateValue::Int(1)),
            Event::increment(Timestamp(20), &["CPUs", "0", "switches"], 1),
            Event::increment(Timestamp(30), &["CPUs", "0", "switches"], 1),
        ];
        let token = CancellationToken::new();
        assert!(builder.drive(events, &token).unwrap());
        builder.close(Timestamp(40)).unwrap();

        let quark = system.get_quark(&["CPUs", "0", "switches"]).unwrap();
        let interval = system.query_single_state(quark, Timestamp(35)).unwrap();
        assert_eq!(interval.value, StateValue::Int(2));
    }

    #[test]
    fn test_drive_stops_on_cancel() {
        let (mut builder, _system) = StateSystem::in_memory(Config::default());
        let token = CancellationToken::new();
        token.cancel();
        let events = vec![Event::set(Timestamp(10), &["x"], StateValue::Int(1))];
        assert!(!builder.drive(events, &token).unwrap());
    }
}
