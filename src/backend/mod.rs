//! Interval storage backends.
//!
//! A backend is the append-mostly, time-ordered store of closed intervals
//! behind a state system. The builder pushes intervals in non-decreasing
//! start order per quark; queries look up the single interval covering a
//! given timestamp. Two variants share the interface: an in-memory store
//! for small histories and a disk-backed history tree for traces that do
//! not fit in memory.

pub mod memory;
pub mod node;
pub mod tree;

use crate::error::Result;
use crate::types::{Interval, Quark, Timestamp};

/// Storage backend for closed state intervals.
///
/// Implementations are internally synchronized: one writer inserts while
/// any number of readers query concurrently.
pub trait HistoryBackend: Send + Sync {
    /// Start of the time range covered by this history.
    fn start_time(&self) -> Timestamp;

    /// End of the committed time range (grows as intervals are inserted).
    fn end_time(&self) -> Timestamp;

    /// Insert a closed interval. Intervals arrive in non-decreasing start
    /// order per quark and must lie inside the history's time range.
    fn insert(&self, interval: Interval) -> Result<()>;

    /// Seal the history at `end`. No inserts are accepted afterward.
    fn finish_building(&self, end: Timestamp) -> Result<()>;

    /// Find the interval covering `t` for `quark`, if any was written.
    fn query_at(&self, quark: Quark, t: Timestamp) -> Result<Option<Interval>>;

    /// Highest quark any stored interval refers to, if any. Lets a
    /// reopened history enumerate its quarks without the attribute tree.
    fn max_quark(&self) -> Option<Quark>;

    /// Release backend resources. Queries fail afterward at the system
    /// layer; the backend itself only closes files.
    fn dispose(&self) {}
}
