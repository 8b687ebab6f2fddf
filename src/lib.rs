//! # State History
//!
//! A versioned, attribute-indexed interval store: it records what value
//! each attribute held between which timestamps, and answers point and
//! range queries over arbitrary past times, including against traces
//! too large to fit in memory.
//!
//! ## Core Concepts
//!
//! - **Attributes**: a hierarchical namespace of dotted paths, mapped to
//!   dense integer quarks
//! - **State values**: a closed tagged union (null, int, long, double,
//!   string) held by an attribute at an instant
//! - **Intervals**: contiguous, non-overlapping time ranges per
//!   attribute, built incrementally from punctual changes
//! - **Backends**: an in-memory store, and an append-only on-disk
//!   history tree with logarithmic point queries
//!
//! ## Example
//!
//! ```ignore
//! use state_history::{Config, StateSystem, Timestamp};
//!
//! let (mut builder, system) = StateSystem::in_memory(Config::default());
//!
//! let status = builder.get_or_create_quark(&["CPUs", "0", "Status"])?;
//! builder.modify_attribute(status, Timestamp(100), "running")?;
//! builder.modify_attribute(status, Timestamp(250), "idle")?;
//! builder.close(Timestamp(300))?;
//!
//! // What was CPU 0 doing at t=200?
//! let interval = system.query_single_state(status, Timestamp(200))?;
//! assert_eq!(interval.value.as_str(), Some("running"));
//! ```

pub mod attributes;
pub mod backend;
pub mod error;
pub mod system;
pub mod transient;
pub mod types;

// Re-exports
pub use attributes::AttributeTree;
pub use backend::memory::InMemoryBackend;
pub use backend::tree::{HistoryTreeBackend, TreeConfig};
pub use backend::HistoryBackend;
pub use error::{Result, StateError};
pub use system::{Config, RangeQuery, StateBuilder, StateSystem};
pub use types::*;
