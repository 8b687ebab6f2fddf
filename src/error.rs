//! Error types for the state history engine.

use crate::types::{Quark, Timestamp};
use thiserror::Error;

/// Main error type for state system operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Attribute quark {0} has no state at time {1}")]
    AttributeNotFound(Quark, Timestamp),

    #[error("State value type mismatch for quark {quark}: got {got}, expected {expected}")]
    StateValueTypeMismatch {
        quark: Quark,
        got: &'static str,
        expected: &'static str,
    },

    #[error("Out-of-order timestamp for quark {quark}: {time} <= ongoing start {ongoing_start}")]
    OutOfOrderTimestamp {
        quark: Quark,
        time: Timestamp,
        ongoing_start: Timestamp,
    },

    #[error("Time {0} outside history range [{1}, {2}]")]
    TimeRangeOutOfBounds(Timestamp, Timestamp, Timestamp),

    #[error("Invalid query range: start {0} > end {1}")]
    InvalidRange(Timestamp, Timestamp),

    #[error("State system has been disposed")]
    StateSystemDisposed,

    #[error("Corrupt node {node_id}: {reason}")]
    CorruptNode { node_id: u32, reason: String },

    #[error("History file truncated at offset {0}")]
    Truncated(u64),

    #[error("Unsupported history file format version: {got} (expected {expected})")]
    UnsupportedFormatVersion { got: u8, expected: u8 },

    #[error("Invalid history file format: {0}")]
    InvalidFormat(String),

    #[error("History file is locked by another process")]
    Locked,
}

/// Result type for state system operations.
pub type Result<T> = std::result::Result<T, StateError>;
