//! Error handling and edge case tests.

use state_history::{Config, Quark, StateError, StateSystem, StateValue, Timestamp, TreeConfig};
use tempfile::TempDir;

// --- Query-side errors: local and recoverable ---

#[test]
fn test_invalid_range_rejected() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["x"]).unwrap();
    builder.modify_attribute(quark, Timestamp(10), 1i32).unwrap();
    builder.close(Timestamp(100)).unwrap();

    let result = system.query_range(quark, Timestamp(50), Timestamp(10));
    assert!(matches!(result, Err(StateError::InvalidRange(_, _))));

    // The failure is local: the same query with the range fixed works.
    let intervals: Vec<_> = system
        .query_range(quark, Timestamp(10), Timestamp(50))
        .unwrap()
        .collect();
    assert!(!intervals.is_empty());
}

#[test]
fn test_query_before_start_and_after_end() {
    let (mut builder, system) = StateSystem::in_memory(Config::new(Timestamp(100)));
    let quark = builder.get_or_create_quark(&["x"]).unwrap();
    builder.modify_attribute(quark, Timestamp(150), 1i32).unwrap();
    builder.close(Timestamp(200)).unwrap();

    assert!(matches!(
        system.query_single_state(quark, Timestamp(99)),
        Err(StateError::TimeRangeOutOfBounds(_, _, _))
    ));
    assert!(matches!(
        system.query_single_state(quark, Timestamp(201)),
        Err(StateError::TimeRangeOutOfBounds(_, _, _))
    ));
    assert!(system.query_single_state(quark, Timestamp(100)).is_ok());
    assert!(system.query_single_state(quark, Timestamp(200)).is_ok());
}

#[test]
fn test_attribute_without_data_not_found() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let touched = builder.get_or_create_quark(&["touched"]).unwrap();
    let untouched = builder.get_or_create_quark(&["untouched"]).unwrap();
    builder.modify_attribute(touched, Timestamp(10), 1i32).unwrap();
    builder.close(Timestamp(100)).unwrap();

    // Created but never written.
    assert!(matches!(
        system.query_single_state(untouched, Timestamp(50)),
        Err(StateError::AttributeNotFound(_, _))
    ));
    // Never created at all.
    assert!(matches!(
        system.query_single_state(Quark(99), Timestamp(50)),
        Err(StateError::AttributeNotFound(_, _))
    ));
    // And the untouched attribute is absent from full-state snapshots.
    let full = system.query_full_state(Timestamp(50)).unwrap();
    assert!(full.iter().all(|iv| iv.quark != untouched));
}

#[test]
fn test_disposed_system_fails_queries() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["x"]).unwrap();
    builder.modify_attribute(quark, Timestamp(10), 1i32).unwrap();
    builder.close(Timestamp(100)).unwrap();

    system.dispose();
    assert!(system.is_disposed());
    assert!(matches!(
        system.query_single_state(quark, Timestamp(50)),
        Err(StateError::StateSystemDisposed)
    ));
    assert!(matches!(
        system.query_full_state(Timestamp(50)),
        Err(StateError::StateSystemDisposed)
    ));
    assert!(matches!(
        system.query_range(quark, Timestamp(10), Timestamp(50)),
        Err(StateError::StateSystemDisposed)
    ));
}

#[test]
fn test_dispose_reaches_existing_clones() {
    let (_builder, system) = StateSystem::in_memory(Config::default());
    let other = system.clone();
    system.dispose();
    assert!(other.is_disposed());
}

// --- Producer-side errors: fatal to the build ---

#[test]
fn test_out_of_order_timestamp_is_fatal() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["x"]).unwrap();
    builder.modify_attribute(quark, Timestamp(20), 1i32).unwrap();

    // Equal to the open start is as invalid as before it.
    let result = builder.modify_attribute(quark, Timestamp(20), 2i32);
    assert!(matches!(
        result,
        Err(StateError::OutOfOrderTimestamp { .. })
    ));
    // The build is dead; the owning analysis must start over.
    assert!(system.is_disposed());
    assert!(matches!(
        builder.modify_attribute(quark, Timestamp(30), 3i32),
        Err(StateError::StateSystemDisposed)
    ));
}

#[test]
fn test_increment_on_string_is_fatal() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["name"]).unwrap();
    builder.modify_attribute(quark, Timestamp(10), "bash").unwrap();

    let result = builder.increment_attribute(quark, Timestamp(20), 1);
    assert!(matches!(
        result,
        Err(StateError::StateValueTypeMismatch { .. })
    ));
    assert!(system.is_disposed());
}

#[test]
fn test_increment_on_double_is_fatal() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["load"]).unwrap();
    builder.modify_attribute(quark, Timestamp(10), 0.5f64).unwrap();

    let result = builder.increment_attribute(quark, Timestamp(20), 1);
    assert!(matches!(
        result,
        Err(StateError::StateValueTypeMismatch { .. })
    ));
    assert!(system.is_disposed());
}

#[test]
fn test_increment_from_absent_counts_from_zero() {
    let (mut builder, _system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["counter"]).unwrap();
    builder.increment_attribute(quark, Timestamp(10), 3).unwrap();
    assert_eq!(builder.query_ongoing(quark).unwrap(), StateValue::Int(3));
}

#[test]
fn test_update_ongoing_type_mismatch_is_fatal() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["x"]).unwrap();
    builder.modify_attribute(quark, Timestamp(10), 1i32).unwrap();

    // Patching the open value keeps its type.
    builder.update_ongoing(quark, 5i32).unwrap();
    let result = builder.update_ongoing(quark, "five");
    assert!(matches!(
        result,
        Err(StateError::StateValueTypeMismatch { .. })
    ));
    assert!(system.is_disposed());
}

#[test]
fn test_close_is_terminal() {
    let (mut builder, system) = StateSystem::in_memory(Config::default());
    let quark = builder.get_or_create_quark(&["x"]).unwrap();
    builder.modify_attribute(quark, Timestamp(10), 1i32).unwrap();
    builder.close(Timestamp(100)).unwrap();
    // The builder is consumed by close; only readers remain, and the
    // closed history keeps answering.
    assert_eq!(system.current_end_time(), Timestamp(100));
    assert!(system.query_single_state(quark, Timestamp(55)).is_ok());
}

// --- Disk-specific errors ---

#[test]
fn test_history_file_locked_while_open() {
    let dir = TempDir::new().unwrap();
    let config = TreeConfig::new(dir.path().join("history.sht"));
    let (_builder, _system) =
        StateSystem::disk_backed(Config::default(), config.clone()).unwrap();

    let result = StateSystem::open(config);
    assert!(matches!(result, Err(StateError::Locked)));
}

#[test]
fn test_open_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let config = TreeConfig::new(dir.path().join("nope.sht"));
    let result = StateSystem::open(config);
    assert!(matches!(result, Err(StateError::Io(_))));
}

#[test]
fn test_open_garbage_file_is_invalid_format() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.sht");
    std::fs::write(&path, b"this is not a state history file").unwrap();
    let result = StateSystem::open(TreeConfig::new(path));
    assert!(matches!(result, Err(StateError::InvalidFormat(_))));
}
