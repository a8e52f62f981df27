//! Tests for error types

use render_farm::core::SchedulerError;
use uuid::Uuid;

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("10000 active jobs".to_string());
    assert_eq!(format!("{}", err), "queue full: 10000 active jobs");
}

#[test]
fn test_capacity_exceeded_error() {
    let id = Uuid::nil();
    let err = SchedulerError::CapacityExceeded(id);
    assert_eq!(format!("{}", err), format!("capacity exceeded on worker {id}"));
}

#[test]
fn test_stale_report_error() {
    let batch = Uuid::new_v4();
    let worker = Uuid::new_v4();
    let err = SchedulerError::StaleReport { batch, worker };
    assert_eq!(
        format!("{}", err),
        format!("stale report for batch {batch} from worker {worker}")
    );
    assert!(err.is_invariant_guard());
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("disk full".to_string());
    assert_eq!(format!("{}", err), "backend error: disk full");
    assert!(!err.is_invariant_guard());
}
