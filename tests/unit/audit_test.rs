//! Tests for audit sink

use render_farm::core::{build_audit_event, AuditEntity, AuditSink, InMemoryAuditSink};
use uuid::Uuid;

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let job = Uuid::new_v4();

    let event = build_audit_event(job, AuditEntity::Job, "submit", Some("1-100".to_string()));

    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].event_id, event.event_id);
    assert_eq!(events[0].subject, job);
    assert_eq!(events[0].action, "submit");
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);
    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    for id in &ids {
        sink.record(build_audit_event(*id, AuditEntity::Batch, "dispatch", None));
    }

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].subject, ids[1]); // First one popped
    assert_eq!(events[1].subject, ids[2]);
}

#[test]
fn test_events_for_subject() {
    let mut sink = InMemoryAuditSink::new(10);
    let worker = Uuid::new_v4();
    sink.record(build_audit_event(worker, AuditEntity::Worker, "register", None));
    sink.record(build_audit_event(Uuid::new_v4(), AuditEntity::Job, "submit", None));
    sink.record(build_audit_event(worker, AuditEntity::Worker, "offline", None));

    let actions: Vec<String> = sink.events_for(worker).into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec!["register", "offline"]);
}

#[test]
fn test_zero_capacity_sink_keeps_nothing() {
    let mut sink = InMemoryAuditSink::new(0);
    sink.record(build_audit_event(Uuid::new_v4(), AuditEntity::Job, "submit", None));
    assert!(sink.events().is_empty());
}

#[test]
fn test_build_audit_event() {
    let batch = Uuid::new_v4();
    let event = build_audit_event(batch, AuditEntity::Batch, "complete", Some("worker-3".to_string()));

    assert_eq!(event.subject, batch);
    assert_eq!(event.entity, AuditEntity::Batch);
    assert_eq!(event.action, "complete");
    assert_eq!(event.detail, Some("worker-3".to_string()));
    assert!(!event.event_id.is_empty());
    assert!(event.created_at_ms > 0);
}
