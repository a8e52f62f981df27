//! Audit trail of farm transitions.
//!
//! The scheduler records one event per job, batch, or worker state change.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::util::clock::now_ms;

/// Kind of record an audit event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEntity {
    /// A job.
    Job,
    /// A batch.
    Batch,
    /// A worker.
    Worker,
}

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Identifier of the job, batch, or worker involved.
    pub subject: Uuid,
    /// What `subject` refers to.
    pub entity: AuditEntity,
    /// Action taken (submit, dispatch, complete, retry, fail, cancel, offline, ...).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Events about one subject, oldest first.
    #[must_use]
    pub fn events_for(&self, subject: Uuid) -> Vec<AuditEvent> {
        self.events
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    subject: Uuid,
    entity: AuditEntity,
    action: impl Into<String>,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        subject,
        entity,
        action: action.into(),
        created_at_ms: now_ms(),
        detail,
    }
}
