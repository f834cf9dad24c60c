//! Audit sink implementations.
//!
//! The batch runner records one event per scheduling decision of a committed
//! batch. Attempts lost to a store conflict are never recorded.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::decision::Decision;

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier, unique within its batch.
    pub event_id: String,
    /// Batch that committed the decision.
    pub batch_id: String,
    /// Pool identifier.
    pub pool: String,
    /// Request or account the decision is about.
    pub subject: String,
    /// Worker involved, if any.
    pub worker: Option<String>,
    /// Action taken (enqueue, assign, preempt, resolve, complete, cancel, ...).
    pub action: String,
    /// Batch time in milliseconds.
    pub created_at_ms: u128,
    /// The decision as JSON.
    pub payload: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
///
/// Clones share one buffer, so a clone handed to the scheduler can be read
/// back from the original.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Build the audit event for one committed decision.
pub fn build_audit_event(
    batch_id: &str,
    seq: usize,
    pool: &str,
    decision: &Decision,
    now_ms: u128,
) -> AuditEvent {
    AuditEvent {
        event_id: format!("{batch_id}-{seq}"),
        batch_id: batch_id.to_string(),
        pool: pool.to_string(),
        subject: decision.subject().to_string(),
        worker: decision.worker().map(str::to_string),
        action: decision.action().to_string(),
        created_at_ms: now_ms,
        payload: serde_json::to_string(decision).ok(),
    }
}
