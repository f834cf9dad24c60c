//! Tests for audit sink

use quota_scheduler::core::{build_audit_event, AuditSink, Decision, InMemoryAuditSink};
use quota_scheduler::util::serde::Funding;

fn enqueued(id: &str) -> Decision {
    Decision::Enqueued {
        request_id: id.to_string(),
    }
}

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let reader = sink.clone();

    let decision = Decision::Assigned {
        worker_id: "w1".to_string(),
        request_id: "r1".to_string(),
        funding: Funding::Funded { level: 1 },
    };
    sink.record(build_audit_event("batch", 0, "pool1", &decision, 42));

    let events = reader.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, "batch-0");
    assert_eq!(events[0].subject, "r1");
    assert_eq!(events[0].worker.as_deref(), Some("w1"));
    assert_eq!(events[0].action, "assign");
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    for (seq, id) in ["r1", "r2", "r3"].into_iter().enumerate() {
        sink.record(build_audit_event("b", seq, "pool1", &enqueued(id), 1));
    }

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_id, "b-1"); // First one popped
    assert_eq!(events[1].event_id, "b-2");
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event("b7", 3, "pool1", &enqueued("task1"), 1_000);

    assert_eq!(event.event_id, "b7-3");
    assert_eq!(event.batch_id, "b7");
    assert_eq!(event.pool, "pool1");
    assert_eq!(event.subject, "task1");
    assert_eq!(event.worker, None);
    assert_eq!(event.action, "enqueue");
    assert_eq!(event.created_at_ms, 1_000);

    let payload: Decision = serde_json::from_str(event.payload.as_deref().unwrap()).unwrap();
    assert_eq!(payload, enqueued("task1"));
}

#[test]
fn test_account_decisions_name_the_account() {
    let decision = Decision::AccountDeleted {
        account_id: "team-a".to_string(),
    };
    let event = build_audit_event("b", 0, "pool1", &decision, 0);
    assert_eq!(event.subject, "team-a");
    assert_eq!(event.action, "account_delete");
}
