//! Tests for error types

use quota_scheduler::core::SchedulerError;
use quota_scheduler::runtime::ErrorBody;

#[test]
fn test_unknown_pool_error() {
    let err = SchedulerError::UnknownPool("gpu".to_string());
    assert_eq!(format!("{}", err), "unknown pool: gpu");
    assert!(err.is_client_error());
    assert!(!err.is_retryable());
}

#[test]
fn test_deadline_exceeded_error() {
    let err = SchedulerError::DeadlineExceeded;
    assert_eq!(format!("{}", err), "deadline exceeded");
    assert!(err.is_retryable());
    assert!(!err.is_client_error());
}

#[test]
fn test_conflict_error() {
    let err = SchedulerError::Conflict {
        pool: "gpu".to_string(),
        expected: Some(3),
        found: Some(4),
    };
    assert_eq!(
        format!("{}", err),
        "version conflict on pool gpu: expected Some(3), found Some(4)"
    );
    assert!(err.is_retryable());
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("disk full".to_string());
    assert_eq!(format!("{}", err), "backend error: disk full");
    assert!(!err.is_retryable());
    assert!(!err.is_client_error());
}

#[test]
fn test_codec_error_from_serde() {
    let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err = SchedulerError::from(parse);
    assert!(matches!(err, SchedulerError::Codec(_)));
}

#[test]
fn test_error_body_mapping() {
    let body = ErrorBody::from(SchedulerError::UnknownAccount("team-a".to_string()));
    assert_eq!(body.code, "unknown_account");
    assert_eq!(body.message, "unknown account: team-a");
    assert!(body.client_error);
    assert!(!body.retryable);

    let body = ErrorBody::from(SchedulerError::Unavailable("retries exhausted".to_string()));
    assert_eq!(body.code, "unavailable");
    assert!(body.retryable);
}
