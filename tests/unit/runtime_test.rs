//! Tests for tokio spawner utilities and the API surface

use quota_scheduler::builders::SchedulerBuilder;
use quota_scheduler::config::SchedulerConfig;
use quota_scheduler::core::{IdleWorker, NewRequest, Spawn};
use quota_scheduler::runtime::api::{
    self, AssignTasksRequest, CreatePoolRequest, EnqueueRequestsRequest, GetCancellationsRequest,
    PoolRef,
};
use quota_scheduler::runtime::tokio_spawner::TokioSpawner;
use quota_scheduler::util::serde::labels;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[tokio::test]
async fn test_api_round_trip() {
    let scheduler = SchedulerBuilder::new(SchedulerConfig::default(), TokioSpawner::current())
        .build()
        .unwrap();
    let pool_id = "api".to_string();

    api::create_pool(
        &scheduler,
        CreatePoolRequest {
            pool_id: pool_id.clone(),
            settings: None,
        },
    )
    .await
    .unwrap();
    let err = api::create_pool(
        &scheduler,
        CreatePoolRequest {
            pool_id: pool_id.clone(),
            settings: None,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, "pool_exists");
    assert!(err.client_error);

    api::enqueue_requests(
        &scheduler,
        EnqueueRequestsRequest {
            pool_id: pool_id.clone(),
            requests: vec![NewRequest {
                id: "r1".into(),
                priority: 1,
                account_id: None,
                labels: labels(["x86"]),
                enqueued_at_ms: None,
            }],
            timeout_ms: Some(5_000),
        },
    )
    .await
    .unwrap();

    let response = api::assign_tasks(
        &scheduler,
        AssignTasksRequest {
            pool_id: pool_id.clone(),
            workers: vec![IdleWorker {
                id: "w1".into(),
                labels: labels(["x86", "ssd"]),
            }],
            timeout_ms: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(response.assignments.len(), 1);
    assert_eq!(response.assignments[0].request_id, "r1");

    let cancellations = api::get_cancellations(
        &scheduler,
        GetCancellationsRequest {
            pool_id: pool_id.clone(),
            worker_id: "w1".into(),
        },
    )
    .await
    .unwrap();
    assert!(cancellations.request_ids.is_empty());

    let pools = api::list_pools(&scheduler).await.unwrap();
    assert_eq!(pools.pools, vec![pool_id.clone()]);
    let dump = api::inspect_pool(&scheduler, PoolRef { pool_id }).await.unwrap();
    assert!(dump.state.check_invariants().is_ok());
    assert!(api::health().ok);
}

#[test]
fn test_request_models_deserialize() {
    let raw = r#"{
        "pool_id": "p",
        "events": [
            { "event": "running", "worker_id": "w1", "request_id": "r1" },
            { "event": "idle", "worker_id": "w2" }
        ]
    }"#;
    let req: api::NotifyTasksRequest = serde_json::from_str(raw).unwrap();
    assert_eq!(req.events.len(), 2);
    assert_eq!(req.timeout_ms, None);
}
