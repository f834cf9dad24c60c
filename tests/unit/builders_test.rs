//! Tests for builder modules

use quota_scheduler::builders::SchedulerBuilder;
use quota_scheduler::config::SchedulerConfig;
use quota_scheduler::core::SchedulerError;
use quota_scheduler::infra::MemoryNodeStore;
use quota_scheduler::runtime::TokioSpawner;
use quota_scheduler::util::clock::ManualClock;

#[tokio::test]
async fn test_scheduler_builder_defaults() {
    let builder = SchedulerBuilder::new(SchedulerConfig::default(), TokioSpawner::current());
    assert_eq!(builder.config().batch.window_ms, 10);

    let scheduler = builder.build().unwrap();
    assert!(scheduler.list_pools().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduler_builder_rejects_invalid_config() {
    let mut config = SchedulerConfig::default();
    config.batch.channel_capacity = 0;
    let err = SchedulerBuilder::new(config, TokioSpawner::current())
        .build()
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidRequest(msg) if msg.starts_with("config invalid:")));
}

#[tokio::test]
async fn test_scheduler_builder_with_store_and_clock() {
    let store = MemoryNodeStore::new();
    let clock = ManualClock::new(0);
    let scheduler = SchedulerBuilder::new(SchedulerConfig::default(), TokioSpawner::current())
        .with_store(store.clone())
        .with_clock(clock)
        .build()
        .unwrap();

    scheduler.create_pool("pool1", None).await.unwrap();
    assert_eq!(store.version("pool1"), Some(1));
    assert_eq!(
        scheduler.config().default_pool,
        scheduler.inspect("pool1").await.unwrap().state.settings
    );
}
