//! Tests for configuration validation

use std::collections::HashMap;

use quota_scheduler::config::{FreeRanking, PoolSettings, SchedulerConfig};

#[test]
fn test_default_config_is_valid() {
    let config = SchedulerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.default_pool.priority_levels, 3);
    assert_eq!(config.default_pool.free_ranking, FreeRanking::AfterFunded);
}

#[test]
fn test_pool_settings_invalid_levels() {
    let invalid = PoolSettings {
        priority_levels: 0,
        ..PoolSettings::default()
    };
    assert!(invalid.validate().is_err());

    let invalid = PoolSettings {
        priority_levels: 1_000,
        ..PoolSettings::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_batch() {
    let mut config = SchedulerConfig::default();
    config.batch.max_batch_size = 0;
    let err = config.validate().unwrap_err();
    assert!(err.starts_with("batch invalid:"), "{err}");
}

#[test]
fn test_scheduler_config_invalid_sample_rate() {
    let mut config = SchedulerConfig::default();
    config.callbacks.waiting_sample_rate = 1.5;
    let err = config.validate().unwrap_err();
    assert!(err.starts_with("callbacks invalid:"), "{err}");
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "batch": { "window_ms": 25, "assume_sole_writer": true },
        "callbacks": { "seed": 9 },
        "default_pool": { "priority_levels": 4, "free_ranking": "within_priority" }
    }"#;

    let config = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(config.batch.window_ms, 25);
    assert!(config.batch.assume_sole_writer);
    assert_eq!(config.batch.max_retries, 3);
    assert_eq!(config.callbacks.seed, Some(9));
    assert_eq!(config.default_pool.priority_levels, 4);
    assert_eq!(config.default_pool.free_ranking, FreeRanking::WithinPriority);
}

#[test]
fn test_scheduler_config_from_json_rejects_invalid() {
    let json = r#"{ "query_timeout_ms": 0 }"#;
    assert!(SchedulerConfig::from_json_str(json).is_err());
    assert!(SchedulerConfig::from_json_str("not json").is_err());
}

#[test]
fn test_scheduler_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scheduler.json");
    std::fs::write(&path, r#"{ "batch": { "max_retries": 7 } }"#).unwrap();
    let config = SchedulerConfig::from_file(&path).unwrap();
    assert_eq!(config.batch.max_retries, 7);

    let missing = SchedulerConfig::from_file(dir.path().join("missing.json"));
    assert!(missing.is_err());
}

#[test]
fn test_overrides() {
    let vars: HashMap<&str, &str> = [
        ("BATCH_WINDOW_MS", "50"),
        ("MAX_RETRIES", "1"),
        ("ASSUME_SOLE_WRITER", "true"),
        ("SAMPLE_SEED", "11"),
    ]
    .into_iter()
    .collect();
    let mut config = SchedulerConfig::default();
    config
        .apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()))
        .unwrap();
    assert_eq!(config.batch.window_ms, 50);
    assert_eq!(config.batch.max_retries, 1);
    assert!(config.batch.assume_sole_writer);
    assert_eq!(config.callbacks.seed, Some(11));
}

#[test]
fn test_override_parse_error() {
    let mut config = SchedulerConfig::default();
    let err = config
        .apply_overrides(|key| (key == "MAX_BATCH_SIZE").then(|| "many".to_string()))
        .unwrap_err();
    assert!(err.to_string().contains("MAX_BATCH_SIZE"));
}
