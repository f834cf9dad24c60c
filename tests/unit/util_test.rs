//! Tests for utility functions

use quota_scheduler::util::{
    init_tracing, labels, now_ms, Clock, Funding, ManualClock, Sampler, SystemClock,
};

#[test]
fn test_labels_are_a_set() {
    let set = labels(["gpu", "os:linux", "gpu"]);
    assert_eq!(set.len(), 2);
    assert!(set.contains("os:linux"));
}

#[test]
fn test_funding_serde_shape() {
    let funded = serde_json::to_value(Funding::Funded { level: 2 }).unwrap();
    assert_eq!(funded, serde_json::json!({ "kind": "funded", "level": 2 }));
    let free = serde_json::to_value(Funding::Free).unwrap();
    assert_eq!(free, serde_json::json!({ "kind": "free" }));
}

#[test]
fn test_manual_clock_shared_between_clones() {
    let clock = ManualClock::new(1_000);
    let other = clock.clone();
    clock.advance_ms(500);
    assert_eq!(other.now_ms(), 1_500);
    other.set_ms(10);
    assert_eq!(clock.now_ms(), 10);
}

#[test]
fn test_system_clock_is_after_epoch() {
    assert!(SystemClock.now_ms() > 0);
    assert!(now_ms() > 0);
}

#[test]
fn test_seeded_sampler_is_reproducible() {
    let items: Vec<u32> = (0..200).collect();
    let a = Sampler::seeded(42).sample(items.iter().copied(), 0.3);
    let b = Sampler::seeded(42).sample(items.iter().copied(), 0.3);
    assert_eq!(a, b);
    assert!(!a.is_empty() && a.len() < items.len());
}

#[test]
fn test_sampler_bounds() {
    let sampler = Sampler::seeded(1);
    assert!(sampler.sample(0..10, 0.0).is_empty());
    assert_eq!(sampler.sample(0..10, 1.0).len(), 10);
    assert_eq!(sampler.sample(0..10, 7.0).len(), 10);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
}
