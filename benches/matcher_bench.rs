//! Benchmarks for the quota scheduler.
//!
//! Benchmarks cover:
//! - Matching idle workers against large waiting sets
//! - Preemption scans over fully busy pools
//! - State encoding for the node store
//! - End-to-end batched calls through a pool actor

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use quota_scheduler::builders::SchedulerBuilder;
use quota_scheduler::config::{PoolSettings, SchedulerConfig};
use quota_scheduler::core::{
    apply_batch, AccountConfig, IdleWorker, NewRequest, Operation, Scheduler, SchedulerState,
};
use quota_scheduler::infra::MemoryNodeStore;
use quota_scheduler::runtime::TokioSpawner;
use quota_scheduler::util::serde::labels;

use tokio::runtime::Runtime;

// ============================================================================
// Helper Functions
// ============================================================================

const ACCOUNTS: u64 = 8;

fn new_request(id: u64, funded: bool) -> NewRequest {
    NewRequest {
        id: format!("r{id}"),
        priority: (id % 3) as usize,
        account_id: funded.then(|| format!("acct-{}", id % ACCOUNTS)),
        labels: if id % 4 == 0 {
            labels(["gpu"])
        } else {
            labels(["cpu"])
        },
        enqueued_at_ms: Some(u128::from(id)),
    }
}

fn worker(id: u64) -> IdleWorker {
    IdleWorker {
        id: format!("w{id}"),
        labels: labels(["cpu", "gpu"]),
    }
}

fn seeded_state(waiting: u64) -> SchedulerState {
    let mut state = SchedulerState::new("bench", PoolSettings::default());
    let mut ops: Vec<Operation> = (0..ACCOUNTS)
        .map(|a| Operation::UpsertAccount {
            account_id: format!("acct-{a}"),
            config: AccountConfig {
                charge_rates: vec![1.0, 1.0, 1.0],
                max_charge_seconds: 3_600.0,
                max_fanout: 0,
                disable_free_tasks: false,
            },
        })
        .collect();
    ops.push(Operation::EnqueueRequests {
        requests: (0..waiting).map(|i| new_request(i, i % 2 == 0)).collect(),
    });
    apply_batch(&mut state, &ops, 0);
    // let every account bank quota
    apply_batch(&mut state, &[], 600_000);
    state
}

// ============================================================================
// Matcher Benchmarks
// ============================================================================

fn bench_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher_assign");

    for waiting in [100, 1_000, 5_000] {
        let base = seeded_state(waiting);
        let workers: Vec<IdleWorker> = (0..64).map(worker).collect();
        let ops = [Operation::AssignTasks { workers }];
        group.throughput(Throughput::Elements(64));
        group.bench_with_input(BenchmarkId::from_parameter(waiting), &waiting, |b, _| {
            b.iter(|| {
                let mut state = base.clone();
                black_box(apply_batch(&mut state, &ops, 600_001));
            });
        });
    }
    group.finish();
}

fn bench_preempt_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher_preempt_scan");

    for busy in [64, 256, 1_024] {
        // every worker runs a free request, then funded work arrives
        let mut state = SchedulerState::new("bench", PoolSettings::default());
        let mut setup = vec![Operation::UpsertAccount {
            account_id: "acct-0".into(),
            config: AccountConfig {
                charge_rates: vec![1.0, 1.0, 1.0],
                max_charge_seconds: 3_600.0,
                max_fanout: 0,
                disable_free_tasks: false,
            },
        }];
        setup.push(Operation::EnqueueRequests {
            requests: (0..busy).map(|i| new_request(i, false)).collect(),
        });
        setup.push(Operation::AssignTasks {
            workers: (0..busy).map(worker).collect(),
        });
        apply_batch(&mut state, &setup, 0);
        apply_batch(&mut state, &[], 600_000);

        let arrivals = [Operation::EnqueueRequests {
            requests: (busy..busy + 32)
                .map(|i| NewRequest {
                    account_id: Some("acct-0".into()),
                    ..new_request(i, true)
                })
                .collect(),
        }];
        group.throughput(Throughput::Elements(busy));
        group.bench_with_input(BenchmarkId::from_parameter(busy), &busy, |b, _| {
            b.iter(|| {
                let mut state = state.clone();
                black_box(apply_batch(&mut state, &arrivals, 600_001));
            });
        });
    }
    group.finish();
}

// ============================================================================
// Codec Benchmarks
// ============================================================================

fn bench_state_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_codec");

    for waiting in [100, 1_000, 10_000] {
        let state = seeded_state(waiting);
        let blob = state.to_blob().unwrap();
        group.throughput(Throughput::Bytes(blob.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", waiting), &state, |b, state| {
            b.iter(|| black_box(state.to_blob().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", waiting), &blob, |b, blob| {
            b.iter(|| black_box(SchedulerState::from_blob(blob).unwrap()));
        });
    }
    group.finish();
}

// ============================================================================
// End-to-End Benchmarks
// ============================================================================

fn build_scheduler(rt: &Runtime) -> Scheduler<TokioSpawner> {
    rt.block_on(async {
        let mut config = SchedulerConfig::default();
        config.batch.window_ms = 1;
        config.batch.assume_sole_writer = true;
        let scheduler = SchedulerBuilder::new(config, TokioSpawner::current())
            .with_shared_store(Arc::new(MemoryNodeStore::new()))
            .build()
            .unwrap();
        scheduler.create_pool("bench", None).await.unwrap();
        scheduler
    })
}

fn bench_batched_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("batched_calls");
    let rt = Runtime::new().unwrap();
    let scheduler = build_scheduler(&rt);
    let scheduler = &scheduler;

    for callers in [1u64, 16, 64] {
        group.throughput(Throughput::Elements(callers));
        group.bench_with_input(BenchmarkId::from_parameter(callers), &callers, |b, &callers| {
            let mut round = 0u64;
            b.to_async(&rt).iter(move || {
                round += 1;
                async move {
                    let calls = (0..callers).map(|i| {
                        let id = round * 1_000 + i;
                        scheduler.enqueue_requests("bench", vec![new_request(id, false)])
                    });
                    for result in futures::future::join_all(calls).await {
                        result.unwrap();
                    }
                    let drained = scheduler
                        .assign_tasks("bench", (0..callers).map(worker).collect())
                        .await
                        .unwrap();
                    black_box(drained);
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark Groups
// ============================================================================

criterion_group!(matcher_benches, bench_assign, bench_preempt_scan);

criterion_group!(codec_benches, bench_state_codec);

criterion_group!(scenario_benches, bench_batched_calls);

criterion_main!(matcher_benches, codec_benches, scenario_benches);
