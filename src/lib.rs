//! # Quota Scheduler
//!
//! A quota-based preemptive task scheduler for fleets of polling workers.
//!
//! Task producers enqueue requests with a priority, an optional owning
//! account and a set of required labels. Workers poll with their own labels
//! and receive at most one request each. Which request a worker gets is
//! decided by quota accounting rather than FIFO: every account accrues quota
//! per priority level over wall-clock time, banks at most a capped amount of
//! it, and spends it while the tasks it funds run.
//!
//! ## Key Features
//!
//! - **Fair-share quota**: per-level charge rates, accrual caps, fanout limits
//!   and charge-rate cascading to cheaper levels
//! - **Free capacity**: unfunded requests run when nothing funded needs the
//!   worker; their rank against funded work is a per-pool setting
//! - **Preemption with reconciliation**: higher-ranked requests evict lower
//!   ones through a cancellation handshake, never by running two requests on
//!   one worker
//! - **Per-pool batching**: one actor per pool folds concurrent calls into a
//!   single transition committed with optimistic compare-and-swap
//! - **Pluggable persistence**: in-memory and file-backed node stores
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quota_scheduler::builders::SchedulerBuilder;
//! use quota_scheduler::config::SchedulerConfig;
//! use quota_scheduler::core::{AccountConfig, IdleWorker, NewRequest};
//! use quota_scheduler::runtime::TokioSpawner;
//! use quota_scheduler::util::serde::labels;
//!
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::default(), TokioSpawner::current())
//!     .build()?;
//! scheduler.create_pool("gpu", None).await?;
//! scheduler
//!     .upsert_account("gpu", "team-a", AccountConfig {
//!         charge_rates: vec![2.0, 1.0],
//!         max_charge_seconds: 600.0,
//!         max_fanout: 4,
//!         disable_free_tasks: false,
//!     })
//!     .await?;
//! scheduler
//!     .enqueue_requests("gpu", vec![NewRequest {
//!         id: "job-1".into(),
//!         priority: 0,
//!         account_id: Some("team-a".into()),
//!         labels: labels(["cuda"]),
//!         enqueued_at_ms: None,
//!     }])
//!     .await?;
//! let assignments = scheduler
//!     .assign_tasks("gpu", vec![IdleWorker { id: "w1".into(), labels: labels(["cuda"]) }])
//!     .await?;
//! ```
//!
//! For complete scenarios, see `tests/scheduler_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling state machine, matching algorithm and batch runner.
pub mod core;
/// Configuration models for the scheduler and its pools.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// Infrastructure adapters for persisting pool state.
pub mod infra;
/// Runtime adapters and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
