//! Configuration models for pools, batching, and queries.

pub mod pool;
pub mod scheduler;

pub use pool::{FreeRanking, PoolSettings};
pub use scheduler::{BatchConfig, CallbackConfig, SchedulerConfig};
