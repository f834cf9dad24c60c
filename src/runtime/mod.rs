//! Runtime adapters and API surface.

pub mod api;
pub mod tokio_spawner;

pub use api::{health, Ack, ErrorBody, Health};
pub use tokio_spawner::TokioSpawner;
