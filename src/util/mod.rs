//! Shared utilities: identifiers, clocks, sampling and telemetry.

pub mod clock;
pub mod sampling;
pub mod serde;
pub mod telemetry;

pub use self::clock::*;
pub use self::sampling::*;
pub use self::serde::*;
pub use self::telemetry::*;
