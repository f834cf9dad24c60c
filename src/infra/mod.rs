//! Infrastructure adapters for persisting pool state.

pub mod store;
pub use store::FileNodeStore;
pub use store::MemoryNodeStore;
