//! Node store backends.

pub mod file;
pub mod memory;

pub use file::FileNodeStore;
pub use memory::MemoryNodeStore;
