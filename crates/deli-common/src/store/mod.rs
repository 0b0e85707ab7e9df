//! Durable storage for per-document sequencing state.

pub mod file_store;
pub mod memory;
pub mod traits;

pub use file_store::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use traits::*;
