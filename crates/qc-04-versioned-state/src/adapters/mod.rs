pub mod memory_snapshot;

pub use memory_snapshot::InMemorySnapshot;
