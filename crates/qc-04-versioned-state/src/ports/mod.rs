pub mod snapshot;

pub use snapshot::{SnapshotReader, SnapshotWriter};
