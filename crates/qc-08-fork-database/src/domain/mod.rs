pub mod error;
pub mod fork_database;
pub mod node;

pub use error::{ForkDatabaseError, ForkDbResult};
pub use fork_database::{Branch, BranchPair, ForkDatabase};
pub use node::{priority, ForkNode, Priority};
