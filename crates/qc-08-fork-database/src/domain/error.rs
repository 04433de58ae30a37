//! Fork database errors.

use thiserror::Error;

/// Result alias for fork database operations.
pub type ForkDbResult<T> = Result<T, ForkDatabaseError>;

/// Errors raised by the fork database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkDatabaseError {
    /// The block is already in the tree.
    #[error("we already know about this block: {0}")]
    DuplicateBlock(String),

    /// The parent is neither the root nor a known block.
    #[error("unlinkable block {id}: previous {previous} not found")]
    UnlinkableBlock { id: String, previous: String },

    /// No block with this id.
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// The database has no root yet.
    #[error("fork database has no root")]
    NoRoot,

    /// The requested root is unknown or not validated.
    #[error("invalid root: {0}")]
    InvalidRoot(String),

    /// Removal would take the best validated head with it.
    #[error("removing block {0} and its descendants would remove the current head")]
    RemovesHead(String),

    /// Branch walk left the tree.
    #[error("invalid branch query: {0}")]
    InvalidBranch(String),

    /// Reading or writing the persisted tree failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}
