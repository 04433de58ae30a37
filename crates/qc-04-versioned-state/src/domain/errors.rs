use thiserror::Error;

/// Errors raised by the versioned state store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("No undo session to {operation}")]
    NoSession { operation: &'static str },

    #[error("Cannot set revision while undo sessions are open ({depth} open)")]
    SessionsOpen { depth: usize },

    #[error("Database is in read-only mode")]
    ReadOnly,

    #[error("Database guard exceeded: {free} bytes free, guard is {guard} bytes")]
    DatabaseGuard { free: u64, guard: u64 },

    #[error("Row not found in table {table}: {key}")]
    RowNotFound { table: &'static str, key: String },

    #[error("Duplicate row in table {table}: {key}")]
    DuplicateRow { table: &'static str, key: String },

    #[error("Snapshot section missing: {0}")]
    SectionMissing(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::SerializationError(e.to_string())
    }
}
