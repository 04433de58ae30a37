use thiserror::Error;

/// Errors raised by block and header-state logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockLogError {
    /// Appends must be gap-free and strictly increasing.
    #[error("Non-sequential append: expected block {expected}, got {actual}")]
    NonSequential { expected: u32, actual: u32 },

    /// Stored bytes do not match their checksum.
    #[error("Data corruption: checksum mismatch for block {block_num}")]
    DataCorruption { block_num: u32 },

    /// Requested entry is outside the log.
    #[error("Block {0} not in log")]
    NotFound(u32),

    /// Another process holds the log.
    #[error("Log already locked: {0}")]
    Locked(String),

    /// Underlying IO failure.
    #[error("IO error: {0}")]
    Io(String),

    /// Encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for BlockLogError {
    fn from(e: std::io::Error) -> Self {
        BlockLogError::Io(e.to_string())
    }
}

impl From<bincode::Error> for BlockLogError {
    fn from(e: bincode::Error) -> Self {
        BlockLogError::Serialization(e.to_string())
    }
}
