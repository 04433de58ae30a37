//! # Error Types
//!
//! Errors raised while encoding or decoding chain primitives.

use thiserror::Error;

/// Errors from chain primitive helpers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// Serialization or deserialization failed.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A header or block extension is malformed.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),
}
