//! # Shared Types Crate
//!
//! Chain primitives shared by every crate in the workspace: identifiers,
//! clocks, headers, signed blocks, transactions, receipts and producer
//! schedules, plus the digest and merkle helpers that give them ids.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: consensus-relevant layouts live here only.
//! - **Infallible ids**: ids are hashed field by field, never through a
//!   fallible serializer.
//! - **Opaque crypto**: keys and signatures are byte vectors; their meaning
//!   belongs to the authorization layer.

pub mod block;
pub mod digest;
pub mod entities;
pub mod errors;
pub mod producer_schedule;
pub mod transaction;

pub use block::*;
pub use digest::{merkle, sha256, DigestEncode};
pub use entities::*;
pub use errors::*;
pub use producer_schedule::*;
pub use transaction::*;
