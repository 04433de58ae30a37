//! # qc-04-versioned-state
//!
//! Versioned key/value state for the chain controller.
//!
//! ## Role in System
//!
//! - **Speculative execution**: every transaction and block runs inside a
//!   nested undo session and is rolled back unless explicitly kept.
//! - **Revision tracking**: the revision equals the head block number once
//!   blocks are committed, which lets the controller assert alignment.
//! - **Snapshots**: tables are exported and imported as named sections.
//!
//! ## Session Lifecycle
//!
//! ```text
//! start_undo_session ──► [changes] ──┬─► push    (kept until commit/undo)
//!                                    ├─► squash  (merged into outer session)
//!                                    ├─► undo    (rolled back)
//!                                    └─► drop    (rolled back)
//! ```

pub mod adapters;
pub mod domain;
pub mod ports;

pub use adapters::*;
pub use domain::*;
pub use ports::*;
