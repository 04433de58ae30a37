//! # qc-02-block-log
//!
//! Durable logs of finalized history.
//!
//! ## Role in System
//!
//! - **Block log**: every irreversible block, gap-free by number.
//! - **Header-state log**: optional twin log of header states over the same
//!   number range.
//!
//! Callers serialize ahead of time with [`TypedLog::pack`] so the costly
//! encoding can run off the write thread; `append` only frames and writes.
//!
//! ## Data Integrity
//!
//! Each entry carries a CRC32 of its payload. A torn final entry is
//! discarded on open; a checksum mismatch anywhere else is an error.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{FileLogStore, MemoryLogStore};
pub use domain::{BlockLogError, LogEntry};
pub use ports::{next_block_num, LogStore};
pub use service::{BlockLog, TypedLog};
