//! # Quantum-Chain Controller Test Suite
//!
//! Scenarios that cross crate boundaries: a controller backed by file logs
//! and a persisted fork database, restarted and replayed.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs     # Chain builders shared by the scenarios
//!     ├── restart.rs      # Shutdown, restart and block log replay
//!     └── properties.rs   # Randomized produce/speculate sequences
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p qc-tests
//! cargo test -p qc-tests integration::restart::
//! ```

pub mod integration;
