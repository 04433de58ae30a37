//! # Quantum Chain - Chain Controller (Subsystem 17)
//!
//! **Bounded Context:** Block assembly, transaction pipeline, fork resolution
//! and irreversibility
//!
//! ## Purpose
//!
//! The controller is the write-side core of a node. It:
//! - builds candidate blocks through the Building → Assembled → Completed stages
//! - speculatively executes transactions inside nested undo sessions
//! - validates and applies received blocks, switching forks when a better
//!   branch appears and restoring the previous head when that branch fails
//! - advances the last irreversible block, appending finalized blocks to the
//!   block log and committing the state store
//! - gates consensus changes behind protocol feature activation
//!
//! ## Architecture Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Service (Controller facade)                        │
//! │  - block_assembly: start/finalize/complete/commit   │
//! │  - transactions:   push / push_scheduled            │
//! │  - fork_resolution: push_block / switch / pop       │
//! │  - irreversibility: log_irreversible                │
//! │  - protocol_gate:  preactivate / validate           │
//! │  - lifecycle:      genesis / snapshot / replay      │
//! │  - queries:        head / lib / fetch_block_*       │
//! └─────────────────────────────────────────────────────┘
//!                         │
//! ┌─────────────────────────────────────────────────────┐
//! │  Ports (Outbound)                                   │
//! │  - ExecutionEngine, Authorization, ResourceLimits   │
//! └─────────────────────────────────────────────────────┘
//!                         │
//! ┌─────────────────────────────────────────────────────┐
//! │  Domain (Pure Logic)                                │
//! │  - BlockHeaderState / BlockState                    │
//! │  - BlockStage, PendingState                         │
//! │  - ProtocolFeatureSet / Manager, ActivationHandlers │
//! │  - TransactionMetadata, TransactionDeadline         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Collaborators
//!
//! | Crate                   | Role                                      |
//! |-------------------------|-------------------------------------------|
//! | `qc-04-versioned-state` | state store with nested undo sessions     |
//! | `qc-08-fork-database`   | tree of reversible blocks                 |
//! | `qc-02-block-log`       | irreversible block and header-state logs  |
//!
//! ## Threading
//!
//! All mutating operations run on one write thread and take `&mut self`.
//! Merkle roots, block serialization and signature recovery are posted to
//! a named worker pool ([`thread_pool::NamedThreadPool`]) and awaited.
//!
//! ## Critical Invariants
//!
//! 1. **Stage order**: a pending block only moves Building → Assembled → Completed
//! 2. **Atomicity**: every block and transaction runs in an undo session that
//!    is either pushed, squashed or rolled back on every exit path
//! 3. **Branch-exact switching**: only blocks above the common ancestor are
//!    popped and applied
//! 4. **Monotonic irreversibility**: the fork database root never moves back

#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod service;
pub mod signals;
pub mod thread_pool;

pub use config::{ControllerConfig, GenesisState, ReadMode, ValidationMode};
pub use error::{ChainError, ChainResult};

pub use domain::{
    BlockHeaderState, BlockReport, BlockStage, BlockState, BlockStatus, BuiltinProtocolFeature,
    ProtocolFeatureSet, TransactionDeadline, TransactionMetadata, TransactionTrace, TrxType,
};

pub use ports::{Authorization, ChainCollaborators, ExecutionEngine, ResourceLimits};

pub use service::{Controller, ForkedBranchCallback, TrxMetaLookup};

pub use signals::ChainSignals;

/// Subsystem identifier used in log prefixes.
pub const SUBSYSTEM_ID: u8 = 17;

/// Default state store size (1 GiB).
pub const DEFAULT_STATE_SIZE: u64 = 1024 * 1024 * 1024;

/// Free space below which new blocks are refused (128 MiB).
pub const DEFAULT_STATE_GUARD_SIZE: u64 = 128 * 1024 * 1024;

/// Default share of signature recovery time billed to the transaction.
pub const DEFAULT_SIG_CPU_BILL_PCT: u32 = 50;

pub const DEFAULT_CHAIN_THREAD_POOL_SIZE: u16 = 4;

/// Snapshot format version written into the header section.
pub const SNAPSHOT_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sizes_leave_room_above_guard() {
        assert!(DEFAULT_STATE_GUARD_SIZE < DEFAULT_STATE_SIZE);
        assert!(DEFAULT_SIG_CPU_BILL_PCT <= 100);
        assert!(DEFAULT_CHAIN_THREAD_POOL_SIZE > 0);
    }
}
