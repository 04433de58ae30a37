//! # qc-08-fork-database
//!
//! The reversible part of the chain: every block received or produced since
//! the last irreversible block, organised as a tree under that block.
//!
//! ## Responsibilities
//!
//! - Link new blocks to known parents; reject duplicates and orphans
//! - Track the best validated head and the best pending head
//! - Extract branches between two blocks for fork switching
//! - Prune on irreversibility (`advance_root`) and on failure (`remove`)
//!
//! ## Head Selection
//!
//! ```text
//! priority = (irreversible_blocknum, block_num, earlier slot, smaller id)
//! head         = max priority over validated nodes, else root
//! pending_head = max priority over all nodes, else root
//! ```
//!
//! The node type is supplied by the caller through [`ForkNode`].

pub mod adapters;
pub mod domain;

#[cfg(test)]
pub(crate) mod test_utils;

pub use adapters::{load_fork_database, save_fork_database};
pub use domain::*;
