//! The node contract the fork database is generic over.

use shared_types::{BlockId, BlockTimestamp};
use std::cmp::Reverse;

/// A block as seen by the fork database.
///
/// Validity is interior-mutable: a node is shared by `Arc` between the tree
/// and the controller's head pointer and flips to valid once applied.
pub trait ForkNode: Send + Sync {
    fn id(&self) -> BlockId;
    fn previous(&self) -> BlockId;
    fn block_num(&self) -> u32;
    fn timestamp(&self) -> BlockTimestamp;
    /// Last irreversible block number implied by this node.
    fn irreversible_blocknum(&self) -> u32;
    fn is_valid(&self) -> bool;
    fn set_valid(&self, valid: bool);
}

/// Best-head ordering key; larger is better.
///
/// Higher implied irreversible number wins, then height, then the earlier
/// production slot, then the smaller id. The slot comparison is an extra
/// tier over a plain (irreversible, height, id) ordering: at equal height
/// the block produced first wins whatever its id.
pub type Priority = (u32, u32, Reverse<BlockTimestamp>, Reverse<BlockId>);

pub fn priority<N: ForkNode + ?Sized>(node: &N) -> Priority {
    (
        node.irreversible_blocknum(),
        node.block_num(),
        Reverse(node.timestamp()),
        Reverse(node.id()),
    )
}
