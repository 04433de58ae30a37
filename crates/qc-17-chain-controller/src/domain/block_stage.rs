//! # Pending Block Stages
//!
//! ```text
//!   Building ──finalize_block──► Assembled ──complete_block──► Completed ──commit_block──► head
//!      │                             │                             │
//!      └─────────────────────────────┴──────── abort_block ────────┘
//! ```
//!
//! Exactly one stage is live at a time. Accessors fail with
//! [`ChainError::WrongBlockStage`] when asked for a stage that is not.

use super::block_state::{BlockState, PendingBlockHeaderState};
use super::transaction_metadata::TransactionMetadata;
use crate::error::{ChainError, ChainResult};
use qc_04_versioned_state::MaybeSession;
use shared_types::{
    BlockId, BlockTimestamp, Digest, Microseconds, ProducerAuthoritySchedule, SignedBlock,
    TransactionReceipt,
};
use std::sync::Arc;

/// Source of the transaction merkle root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrxMerkle {
    /// Taken verbatim from a received block header.
    Root(Digest),
    /// Receipt digests still to be merkleized.
    Digests(Vec<Digest>),
}

/// A block accepting transactions.
#[derive(Debug)]
pub struct BuildingBlock {
    pub pending_block_header_state: PendingBlockHeaderState,
    /// Proposed schedule promoted to pending by this block.
    pub new_pending_producer_schedule: Option<ProducerAuthoritySchedule>,
    pub new_protocol_feature_activations: Vec<Digest>,
    pub num_new_protocol_features_that_have_activated: usize,
    pub pending_trx_metas: Vec<Arc<TransactionMetadata>>,
    pub pending_trx_receipts: Vec<TransactionReceipt>,
    pub trx_mroot_or_receipt_digests: TrxMerkle,
    pub action_receipt_digests: Vec<Digest>,
}

impl BuildingBlock {
    pub fn new(pending_block_header_state: PendingBlockHeaderState, new_protocol_feature_activations: Vec<Digest>) -> Self {
        Self {
            pending_block_header_state,
            new_pending_producer_schedule: None,
            new_protocol_feature_activations,
            num_new_protocol_features_that_have_activated: 0,
            pending_trx_metas: Vec::new(),
            pending_trx_receipts: Vec::new(),
            trx_mroot_or_receipt_digests: TrxMerkle::Digests(Vec::new()),
            action_receipt_digests: Vec::new(),
        }
    }

    /// Whether a feature is active as of this block.
    pub fn is_protocol_feature_activated(&self, digest: &Digest) -> bool {
        self.pending_block_header_state
            .prev_activated_protocol_features
            .contains(digest)
            || self.new_protocol_feature_activations
                [..self.num_new_protocol_features_that_have_activated]
                .contains(digest)
    }
}

/// Sizes of the building block's lists, for rolling back one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestorePoint {
    receipts: usize,
    metas: usize,
    receipt_digests: Option<usize>,
    action_digests: usize,
}

impl RestorePoint {
    pub fn capture(building: &BuildingBlock) -> Self {
        Self {
            receipts: building.pending_trx_receipts.len(),
            metas: building.pending_trx_metas.len(),
            receipt_digests: match &building.trx_mroot_or_receipt_digests {
                TrxMerkle::Digests(d) => Some(d.len()),
                TrxMerkle::Root(_) => None,
            },
            action_digests: building.action_receipt_digests.len(),
        }
    }

    pub fn restore(self, building: &mut BuildingBlock) {
        building.pending_trx_receipts.truncate(self.receipts);
        building.pending_trx_metas.truncate(self.metas);
        if let (Some(len), TrxMerkle::Digests(digests)) =
            (self.receipt_digests, &mut building.trx_mroot_or_receipt_digests)
        {
            digests.truncate(len);
        }
        building.action_receipt_digests.truncate(self.action_digests);
    }
}

/// A block whose header is final but not yet signed.
#[derive(Debug)]
pub struct AssembledBlock {
    pub id: BlockId,
    pub pending_block_header_state: PendingBlockHeaderState,
    pub trx_metas: Vec<Arc<TransactionMetadata>>,
    pub unsigned_block: SignedBlock,
    pub new_producer_authority_cache: Option<ProducerAuthoritySchedule>,
}

/// A signed block ready to commit.
#[derive(Debug)]
pub struct CompletedBlock {
    pub block_state: Arc<BlockState>,
}

#[derive(Debug)]
pub enum BlockStage {
    Building(BuildingBlock),
    Assembled(AssembledBlock),
    Completed(CompletedBlock),
}

impl BlockStage {
    pub fn name(&self) -> &'static str {
        match self {
            BlockStage::Building(_) => "building",
            BlockStage::Assembled(_) => "assembled",
            BlockStage::Completed(_) => "completed",
        }
    }

    fn wrong(&self, wanted: &str) -> ChainError {
        ChainError::WrongBlockStage(format!(
            "pending block is {}, operation requires {wanted}",
            self.name()
        ))
    }

    pub fn building(&self) -> ChainResult<&BuildingBlock> {
        match self {
            BlockStage::Building(b) => Ok(b),
            other => Err(other.wrong("building")),
        }
    }

    pub fn building_mut(&mut self) -> ChainResult<&mut BuildingBlock> {
        match self {
            BlockStage::Building(b) => Ok(b),
            other => Err(other.wrong("building")),
        }
    }

    pub fn assembled(&self) -> ChainResult<&AssembledBlock> {
        match self {
            BlockStage::Assembled(a) => Ok(a),
            other => Err(other.wrong("assembled")),
        }
    }

    pub fn assembled_mut(&mut self) -> ChainResult<&mut AssembledBlock> {
        match self {
            BlockStage::Assembled(a) => Ok(a),
            other => Err(other.wrong("assembled")),
        }
    }

    pub fn completed(&self) -> ChainResult<&CompletedBlock> {
        match self {
            BlockStage::Completed(c) => Ok(c),
            other => Err(other.wrong("completed")),
        }
    }

    /// Pending header state; not available once completed.
    pub fn pending_block_header_state(&self) -> ChainResult<&PendingBlockHeaderState> {
        match self {
            BlockStage::Building(b) => Ok(&b.pending_block_header_state),
            BlockStage::Assembled(a) => Ok(&a.pending_block_header_state),
            BlockStage::Completed(_) => Err(self.wrong("building or assembled")),
        }
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        match self {
            BlockStage::Building(b) => b.pending_block_header_state.timestamp,
            BlockStage::Assembled(a) => a.pending_block_header_state.timestamp,
            BlockStage::Completed(c) => c.block_state.timestamp(),
        }
    }

    pub fn block_num(&self) -> u32 {
        match self {
            BlockStage::Building(b) => b.pending_block_header_state.block_num,
            BlockStage::Assembled(a) => a.pending_block_header_state.block_num,
            BlockStage::Completed(c) => c.block_state.block_num(),
        }
    }

    pub fn is_protocol_feature_activated(&self, digest: &Digest) -> ChainResult<bool> {
        match self {
            BlockStage::Building(b) => Ok(b.is_protocol_feature_activated(digest)),
            BlockStage::Assembled(_) => Err(ChainError::WrongBlockStage(
                "checking if protocol feature is activated in the assembled stage is not supported".into(),
            )),
            BlockStage::Completed(c) => Ok(c
                .block_state
                .header_state
                .activated_protocol_features
                .contains(digest)),
        }
    }

    /// Take the transaction metadata of whichever stage is live.
    pub fn extract_trx_metas(&mut self) -> Vec<Arc<TransactionMetadata>> {
        match self {
            BlockStage::Building(b) => std::mem::take(&mut b.pending_trx_metas),
            BlockStage::Assembled(a) => std::mem::take(&mut a.trx_metas),
            BlockStage::Completed(c) => c.block_state.extract_trxs_metas(),
        }
    }

    pub fn trx_metas(&self) -> Vec<Arc<TransactionMetadata>> {
        match self {
            BlockStage::Building(b) => b.pending_trx_metas.clone(),
            BlockStage::Assembled(a) => a.trx_metas.clone(),
            BlockStage::Completed(c) => c.block_state.trxs_metas(),
        }
    }
}

/// How a pending block came to be, which decides how much is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Replayed from the block log.
    Irreversible,
    /// Previously validated by this node.
    Validated,
    /// Fully signed block from the network.
    Complete,
    /// Being produced locally.
    Incomplete,
    /// Speculative; never committed.
    Ephemeral,
}

/// Totals reported after a block is applied or produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockReport {
    pub total_net_usage: u64,
    pub total_cpu_usage_us: u64,
    pub total_elapsed_time: Microseconds,
    pub total_time: Microseconds,
}

/// The block under construction plus its state-store session.
pub struct PendingState {
    pub db_session: MaybeSession,
    pub block_stage: BlockStage,
    pub block_status: BlockStatus,
    /// Id the finished block must have, when applying a received block.
    pub producer_block_id: Option<BlockId>,
    pub block_report: BlockReport,
}

impl PendingState {
    pub fn new(
        db_session: MaybeSession,
        building: BuildingBlock,
        block_status: BlockStatus,
        producer_block_id: Option<BlockId>,
    ) -> Self {
        Self {
            db_session,
            block_stage: BlockStage::Building(building),
            block_status,
            producer_block_id,
            block_report: BlockReport::default(),
        }
    }

    pub fn is_speculative(&self) -> bool {
        matches!(
            self.block_status,
            BlockStatus::Incomplete | BlockStatus::Ephemeral
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BlockHeaderState;

    fn building() -> BuildingBlock {
        let genesis = BlockHeaderState::genesis(BlockTimestamp::from_slot(1), b"k".to_vec(), [0u8; 32]);
        let pending = genesis.next(BlockTimestamp::from_slot(2), 0).unwrap();
        BuildingBlock::new(pending, vec![[1u8; 32], [2u8; 32]])
    }

    #[test]
    fn test_accessors_fail_fast_on_wrong_stage() {
        let stage = BlockStage::Building(building());
        assert!(stage.building().is_ok());
        assert!(matches!(stage.assembled(), Err(ChainError::WrongBlockStage(_))));
        assert!(matches!(stage.completed(), Err(ChainError::WrongBlockStage(_))));
        assert_eq!(stage.block_num(), 1);
    }

    #[test]
    fn test_features_count_only_once_handled() {
        let mut b = building();
        assert!(!b.is_protocol_feature_activated(&[1u8; 32]));
        b.num_new_protocol_features_that_have_activated = 1;
        assert!(b.is_protocol_feature_activated(&[1u8; 32]));
        assert!(!b.is_protocol_feature_activated(&[2u8; 32]));
    }

    #[test]
    fn test_restore_point_truncates_lists() {
        let mut b = building();
        b.action_receipt_digests.push([5u8; 32]);
        let point = RestorePoint::capture(&b);
        b.action_receipt_digests.push([6u8; 32]);
        if let TrxMerkle::Digests(d) = &mut b.trx_mroot_or_receipt_digests {
            d.push([7u8; 32]);
        }
        point.restore(&mut b);
        assert_eq!(b.action_receipt_digests, vec![[5u8; 32]]);
        assert_eq!(b.trx_mroot_or_receipt_digests, TrxMerkle::Digests(Vec::new()));
    }
}
