//! Read-only accessors.

use super::Controller;
use crate::domain::{BlockReport, BlockStage, BlockState, TransactionMetadata, TransactionObject};
use crate::error::{ChainError, ChainResult};
use qc_08_fork_database::ForkDatabaseError;
use shared_types::{
    BlockId, BlockTimestamp, ChainId, Name, ProducerAuthoritySchedule, SignedBlock, TimePoint,
    TransactionId,
};
use std::sync::Arc;

impl Controller {
    pub fn head_block_num(&self) -> ChainResult<u32> {
        Ok(self.head()?.block_num())
    }

    pub fn head_block_id(&self) -> ChainResult<BlockId> {
        Ok(self.head()?.id())
    }

    pub fn head_block_time(&self) -> ChainResult<TimePoint> {
        Ok(self.head()?.timestamp().to_time_point())
    }

    pub fn head_block_producer(&self) -> ChainResult<Name> {
        Ok(self.head()?.header_state.header.producer.clone())
    }

    pub fn head_block_state(&self) -> ChainResult<Arc<BlockState>> {
        Ok(self.head()?.clone())
    }

    /// Best block in the fork database. Ahead of the head in irreversible
    /// read mode.
    pub fn fork_db_head_block_num(&self) -> ChainResult<u32> {
        Ok(self.fork_db_head()?.block_num())
    }

    pub fn fork_db_head_block_id(&self) -> ChainResult<BlockId> {
        Ok(self.fork_db_head()?.id())
    }

    fn fork_db_head(&self) -> ChainResult<Arc<BlockState>> {
        Ok(self.fork_db.pending_head().ok_or(ForkDatabaseError::NoRoot)?)
    }

    pub fn last_irreversible_block_num(&self) -> ChainResult<u32> {
        Ok(self.fork_db.root().ok_or(ForkDatabaseError::NoRoot)?.block_num())
    }

    pub fn last_irreversible_block_id(&self) -> ChainResult<BlockId> {
        Ok(self.fork_db.root().ok_or(ForkDatabaseError::NoRoot)?.id())
    }

    pub fn is_building_block(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_block_num(&self) -> ChainResult<u32> {
        Ok(self.pending_ref()?.block_stage.block_num())
    }

    pub fn pending_block_time(&self) -> ChainResult<BlockTimestamp> {
        Ok(self.pending_ref()?.block_stage.timestamp())
    }

    pub fn pending_block_producer(&self) -> ChainResult<Name> {
        Ok(match &self.pending_ref()?.block_stage {
            BlockStage::Building(b) => b.pending_block_header_state.producer.clone(),
            BlockStage::Assembled(a) => a.pending_block_header_state.producer.clone(),
            BlockStage::Completed(c) => c.block_state.header_state.header.producer.clone(),
        })
    }

    pub fn pending_block_report(&self) -> ChainResult<BlockReport> {
        Ok(self.pending_ref()?.block_report)
    }

    /// Look a block up on the best branch first, then in the block log.
    pub fn fetch_block_by_number(&self, block_num: u32) -> ChainResult<Option<Arc<SignedBlock>>> {
        if let Some(head) = self.fork_db.pending_head() {
            let found = self
                .fork_db
                .search_on_branch(&head.id(), block_num)
                .and_then(|bsp| bsp.block.clone());
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(self.blog.read_by_num(block_num)?.map(Arc::new))
    }

    pub fn fetch_block_by_id(&self, id: &BlockId) -> ChainResult<Option<Arc<SignedBlock>>> {
        if let Some(block) = self.fork_db.get_or_root(id).and_then(|bsp| bsp.block.clone()) {
            return Ok(Some(block));
        }
        Ok(self.blog.read_by_id(id)?.map(Arc::new))
    }

    pub fn get_block_id_for_num(&self, block_num: u32) -> ChainResult<BlockId> {
        if let Some(head) = self.fork_db.pending_head() {
            if let Some(bsp) = self.fork_db.search_on_branch(&head.id(), block_num) {
                return Ok(bsp.id());
            }
        }
        self.blog
            .id_for_num(block_num)?
            .ok_or_else(|| ChainError::BlockNotFound(format!("could not find block #{block_num}")))
    }

    /// Schedule in force for the pending block, or at the head.
    pub fn active_producers(&self) -> ChainResult<ProducerAuthoritySchedule> {
        let Some(pending) = &self.pending else {
            return Ok(self.head()?.header_state.active_schedule.clone());
        };
        Ok(match &pending.block_stage {
            BlockStage::Building(b) => b.pending_block_header_state.active_schedule.clone(),
            BlockStage::Assembled(a) => a.pending_block_header_state.active_schedule.clone(),
            BlockStage::Completed(c) => c.block_state.header_state.active_schedule.clone(),
        })
    }

    /// Schedule waiting to become active once its proposing block is
    /// irreversible.
    pub fn pending_producers(&self) -> ChainResult<ProducerAuthoritySchedule> {
        let Some(pending) = &self.pending else {
            return Ok(self.head()?.header_state.pending_schedule.schedule.clone());
        };
        Ok(match &pending.block_stage {
            BlockStage::Building(b) => b.new_pending_producer_schedule.clone().unwrap_or_else(|| {
                b.pending_block_header_state.prev_pending_schedule.schedule.clone()
            }),
            BlockStage::Assembled(a) => a.new_producer_authority_cache.clone().unwrap_or_else(|| {
                a.pending_block_header_state.prev_pending_schedule.schedule.clone()
            }),
            BlockStage::Completed(c) => c.block_state.header_state.pending_schedule.schedule.clone(),
        })
    }

    /// Schedule proposed but not yet carried by a block header.
    pub fn proposed_producers(&self) -> ChainResult<Option<ProducerAuthoritySchedule>> {
        let gpo = self.global_properties()?;
        Ok(gpo.proposed_schedule_block_num.map(|_| gpo.proposed_schedule))
    }

    pub fn get_unapplied_transactions(&self) -> &[Arc<TransactionMetadata>] {
        &self.unapplied_transactions
    }

    /// Remove metadata of aborted blocks the caller has re-queued.
    pub fn clear_unapplied_transactions(&mut self) -> Vec<Arc<TransactionMetadata>> {
        std::mem::take(&mut self.unapplied_transactions)
    }

    pub fn get_chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Whether the id is still held by the deduplication table.
    pub fn is_known_unexpired_transaction(&self, id: &TransactionId) -> ChainResult<bool> {
        Ok(self.db.find::<TransactionObject>(id)?.is_some())
    }
}
