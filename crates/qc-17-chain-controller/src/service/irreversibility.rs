//! Moving blocks that became irreversible out of the fork database and
//! into the block log.

use super::{BlockStateLog, Controller};
use crate::config::ReadMode;
use crate::domain::{BlockReport, BlockState, BlockStatus, TransactionMetadata};
use crate::error::{ChainError, ChainResult};
use crate::thread_pool::AsyncResult;
use qc_02_block_log::BlockLog;
use qc_08_fork_database::ForkDatabaseError;
use shared_types::{short_id, BlockId, TransactionId};
use std::sync::Arc;
use tracing::debug;

/// Encoded log entries of one irreversible block.
struct PackedEntry {
    block: Vec<u8>,
    state: Option<Vec<u8>>,
}

impl Controller {
    /// Append every block at or below the new irreversible block number to
    /// the block log, commit the state store up to it and advance the fork
    /// database root. In irreversible read mode those blocks are applied
    /// first.
    pub(super) fn log_irreversible(&mut self) -> ChainResult<()> {
        let root = self.fork_db.root().ok_or(ForkDatabaseError::NoRoot)?;
        let log_first = self.blog.first_block_num();
        let log_head_num = self.blog.head_num().unwrap_or(log_first.saturating_sub(1));

        let consistent = match self.blog.head_id() {
            Some(log_head_id) => log_head_id == root.id(),
            None => root.block_num() == log_first.saturating_sub(1),
        };
        if !consistent {
            return Err(ChainError::ForkDatabaseInconsistent(format!(
                "fork database root {} (#{}) does not match the block log head #{}",
                short_id(&root.id()),
                root.block_num(),
                log_head_num
            )));
        }

        let fork_head = if self.config.read_mode == ReadMode::Irreversible {
            self.fork_db.pending_head().ok_or(ForkDatabaseError::NoRoot)?
        } else {
            self.head()?.clone()
        };
        let new_lib = fork_head.dpos_irreversible_blocknum();
        if new_lib <= log_head_num {
            return Ok(());
        }

        let mut branch = self.fork_db.fetch_branch(&fork_head.id(), new_lib);
        branch.reverse();

        let keep_state = self.state_log.is_some();
        let packed: Vec<AsyncResult<PackedEntry>> = branch
            .iter()
            .map(|bsp| {
                let bsp = bsp.clone();
                self.thread_pool.post(move || pack_entry(&bsp, keep_state))
            })
            .collect();

        let original_root = root.id();
        let mut root_id = original_root;
        let result = self.append_irreversible(&branch, packed, &mut root_id);

        if root_id != original_root {
            self.fork_db.advance_root(&root_id)?;
        }
        self.thread_pool.spawn(move || drop(branch));
        result
    }

    fn append_irreversible(
        &mut self,
        branch: &[Arc<BlockState>],
        packed: Vec<AsyncResult<PackedEntry>>,
        root_id: &mut BlockId,
    ) -> ChainResult<()> {
        let no_lookup = |_: &TransactionId| -> Option<Arc<TransactionMetadata>> { None };
        for (bsp, entry) in branch.iter().zip(packed) {
            if self.config.read_mode == ReadMode::Irreversible {
                let mut report = BlockReport::default();
                self.apply_block(&mut report, bsp, BlockStatus::Complete, &no_lookup)?;
            }

            let entry = entry.get()?;
            self.blog.append(bsp.block_num(), bsp.id(), &entry.block)?;
            if let (Some(log), Some(state)) = (self.state_log.as_mut(), entry.state) {
                log.append(bsp.block_num(), bsp.id(), &state)?;
            }

            self.signals.irreversible_block.emit(bsp)?;
            self.db.commit(i64::from(bsp.block_num()))?;
            *root_id = bsp.id();
            debug!(
                block_num = bsp.block_num(),
                id = %short_id(&bsp.id()),
                "[qc-17] block became irreversible"
            );
        }
        Ok(())
    }
}

fn pack_entry(bsp: &BlockState, keep_state: bool) -> ChainResult<PackedEntry> {
    let block = bsp.block.as_ref().ok_or_else(|| {
        ChainError::Internal(format!(
            "irreversible block #{} has no block body",
            bsp.block_num()
        ))
    })?;
    let state = if keep_state {
        Some(BlockStateLog::pack(&bsp.header_state)?)
    } else {
        None
    };
    Ok(PackedEntry {
        block: BlockLog::pack(block)?,
        state,
    })
}
