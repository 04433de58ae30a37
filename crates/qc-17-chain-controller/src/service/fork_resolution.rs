//! Received blocks: validation, application and fork switching.

use super::{no_pending, Controller, ForkedBranchCallback, TrxMetaLookup};
use crate::config::{ReadMode, ValidationMode};
use crate::domain::{
    BlockReport, BlockStage, BlockState, BlockStatus, CompletedBlock, TransactionMetadata,
    TrxMerkle, TrxType,
};
use crate::error::{ChainError, ChainResult};
use crate::thread_pool::AsyncResult;
use qc_08_fork_database::{ForkDatabaseError, ForkNode};
use shared_types::{
    short_id, BlockHeader, BlockTimestamp, Digest, Microseconds, ReceiptTrx, SignedBlock,
    TimePoint, TransactionStatus,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Transaction metadata of a received block, possibly still recovering keys.
enum PreparedTrx {
    Ready(Arc<TransactionMetadata>),
    Recovering(AsyncResult<TransactionMetadata>),
}

impl PreparedTrx {
    fn wait(self) -> ChainResult<Arc<TransactionMetadata>> {
        match self {
            PreparedTrx::Ready(meta) => Ok(meta),
            PreparedTrx::Recovering(result) => Ok(Arc::new(result.get()?)),
        }
    }
}

impl Controller {
    /// Validate a received block's header against its parent and build its
    /// state. Returns the known state when the block is already in the
    /// fork database.
    pub fn create_block_state(&self, block: Arc<SignedBlock>) -> ChainResult<Arc<BlockState>> {
        let id = block.id();
        if let Some(existing) = self.fork_db.get(&id) {
            return Ok(existing);
        }
        let previous = *block.previous();
        let parent = self.fork_db.get_or_root(&previous).ok_or_else(|| {
            ChainError::ForkDatabase(ForkDatabaseError::UnlinkableBlock {
                id: hex::encode(id),
                previous: hex::encode(previous),
            })
        })?;

        let skip_validate_signee = self.config.block_validation_mode == ValidationMode::Light
            || self.config.trusted_producers.contains(&block.header.producer);
        let feature_set = self.protocol_features.feature_set();
        let validator = |timestamp: BlockTimestamp, active: &BTreeSet<Digest>, new: &[Digest]| {
            feature_set.check_protocol_features(timestamp, active, new)
        };
        let state = BlockState::from_received(
            &parent.header_state,
            block,
            &validator,
            skip_validate_signee,
            self.collaborators.authorization.as_ref(),
        )?;
        Ok(Arc::new(state))
    }

    /// Add a received block to the fork database and switch to the best
    /// branch. On failure the previous head is restored.
    pub fn push_block(
        &mut self,
        bsp: Arc<BlockState>,
        forked_branch_cb: Option<&ForkedBranchCallback<'_>>,
        trx_lookup: &TrxMetaLookup<'_>,
    ) -> ChainResult<BlockReport> {
        if self.pending.is_some() {
            return Err(ChainError::WrongBlockStage(
                "it is not valid to push a block when there is a pending block".into(),
            ));
        }
        let head_num = self.head()?.block_num();
        if self.config.terminate_at_block > 0 && self.config.terminate_at_block <= head_num {
            info!(
                "[qc-17] Reached configured maximum block {}; terminating",
                self.config.terminate_at_block
            );
            if let Some(shutdown) = &self.shutdown_callback {
                shutdown();
            }
            return Ok(BlockReport::default());
        }

        let block = bsp
            .block
            .clone()
            .ok_or_else(|| ChainError::BlockValidate("pushed block state carries no block".into()))?;
        self.signals.pre_accepted_block.emit(&(block, bsp.id()))?;
        self.fork_db.add(bsp.clone(), false)?;
        self.trusted_producer_light_validation = self
            .config
            .trusted_producers
            .contains(&bsp.header_state.header.producer);
        self.signals.accepted_block_header.emit(&bsp)?;

        let mut report = BlockReport::default();
        if self.config.read_mode == ReadMode::Irreversible {
            self.log_irreversible()?;
        } else {
            let new_head = self.fork_db.pending_head().ok_or(ForkDatabaseError::NoRoot)?;
            self.maybe_switch_forks(
                &mut report,
                new_head,
                BlockStatus::Complete,
                forked_branch_cb,
                trx_lookup,
            )?;
        }
        Ok(report)
    }

    pub(super) fn maybe_switch_forks(
        &mut self,
        report: &mut BlockReport,
        new_head: Arc<BlockState>,
        status: BlockStatus,
        forked_branch_cb: Option<&ForkedBranchCallback<'_>>,
        trx_lookup: &TrxMetaLookup<'_>,
    ) -> ChainResult<()> {
        let head = self.head()?.clone();
        if new_head.previous() == head.id() {
            if let Err(e) = self.apply_block(report, &new_head, status, trx_lookup) {
                self.remove_failed_block(&new_head, &e);
                return Err(e);
            }
        } else if new_head.id() != head.id() {
            self.switch_forks(report, &head, &new_head, forked_branch_cb, trx_lookup)?;
        } else {
            return Ok(());
        }
        self.log_irreversible()
    }

    fn switch_forks(
        &mut self,
        report: &mut BlockReport,
        head: &Arc<BlockState>,
        new_head: &Arc<BlockState>,
        forked_branch_cb: Option<&ForkedBranchCallback<'_>>,
        trx_lookup: &TrxMetaLookup<'_>,
    ) -> ChainResult<()> {
        info!(
            from = %short_id(&head.id()),
            from_num = head.block_num(),
            to = %short_id(&new_head.id()),
            to_num = new_head.block_num(),
            "[qc-17] switching forks"
        );
        let (new_branch, old_branch) = self.fork_db.fetch_branch_from(&new_head.id(), &head.id())?;
        let ancestor = match (old_branch.last(), new_branch.last()) {
            (Some(oldest), _) => oldest.previous(),
            (None, Some(oldest)) => oldest.previous(),
            (None, None) => head.id(),
        };

        for _ in 0..old_branch.len() {
            self.pop_block()?;
        }
        self.check_head_is(&ancestor)?;
        if let Some(cb) = forked_branch_cb {
            cb(&old_branch);
        }

        let mut applied = 0usize;
        for bsp in new_branch.iter().rev() {
            let status = if bsp.is_valid() {
                BlockStatus::Validated
            } else {
                BlockStatus::Complete
            };
            let mut block_report = BlockReport::default();
            match self.apply_block(&mut block_report, bsp, status, trx_lookup) {
                Ok(()) => {
                    applied += 1;
                    *report = block_report;
                }
                Err(e) => {
                    warn!(
                        block_num = bsp.block_num(),
                        id = %short_id(&bsp.id()),
                        error = %e,
                        "[qc-17] exception thrown while switching forks, restoring previous branch"
                    );
                    self.remove_failed_block(bsp, &e);
                    for _ in 0..applied {
                        self.pop_block()?;
                    }
                    self.check_head_is(&ancestor)?;
                    for old in old_branch.iter().rev() {
                        let mut restore_report = BlockReport::default();
                        self.apply_block(&mut restore_report, old, BlockStatus::Validated, trx_lookup)?;
                    }
                    return Err(e);
                }
            }
        }

        self.thread_pool.spawn(move || drop(old_branch));
        info!(
            head = %short_id(&new_head.id()),
            block_num = new_head.block_num(),
            "[qc-17] successfully switched fork"
        );
        Ok(())
    }

    fn check_head_is(&self, expected: &shared_types::BlockId) -> ChainResult<()> {
        if self.head()?.id() != *expected {
            return Err(ChainError::ForkDatabaseInconsistent(
                "loss of sync between fork database and state store during fork switch".into(),
            ));
        }
        Ok(())
    }

    fn remove_failed_block(&self, bsp: &Arc<BlockState>, cause: &ChainError) {
        if !cause.invalidates_block() {
            return;
        }
        if let Err(e) = self.fork_db.remove(&bsp.id()) {
            warn!(
                id = %short_id(&bsp.id()),
                error = %e,
                "[qc-17] unable to remove failed block from fork database"
            );
        }
    }

    /// Re-execute a block on top of the head and commit it. The pending
    /// block is aborted on failure.
    pub(super) fn apply_block(
        &mut self,
        report: &mut BlockReport,
        bsp: &Arc<BlockState>,
        status: BlockStatus,
        trx_lookup: &TrxMetaLookup<'_>,
    ) -> ChainResult<()> {
        let start = TimePoint::now();
        match self.replay_block_transactions(bsp, status, trx_lookup) {
            Ok(()) => {}
            Err(e) => {
                self.abort_block();
                return Err(e);
            }
        }
        if let Some(pending) = &self.pending {
            *report = pending.block_report;
        }
        self.commit_block()?;
        report.total_time = TimePoint::now().since(start);
        Ok(())
    }

    fn replay_block_transactions(
        &mut self,
        bsp: &Arc<BlockState>,
        status: BlockStatus,
        trx_lookup: &TrxMetaLookup<'_>,
    ) -> ChainResult<()> {
        let block = bsp
            .block
            .clone()
            .ok_or_else(|| ChainError::BlockValidate("cannot apply a block state without a block".into()))?;
        let header = &block.header;
        self.start_block(
            header.timestamp,
            header.confirmed,
            bsp.new_protocol_feature_activations()?,
            status,
            Some(bsp.id()),
            TimePoint::maximum(),
        )?;

        if status == BlockStatus::Irreversible && !self.config.force_all_checks {
            self.pending
                .as_mut()
                .ok_or_else(no_pending)?
                .block_stage
                .building_mut()?
                .trx_mroot_or_receipt_digests = TrxMerkle::Root(header.transaction_mroot);
        }

        let light = self.light_validation_allowed();
        let keys_cached = bsp.is_pub_keys_recovered();
        let prepared: Vec<PreparedTrx> = if keys_cached {
            bsp.trxs_metas().into_iter().map(PreparedTrx::Ready).collect()
        } else {
            self.prepare_trx_metas(&block, light, trx_lookup)
        };
        let mut prepared = prepared.into_iter();

        let mut metas = Vec::new();
        for receipt in &block.transactions {
            let receipts_before = self.building_receipt_count()?;
            let trace = match &receipt.trx {
                ReceiptTrx::Packed(_) => {
                    let meta = prepared
                        .next()
                        .ok_or_else(|| {
                            ChainError::BlockValidate("missing metadata for packed transaction".into())
                        })?
                        .wait()?;
                    metas.push(meta.clone());
                    self.push_transaction_inner(
                        meta,
                        TimePoint::maximum(),
                        Microseconds::MAX,
                        receipt.header.cpu_usage_us,
                        true,
                        0,
                    )?
                }
                ReceiptTrx::Id(id) => {
                    self.push_scheduled_transaction(id, receipt.header.cpu_usage_us, true)?
                }
            };

            let can_fail = receipt.header.status == TransactionStatus::HardFail
                && matches!(receipt.trx, ReceiptTrx::Id(_));
            if let Some(e) = &trace.except {
                if !can_fail {
                    return Err(e.clone());
                }
            }

            let building = self.pending_ref()?.block_stage.building()?;
            let receipts = &building.pending_trx_receipts;
            if receipts.len() != receipts_before + 1 {
                return Err(ChainError::BlockValidate(format!(
                    "expected receipt for transaction {} was not added",
                    short_id(&receipt.trx_id())
                )));
            }
            if receipts.last() != Some(receipt) {
                return Err(ChainError::BlockValidate(format!(
                    "receipt does not match, producer receipt {:?} vs validator receipt {:?}",
                    receipt.header,
                    receipts.last().map(|r| &r.header)
                )));
            }
        }

        self.finalize_block()?;

        let pending = self.pending.as_mut().ok_or_else(no_pending)?;
        let assembled = pending.block_stage.assembled()?;
        if pending.producer_block_id != Some(assembled.id) {
            let mismatch = header_mismatch(&block.header, &assembled.unsigned_block.header);
            error!(
                block_num = bsp.block_num(),
                producer = %short_id(&bsp.id()),
                validator = %short_id(&assembled.id),
                mismatch = %mismatch,
                "[qc-17] validator block id does not match producer block id"
            );
            return Err(ChainError::BlockValidate(format!(
                "block id does not match: {mismatch}"
            )));
        }

        if !keys_cached {
            bsp.set_trxs_metas(metas, !light);
        }
        pending.block_stage = BlockStage::Completed(CompletedBlock {
            block_state: bsp.clone(),
        });
        Ok(())
    }

    fn building_receipt_count(&self) -> ChainResult<usize> {
        Ok(self
            .pending_ref()?
            .block_stage
            .building()?
            .pending_trx_receipts
            .len())
    }

    /// Metadata for each packed receipt, reusing known transactions and
    /// recovering keys on the pool for the rest.
    fn prepare_trx_metas(
        &self,
        block: &SignedBlock,
        light: bool,
        trx_lookup: &TrxMetaLookup<'_>,
    ) -> Vec<PreparedTrx> {
        block
            .transactions
            .iter()
            .filter_map(|receipt| match &receipt.trx {
                ReceiptTrx::Packed(packed) => Some(packed),
                ReceiptTrx::Id(_) => None,
            })
            .map(|packed| match trx_lookup(&packed.id()) {
                Some(meta) if meta.packed_trx().as_ref() == packed => PreparedTrx::Ready(meta),
                _ if light => PreparedTrx::Ready(Arc::new(TransactionMetadata::create_no_recover_keys(
                    Arc::new(packed.clone()),
                    TrxType::Input,
                ))),
                _ => {
                    let packed = Arc::new(packed.clone());
                    let chain_id = self.chain_id;
                    let authorization = self.collaborators.authorization.clone();
                    PreparedTrx::Recovering(self.thread_pool.post(move || {
                        TransactionMetadata::recover_keys(
                            packed,
                            TrxType::Input,
                            &chain_id,
                            authorization.as_ref(),
                        )
                    }))
                }
            })
            .collect()
    }

    /// Undo the head block, making its parent the head. Requires no
    /// pending block.
    pub fn pop_block(&mut self) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::WrongBlockStage(
                "cannot pop a block while a block is pending".into(),
            ));
        }
        let head = self.head()?.clone();
        let prev = head
            .block
            .as_ref()
            .and_then(|_| self.fork_db.get_or_root(&head.previous()))
            .ok_or_else(|| {
                ChainError::BlockValidate("attempt to pop beyond last irreversible block".into())
            })?;
        self.db.undo()?;
        self.protocol_features.popped_blocks_to(prev.block_num());
        self.head = Some(prev);
        Ok(())
    }
}

/// Names of the header fields that differ.
fn header_mismatch(producer: &BlockHeader, validator: &BlockHeader) -> String {
    let mut fields = Vec::new();
    if producer.timestamp != validator.timestamp {
        fields.push("timestamp");
    }
    if producer.producer != validator.producer {
        fields.push("producer");
    }
    if producer.confirmed != validator.confirmed {
        fields.push("confirmed");
    }
    if producer.previous != validator.previous {
        fields.push("previous");
    }
    if producer.transaction_mroot != validator.transaction_mroot {
        fields.push("transaction_mroot");
    }
    if producer.action_mroot != validator.action_mroot {
        fields.push("action_mroot");
    }
    if producer.schedule_version != validator.schedule_version {
        fields.push("schedule_version");
    }
    if producer.new_producers != validator.new_producers {
        fields.push("new_producers");
    }
    if producer.header_extensions != validator.header_extensions {
        fields.push("header_extensions");
    }
    if fields.is_empty() {
        "headers are identical".into()
    } else {
        fields.join(", ")
    }
}
