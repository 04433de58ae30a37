//! Pending block lifecycle: Building → Assembled → Completed → committed.

use super::{no_pending, Controller};
use crate::domain::{
    ActivatedProtocolFeature, ActivationContext, AssembledBlock, BlockStage, BlockState,
    BlockStatus, BlockSummaryObject, BuildingBlock, CompletedBlock, GlobalPropertyObject,
    PendingState, ProducerPermissionObject, ProtocolStateObject, TransactionExpiryEntry,
    TransactionMetadata, TransactionObject, TrxMerkle, TrxType, ACTIVE_PERMISSION,
    MAJORITY_PERMISSION, MINORITY_PERMISSION, SYSTEM_ACCOUNT,
};
use crate::error::{ChainError, ChainResult};
use crate::ports::{BlockSigner, ElasticLimitParameters};
use qc_04_versioned_state::{MaybeSession, StateObject};
use shared_types::{
    merkle, short_id, Action, BlockId, BlockTimestamp, Digest, Microseconds, Name,
    PackedTransaction, PermissionLevel, TimePoint, TimePointSec, Transaction,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name of the implicit action run at the start of every block.
pub const ONBLOCK_ACTION: &str = "onblock";

/// Blocks over which the elastic resource limits average usage.
const BLOCK_USAGE_AVERAGE_WINDOW: u32 = 120;

const MAXIMUM_ELASTIC_RESOURCE_MULTIPLIER: u32 = 1000;

impl Controller {
    /// Open a pending block on top of the head.
    ///
    /// For every status but `Ephemeral` this also reconciles protocol
    /// feature activations, promotes a proposed producer schedule, runs the
    /// implicit onblock transaction and prunes expired dedup entries.
    pub fn start_block(
        &mut self,
        when: BlockTimestamp,
        confirm_block_count: u16,
        new_protocol_feature_activations: Vec<Digest>,
        status: BlockStatus,
        producer_block_id: Option<BlockId>,
        deadline: TimePoint,
    ) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::WrongBlockStage("pending block already exists".into()));
        }
        let head = self.head()?.clone();
        self.signals.block_start.emit(&head.block_num().wrapping_add(1))?;
        self.db.check_available_size()?;

        let skip_session = status == BlockStatus::Irreversible && !self.config.disable_replay_opts;
        let session = if skip_session {
            MaybeSession::none()
        } else {
            MaybeSession::new(&self.db)
        };
        let pending_header = head.header_state.next(when, confirm_block_count)?;
        self.pending = Some(PendingState::new(
            session,
            BuildingBlock::new(pending_header, new_protocol_feature_activations),
            status,
            producer_block_id,
        ));

        if status != BlockStatus::Ephemeral {
            if let Err(e) = self.init_pending_block(deadline) {
                self.abort_block();
                return Err(e);
            }
        }
        Ok(())
    }

    fn init_pending_block(&mut self, deadline: TimePoint) -> ChainResult<()> {
        self.reconcile_protocol_features()?;
        self.promote_proposed_schedule()?;
        self.update_resource_parameters()?;
        self.run_onblock()?;
        self.clear_expired_input_transactions(deadline)?;
        self.update_producers_authority()
    }

    /// Every pre-activated feature must be activated by this block, and a
    /// feature requiring pre-activation must have been pre-activated.
    fn reconcile_protocol_features(&mut self) -> ChainResult<()> {
        let pending = self.pending.as_ref().ok_or_else(no_pending)?;
        let status = pending.block_status;
        let building = pending.block_stage.building()?;
        let block_num = building.pending_block_header_state.block_num;
        let new_features = building.new_protocol_feature_activations.clone();

        let pso: ProtocolStateObject = self.db.fetch(&[])?;
        let preactivated: BTreeSet<Digest> =
            pso.preactivated_protocol_features.iter().copied().collect();

        let mut handled = 0;
        for digest in &new_features {
            let feature = self
                .protocol_features
                .feature_set()
                .get_protocol_feature(digest)?
                .clone();
            if preactivated.contains(digest) {
                handled += 1;
            } else if feature.preactivation_required {
                return Err(super::protocol_gate::gate_error(
                    status,
                    format!(
                        "attempted to activate protocol feature {} without prior required preactivation",
                        short_id(digest)
                    ),
                ));
            }

            self.protocol_features.activate_feature(digest, block_num)?;
            if let Some(builtin) = feature.builtin_feature {
                let ctx = ActivationContext {
                    db: &self.db,
                    resource_limits: self.collaborators.resource_limits.as_ref(),
                };
                self.activation_handlers.trigger(builtin, &ctx)?;
            }
            self.pending
                .as_mut()
                .ok_or_else(no_pending)?
                .block_stage
                .building_mut()?
                .num_new_protocol_features_that_have_activated += 1;
        }

        if handled != preactivated.len() {
            return Err(ChainError::BlockValidate(
                "there are pre-activated protocol features that were not activated at the start of this block"
                    .into(),
            ));
        }

        if !new_features.is_empty() {
            self.db.modify::<ProtocolStateObject>(&[], |pso| {
                pso.preactivated_protocol_features.clear();
                pso.activated_protocol_features
                    .extend(new_features.iter().map(|d| ActivatedProtocolFeature {
                        feature_digest: *d,
                        activation_block_num: block_num,
                    }));
            })?;
        }
        Ok(())
    }

    /// A proposal becomes pending once the block that proposed it is
    /// irreversible and no other schedule is waiting.
    fn promote_proposed_schedule(&mut self) -> ChainResult<()> {
        let gpo: GlobalPropertyObject = self.db.fetch(&[])?;
        let Some(proposed_num) = gpo.proposed_schedule_block_num else {
            return Ok(());
        };
        let building = self
            .pending
            .as_mut()
            .ok_or_else(no_pending)?
            .block_stage
            .building_mut()?;
        let header = &building.pending_block_header_state;
        if proposed_num > header.dpos_irreversible_blocknum
            || !header.prev_pending_schedule.schedule.producers.is_empty()
            || header.was_pending_promoted
        {
            return Ok(());
        }

        info!(
            version = gpo.proposed_schedule.version,
            proposed_in = proposed_num,
            block_num = header.block_num,
            "[qc-17] promoting proposed producer schedule to pending"
        );
        building.new_pending_producer_schedule = Some(gpo.proposed_schedule);
        self.db.modify::<GlobalPropertyObject>(&[], |gpo| {
            gpo.proposed_schedule_block_num = None;
            gpo.proposed_schedule.producers.clear();
        })?;
        Ok(())
    }

    fn update_resource_parameters(&mut self) -> ChainResult<()> {
        let params = self.global_properties()?.configuration;
        let elastic = |max: u64, target_pct: u32| ElasticLimitParameters {
            target: max * u64::from(target_pct) / 10_000,
            max,
            periods: BLOCK_USAGE_AVERAGE_WINDOW,
            max_multiplier: MAXIMUM_ELASTIC_RESOURCE_MULTIPLIER,
        };
        let cpu = elastic(u64::from(params.max_block_cpu_usage), params.target_block_cpu_usage_pct);
        let net = elastic(params.max_block_net_usage, params.target_block_net_usage_pct);
        let limits = &self.collaborators.resource_limits;
        limits.process_account_limit_updates(&self.db)?;
        limits.set_block_parameters(&self.db, cpu, net)
    }

    /// Tell contract code a new block started. Failure is tolerated.
    fn run_onblock(&mut self) -> ChainResult<()> {
        let trx = self.onblock_transaction()?;
        let meta = Arc::new(TransactionMetadata::create_no_recover_keys(
            Arc::new(PackedTransaction::new(trx, Vec::new())),
            TrxType::Implicit,
        ));
        let min_cpu = self.global_properties()?.configuration.min_transaction_cpu_usage;

        self.in_trx_requiring_checks = true;
        let result = self.push_transaction_inner(
            meta,
            TimePoint::maximum(),
            Microseconds::MAX,
            min_cpu,
            true,
            0,
        );
        self.in_trx_requiring_checks = false;

        match result {
            Ok(trace) => {
                if let Some(e) = &trace.except {
                    warn!(error = %e, "[qc-17] onblock transaction failed");
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "[qc-17] onblock transaction failed");
                Ok(())
            }
        }
    }

    fn onblock_transaction(&self) -> ChainResult<Transaction> {
        let head = self.head()?;
        let pending_time = self.pending_ref()?.block_stage.timestamp().to_time_point();
        let system = Name::from(SYSTEM_ACCOUNT);
        let mut trx = Transaction {
            actions: vec![Action {
                account: system.clone(),
                name: Name::from(ONBLOCK_ACTION),
                authorization: vec![PermissionLevel {
                    actor: system,
                    permission: Name::from(ACTIVE_PERMISSION),
                }],
                data: bincode::serialize(&head.header_state.header)?,
            }],
            ..Transaction::default()
        };
        trx.header.expiration =
            TimePointSec::from_time_point(pending_time.add(Microseconds::from_secs(1)));
        trx.set_reference_block(&head.id());
        Ok(trx)
    }

    /// Drop dedup entries that expired before the pending block time.
    fn clear_expired_input_transactions(&mut self, deadline: TimePoint) -> ChainResult<()> {
        let now = self.pending_ref()?.block_stage.timestamp().to_time_point();
        let mut removed = 0usize;
        for entry in self.db.all::<TransactionExpiryEntry>()? {
            if entry.expiration.to_time_point() >= now {
                break;
            }
            if deadline <= TimePoint::now() {
                debug!(removed, "[qc-17] deadline reached while clearing expired transactions");
                break;
            }
            self.db.remove::<TransactionExpiryEntry>(&entry.primary_key())?;
            self.db.remove::<TransactionObject>(&entry.trx_id)?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "[qc-17] expired input transactions cleared");
        }
        Ok(())
    }

    fn update_producers_authority(&mut self) -> ChainResult<()> {
        let header = self
            .pending_ref()?
            .block_stage
            .pending_block_header_state()?;
        if !header.was_pending_promoted {
            return Ok(());
        }
        let schedule = header.active_schedule.clone();
        for permission in [ACTIVE_PERMISSION, MAJORITY_PERMISSION, MINORITY_PERMISSION] {
            self.db
                .upsert(&ProducerPermissionObject::for_schedule(permission, &schedule))?;
        }
        Ok(())
    }

    /// Compute the merkle roots and the header, moving Building → Assembled.
    pub fn finalize_block(&mut self) -> ChainResult<()> {
        let pending = self.pending.as_mut().ok_or_else(no_pending)?;
        let building = pending.block_stage.building()?;
        let block_num = building.pending_block_header_state.block_num;

        self.collaborators
            .resource_limits
            .process_block_usage(&self.db, block_num)?;

        let trx_root = match &building.trx_mroot_or_receipt_digests {
            TrxMerkle::Root(root) => {
                let root = *root;
                self.thread_pool.post(move || Ok(root))
            }
            TrxMerkle::Digests(digests) => {
                let digests = digests.clone();
                self.thread_pool.post(move || Ok(merkle(digests)))
            }
        };
        let action_digests = building.action_receipt_digests.clone();
        let action_root = self.thread_pool.post(move || Ok(merkle(action_digests)));
        let transaction_mroot = trx_root.get()?;
        let action_mroot = action_root.get()?;

        let header = building.pending_block_header_state.make_block_header(
            transaction_mroot,
            action_mroot,
            building.new_pending_producer_schedule.clone(),
            building.new_protocol_feature_activations.clone(),
        )?;
        let id = header.calculate_id();
        let mut block = shared_types::SignedBlock::from_header(header);
        block.transactions = building.pending_trx_receipts.clone();

        self.db.upsert(&BlockSummaryObject {
            slot: (block_num & 0xffff) as u16,
            block_id: id,
        })?;

        let assembled = AssembledBlock {
            id,
            pending_block_header_state: building.pending_block_header_state.clone(),
            trx_metas: building.pending_trx_metas.clone(),
            unsigned_block: block,
            new_producer_authority_cache: building.new_pending_producer_schedule.clone(),
        };
        pending.block_stage = BlockStage::Assembled(assembled);
        debug!(block_num, id = %short_id(&id), "[qc-17] block assembled");
        Ok(())
    }

    /// Sign the assembled block, moving Assembled → Completed.
    pub fn complete_block(&mut self, signer: &BlockSigner<'_>) -> ChainResult<()> {
        let pending = self.pending.as_mut().ok_or_else(no_pending)?;
        let assembled = pending.block_stage.assembled()?;
        let feature_set = self.protocol_features.feature_set();
        let validator = |timestamp: BlockTimestamp, active: &BTreeSet<Digest>, new: &[Digest]| {
            feature_set.check_protocol_features(timestamp, active, new)
        };
        let block_state = BlockState::from_pending(
            assembled.pending_block_header_state.clone(),
            assembled.unsigned_block.clone(),
            assembled.trx_metas.clone(),
            &validator,
            signer,
            self.collaborators.authorization.as_ref(),
        )?;
        pending.block_stage = BlockStage::Completed(CompletedBlock {
            block_state: Arc::new(block_state),
        });
        Ok(())
    }

    /// Make the completed block the new head. On failure the pending block
    /// is aborted and the head left unchanged.
    pub fn commit_block(&mut self) -> ChainResult<()> {
        let previous_head = self.head.clone();
        match self.commit_pending() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.head = previous_head;
                self.abort_block();
                Err(e)
            }
        }
    }

    fn commit_pending(&mut self) -> ChainResult<()> {
        let pending = self.pending.as_ref().ok_or_else(no_pending)?;
        let status = pending.block_status;
        let bsp = pending.block_stage.completed()?.block_state.clone();

        if status == BlockStatus::Incomplete {
            self.fork_db.add(bsp.clone(), false)?;
            self.fork_db.mark_valid(&bsp);
            self.signals.accepted_block_header.emit(&bsp)?;
            let fork_head = self.fork_db.head().map(|h| h.id());
            if fork_head != Some(bsp.id()) {
                error!(
                    block_num = bsp.block_num(),
                    id = %short_id(&bsp.id()),
                    "[qc-17] committed block did not become the new head in fork database"
                );
                return Err(ChainError::ForkDatabaseInconsistent(
                    "committed block did not become the new head in fork database".into(),
                ));
            }
        } else if status != BlockStatus::Irreversible {
            self.fork_db.mark_valid(&bsp);
        }

        self.head = Some(bsp.clone());
        self.signals.accepted_block.emit(&bsp)?;
        if status == BlockStatus::Incomplete {
            self.log_irreversible()?;
        }

        let mut pending = self.pending.take().ok_or_else(no_pending)?;
        let had_session = pending.db_session.is_active();
        pending.db_session.push();
        if !had_session {
            self.db.set_revision(i64::from(bsp.block_num()))?;
        }

        if let Some(block) = &bsp.block {
            let included: HashSet<_> = block.transactions.iter().map(|r| r.trx_id()).collect();
            self.unapplied_transactions
                .retain(|meta| !included.contains(&meta.id()));
        }

        let report = pending.block_report;
        info!(
            block_num = bsp.block_num(),
            id = %short_id(&bsp.id()),
            producer = %bsp.header_state.header.producer,
            trxs = bsp.block.as_ref().map_or(0, |b| b.transactions.len()),
            net = report.total_net_usage,
            cpu = report.total_cpu_usage_us,
            "[qc-17] block committed"
        );
        Ok(())
    }

    /// Discard the pending block, rolling back its session. Returns the
    /// transactions it carried so they can be retried.
    pub fn abort_block(&mut self) -> Vec<Arc<TransactionMetadata>> {
        let Some(mut pending) = self.pending.take() else {
            return Vec::new();
        };
        let speculative = pending.is_speculative();
        let metas = pending.block_stage.extract_trx_metas();
        drop(pending);

        if let Some(head) = &self.head {
            self.protocol_features.popped_blocks_to(head.block_num());
        }
        if speculative {
            for meta in &metas {
                if !self.unapplied_transactions.iter().any(|m| m.id() == meta.id()) {
                    self.unapplied_transactions.push(meta.clone());
                }
            }
        }
        debug!(trxs = metas.len(), "[qc-17] pending block aborted");
        metas
    }
}
