//! Transaction pipeline: input, implicit and scheduled transactions.
//!
//! Each transaction runs in its own undo session nested in the block
//! session. Success squashes it into the block, a transient transaction or
//! any failure undoes it.

use super::{no_pending, Controller};
use crate::domain::whitelist::{check_signature_sizes, enforce_transaction_lists};
use crate::domain::{
    BlockSummaryObject, BuiltinProtocolFeature, ChainParameters, GeneratedTransactionObject,
    RestorePoint, TransactionDeadline, TransactionExpiryEntry, TransactionMetadata,
    TransactionObject, TransactionTrace, TrxMerkle,
};
use crate::error::{ChainError, ChainResult};
use crate::ports::{ExecutionOutcome, ExecutionRequest};
use qc_04_versioned_state::StateError;
use shared_types::{
    short_id, BlockId, BlockTimestamp, Microseconds, Name, PackedTransaction, ReceiptTrx,
    TimePoint, TimePointSec, TransactionId, TransactionReceipt, TransactionReceiptHeader,
    TransactionStatus,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Pending block facts captured before a transaction borrows the controller.
#[derive(Debug, Clone, Copy)]
struct BlockContext {
    block_num: u32,
    block_time: BlockTimestamp,
    producer_block_id: Option<BlockId>,
    speculative: bool,
    session_active: bool,
}

impl Controller {
    /// Apply an input transaction to the building block.
    ///
    /// Objective failures are returned inside the trace with `except` set;
    /// only failures that must abort the caller come back as `Err`.
    pub fn push_transaction(
        &mut self,
        trx: Arc<TransactionMetadata>,
        block_deadline: TimePoint,
        max_transaction_time: Microseconds,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
        subjective_cpu_bill_us: i64,
    ) -> ChainResult<Arc<TransactionTrace>> {
        if trx.implicit() {
            return Err(ChainError::Transaction(
                "implicit transaction not allowed".into(),
            ));
        }
        if !self.write_window && !trx.is_read_only() {
            return Err(ChainError::Transaction(
                "only read-only transactions may run during a read window".into(),
            ));
        }
        self.push_transaction_inner(
            trx,
            block_deadline,
            max_transaction_time,
            billed_cpu_time_us,
            explicit_billed_cpu_time,
            subjective_cpu_bill_us,
        )
    }

    pub(super) fn push_transaction_inner(
        &mut self,
        meta: Arc<TransactionMetadata>,
        block_deadline: TimePoint,
        max_transaction_time: Microseconds,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
        subjective_cpu_bill_us: i64,
    ) -> ChainResult<Arc<TransactionTrace>> {
        let start = TimePoint::now();
        let ctx = self.block_context()?;
        let params = self.global_properties()?.configuration;

        let mut trace = TransactionTrace::new(
            meta.id(),
            ctx.block_num,
            ctx.block_time,
            ctx.producer_block_id,
        );

        let mut trx_start = start;
        if !explicit_billed_cpu_time {
            let sig_cpu = meta.sig_cpu_usage().count();
            if sig_cpu > 0 {
                let billed = sig_cpu * i64::from(self.config.sig_cpu_bill_pct) / 100;
                trx_start = start.sub(Microseconds(billed));
            }
        }
        let mut max_time = max_transaction_time;
        if !meta.implicit() {
            max_time = max_time.min(Microseconds(i64::from(params.max_transaction_cpu_usage)));
            if ctx.speculative {
                max_time = max_time.min(Microseconds::from_millis(self.config.max_transaction_time_ms));
            }
        }
        let leeway = match self.config.subjective_cpu_leeway_us {
            Some(us) if ctx.speculative => Microseconds(us),
            _ => Microseconds(0),
        };
        let deadline = TransactionDeadline::new(trx_start, block_deadline, max_time, leeway);
        let subjective_cpu_bill_us = if self.config.disable_all_subjective_mitigations {
            0
        } else {
            subjective_cpu_bill_us
        };

        let result = self.apply_transaction(
            &meta,
            &ctx,
            &params,
            &deadline,
            billed_cpu_time_us,
            explicit_billed_cpu_time,
            subjective_cpu_bill_us,
            &mut trace,
        );
        trace.elapsed = TimePoint::now().since(start);

        match result {
            Ok(()) => {
                let trace = Arc::new(trace);
                if !meta.is_dry_run() {
                    if !meta.implicit() && meta.mark_accepted() {
                        self.signals.accepted_transaction.emit(&meta)?;
                    }
                    self.signals
                        .applied_transaction
                        .emit(&(trace.clone(), meta.packed_trx().clone()))?;
                }
                trace!(id = %short_id(&meta.id()), "[qc-17] transaction applied");
                Ok(trace)
            }
            Err(e) if e.is_never_caught() => Err(e),
            Err(e) => {
                debug!(id = %short_id(&meta.id()), error = %e, "[qc-17] transaction failed");
                trace.except = Some(e);
                let trace = Arc::new(trace);
                if !meta.is_transient() {
                    self.signals
                        .applied_transaction
                        .emit(&(trace.clone(), meta.packed_trx().clone()))?;
                }
                Ok(trace)
            }
        }
    }

    fn block_context(&self) -> ChainResult<BlockContext> {
        let pending = self.pending_ref()?;
        let building = pending.block_stage.building()?;
        Ok(BlockContext {
            block_num: building.pending_block_header_state.block_num,
            block_time: building.pending_block_header_state.timestamp,
            producer_block_id: pending.producer_block_id,
            speculative: pending.is_speculative(),
            session_active: pending.db_session.is_active(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_transaction(
        &mut self,
        meta: &Arc<TransactionMetadata>,
        ctx: &BlockContext,
        params: &ChainParameters,
        deadline: &TransactionDeadline,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
        subjective_cpu_bill_us: i64,
        trace: &mut TransactionTrace,
    ) -> ChainResult<()> {
        let session = self.db.start_undo_session(ctx.session_active);
        let light = self.light_validation_allowed();
        let packed = meta.packed_trx();
        let trx = &packed.transaction;

        if !meta.implicit() {
            self.validate_input_transaction(meta, ctx, params, light)?;
            if ctx.speculative {
                enforce_transaction_lists(&self.config, trx, meta.recovered_keys())?;
                check_signature_sizes(&self.config, &meta.id(), &packed.signatures)?;
            }
            if !meta.is_read_only() && !light {
                self.collaborators.authorization.check_authorization(
                    &self.db,
                    &trx.actions,
                    meta.recovered_keys(),
                    Microseconds::from_secs(i64::from(trx.header.delay_sec)),
                    deadline,
                )?;
            }
        }

        let (status, outcome) = if trx.header.delay_sec > 0 {
            if self.is_builtin_activated(BuiltinProtocolFeature::DisableDeferredTrxsStage1) {
                return Err(ChainError::Transaction(
                    "transaction cannot be delayed".into(),
                ));
            }
            let outcome = self.schedule_delayed(
                meta,
                ctx,
                params,
                billed_cpu_time_us,
                explicit_billed_cpu_time,
            )?;
            (TransactionStatus::Delayed, outcome)
        } else {
            let request = ExecutionRequest {
                trx: meta,
                trx_type: meta.trx_type(),
                block_num: ctx.block_num,
                block_time: ctx.block_time,
                deadline,
                billed_cpu_time_us,
                explicit_billed_cpu_time,
                subjective_cpu_bill_us,
                min_billable_cpu_us: params.min_transaction_cpu_usage,
                max_inline_action_size: params.max_inline_action_size,
                contracts_console: self.config.contracts_console,
            };
            let outcome = self.collaborators.execution.execute(&self.db, &request)?;
            (TransactionStatus::Executed, outcome)
        };

        let net_usage_words = check_usage(meta, params, &outcome)?;
        let cpu_usage_us = outcome.billed_cpu_time_us;

        if !meta.is_transient() {
            let report = &self.pending_ref()?.block_report;
            if report.total_net_usage + outcome.net_usage > params.max_block_net_usage {
                return Err(ChainError::BlockNetUsageExceeded(format!(
                    "not enough space left in block for transaction {}",
                    short_id(&meta.id())
                )));
            }
            if report.total_cpu_usage_us + u64::from(cpu_usage_us)
                > u64::from(params.max_block_cpu_usage)
            {
                return Err(ChainError::BlockCpuUsageExceeded(format!(
                    "not enough cpu left in block for transaction {}",
                    short_id(&meta.id())
                )));
            }
        }

        if let Some((account, delta)) = &outcome.account_ram_delta {
            if !meta.is_transient() {
                self.collaborators
                    .resource_limits
                    .add_pending_ram_usage(&self.db, account, *delta)?;
            }
        }

        let receipt_header = TransactionReceiptHeader {
            status,
            cpu_usage_us,
            net_usage_words,
        };
        let pending = self.pending.as_mut().ok_or_else(no_pending)?;
        let building = pending.block_stage.building_mut()?;
        let restore = RestorePoint::capture(building);
        if !meta.implicit() && !meta.is_transient() {
            let receipt = TransactionReceipt {
                header: receipt_header.clone(),
                trx: ReceiptTrx::Packed(packed.as_ref().clone()),
            };
            if let TrxMerkle::Digests(digests) = &mut building.trx_mroot_or_receipt_digests {
                digests.push(receipt.digest());
            }
            building.pending_trx_receipts.push(receipt);
            building.pending_trx_metas.push(meta.clone());
        }
        if !meta.is_transient() {
            building
                .action_receipt_digests
                .extend(outcome.action_receipt_digests.iter().copied());
        }

        let finished = if meta.is_transient() {
            session.undo()
        } else {
            session.squash()
        };
        if let Err(e) = finished {
            restore.restore(building);
            return Err(e.into());
        }

        if !meta.is_transient() {
            let report = &mut pending.block_report;
            report.total_net_usage += outcome.net_usage;
            report.total_cpu_usage_us += u64::from(cpu_usage_us);
        }

        trace.receipt = Some(receipt_header);
        trace.net_usage = outcome.net_usage;
        trace.action_traces = outcome.action_traces;
        trace.account_ram_delta = outcome.account_ram_delta;
        if !meta.is_transient() {
            pending.block_report.total_elapsed_time = Microseconds(
                pending.block_report.total_elapsed_time.count()
                    + TimePoint::now().since(deadline.start).count(),
            );
        }
        meta.set_billed_cpu_time_us(cpu_usage_us);
        Ok(())
    }

    /// Extension, expiration, TaPoS and dedup checks of a non-implicit
    /// transaction. Records the dedup entry on success.
    fn validate_input_transaction(
        &self,
        meta: &TransactionMetadata,
        ctx: &BlockContext,
        params: &ChainParameters,
        light: bool,
    ) -> ChainResult<()> {
        let trx = &meta.packed_trx().transaction;
        let id = meta.id();

        if !trx.transaction_extensions.is_empty() {
            let msg = format!(
                "transaction {} carries {} unsupported extensions",
                short_id(&id),
                trx.transaction_extensions.len()
            );
            return Err(if ctx.speculative {
                ChainError::Transaction(msg)
            } else {
                ChainError::DisallowedTransactionExtensions(msg)
            });
        }

        let expiration = trx.header.expiration;
        if !light {
            let now = ctx.block_time.to_time_point();
            let expires = expiration.to_time_point();
            if expires < now {
                return Err(ChainError::ExpiredTransaction(format!(
                    "transaction {} expired at {}, block time is {}",
                    short_id(&id),
                    expiration.secs(),
                    TimePointSec::from_time_point(now).secs()
                )));
            }
            let mut lifetime = params.max_transaction_lifetime;
            if ctx.speculative {
                lifetime = lifetime.min(self.config.max_transaction_lifetime_secs);
            }
            if expires > now.add(Microseconds::from_secs(i64::from(lifetime))) {
                return Err(ChainError::TxExpirationTooFar(format!(
                    "transaction {} expires more than {lifetime}s after block time",
                    short_id(&id)
                )));
            }

            let summary = self
                .db
                .find::<BlockSummaryObject>(&BlockSummaryObject::key_for(trx.header.ref_block_num))?;
            match summary {
                Some(s) if trx.verify_reference_block(&s.block_id) => {}
                _ => {
                    return Err(ChainError::InvalidRefBlock(format!(
                        "transaction {} references block {} with prefix {}, which is not on this chain",
                        short_id(&id),
                        trx.header.ref_block_num,
                        trx.header.ref_block_prefix
                    )))
                }
            }
        }

        if meta.is_read_only() {
            return Ok(());
        }
        match self.db.create(&TransactionObject { trx_id: id, expiration }) {
            Ok(()) => {}
            Err(StateError::DuplicateRow { .. }) => {
                return Err(ChainError::DuplicateTransaction(format!(
                    "duplicate transaction {}",
                    short_id(&id)
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.db.create(&TransactionExpiryEntry {
            expiration,
            trx_id: id,
        })?;
        Ok(())
    }

    /// Store a delayed transaction for later retirement. It never executes.
    fn schedule_delayed(
        &self,
        meta: &TransactionMetadata,
        ctx: &BlockContext,
        params: &ChainParameters,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<ExecutionOutcome> {
        let packed = meta.packed_trx();
        let trx = &packed.transaction;
        let published = ctx.block_time.to_time_point();
        let delay_until = published.add(Microseconds::from_secs(i64::from(trx.header.delay_sec)));
        let payer = trx.first_authorizer().cloned().unwrap_or_else(|| Name::new(""));
        let gto = GeneratedTransactionObject {
            trx_id: meta.id(),
            sender: Name::new(""),
            sender_id: u128::from_be_bytes(meta.id()[..16].try_into().unwrap_or([0u8; 16])),
            payer: payer.clone(),
            delay_until,
            expiration: delay_until.add(Microseconds::from_secs(i64::from(
                params.max_transaction_lifetime,
            ))),
            published,
            packed_trx: bincode::serialize(packed.as_ref())?,
        };
        self.db.create(&gto)?;

        let ram = gto.billable_size();
        let size = (packed.unprunable_size()? + packed.prunable_size()?) as u64;
        Ok(ExecutionOutcome {
            billed_cpu_time_us: if explicit_billed_cpu_time {
                billed_cpu_time_us
            } else {
                params.min_transaction_cpu_usage
            },
            net_usage: size.div_ceil(8) * 8,
            account_ram_delta: Some((payer, ram)),
            ..ExecutionOutcome::default()
        })
    }

    /// Retire a scheduled transaction left over from deferred execution.
    ///
    /// Expired ones get an `Expired` receipt. Deferred execution no longer
    /// exists, so any other is retired with a `HardFail` receipt.
    pub fn push_scheduled_transaction(
        &mut self,
        id: &TransactionId,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<Arc<TransactionTrace>> {
        let previous = std::mem::replace(&mut self.in_trx_requiring_checks, true);
        let result = self.retire_scheduled_transaction(id, billed_cpu_time_us, explicit_billed_cpu_time);
        self.in_trx_requiring_checks = previous;
        result
    }

    fn retire_scheduled_transaction(
        &mut self,
        id: &TransactionId,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<Arc<TransactionTrace>> {
        let start = TimePoint::now();
        let ctx = self.block_context()?;
        let gto = self
            .db
            .find::<GeneratedTransactionObject>(id)?
            .ok_or_else(|| {
                ChainError::UnknownTransaction(format!(
                    "unknown scheduled transaction {}",
                    short_id(id)
                ))
            })?;
        let min_cpu = self.global_properties()?.configuration.min_transaction_cpu_usage;

        let session = self.db.start_undo_session(ctx.session_active);
        let packed: PackedTransaction = bincode::deserialize(&gto.packed_trx)?;
        self.db.remove::<GeneratedTransactionObject>(id)?;
        self.collaborators
            .resource_limits
            .add_pending_ram_usage(&self.db, &gto.payer, -gto.billable_size())?;

        let mut trace = TransactionTrace::new(*id, ctx.block_num, ctx.block_time, ctx.producer_block_id);
        trace.scheduled = true;

        let block_time = ctx.block_time.to_time_point();
        let stage_one = self.is_builtin_activated(BuiltinProtocolFeature::DisableDeferredTrxsStage1);
        let (status, cpu_usage_us) = if stage_one || gto.expiration < block_time {
            (TransactionStatus::Expired, billed_cpu_time_us)
        } else if gto.delay_until > block_time {
            return Err(ChainError::Transaction(format!(
                "scheduled transaction {} is not ready until {}",
                short_id(id),
                gto.delay_until.micros()
            )));
        } else {
            trace.except = Some(ChainError::DeferredRemoved(
                "deferred transaction implementation has been removed".into(),
            ));
            let cpu = if explicit_billed_cpu_time {
                billed_cpu_time_us
            } else {
                min_cpu
            };
            (TransactionStatus::HardFail, cpu)
        };

        let receipt_header = TransactionReceiptHeader {
            status,
            cpu_usage_us,
            net_usage_words: 0,
        };
        let receipt = TransactionReceipt {
            header: receipt_header.clone(),
            trx: ReceiptTrx::Id(*id),
        };
        let pending = self.pending.as_mut().ok_or_else(no_pending)?;
        let building = pending.block_stage.building_mut()?;
        let restore = RestorePoint::capture(building);
        if let TrxMerkle::Digests(digests) = &mut building.trx_mroot_or_receipt_digests {
            digests.push(receipt.digest());
        }
        building.pending_trx_receipts.push(receipt);
        if let Err(e) = session.squash() {
            restore.restore(building);
            return Err(e.into());
        }
        pending.block_report.total_cpu_usage_us += u64::from(cpu_usage_us);

        trace.receipt = Some(receipt_header);
        trace.elapsed = TimePoint::now().since(start);
        let trace = Arc::new(trace);
        self.signals
            .applied_transaction
            .emit(&(trace.clone(), Arc::new(packed)))?;
        debug!(id = %short_id(id), ?status, "[qc-17] scheduled transaction retired");
        Ok(trace)
    }
}

/// Net and cpu limits of one transaction. Returns the billed net words.
fn check_usage(
    meta: &TransactionMetadata,
    params: &ChainParameters,
    outcome: &ExecutionOutcome,
) -> ChainResult<u32> {
    let header = &meta.packed_trx().transaction.header;
    let id = short_id(&meta.id());
    if outcome.net_usage % 8 != 0 {
        return Err(ChainError::Internal(format!(
            "net usage of {id} is not a multiple of eight bytes"
        )));
    }
    let net_usage_words = u32::try_from(outcome.net_usage / 8).unwrap_or(u32::MAX);
    if header.max_net_usage_words > 0 && net_usage_words > header.max_net_usage_words {
        return Err(ChainError::Transaction(format!(
            "transaction {id} net usage of {net_usage_words} words exceeds its limit of {}",
            header.max_net_usage_words
        )));
    }
    if meta.implicit() {
        return Ok(net_usage_words);
    }
    if outcome.net_usage > u64::from(params.max_transaction_net_usage) {
        return Err(ChainError::Transaction(format!(
            "transaction {id} net usage of {} bytes exceeds the maximum of {}",
            outcome.net_usage, params.max_transaction_net_usage
        )));
    }
    let cpu = outcome.billed_cpu_time_us;
    let own_limit = u32::from(header.max_cpu_usage_ms) * 1000;
    if cpu > params.max_transaction_cpu_usage || (own_limit > 0 && cpu > own_limit) {
        return Err(ChainError::TxCpuUsageExceeded(format!(
            "transaction {id} billed {cpu}us of cpu, above its limit"
        )));
    }
    Ok(net_usage_words)
}
