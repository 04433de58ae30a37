//! Deterministic execution engine that records what it ran.
//!
//! Every action succeeds except those named [`FAILING_ACTION`]. Each
//! executed transaction other than a read-only one writes one row into
//! [`EXECUTED_TABLE`] so state rollback is observable.

use crate::domain::{ActionTrace, TrxType};
use crate::error::{ChainError, ChainResult};
use crate::ports::{ExecutionEngine, ExecutionOutcome, ExecutionRequest};
use parking_lot::Mutex;
use qc_04_versioned_state::Database;
use shared_types::{DigestEncode, Microseconds, TimePoint, TransactionId};

/// Action name that always fails objectively.
pub const FAILING_ACTION: &str = "fail";

pub const EXECUTED_TABLE: &str = "executed";

/// Cpu billed when the caller does not bill explicitly.
pub const DEFAULT_BILLED_CPU_US: u32 = 100;

#[derive(Debug, Default)]
pub struct RecordingExecutionEngine {
    executed: Mutex<Vec<TransactionId>>,
}

impl RecordingExecutionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every transaction executed successfully, in order.
    pub fn executed(&self) -> Vec<TransactionId> {
        self.executed.lock().clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executed.lock().len()
    }
}

impl ExecutionEngine for RecordingExecutionEngine {
    fn execute(&self, db: &Database, request: &ExecutionRequest<'_>) -> ChainResult<ExecutionOutcome> {
        request.deadline.checktime(TimePoint::now())?;
        let packed = request.trx.packed_trx();
        let trx = &packed.transaction;

        let actions = trx
            .context_free_actions
            .iter()
            .map(|a| (a, true))
            .chain(trx.actions.iter().map(|a| (a, false)));
        let mut outcome = ExecutionOutcome::default();
        for (index, (act, context_free)) in actions.enumerate() {
            if act.name.as_str() == FAILING_ACTION {
                return Err(ChainError::Transaction(format!(
                    "action {}::{} failed",
                    act.account, act.name
                )));
            }
            let digest = act.digest();
            let console = if request.contracts_console {
                format!("{}::{}", act.account, act.name)
            } else {
                String::new()
            };
            outcome.action_traces.push(ActionTrace {
                action_ordinal: index as u32 + 1,
                receiver: act.account.clone(),
                act: act.clone(),
                context_free,
                elapsed: Microseconds(0),
                console,
                return_value: Vec::new(),
                receipt_digest: Some(digest),
            });
            outcome.action_receipt_digests.push(digest);
        }

        let id = request.trx.id();
        if request.trx_type != TrxType::ReadOnly {
            db.put_raw(EXECUTED_TABLE, &id, request.block_num.to_be_bytes().to_vec())?;
        }

        outcome.billed_cpu_time_us = if request.explicit_billed_cpu_time {
            request.billed_cpu_time_us
        } else {
            request.min_billable_cpu_us.max(DEFAULT_BILLED_CPU_US)
        };
        outcome.net_usage = if request.trx_type == TrxType::Implicit {
            0
        } else {
            let size = (packed.unprunable_size()? + packed.prunable_size()?) as u64;
            size.div_ceil(8) * 8
        };
        self.executed.lock().push(id);
        Ok(outcome)
    }
}
