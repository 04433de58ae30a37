//! Outbound ports: collaborators the controller drives but does not own.

use crate::domain::{ActionTrace, TransactionDeadline, TransactionMetadata, TrxType};
use crate::error::ChainResult;
use qc_04_versioned_state::{Database, SnapshotReader, SnapshotWriter};
use shared_types::{Action, BlockTimestamp, Digest, Microseconds, Name, PublicKey, Signature};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Produces block signatures over a signing digest. The last signature is
/// the producer signature, any others are additional signatures.
pub type BlockSigner<'a> = dyn Fn(&Digest) -> ChainResult<Vec<Signature>> + 'a;

/// Checks the protocol features a block header activates, given the
/// block timestamp and the features active before it.
pub type FeatureValidator<'a> =
    dyn Fn(BlockTimestamp, &BTreeSet<Digest>, &[Digest]) -> ChainResult<()> + 'a;

/// Everything the execution engine needs to run one transaction.
#[derive(Debug)]
pub struct ExecutionRequest<'a> {
    pub trx: &'a TransactionMetadata,
    pub trx_type: TrxType,
    pub block_num: u32,
    pub block_time: BlockTimestamp,
    pub deadline: &'a TransactionDeadline,
    pub billed_cpu_time_us: u32,
    pub explicit_billed_cpu_time: bool,
    pub subjective_cpu_bill_us: i64,
    pub min_billable_cpu_us: u32,
    pub max_inline_action_size: u32,
    pub contracts_console: bool,
}

/// Result of a successful execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub action_traces: Vec<ActionTrace>,
    /// One digest per executed action, in execution order.
    pub action_receipt_digests: Vec<Digest>,
    pub billed_cpu_time_us: u32,
    /// Net usage in bytes; a multiple of eight.
    pub net_usage: u64,
    pub account_ram_delta: Option<(Name, i64)>,
}

/// Runs transaction actions against the state store. The controller opens
/// the undo session around each call.
pub trait ExecutionEngine: Send + Sync {
    fn execute(&self, db: &Database, request: &ExecutionRequest<'_>) -> ChainResult<ExecutionOutcome>;

    /// Contract tables exported with snapshots.
    fn add_to_snapshot(&self, _db: &Database, _writer: &mut dyn SnapshotWriter) -> ChainResult<()> {
        Ok(())
    }

    fn read_from_snapshot(&self, _db: &Database, _reader: &dyn SnapshotReader) -> ChainResult<()> {
        Ok(())
    }
}

/// Permission checks and signature key recovery.
pub trait Authorization: Send + Sync {
    fn check_authorization(
        &self,
        db: &Database,
        actions: &[Action],
        provided_keys: &BTreeSet<PublicKey>,
        delay: Microseconds,
        deadline: &TransactionDeadline,
    ) -> ChainResult<()>;

    /// Public key that produced `signature` over `digest`.
    fn recover_key(&self, signature: &Signature, digest: &Digest) -> ChainResult<PublicKey>;

    fn initialize_database(&self, _db: &Database) -> ChainResult<()> {
        Ok(())
    }

    fn add_to_snapshot(&self, _db: &Database, _writer: &mut dyn SnapshotWriter) -> ChainResult<()> {
        Ok(())
    }

    fn read_from_snapshot(&self, _db: &Database, _reader: &dyn SnapshotReader) -> ChainResult<()> {
        Ok(())
    }
}

/// Parameters of an elastic block resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElasticLimitParameters {
    pub target: u64,
    pub max: u64,
    pub periods: u32,
    pub max_multiplier: u32,
}

/// Account resource accounting.
pub trait ResourceLimits: Send + Sync {
    fn initialize_database(&self, _db: &Database) -> ChainResult<()> {
        Ok(())
    }

    fn process_account_limit_updates(&self, db: &Database) -> ChainResult<()>;

    fn set_block_parameters(
        &self,
        db: &Database,
        cpu: ElasticLimitParameters,
        net: ElasticLimitParameters,
    ) -> ChainResult<()>;

    fn process_block_usage(&self, db: &Database, block_num: u32) -> ChainResult<()>;

    fn add_pending_ram_usage(&self, db: &Database, account: &Name, delta: i64) -> ChainResult<()>;

    fn get_account_ram_usage(&self, db: &Database, account: &Name) -> i64;

    fn add_to_snapshot(&self, _db: &Database, _writer: &mut dyn SnapshotWriter) -> ChainResult<()> {
        Ok(())
    }

    fn read_from_snapshot(&self, _db: &Database, _reader: &dyn SnapshotReader) -> ChainResult<()> {
        Ok(())
    }
}

/// The collaborators a controller is wired with.
#[derive(Clone)]
pub struct ChainCollaborators {
    pub execution: Arc<dyn ExecutionEngine>,
    pub authorization: Arc<dyn Authorization>,
    pub resource_limits: Arc<dyn ResourceLimits>,
}

impl ChainCollaborators {
    pub fn new(
        execution: Arc<dyn ExecutionEngine>,
        authorization: Arc<dyn Authorization>,
        resource_limits: Arc<dyn ResourceLimits>,
    ) -> Self {
        Self {
            execution,
            authorization,
            resource_limits,
        }
    }
}

impl std::fmt::Debug for ChainCollaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCollaborators").finish_non_exhaustive()
    }
}
