//! Error types for the chain controller.
//!
//! Every failure the controller can surface is a [`ChainError`]. The
//! pipeline does not match on message text; it asks the error which class
//! it belongs to:
//!
//! | Class              | Effect                                              |
//! |--------------------|-----------------------------------------------------|
//! | fatal              | propagated everywhere, never captured in a trace    |
//! | block-invalidating | the enclosing block is rejected                     |
//! | subjective         | node-local; the transaction may be retried later    |
//! | objective          | deterministic; recorded in the transaction trace    |

use qc_02_block_log::BlockLogError;
use qc_04_versioned_state::StateError;
use qc_08_fork_database::ForkDatabaseError;
use shared_types::TypesError;
use thiserror::Error;

/// Result type alias for controller operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Errors raised by the chain controller and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Allocation failure reported by a collaborator. Always fatal.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Block failed validation.
    #[error("block validation error: {0}")]
    BlockValidate(String),

    /// A block activates protocol features it must not.
    #[error("protocol feature bad block: {0}")]
    ProtocolFeatureBadBlock(String),

    /// A transaction in a received block carries extensions it must not.
    #[error("disallowed transaction extensions in block: {0}")]
    DisallowedTransactionExtensions(String),

    /// Block signature does not satisfy the producer authority.
    #[error("wrong signing key: {0}")]
    WrongSigningKey(String),

    /// Fork database rejected an operation.
    #[error(transparent)]
    ForkDatabase(#[from] ForkDatabaseError),

    /// Fork database and head state disagree.
    #[error("fork database inconsistent: {0}")]
    ForkDatabaseInconsistent(String),

    /// Subjective production failure, e.g. an unrecognized feature while
    /// producing.
    #[error("subjective block production: {0}")]
    SubjectiveBlockProduction(String),

    #[error("block net usage exceeded: {0}")]
    BlockNetUsageExceeded(String),

    #[error("block cpu usage exceeded: {0}")]
    BlockCpuUsageExceeded(String),

    #[error("greylisted net usage exceeded: {0}")]
    GreylistNetUsageExceeded(String),

    #[error("greylisted cpu usage exceeded: {0}")]
    GreylistCpuUsageExceeded(String),

    /// Block deadline reached while executing.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Subjective leeway on top of the transaction limit ran out.
    #[error("leeway deadline exceeded: {0}")]
    LeewayDeadline(String),

    #[error("transaction cpu usage exceeded: {0}")]
    TxCpuUsageExceeded(String),

    #[error("actor whitelist violation: {0}")]
    ActorWhitelist(String),

    #[error("actor blacklist violation: {0}")]
    ActorBlacklist(String),

    #[error("contract whitelist violation: {0}")]
    ContractWhitelist(String),

    #[error("contract blacklist violation: {0}")]
    ContractBlacklist(String),

    #[error("action blacklist violation: {0}")]
    ActionBlacklist(String),

    #[error("key blacklist violation: {0}")]
    KeyBlacklist(String),

    /// A signature exceeds the node's variable-size limit.
    #[error("signature variable size limit: {0}")]
    SigVariableSizeLimit(String),

    #[error("expired transaction: {0}")]
    ExpiredTransaction(String),

    #[error("transaction expiration too far: {0}")]
    TxExpirationTooFar(String),

    /// TaPoS reference does not match the referenced block.
    #[error("invalid reference block: {0}")]
    InvalidRefBlock(String),

    #[error("duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),

    /// Generic objective transaction failure.
    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("unsatisfied authorization: {0}")]
    Unauthorized(String),

    /// Deferred execution was removed from the protocol.
    #[error("{0}")]
    DeferredRemoved(String),

    /// Protocol feature activation rules violated.
    #[error("protocol feature error: {0}")]
    ProtocolFeature(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    BlockLog(#[from] BlockLogError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persisted stores disagree with each other.
    #[error("configuration inconsistency: {0}")]
    ConfigInconsistency(String),

    #[error("chain id mismatch: {0}")]
    ChainIdMismatch(String),

    #[error("producer schedule error: {0}")]
    ProducerSchedule(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// Operation requires a pending block.
    #[error("no pending block: {0}")]
    NoPendingBlock(String),

    /// The pending block is in another stage than the operation needs.
    #[error("wrong block stage: {0}")]
    WrongBlockStage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChainError {
    /// Failures that abort the process-level operation unconditionally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::OutOfMemory(_))
    }

    /// Failures that make the enclosing block invalid: everything that is
    /// neither fatal nor subjective. A received block failing with one of
    /// these is pruned from the fork database.
    pub fn invalidates_block(&self) -> bool {
        !self.is_fatal() && !self.is_subjective()
    }

    /// Node-local failures of input transactions: retrying later, or on
    /// another node, may succeed.
    pub fn is_subjective(&self) -> bool {
        matches!(
            self,
            ChainError::SubjectiveBlockProduction(_)
                | ChainError::BlockNetUsageExceeded(_)
                | ChainError::BlockCpuUsageExceeded(_)
                | ChainError::GreylistNetUsageExceeded(_)
                | ChainError::GreylistCpuUsageExceeded(_)
                | ChainError::DeadlineExceeded(_)
                | ChainError::LeewayDeadline(_)
                | ChainError::ActorWhitelist(_)
                | ChainError::ActorBlacklist(_)
                | ChainError::ContractWhitelist(_)
                | ChainError::ContractBlacklist(_)
                | ChainError::ActionBlacklist(_)
                | ChainError::KeyBlacklist(_)
                | ChainError::SigVariableSizeLimit(_)
        )
    }

    /// Failures the transaction pipeline re-raises instead of recording in
    /// the trace.
    pub fn is_never_caught(&self) -> bool {
        matches!(
            self,
            ChainError::OutOfMemory(_)
                | ChainError::DisallowedTransactionExtensions(_)
                | ChainError::ProtocolFeatureBadBlock(_)
        )
    }
}

impl From<bincode::Error> for ChainError {
    fn from(e: bincode::Error) -> Self {
        ChainError::Internal(format!("encoding error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_is_fatal_and_never_caught() {
        let e = ChainError::OutOfMemory("arena".into());
        assert!(e.is_fatal());
        assert!(e.is_never_caught());
        assert!(!e.is_subjective());
    }

    #[test]
    fn test_cpu_exceeded_is_objective() {
        let e = ChainError::TxCpuUsageExceeded("cpu".into());
        assert!(!e.is_subjective());
        assert!(e.invalidates_block());
        assert!(ChainError::KeyBlacklist("k".into()).is_subjective());
    }

    #[test]
    fn test_objective_failures_invalidate_block() {
        let e: ChainError = ForkDatabaseError::DuplicateBlock("x".into()).into();
        assert!(e.invalidates_block());
        assert!(ChainError::BlockValidate("mroot".into()).invalidates_block());
        assert!(ChainError::ExpiredTransaction("t".into()).invalidates_block());
        assert!(!ChainError::DeadlineExceeded("t".into()).invalidates_block());
        assert!(!ChainError::OutOfMemory("arena".into()).invalidates_block());
    }
}
