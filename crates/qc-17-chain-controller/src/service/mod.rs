//! # Controller
//!
//! The single entry point composing the state store, the fork database,
//! the block logs and the collaborators behind the outbound ports.
//!
//! The implementation is split by concern:
//!
//! | Module            | Operations                                                    |
//! |-------------------|---------------------------------------------------------------|
//! | `block_assembly`  | start, finalize, complete, commit and abort a pending block   |
//! | `transactions`    | input and scheduled transaction application                   |
//! | `fork_resolution` | push, apply and pop blocks, fork switching                    |
//! | `irreversibility` | logging blocks that became irreversible                       |
//! | `protocol_gate`   | pre-activation and feature checks, producer schedule proposal |
//! | `lifecycle`       | genesis, snapshot, replay and shutdown                        |
//! | `queries`         | read-only accessors                                           |
//!
//! Every mutating operation takes `&mut self`: the controller is owned by
//! the write thread.

mod block_assembly;
mod fork_resolution;
mod irreversibility;
mod lifecycle;
mod protocol_gate;
mod queries;
mod transactions;

#[cfg(test)]
mod tests;

use crate::config::{ControllerConfig, ValidationMode};
use crate::domain::{
    ActivationHandlers, BlockHeaderState, BlockState, BlockStatus, GlobalPropertyObject,
    PendingState, ProtocolFeatureManager, ProtocolFeatureSet, TransactionMetadata,
};
use crate::error::{ChainError, ChainResult};
use crate::ports::ChainCollaborators;
use crate::signals::ChainSignals;
use crate::thread_pool::NamedThreadPool;
use qc_02_block_log::{BlockLog, FileLogStore, LogStore, MemoryLogStore, TypedLog};
use qc_04_versioned_state::{Database, DatabaseLimits};
use qc_08_fork_database::ForkDatabase;
use shared_types::{ChainId, TransactionId};
use std::sync::Arc;
use tracing::info;

/// Called with the blocks popped during a fork switch, newest first.
pub type ForkedBranchCallback<'a> = dyn Fn(&[Arc<BlockState>]) + 'a;

/// Looks up transaction metadata with already recovered keys, so blocks
/// containing transactions this node has seen skip key recovery.
pub type TrxMetaLookup<'a> = dyn Fn(&TransactionId) -> Option<Arc<TransactionMetadata>> + 'a;

/// Invoked once `terminate_at_block` is reached.
pub type ShutdownCallback = Box<dyn Fn() + Send + Sync>;

const BLOCK_LOG_FILE: &str = "blocks.log";
const STATE_LOG_FILE: &str = "block_states.log";
const FORK_DB_FILE: &str = "fork_db.dat";

/// Header states of irreversible blocks, kept next to the block log.
pub type BlockStateLog = TypedLog<BlockHeaderState>;

pub struct Controller {
    config: ControllerConfig,
    db: Database,
    fork_db: ForkDatabase<BlockState>,
    blog: BlockLog,
    state_log: Option<BlockStateLog>,
    head: Option<Arc<BlockState>>,
    pending: Option<PendingState>,
    chain_id: ChainId,
    protocol_features: ProtocolFeatureManager,
    activation_handlers: ActivationHandlers,
    collaborators: ChainCollaborators,
    signals: ChainSignals,
    thread_pool: NamedThreadPool,
    /// Metadata of transactions carried by aborted speculative blocks.
    unapplied_transactions: Vec<Arc<TransactionMetadata>>,
    /// Set while an implicit or scheduled transaction runs; disables light validation.
    in_trx_requiring_checks: bool,
    trusted_producer_light_validation: bool,
    write_window: bool,
    shutdown_callback: Option<ShutdownCallback>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        feature_set: ProtocolFeatureSet,
        collaborators: ChainCollaborators,
    ) -> ChainResult<Self> {
        config.validate()?;
        let db = Database::new(DatabaseLimits {
            max_size: config.state_size,
            guard_size: config.state_guard_size,
        });
        let blog = BlockLog::new("blocks", open_log_store(&config, BLOCK_LOG_FILE)?);
        let state_log = if config.keep_state_log {
            Some(BlockStateLog::new("block_states", open_log_store(&config, STATE_LOG_FILE)?))
        } else {
            None
        };
        let thread_pool = NamedThreadPool::new("chain", usize::from(config.chain_thread_pool_size))?;

        info!("[qc-17] Initializing chain controller");
        info!("  Read Mode: {:?}", config.read_mode);
        info!("  Validation Mode: {:?}", config.block_validation_mode);
        info!("  Recognized Protocol Features: {}", feature_set.len());

        Ok(Self {
            config,
            db,
            fork_db: ForkDatabase::new(),
            blog,
            state_log,
            head: None,
            pending: None,
            chain_id: [0u8; 32],
            protocol_features: ProtocolFeatureManager::new(feature_set),
            activation_handlers: ActivationHandlers::with_builtin_handlers(),
            collaborators,
            signals: ChainSignals::default(),
            thread_pool,
            unapplied_transactions: Vec::new(),
            in_trx_requiring_checks: false,
            trusted_producer_light_validation: false,
            write_window: true,
            shutdown_callback: None,
        })
    }

    /// Observers register here.
    pub fn signals(&self) -> &ChainSignals {
        &self.signals
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Shared handle to the state store.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn fork_db(&self) -> &ForkDatabase<BlockState> {
        &self.fork_db
    }

    pub fn block_log(&self) -> &BlockLog {
        &self.blog
    }

    pub fn block_state_log(&self) -> Option<&BlockStateLog> {
        self.state_log.as_ref()
    }

    pub fn protocol_feature_manager(&self) -> &ProtocolFeatureManager {
        &self.protocol_features
    }

    /// Replace the migration table, e.g. to observe activations in tests.
    pub fn activation_handlers_mut(&mut self) -> &mut ActivationHandlers {
        &mut self.activation_handlers
    }

    pub fn set_shutdown_callback(&mut self, callback: ShutdownCallback) {
        self.shutdown_callback = Some(callback);
    }

    /// Allow writes again after a read window.
    pub fn set_to_write_window(&mut self) {
        self.db.set_read_only(self.config.read_only);
        self.write_window = true;
    }

    /// Read-only transactions may run on worker threads until the next
    /// write window. The store refuses writes meanwhile.
    pub fn set_to_read_window(&mut self) {
        self.db.set_read_only(true);
        self.write_window = false;
    }

    pub fn is_write_window(&self) -> bool {
        self.write_window
    }

    /// Whether received content may skip authorization and signature checks.
    pub fn light_validation_allowed(&self) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        if self.in_trx_requiring_checks {
            return false;
        }
        match pending.block_status {
            BlockStatus::Irreversible | BlockStatus::Validated => !self.config.force_all_checks,
            BlockStatus::Complete => {
                self.config.block_validation_mode == ValidationMode::Light
                    || self.trusted_producer_light_validation
            }
            BlockStatus::Incomplete | BlockStatus::Ephemeral => false,
        }
    }

    pub(crate) fn head(&self) -> ChainResult<&Arc<BlockState>> {
        self.head
            .as_ref()
            .ok_or_else(|| ChainError::Internal("controller has not been started".into()))
    }

    pub(crate) fn pending_ref(&self) -> ChainResult<&PendingState> {
        self.pending.as_ref().ok_or_else(no_pending)
    }

    pub(crate) fn global_properties(&self) -> ChainResult<GlobalPropertyObject> {
        Ok(self.db.fetch(&[])?)
    }

    fn fork_db_path(&self) -> Option<std::path::PathBuf> {
        self.config.state_dir.as_ref().map(|dir| dir.join(FORK_DB_FILE))
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("head", &self.head.as_ref().map(|h| h.block_num()))
            .field("pending", &self.pending.as_ref().map(|p| p.block_stage.name()))
            .field("fork_db_size", &self.fork_db.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn no_pending() -> ChainError {
    ChainError::NoPendingBlock("no pending block".into())
}

fn open_log_store(config: &ControllerConfig, file: &str) -> ChainResult<Box<dyn LogStore>> {
    Ok(match &config.blocks_dir {
        Some(dir) => Box::new(FileLogStore::open(dir.join(file), 1)?),
        None => Box::new(MemoryLogStore::new(1)),
    })
}
