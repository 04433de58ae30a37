//! Startup from genesis or snapshot, block log replay, snapshot export and
//! shutdown.

use super::Controller;
use crate::config::{GenesisState, ReadMode};
use crate::domain::{
    BlockHeaderState, BlockReport, BlockState, BlockStatus, BlockSummaryObject,
    GlobalPropertyObject, ProducerPermissionObject, ProtocolStateObject, TransactionMetadata,
    ACTIVE_PERMISSION, MAJORITY_PERMISSION, MINORITY_PERMISSION, SNAPSHOT_TABLES,
};
use crate::error::{ChainError, ChainResult};
use crate::SNAPSHOT_VERSION;
use qc_04_versioned_state::{SnapshotReader, SnapshotWriter};
use qc_08_fork_database::{load_fork_database, save_fork_database, ForkNode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::{short_id, BlockTimestamp, ChainId, Digest, SignedBlock, TransactionId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

const VERSION_SECTION: &str = "version";
const CHAIN_ID_SECTION: &str = "chain_id";
const BLOCK_STATE_SECTION: &str = "block_state";
const TABLE_SECTION_PREFIX: &str = "table/";

impl Controller {
    /// Initialize state from a genesis description, then replay whatever the
    /// block log already holds.
    pub fn startup_from_genesis(&mut self, genesis: &GenesisState) -> ChainResult<()> {
        self.ensure_not_started()?;
        genesis.validate()?;
        self.chain_id = genesis.compute_chain_id()?;

        info!("[qc-17] Starting from genesis");
        info!("  Chain ID: {}", hex::encode(self.chain_id));
        info!("  Initial Timestamp: {}", genesis.initial_timestamp.slot);

        let header_state = BlockHeaderState::genesis(
            genesis.initial_timestamp,
            genesis.initial_key.clone(),
            self.chain_id,
        );
        let genesis_block = Arc::new(BlockState::genesis(header_state));
        self.db.set_revision(i64::from(genesis_block.block_num()))?;
        self.initialize_database(genesis, &genesis_block)?;

        self.head = Some(genesis_block.clone());
        self.fork_db.reset(genesis_block);
        self.finish_startup()
    }

    /// Load state from a snapshot, then replay log blocks above it.
    pub fn startup_from_snapshot(&mut self, reader: &dyn SnapshotReader) -> ChainResult<()> {
        self.ensure_not_started()?;
        reader.validate()?;

        let version: u32 = read_single(reader, VERSION_SECTION)?;
        if version != SNAPSHOT_VERSION {
            return Err(ChainError::Snapshot(format!(
                "unsupported snapshot version {version}, expected {SNAPSHOT_VERSION}"
            )));
        }
        let chain_id: ChainId = read_single(reader, CHAIN_ID_SECTION)?;
        let header_state: BlockHeaderState = read_single(reader, BLOCK_STATE_SECTION)?;

        self.db
            .read_table_sections(reader, TABLE_SECTION_PREFIX, SNAPSHOT_TABLES)?;
        self.collaborators
            .authorization
            .read_from_snapshot(&self.db, reader)?;
        self.collaborators
            .resource_limits
            .read_from_snapshot(&self.db, reader)?;
        self.collaborators.execution.read_from_snapshot(&self.db, reader)?;

        let gpo = self.global_properties()?;
        if gpo.chain_id != chain_id {
            return Err(ChainError::ChainIdMismatch(format!(
                "snapshot declares chain id {} but its state holds {}",
                hex::encode(chain_id),
                hex::encode(gpo.chain_id)
            )));
        }
        self.chain_id = chain_id;

        let head = Arc::new(BlockState::new(header_state, None));
        let head_num = head.block_num();
        info!("[qc-17] Starting from snapshot");
        info!("  Chain ID: {}", hex::encode(self.chain_id));
        info!("  Head: #{} {}", head_num, short_id(&head.id()));

        self.db.set_revision(i64::from(head_num))?;
        self.head = Some(head.clone());
        self.fork_db.reset(head);

        match self.blog.head_num() {
            None => {
                self.blog.reset(head_num + 1)?;
                if let Some(log) = self.state_log.as_mut() {
                    log.reset(head_num + 1)?;
                }
            }
            Some(log_head) => {
                if self.blog.first_block_num() > head_num + 1 || log_head < head_num {
                    return Err(ChainError::ConfigInconsistency(format!(
                        "block log covers #{}..=#{} which does not continue snapshot head #{}",
                        self.blog.first_block_num(),
                        log_head,
                        head_num
                    )));
                }
            }
        }
        self.finish_startup()
    }

    /// Export the head state. Not allowed while a block is pending.
    pub fn write_snapshot(&self, writer: &mut dyn SnapshotWriter) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::WrongBlockStage(
                "cannot write a snapshot while a block is pending".into(),
            ));
        }
        let head = self.head()?;

        writer.write_section(VERSION_SECTION, vec![encode(&SNAPSHOT_VERSION)?])?;
        writer.write_section(CHAIN_ID_SECTION, vec![encode(&self.chain_id)?])?;
        writer.write_section(BLOCK_STATE_SECTION, vec![encode(&head.header_state)?])?;
        self.db
            .write_table_sections(writer, TABLE_SECTION_PREFIX, SNAPSHOT_TABLES)?;
        self.collaborators
            .authorization
            .add_to_snapshot(&self.db, writer)?;
        self.collaborators
            .resource_limits
            .add_to_snapshot(&self.db, writer)?;
        self.collaborators.execution.add_to_snapshot(&self.db, writer)?;
        writer.finalize()?;

        info!(
            block_num = head.block_num(),
            id = %short_id(&head.id()),
            "[qc-17] snapshot written"
        );
        Ok(())
    }

    /// Abort the pending block, flush the logs and persist the fork database.
    pub fn shutdown(&mut self) -> ChainResult<()> {
        info!("[qc-17] Shutting down chain controller");
        self.abort_block();
        self.blog.flush()?;
        if let Some(log) = self.state_log.as_mut() {
            log.flush()?;
        }
        if let (Some(path), Some(_)) = (self.fork_db_path(), self.fork_db.root()) {
            save_fork_database(&self.fork_db, &path)?;
        }
        Ok(())
    }

    fn ensure_not_started(&self) -> ChainResult<()> {
        if self.head.is_some() {
            return Err(ChainError::Internal("controller is already started".into()));
        }
        Ok(())
    }

    fn initialize_database(
        &mut self,
        genesis: &GenesisState,
        genesis_block: &Arc<BlockState>,
    ) -> ChainResult<()> {
        self.db.create(&GlobalPropertyObject {
            proposed_schedule_block_num: None,
            proposed_schedule: Default::default(),
            configuration: genesis.initial_configuration.clone(),
            chain_id: self.chain_id,
        })?;
        self.db.create(&ProtocolStateObject::genesis())?;
        self.db.create(&BlockSummaryObject {
            slot: (genesis_block.block_num() & 0xffff) as u16,
            block_id: genesis_block.id(),
        })?;

        self.collaborators.authorization.initialize_database(&self.db)?;
        self.collaborators.resource_limits.initialize_database(&self.db)?;

        let schedule = &genesis_block.header_state.active_schedule;
        for permission in [ACTIVE_PERMISSION, MAJORITY_PERMISSION, MINORITY_PERMISSION] {
            self.db
                .create(&ProducerPermissionObject::for_schedule(permission, schedule))?;
        }
        Ok(())
    }

    /// Shared tail of both startup paths: protocol feature state, block log
    /// replay and the persisted fork database.
    fn finish_startup(&mut self) -> ChainResult<()> {
        let pso: ProtocolStateObject = self.db.fetch(&[])?;
        self.protocol_features.init(&pso)?;

        if let Some(state_log) = &self.state_log {
            if state_log.head_num() != self.blog.head_num() {
                return Err(ChainError::ConfigInconsistency(format!(
                    "block state log head {:?} does not match block log head {:?}",
                    state_log.head_num(),
                    self.blog.head_num()
                )));
            }
        }

        self.replay_block_log()?;
        self.load_persisted_fork_db()?;

        if self.config.read_only {
            self.db.set_read_only(true);
        }

        let head = self.head()?;
        info!("[qc-17] Chain controller started");
        info!("  Head: #{} {}", head.block_num(), short_id(&head.id()));
        info!("  Fork Database Blocks: {}", self.fork_db.len());
        info!("  Activated Protocol Features: {}", self.protocol_features.activated_features().len());
        Ok(())
    }

    fn replay_block_log(&mut self) -> ChainResult<()> {
        let head_num = self.head()?.block_num();
        let Some(log_head) = self.blog.head_num() else {
            return Ok(());
        };
        if log_head <= head_num {
            return Ok(());
        }
        let start = head_num + 1;
        if start < self.blog.first_block_num() {
            return Err(ChainError::ConfigInconsistency(format!(
                "block log starts at #{} and cannot continue head #{}",
                self.blog.first_block_num(),
                head_num
            )));
        }

        info!("[qc-17] Replaying irreversible blocks");
        info!("  From: {}", start);
        info!("  To: {}", log_head);
        let started = std::time::Instant::now();
        let mut replayed = 0u32;
        for block_num in start..=log_head {
            if self.config.terminate_at_block > 0 && block_num > self.config.terminate_at_block {
                info!(
                    "[qc-17] Reached configured maximum block {}; terminating",
                    self.config.terminate_at_block
                );
                if let Some(shutdown) = &self.shutdown_callback {
                    shutdown();
                }
                break;
            }
            let block = self.blog.read_by_num(block_num)?.ok_or_else(|| {
                ChainError::BlockNotFound(format!("block #{block_num} missing from block log"))
            })?;
            self.replay_irreversible_block(Arc::new(block))?;
            replayed += 1;
        }
        info!(
            blocks = replayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[qc-17] block log replay finished"
        );
        Ok(())
    }

    fn replay_irreversible_block(&mut self, block: Arc<SignedBlock>) -> ChainResult<()> {
        let head = self.head()?.clone();
        if *block.previous() != head.id() {
            return Err(ChainError::BlockValidate(format!(
                "logged block #{} does not link to head {}",
                block.block_num(),
                short_id(&head.id())
            )));
        }
        let feature_set = self.protocol_features.feature_set();
        let validator = |timestamp: BlockTimestamp, active: &BTreeSet<Digest>, new: &[Digest]| {
            feature_set.check_protocol_features(timestamp, active, new)
        };
        let bsp = Arc::new(BlockState::from_received(
            &head.header_state,
            block,
            &validator,
            !self.config.force_all_checks,
            self.collaborators.authorization.as_ref(),
        )?);

        let no_lookup = |_: &TransactionId| -> Option<Arc<TransactionMetadata>> { None };
        let mut report = BlockReport::default();
        self.apply_block(&mut report, &bsp, BlockStatus::Irreversible, &no_lookup)?;
        self.fork_db.reset(bsp.clone());
        self.db.commit(i64::from(bsp.block_num()))?;
        Ok(())
    }

    /// Adopt the reversible blocks saved at the last shutdown when they
    /// build on the current head.
    fn load_persisted_fork_db(&mut self) -> ChainResult<()> {
        let Some(path) = self.fork_db_path() else {
            return Ok(());
        };
        let Some(saved) = load_fork_database::<BlockState>(&path)? else {
            return Ok(());
        };
        let head = self.head()?.clone();
        match saved.root() {
            Some(root) if root.id() == head.id() => {}
            other => {
                warn!(
                    saved_root = ?other.map(|r| r.block_num()),
                    head = head.block_num(),
                    "[qc-17] persisted fork database does not build on head; discarding"
                );
                return Ok(());
            }
        }
        for node in saved.nodes() {
            let valid = node.is_valid();
            self.fork_db.add(node.clone(), true)?;
            if valid {
                self.fork_db.mark_valid(&node);
            }
        }
        info!(blocks = self.fork_db.len(), "[qc-17] reversible blocks restored");

        if self.config.read_mode == ReadMode::Irreversible {
            return self.log_irreversible();
        }
        let Some(pending_head) = self.fork_db.pending_head() else {
            return Ok(());
        };
        if pending_head.id() == head.id() {
            return Ok(());
        }
        let status = if pending_head.is_valid() {
            BlockStatus::Validated
        } else {
            BlockStatus::Complete
        };
        let no_lookup = |_: &TransactionId| -> Option<Arc<TransactionMetadata>> { None };
        let mut report = BlockReport::default();
        self.maybe_switch_forks(&mut report, pending_head, status, None, &no_lookup)
    }
}

fn encode<T: Serialize>(value: &T) -> ChainResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a section holding exactly one row.
fn read_single<T: DeserializeOwned>(reader: &dyn SnapshotReader, name: &str) -> ChainResult<T> {
    let rows = reader.read_section(name)?;
    match rows.as_slice() {
        [row] => Ok(bincode::deserialize(row)?),
        _ => Err(ChainError::Snapshot(format!(
            "section '{name}' holds {} rows, expected one",
            rows.len()
        ))),
    }
}
