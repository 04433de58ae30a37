//! Chain builders shared by the scenarios.
//!
//! Blocks are signed by the single genesis producer; transactions by a
//! fixed user key. Both go through the permissive authorization adapter,
//! whose signatures are `key ++ digest`.

use qc_17_chain_controller::adapters::PermissiveAuthorization;
use qc_17_chain_controller::domain::signing_digest;
use qc_17_chain_controller::{
    BlockState, BlockStatus, ChainCollaborators, ChainResult, Controller, ControllerConfig,
    GenesisState, ProtocolFeatureSet, TransactionMetadata, TrxType,
};
use shared_types::{
    Action, BlockTimestamp, Digest, Microseconds, Name, PackedTransaction, PermissionLevel,
    Signature, TimePoint, TimePointSec, Transaction, TransactionId,
};
use std::path::Path;
use std::sync::{Arc, Once};

pub const PRODUCER_KEY: &[u8] = b"sysio-producer-key";
pub const USER_KEY: &[u8] = b"alice-key";
pub const GENESIS_SLOT: u32 = 10_000;

static TRACING: Once = Once::new();

/// Route controller logs to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn genesis() -> GenesisState {
    GenesisState::new(BlockTimestamp::from_slot(GENESIS_SLOT), PRODUCER_KEY.to_vec())
}

/// Config keeping logs and the fork database under `dir`.
pub fn persistent_config(dir: &Path) -> ControllerConfig {
    ControllerConfig {
        blocks_dir: Some(dir.join("blocks")),
        state_dir: Some(dir.join("state")),
        keep_state_log: true,
        ..ControllerConfig::default()
    }
}

pub fn new_controller(config: ControllerConfig) -> ChainResult<Controller> {
    init_tracing();
    Controller::new(
        config,
        ProtocolFeatureSet::with_all_builtins()?,
        ChainCollaborators::in_memory(),
    )
}

/// Controller started from the shared genesis.
pub fn started(config: ControllerConfig) -> ChainResult<Controller> {
    let mut chain = new_controller(config)?;
    chain.startup_from_genesis(&genesis())?;
    Ok(chain)
}

pub fn sign_block(digest: &Digest) -> ChainResult<Vec<Signature>> {
    Ok(vec![PermissiveAuthorization::sign(PRODUCER_KEY, digest)])
}

pub fn no_lookup(_: &TransactionId) -> Option<Arc<TransactionMetadata>> {
    None
}

/// A signed single-action transaction referencing the head block.
pub fn transfer(chain: &Controller, nonce: u64) -> ChainResult<Arc<TransactionMetadata>> {
    let head = chain.head_block_state()?;
    let mut trx = Transaction::default();
    trx.header.expiration = TimePointSec::from_time_point(
        head.timestamp().to_time_point().add(Microseconds::from_secs(120)),
    );
    trx.set_reference_block(&head.id());
    trx.actions.push(Action {
        account: Name::from("alice"),
        name: Name::from("transfer"),
        authorization: vec![PermissionLevel {
            actor: Name::from("alice"),
            permission: Name::from("active"),
        }],
        data: nonce.to_le_bytes().to_vec(),
    });
    let mut packed = PackedTransaction::new(trx, Vec::new());
    let digest = signing_digest(&chain.get_chain_id(), &packed);
    packed.signatures.push(PermissiveAuthorization::sign(USER_KEY, &digest));
    Ok(Arc::new(TransactionMetadata::recover_keys(
        Arc::new(packed),
        TrxType::Input,
        &chain.get_chain_id(),
        &PermissiveAuthorization,
    )?))
}

/// Produce, sign and commit a block at `slot`.
pub fn produce_at(
    chain: &mut Controller,
    slot: u32,
    trxs: &[Arc<TransactionMetadata>],
) -> ChainResult<Arc<BlockState>> {
    chain.start_block(
        BlockTimestamp::from_slot(slot),
        0,
        Vec::new(),
        BlockStatus::Incomplete,
        None,
        TimePoint::maximum(),
    )?;
    for trx in trxs {
        let trace =
            chain.push_transaction(trx.clone(), TimePoint::maximum(), Microseconds::MAX, 0, false, 0)?;
        if let Some(e) = &trace.except {
            return Err(e.clone());
        }
    }
    chain.finalize_block()?;
    chain.complete_block(&sign_block)?;
    chain.commit_block()?;
    chain.head_block_state()
}

/// Produce a block with one fresh transfer in the slot after the head.
pub fn produce_next(chain: &mut Controller, nonce: u64) -> ChainResult<Arc<BlockState>> {
    let slot = chain.head_block_state()?.timestamp().slot + 1;
    let trx = transfer(chain, nonce)?;
    produce_at(chain, slot, &[trx])
}

/// Validate and push a block produced elsewhere.
pub fn receive(chain: &mut Controller, bsp: &Arc<BlockState>) -> ChainResult<()> {
    let Some(block) = bsp.block.clone() else {
        return Ok(());
    };
    let state = chain.create_block_state(block)?;
    chain.push_block(state, None, &no_lookup)?;
    Ok(())
}
