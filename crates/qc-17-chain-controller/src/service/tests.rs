//! Controller scenarios driven through the public operations.

use super::Controller;
use crate::adapters::{PermissiveAuthorization, EXECUTED_TABLE};
use crate::config::{ControllerConfig, GenesisState, ReadMode, ValidationMode};
use crate::domain::{
    signing_digest, BlockState, BlockStatus, BuiltinProtocolFeature, GeneratedTransactionObject,
    ProtocolFeatureSet, TransactionMetadata, TrxType,
};
use crate::error::{ChainError, ChainResult};
use crate::ports::ChainCollaborators;
use parking_lot::Mutex;
use qc_08_fork_database::ForkDatabaseError;
use qc_04_versioned_state::InMemorySnapshot;
use shared_types::{
    Action, BlockId, BlockTimestamp, Digest, Microseconds, Name, PackedTransaction,
    PermissionLevel, ReceiptTrx, Signature, TimePoint, TimePointSec, Transaction, TransactionId,
    TransactionStatus,
};
use std::sync::Arc;

const PRODUCER_KEY: &[u8] = b"sysio-producer-key";
const USER_KEY: &[u8] = b"alice-key";
const GENESIS_SLOT: u32 = 1_000;

fn genesis() -> GenesisState {
    GenesisState::new(BlockTimestamp::from_slot(GENESIS_SLOT), PRODUCER_KEY.to_vec())
}

fn controller_with(config: ControllerConfig) -> Controller {
    let mut chain = Controller::new(
        config,
        ProtocolFeatureSet::with_all_builtins().unwrap(),
        ChainCollaborators::in_memory(),
    )
    .unwrap();
    chain.startup_from_genesis(&genesis()).unwrap();
    chain
}

fn controller() -> Controller {
    controller_with(ControllerConfig::default())
}

fn sign_block(digest: &Digest) -> ChainResult<Vec<Signature>> {
    Ok(vec![PermissiveAuthorization::sign(PRODUCER_KEY, digest)])
}

fn sign_as_intruder(digest: &Digest) -> ChainResult<Vec<Signature>> {
    Ok(vec![PermissiveAuthorization::sign(b"intruder", digest)])
}

fn no_lookup(_: &TransactionId) -> Option<Arc<TransactionMetadata>> {
    None
}

fn transfer(chain: &Controller, nonce: u8, delay_sec: u32) -> Arc<TransactionMetadata> {
    let head = chain.head_block_state().unwrap();
    let mut trx = Transaction::default();
    trx.header.expiration = TimePointSec::from_time_point(
        head.timestamp().to_time_point().add(Microseconds::from_secs(60)),
    );
    trx.header.delay_sec = delay_sec;
    trx.set_reference_block(&head.id());
    trx.actions.push(Action {
        account: Name::from("alice"),
        name: Name::from("transfer"),
        authorization: vec![PermissionLevel {
            actor: Name::from("alice"),
            permission: Name::from("active"),
        }],
        data: vec![nonce],
    });
    let mut packed = PackedTransaction::new(trx, Vec::new());
    let digest = signing_digest(&chain.get_chain_id(), &packed);
    packed.signatures.push(PermissiveAuthorization::sign(USER_KEY, &digest));
    Arc::new(
        TransactionMetadata::recover_keys(
            Arc::new(packed),
            TrxType::Input,
            &chain.get_chain_id(),
            &PermissiveAuthorization,
        )
        .unwrap(),
    )
}

fn start_at(chain: &mut Controller, slot: u32, features: Vec<Digest>) -> ChainResult<()> {
    chain.start_block(
        BlockTimestamp::from_slot(slot),
        0,
        features,
        BlockStatus::Incomplete,
        None,
        TimePoint::maximum(),
    )
}

fn push(chain: &mut Controller, trx: &Arc<TransactionMetadata>) -> ChainResult<()> {
    let trace = chain.push_transaction(trx.clone(), TimePoint::maximum(), Microseconds::MAX, 0, false, 0)?;
    match &trace.except {
        Some(e) => Err(e.clone()),
        None => Ok(()),
    }
}

fn seal(chain: &mut Controller) -> Arc<BlockState> {
    chain.finalize_block().unwrap();
    chain.complete_block(&sign_block).unwrap();
    chain.commit_block().unwrap();
    chain.head_block_state().unwrap()
}

/// Produce a block in the slot after the head.
fn produce(chain: &mut Controller, trxs: &[Arc<TransactionMetadata>]) -> Arc<BlockState> {
    let slot = chain.head_block_state().unwrap().timestamp().slot + 1;
    start_at(chain, slot, Vec::new()).unwrap();
    for trx in trxs {
        push(chain, trx).unwrap();
    }
    seal(chain)
}

fn receive(chain: &mut Controller, bsp: &Arc<BlockState>) -> ChainResult<()> {
    let block = bsp.block.clone().unwrap();
    let state = chain.create_block_state(block)?;
    chain.push_block(state, None, &no_lookup).map(|_| ())
}

fn builtin(chain: &Controller, feature: BuiltinProtocolFeature) -> Digest {
    chain
        .protocol_feature_manager()
        .feature_set()
        .get_builtin_digest(feature)
        .unwrap()
}

#[test]
fn test_genesis_then_block_with_one_transaction() {
    let mut chain = controller();
    assert_eq!(chain.head_block_num().unwrap(), 0);
    assert_eq!(chain.db().revision(), 0);

    let trx = transfer(&chain, 1, 0);
    let head = produce(&mut chain, &[trx.clone()]);

    assert_eq!(head.block_num(), 1);
    assert_eq!(chain.db().revision(), 1);
    let block = head.block.clone().unwrap();
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].header.status, TransactionStatus::Executed);
    assert_eq!(block.transactions[0].trx_id(), trx.id());
    assert!(chain.is_known_unexpired_transaction(&trx.id()).unwrap());
    assert!(!chain.is_building_block());
}

#[test]
fn test_pop_block_restores_prior_state() {
    let mut chain = controller();
    let genesis_id = chain.head_block_id().unwrap();
    let executed_before = chain.db().rows(EXECUTED_TABLE).len();

    let trx = transfer(&chain, 1, 0);
    produce(&mut chain, &[trx.clone()]);
    assert!(chain.db().rows(EXECUTED_TABLE).len() > executed_before);

    chain.pop_block().unwrap();
    assert_eq!(chain.head_block_id().unwrap(), genesis_id);
    assert_eq!(chain.db().revision(), 0);
    assert_eq!(chain.db().rows(EXECUTED_TABLE).len(), executed_before);
    assert!(!chain.is_known_unexpired_transaction(&trx.id()).unwrap());

    let err = chain.pop_block().unwrap_err();
    assert!(matches!(err, ChainError::BlockValidate(_)));
}

#[test]
fn test_duplicate_transaction_is_rejected() {
    let mut chain = controller();
    let trx = transfer(&chain, 7, 0);
    produce(&mut chain, &[trx.clone()]);

    let slot = chain.head_block_state().unwrap().timestamp().slot + 1;
    start_at(&mut chain, slot, Vec::new()).unwrap();
    let err = push(&mut chain, &trx).unwrap_err();
    assert!(matches!(err, ChainError::DuplicateTransaction(_)));
    chain.abort_block();
}

#[test]
fn test_aborted_speculative_block_returns_transactions() {
    let mut chain = controller();
    let slot = chain.head_block_state().unwrap().timestamp().slot + 1;
    chain
        .start_block(
            BlockTimestamp::from_slot(slot),
            0,
            Vec::new(),
            BlockStatus::Ephemeral,
            None,
            TimePoint::maximum(),
        )
        .unwrap();
    let trx = transfer(&chain, 3, 0);
    push(&mut chain, &trx).unwrap();

    let aborted = chain.abort_block();
    assert_eq!(aborted.len(), 1);
    assert_eq!(chain.get_unapplied_transactions().len(), 1);
    assert_eq!(chain.head_block_num().unwrap(), 0);
}

#[test]
fn test_validator_reproduces_producer_block_id() {
    let mut producer = controller();
    let mut validator = controller();
    assert_eq!(producer.get_chain_id(), validator.get_chain_id());

    for nonce in 0..3u8 {
        let trx = transfer(&producer, nonce, 0);
        let produced = produce(&mut producer, &[trx]);
        receive(&mut validator, &produced).unwrap();
        assert_eq!(validator.head_block_id().unwrap(), produced.id());
    }
    assert_eq!(
        validator.last_irreversible_block_num().unwrap(),
        producer.last_irreversible_block_num().unwrap()
    );
}

#[test]
fn test_switches_to_longer_fork_and_reports_popped_blocks() {
    let mut fork_a = controller();
    let mut fork_b = controller();
    let mut validator = controller();

    start_at(&mut fork_a, GENESIS_SLOT + 1, Vec::new()).unwrap();
    let a1 = seal(&mut fork_a);
    start_at(&mut fork_b, GENESIS_SLOT + 2, Vec::new()).unwrap();
    let b1 = seal(&mut fork_b);
    start_at(&mut fork_b, GENESIS_SLOT + 3, Vec::new()).unwrap();
    let b2 = seal(&mut fork_b);

    receive(&mut validator, &a1).unwrap();
    assert_eq!(validator.head_block_id().unwrap(), a1.id());

    let popped: Mutex<Vec<BlockId>> = Mutex::new(Vec::new());
    let on_fork = |branch: &[Arc<BlockState>]| {
        popped.lock().extend(branch.iter().map(|b| b.id()));
    };
    for bsp in [&b1, &b2] {
        let state = validator.create_block_state(bsp.block.clone().unwrap()).unwrap();
        validator.push_block(state, Some(&on_fork), &no_lookup).unwrap();
    }

    assert_eq!(validator.head_block_id().unwrap(), b2.id());
    assert_eq!(*popped.lock(), vec![a1.id()]);
    assert_eq!(validator.last_irreversible_block_id().unwrap(), b1.id());
}

#[test]
fn test_earlier_block_at_same_height_replaces_head() {
    let mut fork_a = controller();
    let mut fork_b = controller();
    let mut validator = controller();

    start_at(&mut fork_a, GENESIS_SLOT + 1, Vec::new()).unwrap();
    let early = seal(&mut fork_a);
    start_at(&mut fork_b, GENESIS_SLOT + 2, Vec::new()).unwrap();
    let late = seal(&mut fork_b);

    receive(&mut validator, &late).unwrap();
    assert_eq!(validator.head_block_id().unwrap(), late.id());

    let popped: Mutex<Vec<BlockId>> = Mutex::new(Vec::new());
    let on_fork = |branch: &[Arc<BlockState>]| {
        popped.lock().extend(branch.iter().map(|b| b.id()));
    };
    let state = validator.create_block_state(early.block.clone().unwrap()).unwrap();
    validator.push_block(state, Some(&on_fork), &no_lookup).unwrap();

    assert_eq!(validator.head_block_id().unwrap(), early.id());
    assert_eq!(validator.head_block_num().unwrap(), 1);
    assert_eq!(validator.db().revision(), 1);
    assert_eq!(*popped.lock(), vec![late.id()]);
}

#[test]
fn test_pushing_known_block_fails_without_side_effects() {
    let mut producer = controller();
    let mut validator = controller();
    let b1 = produce(&mut producer, &[]);
    receive(&mut validator, &b1).unwrap();
    let head = validator.head_block_id().unwrap();
    let revision = validator.db().revision();

    let err = receive(&mut validator, &b1).unwrap_err();
    assert!(matches!(
        err,
        ChainError::ForkDatabase(ForkDatabaseError::DuplicateBlock(_))
    ));
    assert_eq!(validator.head_block_id().unwrap(), head);
    assert_eq!(validator.db().revision(), revision);
    assert!(!validator.is_building_block());
}

#[test]
fn test_failed_switch_restores_previous_branch() {
    let mut fork_a = controller();
    let mut fork_b = controller();
    let mut validator = controller_with(ControllerConfig {
        block_validation_mode: ValidationMode::Light,
        ..ControllerConfig::default()
    });

    start_at(&mut fork_a, GENESIS_SLOT + 1, Vec::new()).unwrap();
    let a1 = seal(&mut fork_a);
    start_at(&mut fork_b, GENESIS_SLOT + 2, Vec::new()).unwrap();
    let b1 = seal(&mut fork_b);
    start_at(&mut fork_b, GENESIS_SLOT + 3, Vec::new()).unwrap();
    let b2 = seal(&mut fork_b);

    receive(&mut validator, &a1).unwrap();
    receive(&mut validator, &b1).unwrap();
    assert_eq!(validator.head_block_id().unwrap(), a1.id());
    let revision = validator.db().revision();

    // light validation skips the signature, so only execution catches this
    let mut tampered = (*b2.block.clone().unwrap()).clone();
    tampered.header.action_mroot = [7u8; 32];
    let tampered = validator.create_block_state(Arc::new(tampered)).unwrap();
    let tampered_id = tampered.id();
    let err = validator.push_block(tampered, None, &no_lookup).unwrap_err();

    assert!(matches!(err, ChainError::BlockValidate(_)));
    assert_eq!(validator.head_block_id().unwrap(), a1.id());
    assert_eq!(validator.db().revision(), revision);
    assert!(validator.fork_db().get(&tampered_id).is_none());
    assert!(validator.fork_db().get(&b1.id()).is_some());
    assert!(!validator.is_building_block());
}

#[test]
fn test_block_with_wrong_signature_is_rejected() {
    let mut producer = controller();
    let validator = controller();
    let slot = GENESIS_SLOT + 1;
    start_at(&mut producer, slot, Vec::new()).unwrap();
    producer.finalize_block().unwrap();
    producer
        .complete_block(&sign_as_intruder)
        .unwrap_err();
    producer.abort_block();

    let good = produce(&mut producer, &[]);
    let mut forged = (*good.block.clone().unwrap()).clone();
    forged.producer_signature = PermissiveAuthorization::sign(b"intruder", &good.header_state.sig_digest());
    let err = validator.create_block_state(Arc::new(forged)).unwrap_err();
    assert!(matches!(err, ChainError::WrongSigningKey(_) | ChainError::Unauthorized(_)));
}

#[test]
fn test_feature_cannot_activate_twice() {
    let mut chain = controller();
    let preactivate = builtin(&chain, BuiltinProtocolFeature::PreactivateFeature);

    start_at(&mut chain, GENESIS_SLOT + 1, vec![preactivate]).unwrap();
    seal(&mut chain);
    assert!(chain.is_builtin_activated(BuiltinProtocolFeature::PreactivateFeature));
    assert!(chain.is_protocol_feature_activated(&preactivate).unwrap());

    assert!(start_at(&mut chain, GENESIS_SLOT + 2, vec![preactivate]).is_err());
    assert!(!chain.is_building_block());

    start_at(&mut chain, GENESIS_SLOT + 2, Vec::new()).unwrap();
    let err = chain.preactivate_feature(&preactivate).unwrap_err();
    assert!(matches!(err, ChainError::ProtocolFeature(_)));
    chain.abort_block();
}

#[test]
fn test_preactivated_feature_must_activate_in_next_block() {
    let mut chain = controller();
    let preactivate = builtin(&chain, BuiltinProtocolFeature::PreactivateFeature);
    let stage_one = builtin(&chain, BuiltinProtocolFeature::DisableDeferredTrxsStage1);

    start_at(&mut chain, GENESIS_SLOT + 1, vec![preactivate]).unwrap();
    seal(&mut chain);

    start_at(&mut chain, GENESIS_SLOT + 2, Vec::new()).unwrap();
    chain.preactivate_feature(&stage_one).unwrap();
    assert!(chain.preactivate_feature(&stage_one).is_err());
    seal(&mut chain);

    let err = start_at(&mut chain, GENESIS_SLOT + 3, Vec::new()).unwrap_err();
    assert!(matches!(err, ChainError::BlockValidate(_)));

    start_at(&mut chain, GENESIS_SLOT + 3, vec![stage_one]).unwrap();
    seal(&mut chain);
    assert!(chain.is_builtin_activated(BuiltinProtocolFeature::DisableDeferredTrxsStage1));
}

#[test]
fn test_irreversible_block_number_never_decreases() {
    let mut chain = controller();
    let irreversible = Arc::new(Mutex::new(Vec::new()));
    let seen = irreversible.clone();
    chain.signals().irreversible_block.connect(move |bsp| {
        seen.lock().push(bsp.block_num());
        Ok(())
    });

    let mut last_lib = chain.last_irreversible_block_num().unwrap();
    for nonce in 0..6u8 {
        let trx = transfer(&chain, nonce, 0);
        produce(&mut chain, &[trx]);
        let lib = chain.last_irreversible_block_num().unwrap();
        assert!(lib >= last_lib);
        assert!(lib < chain.head_block_num().unwrap());
        last_lib = lib;
    }

    let logged = irreversible.lock().clone();
    assert_eq!(logged, (1..=last_lib).collect::<Vec<_>>());
    assert_eq!(chain.block_log().head_num(), Some(last_lib));
    assert_eq!(
        chain.fetch_block_by_number(1).unwrap().map(|b| b.block_num()),
        Some(1)
    );
    assert_eq!(
        chain.get_block_id_for_num(chain.head_block_num().unwrap()).unwrap(),
        chain.head_block_id().unwrap()
    );
}

#[test]
fn test_scheduled_transaction_expires_once_deferral_is_disabled() {
    let mut chain = controller();
    let preactivate = builtin(&chain, BuiltinProtocolFeature::PreactivateFeature);
    let stage_one = builtin(&chain, BuiltinProtocolFeature::DisableDeferredTrxsStage1);

    start_at(&mut chain, GENESIS_SLOT + 1, vec![preactivate]).unwrap();
    let delayed = transfer(&chain, 9, 1);
    let trace = chain
        .push_transaction(delayed.clone(), TimePoint::maximum(), Microseconds::MAX, 0, false, 0)
        .unwrap();
    assert_eq!(trace.receipt.as_ref().unwrap().status, TransactionStatus::Delayed);
    seal(&mut chain);
    assert!(chain
        .db()
        .find::<GeneratedTransactionObject>(&delayed.id())
        .unwrap()
        .is_some());

    start_at(&mut chain, GENESIS_SLOT + 2, Vec::new()).unwrap();
    chain.preactivate_feature(&stage_one).unwrap();
    seal(&mut chain);

    start_at(&mut chain, GENESIS_SLOT + 3, vec![stage_one]).unwrap();
    let trace = chain.push_scheduled_transaction(&delayed.id(), 0, false).unwrap();
    assert_eq!(trace.receipt.as_ref().unwrap().status, TransactionStatus::Expired);
    assert!(trace.scheduled);
    let head = seal(&mut chain);

    let receipts = &head.block.as_ref().unwrap().transactions;
    assert!(receipts
        .iter()
        .any(|r| matches!(r.trx, ReceiptTrx::Id(id) if id == delayed.id())));
    assert!(chain
        .db()
        .find::<GeneratedTransactionObject>(&delayed.id())
        .unwrap()
        .is_none());
}

#[test]
fn test_unknown_scheduled_transaction_is_an_error() {
    let mut chain = controller();
    start_at(&mut chain, GENESIS_SLOT + 1, Vec::new()).unwrap();
    let err = chain.push_scheduled_transaction(&[5u8; 32], 0, false).unwrap_err();
    assert!(matches!(err, ChainError::UnknownTransaction(_)));
}

#[test]
fn test_snapshot_restores_head_and_state() {
    let mut chain = controller();
    for nonce in 0..3u8 {
        let trx = transfer(&chain, nonce, 0);
        produce(&mut chain, &[trx]);
    }
    let mut snapshot = InMemorySnapshot::new();
    chain.write_snapshot(&mut snapshot).unwrap();
    assert!(snapshot.is_finalized());

    let mut restored = Controller::new(
        ControllerConfig::default(),
        ProtocolFeatureSet::with_all_builtins().unwrap(),
        ChainCollaborators::in_memory(),
    )
    .unwrap();
    restored.startup_from_snapshot(&snapshot).unwrap();
    assert_eq!(restored.head_block_id().unwrap(), chain.head_block_id().unwrap());
    assert_eq!(restored.get_chain_id(), chain.get_chain_id());
    assert_eq!(
        restored.block_log().first_block_num(),
        chain.head_block_num().unwrap() + 1
    );

    let produced = produce(&mut chain, &[]);
    receive(&mut restored, &produced).unwrap();
    assert_eq!(restored.head_block_id().unwrap(), produced.id());
}

#[test]
fn test_snapshot_refused_while_building() {
    let mut chain = controller();
    start_at(&mut chain, GENESIS_SLOT + 1, Vec::new()).unwrap();
    let mut snapshot = InMemorySnapshot::new();
    assert!(matches!(
        chain.write_snapshot(&mut snapshot),
        Err(ChainError::WrongBlockStage(_))
    ));
}

#[test]
fn test_irreversible_mode_applies_only_irreversible_blocks() {
    let mut producer = controller();
    let mut follower = controller_with(ControllerConfig {
        read_mode: ReadMode::Irreversible,
        ..ControllerConfig::default()
    });

    let mut produced = Vec::new();
    for nonce in 0..4u8 {
        let trx = transfer(&producer, nonce, 0);
        produced.push(produce(&mut producer, &[trx]));
    }
    for bsp in &produced {
        receive(&mut follower, bsp).unwrap();
    }

    assert_eq!(follower.fork_db_head_block_id().unwrap(), produced[3].id());
    assert_eq!(
        follower.head_block_num().unwrap(),
        follower.last_irreversible_block_num().unwrap()
    );
    assert_eq!(
        follower.head_block_num().unwrap(),
        producer.last_irreversible_block_num().unwrap()
    );
}

#[test]
fn test_read_window_locks_store() {
    let mut chain = controller();
    chain.set_to_read_window();
    assert!(!chain.is_write_window());
    assert!(chain.db().is_read_only());

    let trx = transfer(&chain, 1, 0);
    let err = chain
        .push_transaction(trx, TimePoint::maximum(), Microseconds::MAX, 0, false, 0)
        .unwrap_err();
    assert!(matches!(err, ChainError::Transaction(_)));

    chain.set_to_write_window();
    assert!(!chain.db().is_read_only());
}

#[test]
fn test_terminate_at_block_invokes_shutdown_callback() {
    let mut producer = controller();
    let mut follower = controller_with(ControllerConfig {
        terminate_at_block: 1,
        ..ControllerConfig::default()
    });
    let stopped = Arc::new(Mutex::new(false));
    let flag = stopped.clone();
    follower.set_shutdown_callback(Box::new(move || *flag.lock() = true));

    let b1 = produce(&mut producer, &[]);
    let b2 = produce(&mut producer, &[]);
    receive(&mut follower, &b1).unwrap();
    assert!(!*stopped.lock());
    receive(&mut follower, &b2).unwrap();
    assert!(*stopped.lock());
    assert_eq!(follower.head_block_num().unwrap(), 1);
}
