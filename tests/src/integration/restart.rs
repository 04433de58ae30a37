//! Shutdown, restart and replay against file-backed logs.

use super::fixtures::*;
use qc_04_versioned_state::InMemorySnapshot;
use qc_17_chain_controller::{ChainError, ControllerConfig, ReadMode};
use std::sync::Arc;

// =============================================================================
// RESTART FROM PERSISTED STATE
// =============================================================================

#[test]
fn test_restart_replays_log_and_restores_reversible_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let (head_id, lib) = {
        let mut chain = started(persistent_config(dir.path())).unwrap();
        for nonce in 0..6 {
            produce_next(&mut chain, nonce).unwrap();
        }
        let head_id = chain.head_block_id().unwrap();
        let lib = chain.last_irreversible_block_num().unwrap();
        assert!(lib > 0);
        chain.shutdown().unwrap();
        (head_id, lib)
    };

    let mut restarted = started(persistent_config(dir.path())).unwrap();
    assert_eq!(restarted.head_block_id().unwrap(), head_id);
    assert_eq!(restarted.last_irreversible_block_num().unwrap(), lib);
    assert_eq!(restarted.block_log().head_num(), Some(lib));
    assert_eq!(
        restarted.block_state_log().and_then(|log| log.head_num()),
        Some(lib)
    );

    // the replayed chain keeps producing on top of the restored head
    let next = produce_next(&mut restarted, 100).unwrap();
    assert_eq!(next.previous(), head_id);
}

#[test]
fn test_restart_without_fork_database_stops_at_irreversible_head() {
    let dir = tempfile::tempdir().unwrap();
    let lib = {
        let mut chain = started(persistent_config(dir.path())).unwrap();
        for nonce in 0..4 {
            produce_next(&mut chain, nonce).unwrap();
        }
        chain.last_irreversible_block_num().unwrap()
        // dropped without shutdown: the fork database is never written
    };

    let restarted = started(persistent_config(dir.path())).unwrap();
    assert_eq!(restarted.head_block_num().unwrap(), lib);
    assert_eq!(restarted.fork_db().len(), 0);
}

#[test]
fn test_replay_honours_terminate_at_block() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut chain = started(persistent_config(dir.path())).unwrap();
        for nonce in 0..6 {
            produce_next(&mut chain, nonce).unwrap();
        }
    }

    let config = ControllerConfig {
        terminate_at_block: 2,
        ..persistent_config(dir.path())
    };
    let restarted = started(config).unwrap();
    assert_eq!(restarted.head_block_num().unwrap(), 2);
}

#[test]
fn test_replayed_transactions_stay_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let trx = {
        let mut chain = started(persistent_config(dir.path())).unwrap();
        let slot = GENESIS_SLOT + 1;
        let trx = transfer(&chain, 42).unwrap();
        produce_at(&mut chain, slot, &[trx.clone()]).unwrap();
        for nonce in 0..3 {
            produce_next(&mut chain, nonce).unwrap();
        }
        chain.shutdown().unwrap();
        trx
    };

    let mut restarted = started(persistent_config(dir.path())).unwrap();
    assert!(restarted.is_known_unexpired_transaction(&trx.id()).unwrap());
    let slot = restarted.head_block_state().unwrap().timestamp().slot + 1;
    let err = produce_at(&mut restarted, slot, &[trx]).unwrap_err();
    assert!(matches!(err, ChainError::DuplicateTransaction(_)));
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

#[test]
fn test_snapshot_node_follows_producer() {
    let mut producer = started(ControllerConfig::default()).unwrap();
    for nonce in 0..5 {
        produce_next(&mut producer, nonce).unwrap();
    }
    let mut snapshot = InMemorySnapshot::new();
    producer.write_snapshot(&mut snapshot).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut follower = new_controller(persistent_config(dir.path())).unwrap();
    follower.startup_from_snapshot(&snapshot).unwrap();
    let snapshot_head = follower.head_block_num().unwrap();

    let mut produced = Vec::new();
    for nonce in 10..14 {
        produced.push(produce_next(&mut producer, nonce).unwrap());
    }
    for bsp in &produced {
        receive(&mut follower, bsp).unwrap();
    }
    assert_eq!(follower.head_block_id().unwrap(), producer.head_block_id().unwrap());
    assert_eq!(follower.block_log().first_block_num(), snapshot_head + 1);
    assert_eq!(
        follower.last_irreversible_block_num().unwrap(),
        producer.last_irreversible_block_num().unwrap()
    );
}

#[test]
fn test_snapshot_ahead_of_block_log_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut chain = started(persistent_config(dir.path())).unwrap();
        for nonce in 0..4 {
            produce_next(&mut chain, nonce).unwrap();
        }
    }

    // a snapshot taken far ahead of what the block log holds
    let mut far_ahead = started(ControllerConfig::default()).unwrap();
    for nonce in 0..12 {
        produce_next(&mut far_ahead, nonce).unwrap();
    }
    let mut snapshot = InMemorySnapshot::new();
    far_ahead.write_snapshot(&mut snapshot).unwrap();

    let mut chain = new_controller(persistent_config(dir.path())).unwrap();
    let err = chain.startup_from_snapshot(&snapshot).unwrap_err();
    assert!(matches!(err, ChainError::ConfigInconsistency(_)));
}

// =============================================================================
// READ MODES
// =============================================================================

#[test]
fn test_irreversible_follower_logs_what_it_applies() {
    let mut producer = started(ControllerConfig::default()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut follower = started(ControllerConfig {
        read_mode: ReadMode::Irreversible,
        ..persistent_config(dir.path())
    })
    .unwrap();

    let applied = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = applied.clone();
    follower.signals().accepted_block.connect(move |bsp| {
        seen.lock().push(bsp.block_num());
        Ok(())
    });

    for nonce in 0..5 {
        let bsp = produce_next(&mut producer, nonce).unwrap();
        receive(&mut follower, &bsp).unwrap();
    }

    let lib = producer.last_irreversible_block_num().unwrap();
    assert_eq!(*applied.lock(), (1..=lib).collect::<Vec<_>>());
    assert_eq!(follower.block_log().head_num(), Some(lib));
    assert_eq!(follower.fork_db_head_block_num().unwrap(), 5);
}
