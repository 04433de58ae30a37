//! Randomized block sequences checked against chain-wide invariants.

use super::fixtures::*;
use proptest::prelude::*;
use qc_17_chain_controller::{BlockStatus, ControllerConfig};
use shared_types::{BlockTimestamp, Microseconds, TimePoint};

#[derive(Debug, Clone)]
enum Step {
    /// Produce a block carrying this many transfers.
    Produce(usize),
    /// Build a speculative block, then throw it away.
    Speculate(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0usize..3).prop_map(Step::Produce),
        1 => (1usize..3).prop_map(Step::Speculate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_follower_tracks_producer_and_lib_only_grows(steps in prop::collection::vec(step(), 1..12)) {
        let mut producer = started(ControllerConfig::default()).unwrap();
        let mut follower = started(ControllerConfig::default()).unwrap();
        let mut nonce = 0u64;
        let mut last_lib = 0;

        for step in steps {
            match step {
                Step::Produce(count) => {
                    let mut trxs = Vec::new();
                    for _ in 0..count {
                        trxs.push(transfer(&producer, nonce).unwrap());
                        nonce += 1;
                    }
                    let slot = producer.head_block_state().unwrap().timestamp().slot + 1;
                    let bsp = produce_at(&mut producer, slot, &trxs).unwrap();
                    receive(&mut follower, &bsp).unwrap();
                }
                Step::Speculate(count) => {
                    let slot = producer.head_block_state().unwrap().timestamp().slot + 1;
                    producer
                        .start_block(
                            BlockTimestamp::from_slot(slot),
                            0,
                            Vec::new(),
                            BlockStatus::Incomplete,
                            None,
                            TimePoint::maximum(),
                        )
                        .unwrap();
                    let revision = producer.db().revision();
                    for _ in 0..count {
                        let trx = transfer(&producer, nonce).unwrap();
                        nonce += 1;
                        producer
                            .push_transaction(trx, TimePoint::maximum(), Microseconds::MAX, 0, false, 0)
                            .unwrap();
                    }
                    let aborted = producer.abort_block();
                    prop_assert_eq!(aborted.len(), count);
                    prop_assert_eq!(producer.db().revision(), revision - 1);
                }
            }

            let head = producer.head_block_num().unwrap();
            let lib = producer.last_irreversible_block_num().unwrap();
            prop_assert!(lib >= last_lib);
            prop_assert!(lib <= head);
            prop_assert_eq!(producer.db().revision(), i64::from(head));
            prop_assert_eq!(producer.block_log().head_num().unwrap_or(0), lib);
            prop_assert_eq!(follower.head_block_id().unwrap(), producer.head_block_id().unwrap());
            prop_assert_eq!(follower.last_irreversible_block_num().unwrap(), lib);
            last_lib = lib;
        }
    }
}
