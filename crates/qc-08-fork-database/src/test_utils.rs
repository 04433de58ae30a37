//! Minimal fork node for unit tests.

use crate::domain::ForkNode;
use serde::{Deserialize, Serialize};
use shared_types::{sha256, BlockId, BlockTimestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct TestNode {
    pub id: BlockId,
    pub previous: BlockId,
    pub block_num: u32,
    pub slot: u32,
    #[serde(skip)]
    pub valid: AtomicBool,
}

fn make_id(block_num: u32, previous: &BlockId, slot: u32) -> BlockId {
    let mut seed = previous.to_vec();
    seed.extend_from_slice(&slot.to_le_bytes());
    let mut id = sha256(&seed);
    id[..4].copy_from_slice(&block_num.to_be_bytes());
    id
}

impl TestNode {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            id: make_id(0, &[0u8; 32], 0),
            previous: [0u8; 32],
            block_num: 0,
            slot: 0,
            valid: AtomicBool::new(true),
        })
    }

    pub fn child(parent: &Arc<Self>, slot: u32) -> Arc<Self> {
        let block_num = parent.block_num + 1;
        Arc::new(Self {
            id: make_id(block_num, &parent.id, slot),
            previous: parent.id,
            block_num,
            slot,
            valid: AtomicBool::new(false),
        })
    }
}

/// `len` successive children of `base`, slots starting at `first_slot`.
pub fn chain(base: &Arc<TestNode>, len: usize, first_slot: u32) -> Vec<Arc<TestNode>> {
    let mut out: Vec<Arc<TestNode>> = Vec::with_capacity(len);
    for i in 0..len {
        let parent = out.last().cloned().unwrap_or_else(|| base.clone());
        out.push(TestNode::child(&parent, first_slot + i as u32));
    }
    out
}

impl ForkNode for TestNode {
    fn id(&self) -> BlockId {
        self.id
    }
    fn previous(&self) -> BlockId {
        self.previous
    }
    fn block_num(&self) -> u32 {
        self.block_num
    }
    fn timestamp(&self) -> BlockTimestamp {
        BlockTimestamp::from_slot(self.slot)
    }
    fn irreversible_blocknum(&self) -> u32 {
        0
    }
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
    fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release)
    }
}
