//! Typed log service over a [`LogStore`].

use crate::domain::BlockLogError;
use crate::ports::LogStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::{block_num_from_id, BlockId, SignedBlock};
use std::marker::PhantomData;
use tracing::debug;

/// Log of serialized values, one per block number.
pub struct TypedLog<T> {
    store: Box<dyn LogStore>,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

/// Log of irreversible blocks.
pub type BlockLog = TypedLog<SignedBlock>;

impl<T: Serialize + DeserializeOwned> TypedLog<T> {
    pub fn new(name: &'static str, store: Box<dyn LogStore>) -> Self {
        Self {
            store,
            name,
            _marker: PhantomData,
        }
    }

    /// Serialize a value ahead of [`TypedLog::append`].
    pub fn pack(value: &T) -> Result<Vec<u8>, BlockLogError> {
        Ok(bincode::serialize(value)?)
    }

    pub fn first_block_num(&self) -> u32 {
        self.store.first_block_num()
    }

    pub fn head_num(&self) -> Option<u32> {
        self.store.head().map(|(num, _)| num)
    }

    pub fn head_id(&self) -> Option<BlockId> {
        self.store.head().map(|(_, id)| id)
    }

    /// Append pre-serialized bytes.
    pub fn append(&mut self, block_num: u32, id: BlockId, packed: &[u8]) -> Result<(), BlockLogError> {
        self.store.append(block_num, id, packed)?;
        debug!(log = self.name, block_num, "[qc-02] appended");
        Ok(())
    }

    pub fn read_by_num(&self, block_num: u32) -> Result<Option<T>, BlockLogError> {
        self.store
            .read_by_num(block_num)?
            .map(|bytes| bincode::deserialize(&bytes).map_err(BlockLogError::from))
            .transpose()
    }

    /// Read by id; `None` when the number is absent or the id differs.
    pub fn read_by_id(&self, id: &BlockId) -> Result<Option<T>, BlockLogError> {
        let block_num = block_num_from_id(id);
        if self.store.id_for_num(block_num)?.as_ref() != Some(id) {
            return Ok(None);
        }
        self.read_by_num(block_num)
    }

    pub fn id_for_num(&self, block_num: u32) -> Result<Option<BlockId>, BlockLogError> {
        self.store.id_for_num(block_num)
    }

    /// Drop everything and start again at `first_block_num`.
    pub fn reset(&mut self, first_block_num: u32) -> Result<(), BlockLogError> {
        self.store.reset(first_block_num)
    }

    pub fn flush(&mut self) -> Result<(), BlockLogError> {
        self.store.flush()
    }
}
