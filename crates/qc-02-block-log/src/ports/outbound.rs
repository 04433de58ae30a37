use crate::domain::BlockLogError;
use shared_types::BlockId;

/// Gap-free, append-only storage keyed by block number.
pub trait LogStore: Send + Sync {
    /// Number of the first entry, or of the first expected entry when empty.
    fn first_block_num(&self) -> u32;

    /// Newest entry's number and id.
    fn head(&self) -> Option<(u32, BlockId)>;

    /// Append pre-serialized bytes. `block_num` must be `head + 1`, or
    /// `first_block_num` on an empty log.
    fn append(&mut self, block_num: u32, id: BlockId, payload: &[u8]) -> Result<(), BlockLogError>;

    fn read_by_num(&self, block_num: u32) -> Result<Option<Vec<u8>>, BlockLogError>;

    fn id_for_num(&self, block_num: u32) -> Result<Option<BlockId>, BlockLogError>;

    /// Drop all entries and restart at `first_block_num`.
    fn reset(&mut self, first_block_num: u32) -> Result<(), BlockLogError>;

    fn flush(&mut self) -> Result<(), BlockLogError> {
        Ok(())
    }
}

/// Expected next number for a store.
pub fn next_block_num(store: &dyn LogStore) -> u32 {
    store
        .head()
        .map(|(num, _)| num + 1)
        .unwrap_or_else(|| store.first_block_num())
}
