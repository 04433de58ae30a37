use crate::domain::BlockLogError;
use crate::ports::{next_block_num, LogStore};
use shared_types::BlockId;

/// In-memory log for tests and ephemeral nodes.
#[derive(Debug, Clone)]
pub struct MemoryLogStore {
    first_block_num: u32,
    entries: Vec<(BlockId, Vec<u8>)>,
}

impl MemoryLogStore {
    pub fn new(first_block_num: u32) -> Self {
        Self {
            first_block_num,
            entries: Vec::new(),
        }
    }

    fn index(&self, block_num: u32) -> Option<usize> {
        let offset = block_num.checked_sub(self.first_block_num)? as usize;
        (offset < self.entries.len()).then_some(offset)
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl LogStore for MemoryLogStore {
    fn first_block_num(&self) -> u32 {
        self.first_block_num
    }

    fn head(&self) -> Option<(u32, BlockId)> {
        let (id, _) = self.entries.last()?;
        Some((self.first_block_num + self.entries.len() as u32 - 1, *id))
    }

    fn append(&mut self, block_num: u32, id: BlockId, payload: &[u8]) -> Result<(), BlockLogError> {
        let expected = next_block_num(self);
        if block_num != expected {
            return Err(BlockLogError::NonSequential {
                expected,
                actual: block_num,
            });
        }
        self.entries.push((id, payload.to_vec()));
        Ok(())
    }

    fn read_by_num(&self, block_num: u32) -> Result<Option<Vec<u8>>, BlockLogError> {
        Ok(self.index(block_num).map(|i| self.entries[i].1.clone()))
    }

    fn id_for_num(&self, block_num: u32) -> Result<Option<BlockId>, BlockLogError> {
        Ok(self.index(block_num).map(|i| self.entries[i].0))
    }

    fn reset(&mut self, first_block_num: u32) -> Result<(), BlockLogError> {
        self.first_block_num = first_block_num;
        self.entries.clear();
        Ok(())
    }
}
