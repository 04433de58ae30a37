//! On-disk entry framing.
//!
//! ```text
//! [block_num: u32 LE][id: 32 bytes][len: u32 LE][crc32: u32 LE][payload: len bytes]
//! ```

use super::errors::BlockLogError;
use shared_types::BlockId;

/// Fixed part of every entry.
pub const ENTRY_HEADER_LEN: usize = 4 + 32 + 4 + 4;

/// A stored log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub block_num: u32,
    pub id: BlockId,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.block_num.to_le_bytes());
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&self.payload).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode an entry at the start of `bytes`. Returns `Ok(None)` when the
    /// buffer ends mid-entry, which marks a torn tail write.
    pub fn decode(bytes: &[u8]) -> Result<Option<(LogEntry, usize)>, BlockLogError> {
        if bytes.len() < ENTRY_HEADER_LEN {
            return Ok(None);
        }
        let block_num = read_u32(&bytes[0..4]);
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes[4..36]);
        let len = read_u32(&bytes[36..40]) as usize;
        let checksum = read_u32(&bytes[40..44]);
        let end = ENTRY_HEADER_LEN + len;
        if bytes.len() < end {
            return Ok(None);
        }
        let payload = bytes[ENTRY_HEADER_LEN..end].to_vec();
        if crc32fast::hash(&payload) != checksum {
            return Err(BlockLogError::DataCorruption { block_num });
        }
        Ok(Some((
            LogEntry {
                block_num,
                id,
                payload,
            },
            end,
        )))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_detects_torn_tail() {
        let entry = LogEntry {
            block_num: 3,
            id: [3u8; 32],
            payload: vec![1, 2, 3],
        };
        let bytes = entry.encode();
        assert!(LogEntry::decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
        let (decoded, used) = LogEntry::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_decode_detects_corruption() {
        let mut bytes = LogEntry {
            block_num: 9,
            id: [0u8; 32],
            payload: vec![5; 8],
        }
        .encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(
            LogEntry::decode(&bytes),
            Err(BlockLogError::DataCorruption { block_num: 9 })
        );
    }
}
