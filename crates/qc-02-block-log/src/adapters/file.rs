use crate::domain::{BlockLogError, LogEntry};
use crate::ports::{next_block_num, LogStore};
use shared_types::BlockId;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const FILE_MAGIC: u32 = 0x424c_4f47;
const FILE_VERSION: u32 = 1;
const FILE_HEADER_LEN: u64 = 12;

/// File-backed append-only log.
///
/// Layout: `[magic][version][first_block_num]` then framed entries. The
/// index of entry offsets is rebuilt on open; a torn final entry is
/// truncated away.
pub struct FileLogStore {
    file: File,
    path: PathBuf,
    first_block_num: u32,
    offsets: Vec<(u64, BlockId)>,
    end: u64,
}

impl FileLogStore {
    /// Open or create a log at `path`. A new file starts at `first_block_num`.
    pub fn open<P: AsRef<Path>>(path: P, first_block_num: u32) -> Result<Self, BlockLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        #[cfg(feature = "locking")]
        {
            use fs2::FileExt;
            file.try_lock_exclusive()
                .map_err(|_| BlockLogError::Locked(path.display().to_string()))?;
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut store = Self {
            file,
            path,
            first_block_num,
            offsets: Vec::new(),
            end: FILE_HEADER_LEN,
        };

        if bytes.is_empty() {
            store.write_file_header()?;
            info!(path = %store.path.display(), first_block_num, "[qc-02] created log");
            return Ok(store);
        }

        store.load(&bytes)?;
        info!(
            path = %store.path.display(),
            entries = store.offsets.len(),
            first_block_num = store.first_block_num,
            "[qc-02] opened log"
        );
        Ok(store)
    }

    fn write_file_header(&mut self) -> Result<(), BlockLogError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&FILE_MAGIC.to_le_bytes())?;
        self.file.write_all(&FILE_VERSION.to_le_bytes())?;
        self.file.write_all(&self.first_block_num.to_le_bytes())?;
        self.file.sync_all()?;
        self.end = FILE_HEADER_LEN;
        self.offsets.clear();
        Ok(())
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), BlockLogError> {
        if bytes.len() < FILE_HEADER_LEN as usize {
            return Err(BlockLogError::Io("log header truncated".into()));
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        if word(0) != FILE_MAGIC || word(4) != FILE_VERSION {
            return Err(BlockLogError::Io(format!(
                "{} is not a block log",
                self.path.display()
            )));
        }
        self.first_block_num = word(8);

        let mut cursor = FILE_HEADER_LEN as usize;
        while cursor < bytes.len() {
            let Some((entry, used)) = LogEntry::decode(&bytes[cursor..])? else {
                warn!(offset = cursor, "[qc-02] truncating torn log tail");
                self.file.set_len(cursor as u64)?;
                break;
            };
            let expected = self.first_block_num + self.offsets.len() as u32;
            if entry.block_num != expected {
                return Err(BlockLogError::NonSequential {
                    expected,
                    actual: entry.block_num,
                });
            }
            self.offsets.push((cursor as u64, entry.id));
            cursor += used;
        }
        self.end = cursor as u64;
        Ok(())
    }

    fn read_entry(&self, block_num: u32) -> Result<Option<LogEntry>, BlockLogError> {
        let Some(index) = block_num.checked_sub(self.first_block_num) else {
            return Ok(None);
        };
        let index = index as usize;
        let Some((offset, _)) = self.offsets.get(index) else {
            return Ok(None);
        };
        let next = self
            .offsets
            .get(index + 1)
            .map(|(o, _)| *o)
            .unwrap_or(self.end);
        let mut buf = vec![0u8; (next - offset) as usize];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(*offset))?;
        file.read_exact(&mut buf)?;
        match LogEntry::decode(&buf)? {
            Some((entry, _)) => Ok(Some(entry)),
            None => Err(BlockLogError::DataCorruption { block_num }),
        }
    }
}

impl LogStore for FileLogStore {
    fn first_block_num(&self) -> u32 {
        self.first_block_num
    }

    fn head(&self) -> Option<(u32, BlockId)> {
        let (_, id) = self.offsets.last()?;
        Some((self.first_block_num + self.offsets.len() as u32 - 1, *id))
    }

    fn append(&mut self, block_num: u32, id: BlockId, payload: &[u8]) -> Result<(), BlockLogError> {
        let expected = next_block_num(self);
        if block_num != expected {
            return Err(BlockLogError::NonSequential {
                expected,
                actual: block_num,
            });
        }
        let bytes = LogEntry {
            block_num,
            id,
            payload: payload.to_vec(),
        }
        .encode();
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&bytes)?;
        self.offsets.push((self.end, id));
        self.end += bytes.len() as u64;
        Ok(())
    }

    fn read_by_num(&self, block_num: u32) -> Result<Option<Vec<u8>>, BlockLogError> {
        Ok(self.read_entry(block_num)?.map(|e| e.payload))
    }

    fn id_for_num(&self, block_num: u32) -> Result<Option<BlockId>, BlockLogError> {
        let Some(index) = block_num.checked_sub(self.first_block_num) else {
            return Ok(None);
        };
        Ok(self.offsets.get(index as usize).map(|(_, id)| *id))
    }

    fn reset(&mut self, first_block_num: u32) -> Result<(), BlockLogError> {
        self.first_block_num = first_block_num;
        self.write_file_header()
    }

    fn flush(&mut self) -> Result<(), BlockLogError> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.log");
        {
            let mut store = FileLogStore::open(&path, 1).unwrap();
            store.append(1, [1u8; 32], b"one").unwrap();
            store.append(2, [2u8; 32], b"two").unwrap();
            store.flush().unwrap();
        }
        let store = FileLogStore::open(&path, 1).unwrap();
        assert_eq!(store.head(), Some((2, [2u8; 32])));
        assert_eq!(store.read_by_num(1).unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.id_for_num(2).unwrap(), Some([2u8; 32]));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.log");
        {
            let mut store = FileLogStore::open(&path, 1).unwrap();
            store.append(1, [1u8; 32], b"one").unwrap();
            store.append(2, [2u8; 32], b"two").unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        let mut store = FileLogStore::open(&path, 1).unwrap();
        assert_eq!(store.head(), Some((1, [1u8; 32])));
        store.append(2, [9u8; 32], b"again").unwrap();
        assert_eq!(store.read_by_num(2).unwrap(), Some(b"again".to_vec()));
    }

    #[test]
    fn test_reset_changes_first_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(dir.path().join("b.log"), 1).unwrap();
        store.append(1, [1u8; 32], b"one").unwrap();
        store.reset(100).unwrap();
        assert!(store.head().is_none());
        store.append(100, [4u8; 32], b"x").unwrap();
        assert_eq!(store.first_block_num(), 100);
    }
}
