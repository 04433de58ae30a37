use crate::domain::StateError;
use crate::ports::{SnapshotReader, SnapshotWriter};

/// In-memory snapshot: sections kept in write order.
#[derive(Debug, Default, Clone)]
pub struct InMemorySnapshot {
    sections: Vec<(String, Vec<Vec<u8>>)>,
    finalized: bool,
}

impl InMemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl SnapshotWriter for InMemorySnapshot {
    fn write_section(&mut self, name: &str, rows: Vec<Vec<u8>>) -> Result<(), StateError> {
        if let Some(existing) = self.sections.iter_mut().find(|(n, _)| n == name) {
            existing.1.extend(rows);
        } else {
            self.sections.push((name.to_string(), rows));
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StateError> {
        self.finalized = true;
        Ok(())
    }
}

impl SnapshotReader for InMemorySnapshot {
    fn section_names(&self) -> Vec<String> {
        self.sections.iter().map(|(n, _)| n.clone()).collect()
    }

    fn read_section(&self, name: &str) -> Result<Vec<Vec<u8>>, StateError> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rows)| rows.clone())
            .ok_or_else(|| StateError::SectionMissing(name.to_string()))
    }

    fn validate(&self) -> Result<(), StateError> {
        if !self.finalized {
            return Err(StateError::SectionMissing("snapshot was not finalized".into()));
        }
        Ok(())
    }
}
