//! Snapshot section contract.
//!
//! A snapshot is an ordered list of named sections, each an independent
//! run of encoded rows. File formats are an adapter concern.

use crate::domain::StateError;

/// Sink for snapshot sections, written in order.
pub trait SnapshotWriter {
    fn write_section(&mut self, name: &str, rows: Vec<Vec<u8>>) -> Result<(), StateError>;

    /// Called once after the last section.
    fn finalize(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}

/// Source of snapshot sections.
pub trait SnapshotReader {
    fn section_names(&self) -> Vec<String>;

    fn has_section(&self, name: &str) -> bool {
        self.section_names().iter().any(|n| n == name)
    }

    fn read_section(&self, name: &str) -> Result<Vec<Vec<u8>>, StateError>;

    /// Check structural integrity before any section is consumed.
    fn validate(&self) -> Result<(), StateError> {
        Ok(())
    }
}
