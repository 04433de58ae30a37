use std::collections::BTreeMap;

/// Prior values of every key touched since a session began.
///
/// `None` means the key did not exist before the session.
#[derive(Debug, Default)]
pub struct UndoState {
    pub revision: i64,
    pub old_values: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl UndoState {
    pub fn new(revision: i64) -> Self {
        Self {
            revision,
            old_values: BTreeMap::new(),
        }
    }

    /// Remember the first prior value of a key only.
    pub fn record(&mut self, key: &[u8], previous: Option<Vec<u8>>) {
        self.old_values.entry(key.to_vec()).or_insert(previous);
    }

    /// Fold a newer state into this one, keeping the older prior values.
    pub fn absorb(&mut self, newer: UndoState) {
        for (key, previous) in newer.old_values {
            self.old_values.entry(key).or_insert(previous);
        }
    }
}
