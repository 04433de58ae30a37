//! # Versioned Database
//!
//! An ordered key/value map with a stack of undo states. Each open session
//! owns one undo state; undoing it restores every key it touched, squashing
//! folds it into the session below, and committing a revision forgets undo
//! history at or below it.
//!
//! Rows live in named tables. A table key is the table name, a zero byte,
//! then the row's primary key, so a table is a contiguous range.

use super::errors::StateError;
use super::session::Session;
use super::table::StateObject;
use super::undo::UndoState;
use crate::ports::{SnapshotReader, SnapshotWriter};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Store sizing. A zero `max_size` disables the guard.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseLimits {
    pub max_size: u64,
    pub guard_size: u64,
}

#[derive(Debug, Default)]
struct DatabaseInner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    stack: Vec<UndoState>,
    revision: i64,
    read_only: bool,
    used_bytes: u64,
    limits: DatabaseLimits,
}

/// Shared handle to the versioned store. Clones refer to the same data.
#[derive(Debug, Clone, Default)]
pub struct Database {
    inner: Arc<RwLock<DatabaseInner>>,
}

fn table_key(table: &str, key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(table.len() + 1 + key.len());
    full.extend_from_slice(table.as_bytes());
    full.push(0);
    full.extend_from_slice(key);
    full
}

fn table_prefix(table: &str) -> Vec<u8> {
    table_key(table, &[])
}

impl DatabaseInner {
    fn write(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<(), StateError> {
        if self.read_only {
            return Err(StateError::ReadOnly);
        }
        let previous = match &value {
            Some(v) => {
                self.used_bytes += (key.len() + v.len()) as u64;
                self.data.insert(key.clone(), v.clone())
            }
            None => self.data.remove(&key),
        };
        if let Some(prev) = &previous {
            self.used_bytes = self
                .used_bytes
                .saturating_sub((key.len() + prev.len()) as u64);
        }
        if let Some(top) = self.stack.last_mut() {
            top.record(&key, previous);
        }
        Ok(())
    }

    fn restore(&mut self, state: UndoState) {
        for (key, previous) in state.old_values {
            match previous {
                Some(value) => {
                    self.used_bytes += (key.len() + value.len()) as u64;
                    if let Some(cur) = self.data.insert(key.clone(), value) {
                        self.used_bytes = self.used_bytes.saturating_sub((key.len() + cur.len()) as u64);
                    }
                }
                None => {
                    if let Some(cur) = self.data.remove(&key) {
                        self.used_bytes = self.used_bytes.saturating_sub((key.len() + cur.len()) as u64);
                    }
                }
            }
        }
    }
}

impl Database {
    pub fn new(limits: DatabaseLimits) -> Self {
        let db = Self::default();
        db.inner.write().limits = limits;
        db
    }

    /// Open a nested session. With `enabled == false` nothing is tracked and
    /// the returned session is inert.
    pub fn start_undo_session(&self, enabled: bool) -> Session {
        if !enabled {
            return Session::inert(self.clone());
        }
        let mut inner = self.inner.write();
        inner.revision += 1;
        let revision = inner.revision;
        inner.stack.push(UndoState::new(revision));
        debug!(revision, depth = inner.stack.len(), "[qc-04] undo session started");
        drop(inner);
        Session::tracked(self.clone(), revision)
    }

    pub fn revision(&self) -> i64 {
        self.inner.read().revision
    }

    pub fn undo_depth(&self) -> usize {
        self.inner.read().stack.len()
    }

    /// Force the revision. Only legal with no open sessions.
    pub fn set_revision(&self, revision: i64) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        if !inner.stack.is_empty() {
            return Err(StateError::SessionsOpen {
                depth: inner.stack.len(),
            });
        }
        inner.revision = revision;
        Ok(())
    }

    /// Roll back the newest undo state.
    pub fn undo(&self) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        let state = inner
            .stack
            .pop()
            .ok_or(StateError::NoSession { operation: "undo" })?;
        inner.restore(state);
        inner.revision -= 1;
        debug!(revision = inner.revision, "[qc-04] undo");
        Ok(())
    }

    /// Merge the newest undo state into the one below it.
    pub fn squash(&self) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        let top = inner
            .stack
            .pop()
            .ok_or(StateError::NoSession { operation: "squash" })?;
        if let Some(below) = inner.stack.last_mut() {
            below.absorb(top);
        }
        inner.revision -= 1;
        Ok(())
    }

    /// Roll back every open undo state.
    pub fn undo_all(&self) -> Result<(), StateError> {
        while self.undo_depth() > 0 {
            self.undo()?;
        }
        Ok(())
    }

    /// Make every change at or below `revision` permanent.
    pub fn commit(&self, revision: i64) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        let keep_from = inner
            .stack
            .iter()
            .position(|s| s.revision > revision)
            .unwrap_or(inner.stack.len());
        inner.stack.drain(..keep_from);
        debug!(revision, remaining = inner.stack.len(), "[qc-04] commit");
        Ok(())
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.inner.write().read_only = read_only;
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read().read_only
    }

    /// Approximate bytes held by live rows.
    pub fn used_bytes(&self) -> u64 {
        self.inner.read().used_bytes
    }

    /// Fail once free space drops below the configured guard.
    pub fn check_available_size(&self) -> Result<(), StateError> {
        let inner = self.inner.read();
        let limits = inner.limits;
        if limits.max_size == 0 {
            return Ok(());
        }
        let free = limits.max_size.saturating_sub(inner.used_bytes);
        if free < limits.guard_size {
            return Err(StateError::DatabaseGuard {
                free,
                guard: limits.guard_size,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Raw rows
    // ---------------------------------------------------------------------

    pub fn get_raw(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().data.get(&table_key(table, key)).cloned()
    }

    pub fn put_raw(&self, table: &str, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        self.inner.write().write(table_key(table, key), Some(value))
    }

    pub fn remove_raw(&self, table: &str, key: &[u8]) -> Result<bool, StateError> {
        let full = table_key(table, key);
        let mut inner = self.inner.write();
        if !inner.data.contains_key(&full) {
            return Ok(false);
        }
        inner.write(full, None)?;
        Ok(true)
    }

    /// All rows of a table as `(primary key, value)`, in key order.
    pub fn rows(&self, table: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        let prefix = table_prefix(table);
        self.inner
            .read()
            .data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_vec(), v.clone()))
            .collect()
    }

    /// Names of every non-empty table.
    pub fn table_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = Vec::new();
        for key in inner.data.keys() {
            let Some(split) = key.iter().position(|b| *b == 0) else {
                continue;
            };
            let name = String::from_utf8_lossy(&key[..split]).into_owned();
            if names.last() != Some(&name) {
                names.push(name);
            }
        }
        names.dedup();
        names
    }

    // ---------------------------------------------------------------------
    // Typed objects
    // ---------------------------------------------------------------------

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &[u8]) -> Result<Option<T>, StateError> {
        self.get_raw(table, key)
            .map(|bytes| bincode::deserialize(&bytes).map_err(StateError::from))
            .transpose()
    }

    pub fn put<T: Serialize>(&self, table: &str, key: &[u8], value: &T) -> Result<(), StateError> {
        self.put_raw(table, key, bincode::serialize(value)?)
    }

    /// Look up an object by primary key.
    pub fn find<T: StateObject>(&self, key: &[u8]) -> Result<Option<T>, StateError> {
        self.get(T::TABLE, key)
    }

    /// Look up a singleton or keyed object that must exist.
    pub fn fetch<T: StateObject>(&self, key: &[u8]) -> Result<T, StateError> {
        self.find(key)?.ok_or_else(|| StateError::RowNotFound {
            table: T::TABLE,
            key: hex::encode(key),
        })
    }

    /// Insert a new object; fails if the key is taken.
    pub fn create<T: StateObject>(&self, object: &T) -> Result<(), StateError> {
        let key = object.primary_key();
        if self.get_raw(T::TABLE, &key).is_some() {
            return Err(StateError::DuplicateRow {
                table: T::TABLE,
                key: hex::encode(&key),
            });
        }
        self.put(T::TABLE, &key, object)
    }

    /// Insert or overwrite an object.
    pub fn upsert<T: StateObject>(&self, object: &T) -> Result<(), StateError> {
        self.put(T::TABLE, &object.primary_key(), object)
    }

    /// Read, mutate and write back an existing object.
    pub fn modify<T: StateObject>(&self, key: &[u8], f: impl FnOnce(&mut T)) -> Result<T, StateError> {
        let mut object: T = self.fetch(key)?;
        f(&mut object);
        self.put(T::TABLE, key, &object)?;
        Ok(object)
    }

    pub fn remove<T: StateObject>(&self, key: &[u8]) -> Result<bool, StateError> {
        self.remove_raw(T::TABLE, key)
    }

    /// Every object of a table, in primary key order.
    pub fn all<T: StateObject>(&self) -> Result<Vec<T>, StateError> {
        self.rows(T::TABLE)
            .into_iter()
            .map(|(_, bytes)| bincode::deserialize(&bytes).map_err(StateError::from))
            .collect()
    }
    // ---------------------------------------------------------------------
    // Snapshot sections
    // ---------------------------------------------------------------------

    /// Write one section per table, named `<prefix><table>`. Each row is
    /// the bincode pair of primary key and value.
    pub fn write_table_sections(
        &self,
        writer: &mut dyn SnapshotWriter,
        prefix: &str,
        tables: &[&str],
    ) -> Result<(), StateError> {
        for table in tables {
            let rows = self
                .rows(table)
                .into_iter()
                .map(|row| bincode::serialize(&row).map_err(StateError::from))
                .collect::<Result<Vec<_>, _>>()?;
            writer.write_section(&format!("{prefix}{table}"), rows)?;
        }
        Ok(())
    }

    /// Load the sections written by [`Database::write_table_sections`].
    /// Missing sections are an error.
    pub fn read_table_sections(
        &self,
        reader: &dyn SnapshotReader,
        prefix: &str,
        tables: &[&str],
    ) -> Result<(), StateError> {
        for table in tables {
            for row in reader.read_section(&format!("{prefix}{table}"))? {
                let (key, value): (Vec<u8>, Vec<u8>) = bincode::deserialize(&row)?;
                self.put_raw(table, &key, value)?;
            }
        }
        Ok(())
    }
}
