//! Persisting the fork database across restarts.
//!
//! The reversible tree is written on clean shutdown and read back (then
//! deleted) on startup, so reversible blocks survive a restart.

use crate::domain::{ForkDatabase, ForkDatabaseError, ForkDbResult, ForkNode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const MAGIC: u32 = 0x3041_0fdb;
const VERSION: u32 = 1;

#[derive(Serialize)]
struct PersistedRef<'a, N> {
    magic: u32,
    version: u32,
    root: &'a N,
    nodes: Vec<(&'a N, bool)>,
}

#[derive(Deserialize)]
struct Persisted<N> {
    magic: u32,
    version: u32,
    root: N,
    nodes: Vec<(N, bool)>,
}

fn persistence_error(e: impl std::fmt::Display) -> ForkDatabaseError {
    ForkDatabaseError::Persistence(e.to_string())
}

/// Write the tree to `path`.
pub fn save_fork_database<N>(db: &ForkDatabase<N>, path: &Path) -> ForkDbResult<()>
where
    N: ForkNode + Serialize,
{
    let root = db.root().ok_or(ForkDatabaseError::NoRoot)?;
    let nodes = db.nodes();
    let persisted = PersistedRef {
        magic: MAGIC,
        version: VERSION,
        root: root.as_ref(),
        nodes: nodes.iter().map(|n| (n.as_ref(), n.is_valid())).collect(),
    };
    let bytes = bincode::serialize(&persisted).map_err(persistence_error)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(persistence_error)?;
    }
    let temp = path.with_extension("tmp");
    std::fs::write(&temp, bytes).map_err(persistence_error)?;
    std::fs::rename(&temp, path).map_err(persistence_error)?;
    info!(path = %path.display(), nodes = nodes.len(), "[qc-08] fork database saved");
    Ok(())
}

/// Read a tree written by [`save_fork_database`] and delete the file.
/// Returns `None` when no file exists.
pub fn load_fork_database<N>(path: &Path) -> ForkDbResult<Option<ForkDatabase<N>>>
where
    N: ForkNode + DeserializeOwned,
{
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(persistence_error(e)),
    };
    let persisted: Persisted<N> = bincode::deserialize(&bytes).map_err(persistence_error)?;
    if persisted.magic != MAGIC || persisted.version != VERSION {
        return Err(ForkDatabaseError::Persistence(format!(
            "{} is not a supported fork database file",
            path.display()
        )));
    }

    let db = ForkDatabase::new();
    db.reset(Arc::new(persisted.root));
    let mut nodes = persisted.nodes;
    nodes.sort_by_key(|(n, _)| n.block_num());
    let count = nodes.len();
    for (node, valid) in nodes {
        node.set_valid(valid);
        db.add(Arc::new(node), false)?;
    }
    std::fs::remove_file(path).map_err(persistence_error)?;
    info!(path = %path.display(), nodes = count, "[qc-08] fork database loaded");
    Ok(Some(db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chain, TestNode};

    #[test]
    fn test_save_and_load_preserves_tree_and_validity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fork_db.dat");

        let root = TestNode::root();
        let db = ForkDatabase::new();
        db.reset(root.clone());
        let nodes = chain(&root, 3, 1);
        for n in &nodes {
            db.add(n.clone(), false).unwrap();
        }
        db.mark_valid(&nodes[0]);
        save_fork_database(&db, &path).unwrap();

        let loaded: ForkDatabase<TestNode> = load_fork_database(&path).unwrap().unwrap();
        assert_eq!(loaded.root().unwrap().id(), root.id());
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.head().unwrap().id(), nodes[0].id());
        assert_eq!(loaded.pending_head().unwrap().id(), nodes[2].id());
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<ForkDatabase<TestNode>> =
            load_fork_database(&dir.path().join("none.dat")).unwrap();
        assert!(loaded.is_none());
    }
}
