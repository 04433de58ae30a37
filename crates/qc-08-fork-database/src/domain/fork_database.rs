//! # Fork Database
//!
//! Holds every reversible block since the last irreversible one.
//!
//! ## Structure
//!
//! - `root`: the last irreversible block; always valid, never in `index`
//! - `index`: all other known blocks by id
//! - `children`: parent id to child ids, for subtree removal
//!
//! `head` is the best validated node (or the root); `pending_head` is the
//! best node regardless of validity, i.e. the fork the controller should
//! try to switch to.

use super::error::{ForkDatabaseError, ForkDbResult};
use super::node::{priority, ForkNode};
use parking_lot::RwLock;
use shared_types::{short_id, BlockId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Nodes ordered newest first.
pub type Branch<N> = Vec<Arc<N>>;

/// Two branches below a common ancestor, each newest first.
pub type BranchPair<N> = (Branch<N>, Branch<N>);

struct Inner<N> {
    root: Option<Arc<N>>,
    index: HashMap<BlockId, Arc<N>>,
    children: HashMap<BlockId, Vec<BlockId>>,
    head: Option<Arc<N>>,
}

impl<N: ForkNode> Inner<N> {
    fn get_or_root(&self, id: &BlockId) -> Option<Arc<N>> {
        if let Some(root) = &self.root {
            if &root.id() == id {
                return Some(root.clone());
            }
        }
        self.index.get(id).cloned()
    }

    fn recompute_head(&mut self) {
        self.head = self
            .index
            .values()
            .filter(|n| n.is_valid())
            .max_by_key(|n| priority(n.as_ref()))
            .cloned()
            .or_else(|| self.root.clone());
    }

    fn pending_head(&self) -> Option<Arc<N>> {
        self.index
            .values()
            .max_by_key(|n| priority(n.as_ref()))
            .cloned()
            .or_else(|| self.root.clone())
    }

    fn remove_subtree(&mut self, id: &BlockId) -> usize {
        let mut queue = VecDeque::from([*id]);
        let mut removed = 0;
        while let Some(next) = queue.pop_front() {
            if let Some(node) = self.index.remove(&next) {
                removed += 1;
                if let Some(siblings) = self.children.get_mut(&node.previous()) {
                    siblings.retain(|c| c != &next);
                }
            }
            if let Some(kids) = self.children.remove(&next) {
                queue.extend(kids);
            }
        }
        removed
    }
}

/// Tree of reversible blocks rooted at the last irreversible block.
pub struct ForkDatabase<N> {
    inner: RwLock<Inner<N>>,
}

impl<N: ForkNode> Default for ForkDatabase<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: ForkNode> ForkDatabase<N> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                root: None,
                index: HashMap::new(),
                children: HashMap::new(),
                head: None,
            }),
        }
    }

    /// Drop every block and install a new root.
    pub fn reset(&self, root: Arc<N>) {
        root.set_valid(true);
        let mut inner = self.inner.write();
        inner.index.clear();
        inner.children.clear();
        inner.head = Some(root.clone());
        inner.root = Some(root);
    }

    pub fn root(&self) -> Option<Arc<N>> {
        self.inner.read().root.clone()
    }

    /// Best validated node, or the root.
    pub fn head(&self) -> Option<Arc<N>> {
        self.inner.read().head.clone()
    }

    /// Best node whether validated or not.
    pub fn pending_head(&self) -> Option<Arc<N>> {
        self.inner.read().pending_head()
    }

    /// Known block by id. The root is not returned; see [`Self::get_or_root`].
    pub fn get(&self, id: &BlockId) -> Option<Arc<N>> {
        self.inner.read().index.get(id).cloned()
    }

    pub fn get_or_root(&self, id: &BlockId) -> Option<Arc<N>> {
        self.inner.read().get_or_root(id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.inner.read().get_or_root(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All non-root nodes, oldest first.
    pub fn nodes(&self) -> Vec<Arc<N>> {
        let mut nodes: Vec<Arc<N>> = self.inner.read().index.values().cloned().collect();
        nodes.sort_by_key(|n| (n.block_num(), n.id()));
        nodes
    }

    /// Insert a block whose parent is the root or already known.
    pub fn add(&self, node: Arc<N>, ignore_duplicate: bool) -> ForkDbResult<()> {
        let mut inner = self.inner.write();
        if inner.root.is_none() {
            return Err(ForkDatabaseError::NoRoot);
        }
        let id = node.id();
        if inner.get_or_root(&id).is_some() {
            if ignore_duplicate {
                return Ok(());
            }
            return Err(ForkDatabaseError::DuplicateBlock(hex::encode(id)));
        }
        let previous = node.previous();
        if inner.get_or_root(&previous).is_none() {
            return Err(ForkDatabaseError::UnlinkableBlock {
                id: hex::encode(id),
                previous: hex::encode(previous),
            });
        }
        inner.children.entry(previous).or_default().push(id);
        inner.index.insert(id, node.clone());
        if node.is_valid() {
            inner.recompute_head();
        }
        debug!(block_num = node.block_num(), id = %short_id(&id), "[qc-08] block added");
        Ok(())
    }

    /// Flag a node valid and reselect the head.
    pub fn mark_valid(&self, node: &Arc<N>) {
        if node.is_valid() {
            return;
        }
        node.set_valid(true);
        self.inner.write().recompute_head();
    }

    /// Remove a block and every descendant.
    pub fn remove(&self, id: &BlockId) -> ForkDbResult<()> {
        let mut inner = self.inner.write();
        if inner.root.as_ref().map(|r| r.id()) == Some(*id) {
            return Err(ForkDatabaseError::RemovesHead(hex::encode(id)));
        }
        if let Some(head) = &inner.head {
            let head_id = head.id();
            let mut cursor = inner.index.get(&head_id).cloned();
            while let Some(node) = cursor {
                if &node.id() == id {
                    return Err(ForkDatabaseError::RemovesHead(hex::encode(id)));
                }
                cursor = inner.index.get(&node.previous()).cloned();
            }
        }
        let removed = inner.remove_subtree(id);
        inner.recompute_head();
        debug!(id = %short_id(id), removed, "[qc-08] subtree removed");
        Ok(())
    }

    /// Make `id` the new root, pruning everything outside its subtree.
    pub fn advance_root(&self, id: &BlockId) -> ForkDbResult<()> {
        let mut inner = self.inner.write();
        let old_root = inner.root.clone().ok_or(ForkDatabaseError::NoRoot)?;
        if old_root.id() == *id {
            return Ok(());
        }
        let new_root = inner
            .index
            .get(id)
            .cloned()
            .ok_or_else(|| ForkDatabaseError::InvalidRoot(format!("{} not in fork database", hex::encode(id))))?;
        if !new_root.is_valid() {
            return Err(ForkDatabaseError::InvalidRoot(format!(
                "{} has not been validated",
                hex::encode(id)
            )));
        }

        // Everything outside the new root's subtree goes.
        let mut keep = HashMap::new();
        let mut queue: VecDeque<BlockId> = inner.children.get(id).cloned().unwrap_or_default().into();
        while let Some(next) = queue.pop_front() {
            if let Some(node) = inner.index.get(&next) {
                keep.insert(next, node.clone());
            }
            if let Some(kids) = inner.children.get(&next) {
                queue.extend(kids.iter().copied());
            }
        }
        let pruned = inner.index.len() - keep.len() - 1;
        inner.children.retain(|parent, _| parent == id || keep.contains_key(parent));
        inner.index = keep;
        inner.root = Some(new_root.clone());
        inner.recompute_head();

        info!(
            block_num = new_root.block_num(),
            id = %short_id(id),
            pruned,
            "[qc-08] root advanced"
        );
        Ok(())
    }

    /// Walk from `head` toward the root, newest first, keeping nodes with
    /// `block_num <= trim_after`. The root itself is excluded.
    pub fn fetch_branch(&self, head: &BlockId, trim_after: u32) -> Branch<N> {
        let inner = self.inner.read();
        let mut result = Vec::new();
        let mut cursor = inner.index.get(head).cloned();
        while let Some(node) = cursor {
            if node.block_num() <= trim_after {
                result.push(node.clone());
            }
            cursor = inner.index.get(&node.previous()).cloned();
        }
        result
    }

    /// Node at `block_num` on the branch ending at `head`, root included.
    pub fn search_on_branch(&self, head: &BlockId, block_num: u32) -> Option<Arc<N>> {
        let inner = self.inner.read();
        let mut cursor = inner.get_or_root(head);
        while let Some(node) = cursor {
            if node.block_num() == block_num {
                return Some(node);
            }
            if node.block_num() < block_num {
                return None;
            }
            cursor = inner.get_or_root(&node.previous());
        }
        None
    }

    /// Branches from `first` and `second` down to their common ancestor,
    /// each newest first and excluding the ancestor.
    pub fn fetch_branch_from(&self, first: &BlockId, second: &BlockId) -> ForkDbResult<BranchPair<N>> {
        let inner = self.inner.read();
        let lookup = |id: &BlockId| {
            inner
                .get_or_root(id)
                .ok_or_else(|| ForkDatabaseError::BlockNotFound(hex::encode(id)))
        };

        let mut first_branch = Vec::new();
        let mut second_branch = Vec::new();
        let mut a = lookup(first)?;
        let mut b = lookup(second)?;

        while a.block_num() > b.block_num() {
            let prev = a.previous();
            first_branch.push(a);
            a = lookup(&prev)?;
        }
        while b.block_num() > a.block_num() {
            let prev = b.previous();
            second_branch.push(b);
            b = lookup(&prev)?;
        }
        if a.id() == b.id() {
            return Ok((first_branch, second_branch));
        }
        while a.previous() != b.previous() {
            let (prev_a, prev_b) = (a.previous(), b.previous());
            first_branch.push(a);
            second_branch.push(b);
            a = lookup(&prev_a).map_err(|_| {
                ForkDatabaseError::InvalidBranch("branches do not share an ancestor".into())
            })?;
            b = lookup(&prev_b).map_err(|_| {
                ForkDatabaseError::InvalidBranch("branches do not share an ancestor".into())
            })?;
        }
        first_branch.push(a);
        second_branch.push(b);
        Ok((first_branch, second_branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chain, TestNode};
    use proptest::prelude::*;

    fn db_with_root() -> (ForkDatabase<TestNode>, Arc<TestNode>) {
        let root = TestNode::root();
        let db = ForkDatabase::new();
        db.reset(root.clone());
        (db, root)
    }

    #[test]
    fn test_add_rejects_duplicates_and_orphans() {
        let (db, root) = db_with_root();
        let b1 = TestNode::child(&root, 1);
        db.add(b1.clone(), false).unwrap();
        assert!(matches!(
            db.add(b1.clone(), false),
            Err(ForkDatabaseError::DuplicateBlock(_))
        ));
        db.add(b1.clone(), true).unwrap();

        let orphan = TestNode::child(&TestNode::child(&b1, 9), 10);
        assert!(matches!(
            db.add(orphan, false),
            Err(ForkDatabaseError::UnlinkableBlock { .. })
        ));
    }

    #[test]
    fn test_head_tracks_best_valid_node() {
        let (db, root) = db_with_root();
        let b1 = TestNode::child(&root, 1);
        let b2 = TestNode::child(&b1, 2);
        db.add(b1.clone(), false).unwrap();
        db.add(b2.clone(), false).unwrap();

        assert_eq!(db.head().unwrap().id(), root.id());
        assert_eq!(db.pending_head().unwrap().id(), b2.id());

        db.mark_valid(&b1);
        assert_eq!(db.head().unwrap().id(), b1.id());
    }

    #[test]
    fn test_earlier_slot_wins_tie() {
        let (db, root) = db_with_root();
        let late = TestNode::child(&root, 5);
        let early = TestNode::child(&root, 3);
        db.add(late.clone(), false).unwrap();
        db.add(early.clone(), false).unwrap();
        assert_eq!(db.pending_head().unwrap().id(), early.id());
    }

    #[test]
    fn test_remove_drops_descendants() {
        let (db, root) = db_with_root();
        let nodes = chain(&root, 3, 1);
        for n in &nodes {
            db.add(n.clone(), false).unwrap();
        }
        db.remove(&nodes[1].id()).unwrap();
        assert!(db.get(&nodes[0].id()).is_some());
        assert!(db.get(&nodes[1].id()).is_none());
        assert!(db.get(&nodes[2].id()).is_none());
    }

    #[test]
    fn test_remove_refuses_head() {
        let (db, root) = db_with_root();
        let b1 = TestNode::child(&root, 1);
        db.add(b1.clone(), false).unwrap();
        db.mark_valid(&b1);
        assert!(matches!(
            db.remove(&b1.id()),
            Err(ForkDatabaseError::RemovesHead(_))
        ));
    }

    #[test]
    fn test_advance_root_prunes_other_forks() {
        let (db, root) = db_with_root();
        let main = chain(&root, 3, 1);
        let side = TestNode::child(&root, 20);
        for n in main.iter().chain(std::iter::once(&side)) {
            db.add(n.clone(), false).unwrap();
            db.mark_valid(n);
        }
        db.advance_root(&main[1].id()).unwrap();
        assert_eq!(db.root().unwrap().id(), main[1].id());
        assert!(db.get(&main[0].id()).is_none());
        assert!(db.get(&side.id()).is_none());
        assert!(db.get(&main[2].id()).is_some());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_advance_root_requires_validated_node() {
        let (db, root) = db_with_root();
        let b1 = TestNode::child(&root, 1);
        db.add(b1.clone(), false).unwrap();
        assert!(matches!(
            db.advance_root(&b1.id()),
            Err(ForkDatabaseError::InvalidRoot(_))
        ));
    }

    #[test]
    fn test_fetch_branch_trims_and_excludes_root() {
        let (db, root) = db_with_root();
        let nodes = chain(&root, 4, 1);
        for n in &nodes {
            db.add(n.clone(), false).unwrap();
        }
        let branch = db.fetch_branch(&nodes[3].id(), 2);
        let nums: Vec<u32> = branch.iter().map(|n| n.block_num()).collect();
        assert_eq!(nums, vec![2, 1]);
        assert_eq!(
            db.search_on_branch(&nodes[3].id(), 0).map(|n| n.id()),
            Some(root.id())
        );
    }

    proptest! {
        #[test]
        fn test_branches_stop_at_common_ancestor(
            shared in 0usize..4,
            left in 0usize..5,
            right in 0usize..5,
        ) {
            let (db, root) = db_with_root();
            let trunk = chain(&root, shared, 1);
            let base = trunk.last().cloned().unwrap_or_else(|| root.clone());
            let left_nodes = chain(&base, left, 100);
            let right_nodes = chain(&base, right, 200);
            for n in trunk.iter().chain(&left_nodes).chain(&right_nodes) {
                db.add(n.clone(), false).unwrap();
            }
            let left_tip = left_nodes.last().cloned().unwrap_or_else(|| base.clone());
            let right_tip = right_nodes.last().cloned().unwrap_or_else(|| base.clone());

            let (first, second) = db.fetch_branch_from(&left_tip.id(), &right_tip.id()).unwrap();
            let ids = |v: &Vec<Arc<TestNode>>| v.iter().map(|n| n.id()).collect::<Vec<_>>();
            let mut expected_left = ids(&left_nodes);
            expected_left.reverse();
            let mut expected_right = ids(&right_nodes);
            expected_right.reverse();
            prop_assert_eq!(ids(&first), expected_left);
            prop_assert_eq!(ids(&second), expected_right);
        }
    }
}
