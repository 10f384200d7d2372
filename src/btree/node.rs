use std::{collections::HashMap, sync::Arc};

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::{
    btree::{
        buffer_pool::BufferPool,
        freelist::Freelist,
        page::{BTreeInternalPage, BTreeLeafPage},
    },
    types::{ArcWriteGuard, Comparator, PageId},
};

/// Everything a tree hands its nodes: the shared page layer plus the
/// bucket's comparator.
pub struct TreeContext {
    pub page_size: u32,
    pub pool: Arc<BufferPool>,
    pub freelist: Arc<Freelist>,
    pub cmp: Comparator,
}

/// A leaf wrapper: the page id plus the node latch guarding the
/// materialized container.
pub struct LeafNode {
    pub id: PageId,
    pub latch: Arc<RwLock<BTreeLeafPage>>,
}

pub struct InnerNode {
    pub id: PageId,
    pub latch: Arc<RwLock<BTreeInternalPage>>,
}

pub trait TreeNode {
    fn raw(id: PageId, ctx: &TreeContext) -> Self;
}

impl TreeNode for LeafNode {
    fn raw(id: PageId, ctx: &TreeContext) -> Self {
        LeafNode {
            id,
            latch: Arc::new(RwLock::new(BTreeLeafPage::raw(
                id,
                ctx.page_size,
                ctx.cmp.clone(),
            ))),
        }
    }
}

impl TreeNode for InnerNode {
    fn raw(id: PageId, ctx: &TreeContext) -> Self {
        InnerNode {
            id,
            latch: Arc::new(RwLock::new(BTreeInternalPage::raw(
                id,
                ctx.page_size,
                ctx.cmp.clone(),
            ))),
        }
    }
}

/// The per-tree node registry: one wrapper per live page id, created on
/// demand and destroyed only when the page is freed during a merge. The
/// registry owns the wrappers; everyone else holds clones of the `Arc`.
pub struct NodeMap<N> {
    map: Mutex<HashMap<PageId, Arc<N>>>,
}

impl<N: TreeNode> NodeMap<N> {
    pub fn new() -> NodeMap<N> {
        NodeMap {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: PageId, ctx: &TreeContext) -> Arc<N> {
        let mut map = self.map.lock();
        map.entry(id).or_insert_with(|| Arc::new(N::raw(id, ctx))).clone()
    }

    pub fn del(&self, id: PageId) {
        let mut map = self.map.lock();
        map.remove(&id);
    }
}

/// A `(separator, new_child)` promotion bubbling up after a split.
pub struct PutEntry {
    pub key: Vec<u8>,
    pub val: PageId,
}

/// Rebalance signals exchanged between a node and its parent during
/// deletion. `key`/`update`/`del` flow child to parent, `delim`/`last`
/// parent to child.
#[derive(Default)]
pub struct DelEntry {
    pub update: bool,
    pub del: bool,
    pub key: Vec<u8>,
    pub last: bool,
    pub delim: Vec<u8>,
}

/// The root pointer and tree height, guarded by the per-bucket root latch.
pub struct TreeRoot {
    pub root: PageId,
    pub height: u32,
}

pub(crate) enum Latch {
    Root(ArcWriteGuard<TreeRoot>),
    Inner(PageId, ArcWriteGuard<BTreeInternalPage>),
}

/// The guard stack of a pessimistic descent. Latches are pushed root
/// first; the whole stack is released the moment a visited node turns out
/// to be safe, or when the operation completes.
pub(crate) struct LatchStack {
    stack: Vec<Latch>,
}

impl LatchStack {
    pub fn new(height: u32) -> LatchStack {
        LatchStack {
            stack: Vec::with_capacity(height as usize + 1),
        }
    }

    pub fn push(&mut self, latch: Latch) {
        self.stack.push(latch);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Release every held latch; the visited child turned out safe.
    pub fn clear(&mut self) {
        if !self.stack.is_empty() {
            debug!("descent releases {} ancestor latches", self.stack.len());
            self.stack.clear();
        }
    }

    /// True while the root latch from the start of the descent is still
    /// held, i.e. no node on the path was safe.
    pub fn has_root(&self) -> bool {
        matches!(self.stack.first(), Some(Latch::Root(_)))
    }

    pub fn root_mut(&mut self) -> Option<&mut ArcWriteGuard<TreeRoot>> {
        match self.stack.first_mut() {
            Some(Latch::Root(guard)) => Some(guard),
            _ => None,
        }
    }

    /// The inner-node guard pushed at stack index `idx`. Callers only ask
    /// for an index they pushed themselves, gated on the child having
    /// reported structural work, which implies no clear has happened.
    pub fn inner_at(
        &mut self,
        idx: usize,
    ) -> Option<(PageId, &mut ArcWriteGuard<BTreeInternalPage>)> {
        match self.stack.get_mut(idx) {
            Some(Latch::Inner(id, guard)) => Some((*id, guard)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{io::DbFile, types::lexicographic};

    fn ctx() -> (tempfile::TempDir, TreeContext) {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(DbFile::open(dir.path().join("node.db"), true, false).unwrap());
        let pool = crate::btree::buffer_pool::BufferPool::new(file, 4096, 16);
        Freelist::new_on_disk(1, &pool, 4096, 2).unwrap();
        let freelist = Arc::new(Freelist::open(1, 4096, pool.clone()).unwrap());
        (
            dir,
            TreeContext {
                page_size: 4096,
                pool,
                freelist,
                cmp: lexicographic(),
            },
        )
    }

    #[test]
    fn test_registry_returns_one_wrapper_per_page() {
        let (_dir, ctx) = ctx();
        let map: NodeMap<LeafNode> = NodeMap::new();

        let a = map.get(7, &ctx);
        let b = map.get(7, &ctx);
        assert!(Arc::ptr_eq(&a, &b));

        let c = map.get(8, &ctx);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_registry_del_forgets_wrapper() {
        let (_dir, ctx) = ctx();
        let map: NodeMap<InnerNode> = NodeMap::new();

        let a = map.get(7, &ctx);
        map.del(7);
        let b = map.get(7, &ctx);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_latch_stack_clear_releases_everything() {
        let root = Arc::new(RwLock::new(TreeRoot { root: 3, height: 1 }));

        let mut stack = LatchStack::new(1);
        stack.push(Latch::Root(root.write_arc()));
        assert!(stack.has_root());
        assert!(root.try_write().is_none());

        stack.clear();
        assert!(!stack.has_root());
        assert_eq!(stack.len(), 0);
        // the root latch is free again
        assert!(root.try_write().is_some());
    }

    #[test]
    fn test_latch_stack_indexing() {
        let (_dir, ctx) = ctx();
        let map: NodeMap<InnerNode> = NodeMap::new();
        let node = map.get(9, &ctx);

        let mut stack = LatchStack::new(2);
        let my_idx = stack.len();
        stack.push(Latch::Inner(9, node.latch.write_arc()));

        let (id, _guard) = stack.inner_at(my_idx).unwrap();
        assert_eq!(id, 9);
        assert!(stack.root_mut().is_none());
        assert!(stack.inner_at(5).is_none());
    }
}
