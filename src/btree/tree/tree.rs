use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    btree::{
        node::{InnerNode, LeafNode, NodeMap, TreeContext, TreeRoot},
        page::{BTreeInternalPage, BTreeLeafPage},
    },
    bucket::BucketMeta,
    database::MetaStore,
    error::KvError,
    types::{ArcReadGuard, ArcWriteGuard, KvResult, PageId},
};

/// Where a tree persists its root and height when they change: the bucket
/// directory persists into the file meta, user buckets rewrite their
/// directory record.
pub(crate) enum RootSink {
    Meta(Arc<MetaStore>),
    Directory(Arc<Bptree>),
}

/// One B+ tree: the root latch, the two node registries, and the shared
/// page layer. All key ordering goes through the bucket's comparator.
pub struct Bptree {
    pub(crate) name: String,
    pub(crate) order: u32,
    pub(crate) first_leaf: PageId,
    pub(crate) root_latch: Arc<RwLock<TreeRoot>>,
    pub(crate) leaves: NodeMap<LeafNode>,
    pub(crate) inners: NodeMap<InnerNode>,
    pub(crate) ctx: TreeContext,
    pub(crate) root_sink: RootSink,
}

/// The shared latch still held on the lowest visited level during a
/// read-crabbing descent. Only the unlock-on-drop matters.
pub(crate) enum DownGuard {
    Root { _guard: ArcReadGuard<TreeRoot> },
    Inner { _guard: ArcReadGuard<BTreeInternalPage> },
}

impl Bptree {
    pub(crate) fn new(
        name: &str,
        meta: BucketMeta,
        ctx: TreeContext,
        root_sink: RootSink,
    ) -> Bptree {
        Bptree {
            name: name.to_string(),
            order: meta.order,
            first_leaf: meta.first_leaf,
            root_latch: Arc::new(RwLock::new(TreeRoot {
                root: meta.root,
                height: meta.height,
            })),
            leaves: NodeMap::new(),
            inners: NodeMap::new(),
            ctx,
            root_sink,
        }
    }

    /// Point lookup. Read-crab to the leaf, shared latch on the leaf,
    /// parent released once the leaf is latched.
    pub fn get(&self, key: &[u8]) -> Result<Bytes, KvError> {
        let (leaf_id, parent) = self.down(key)?;
        let node = self.leaves.get(leaf_id, &self.ctx);
        let leaf = self.read_leaf(&node)?;
        drop(parent);

        match leaf.get(key) {
            Some(val) => Ok(val),
            None => Err(KvError::key_not_found(key)),
        }
    }

    /// Replace the value of an existing key. Value growth is absorbed by
    /// the overflow mechanism, so no structural change can happen and the
    /// leaf latch alone is enough.
    pub fn update(&self, key: &[u8], val: &[u8]) -> KvResult {
        let (leaf_id, parent) = self.down(key)?;
        let node = self.leaves.get(leaf_id, &self.ctx);
        let mut leaf = self.write_leaf(&node)?;
        drop(parent);

        if !leaf.update(&self.ctx.freelist, key, val)? {
            return Err(KvError::key_not_found(key));
        }
        leaf.write(&self.ctx.pool)
    }

    /// Read-crabbing descent: shared latch on each inner node, parent
    /// released as soon as the child is latched. Returns the leaf id and
    /// the still-held latch of its parent (or of the root pointer when the
    /// tree is one level tall).
    pub(crate) fn down(&self, key: &[u8]) -> Result<(PageId, DownGuard), KvError> {
        let root = self.root_latch.read_arc();
        let mut height = root.height;
        let mut id = root.root;
        let mut parent = DownGuard::Root { _guard: root };

        while height > 1 {
            let node = self.inners.get(id, &self.ctx);
            let inner = self.read_inner(&node)?;
            let (child, _pos) = inner.route(key);
            parent = DownGuard::Inner { _guard: inner };
            id = child;
            height -= 1;
        }
        Ok((id, parent))
    }

    // ------------------------------------------------------------------
    // node latching; materialization takes the write latch once and
    // downgrades

    pub(crate) fn read_leaf(
        &self,
        node: &Arc<LeafNode>,
    ) -> Result<ArcReadGuard<BTreeLeafPage>, KvError> {
        let guard = node.latch.read_arc();
        if guard.is_loaded() {
            return Ok(guard);
        }
        drop(guard);
        let mut guard = node.latch.write_arc();
        guard.load(&self.ctx.pool)?;
        Ok(ArcWriteGuard::downgrade(guard))
    }

    pub(crate) fn write_leaf(
        &self,
        node: &Arc<LeafNode>,
    ) -> Result<ArcWriteGuard<BTreeLeafPage>, KvError> {
        let mut guard = node.latch.write_arc();
        guard.load(&self.ctx.pool)?;
        Ok(guard)
    }

    pub(crate) fn read_inner(
        &self,
        node: &Arc<InnerNode>,
    ) -> Result<ArcReadGuard<BTreeInternalPage>, KvError> {
        let guard = node.latch.read_arc();
        if guard.is_loaded() {
            return Ok(guard);
        }
        drop(guard);
        let mut guard = node.latch.write_arc();
        guard.load(&self.ctx.pool)?;
        Ok(ArcWriteGuard::downgrade(guard))
    }

    pub(crate) fn write_inner(
        &self,
        node: &Arc<InnerNode>,
    ) -> Result<ArcWriteGuard<BTreeInternalPage>, KvError> {
        let mut guard = node.latch.write_arc();
        guard.load(&self.ctx.pool)?;
        Ok(guard)
    }

    // ------------------------------------------------------------------
    // root persistence

    pub(crate) fn update_root(&self, root: PageId, height: u32) -> KvResult {
        match &self.root_sink {
            RootSink::Meta(meta) => meta.update_dir_root(root, height),
            RootSink::Directory(dir) => dir.update_bucket_root(&self.name, root, height),
        }
    }

    /// Rewrite a bucket's directory record in place after its tree grew or
    /// shrank. Serialized per bucket by that bucket's root latch, which is
    /// held across the call.
    pub(crate) fn update_bucket_root(&self, name: &str, root: PageId, height: u32) -> KvResult {
        let val = self.get(name.as_bytes())?;
        let mut meta = BucketMeta::from_bytes(&val);
        meta.root = root;
        meta.height = height;
        self.update(name.as_bytes(), &meta.to_bytes())
    }

    // ------------------------------------------------------------------
    // entry-count safety predicates; byte growth is handled by the
    // overflow mechanism and never triggers a split

    pub(crate) fn safe_to_put(&self, size: u32) -> bool {
        size < self.order
    }

    pub(crate) fn if_split(&self, size: u32) -> bool {
        size > self.order
    }

    /// Minimum occupancy is the ceiling half of the order, so an odd
    /// order rounds up.
    pub(crate) fn safe_to_del(&self, size: u32) -> bool {
        size > self.order.div_ceil(2)
    }

    pub(crate) fn if_merge(&self, size: u32) -> bool {
        size < self.order.div_ceil(2)
    }

    pub(crate) fn has_more(&self, size: u32) -> bool {
        size > self.order.div_ceil(2)
    }

    #[cfg(test)]
    pub(crate) fn height(&self) -> u32 {
        self.root_latch.read().height
    }
}
