use std::sync::Arc;

use bytes::Bytes;
use log::warn;

use crate::btree::node::LeafNode;

use super::tree::Bptree;

/// In-order cursor over a bucket's leaf chain.
///
/// Iteration holds no latches across steps; each access latches the
/// current leaf just long enough to copy one record out. Concurrent
/// writers may split or merge leaves underneath, so the only promise is
/// that every yielded pair was present at some point during the walk.
pub struct BucketIter {
    tree: Arc<Bptree>,
    node: Arc<LeafNode>,
    pos: usize,
    current: Option<(Bytes, Bytes)>,
}

impl BucketIter {
    /// A cursor anchored at the first leaf.
    pub(crate) fn begin(tree: Arc<Bptree>) -> BucketIter {
        let node = tree.leaves.get(tree.first_leaf, &tree.ctx);
        let mut iter = BucketIter {
            tree,
            node,
            pos: 0,
            current: None,
        };
        iter.load_current();
        iter
    }

    /// A cursor positioned at the first record >= `key`, advancing into
    /// the next leaf when the containing leaf ends before one is found.
    pub(crate) fn at(tree: Arc<Bptree>, key: &[u8]) -> BucketIter {
        match tree.down(key) {
            Ok((leaf_id, parent)) => {
                let node = tree.leaves.get(leaf_id, &tree.ctx);
                let pos = match tree.read_leaf(&node) {
                    Ok(leaf) => leaf.lower_bound(key),
                    Err(e) => {
                        warn!("iterator positioning failed: {}", e);
                        0
                    }
                };
                drop(parent);
                let mut iter = BucketIter {
                    tree,
                    node,
                    pos,
                    current: None,
                };
                iter.load_current();
                iter
            }
            Err(e) => {
                warn!("iterator descent failed: {}", e);
                let node = tree.leaves.get(tree.first_leaf, &tree.ctx);
                BucketIter {
                    tree,
                    node,
                    pos: 0,
                    current: None,
                }
            }
        }
    }

    pub fn done(&self) -> bool {
        self.current.is_none()
    }

    /// Key of the current record. Must not be called once `done()`.
    pub fn key(&self) -> Bytes {
        let (key, _) = self.current.as_ref().expect("iterator out of range");
        key.clone()
    }

    /// Value of the current record. Must not be called once `done()`.
    pub fn val(&self) -> Bytes {
        let (_, val) = self.current.as_ref().expect("iterator out of range");
        val.clone()
    }

    /// Advance within the leaf, following the `next` link when the leaf is
    /// exhausted.
    pub fn next(&mut self) {
        assert!(!self.done(), "iterator out of range");
        self.pos += 1;
        self.load_current();
    }

    fn load_current(&mut self) {
        loop {
            let leaf = match self.tree.read_leaf(&self.node) {
                Ok(leaf) => leaf,
                Err(e) => {
                    warn!("iterator leaf read failed: {}", e);
                    self.current = None;
                    return;
                }
            };

            if self.pos < leaf.size() as usize {
                self.current = Some((leaf.key_bytes(self.pos), leaf.val_bytes(self.pos)));
                return;
            }

            let next = leaf.next();
            drop(leaf);
            if next == 0 {
                self.current = None;
                return;
            }
            self.node = self.tree.leaves.get(next, &self.tree.ctx);
            self.pos = 0;
        }
    }
}
