use log::debug;

use crate::{
    btree::{
        node::{DelEntry, Latch, LatchStack},
        page::BTreeInternalPage,
    },
    error::KvError,
    types::{KvResult, PageId},
};

use super::tree::Bptree;

/// delete-related methods
impl Bptree {
    /// Delete a record; an absent key fails with `KeyNotFound`.
    ///
    /// May cause nodes to borrow from or merge with their right sibling
    /// when they fall under half occupancy, and may collapse the root.
    pub fn del(&self, key: &[u8]) -> KvResult {
        if self.try_del(key)? {
            return Ok(());
        }

        // the leaf would fall under half, restart under exclusive latches
        let root_guard = self.root_latch.write_arc();
        let height = root_guard.height;
        let root = root_guard.root;
        let mut stack = LatchStack::new(height);
        stack.push(Latch::Root(root_guard));

        let mut entry = DelEntry::default();
        self.del_rec(height, root, key, &mut entry, &mut stack)?;

        // root collapse: an inner root with a lone child hands the root
        // role down. Only possible while the whole path stayed latched.
        if height > 1 && stack.has_root() {
            let collapsed = match stack.inner_at(1) {
                Some((root_id, root_node)) if root_node.is_empty() => {
                    let child = root_node.head();
                    root_node.free(&self.ctx.freelist, &self.ctx.pool)?;
                    Some((root_id, child))
                }
                _ => None,
            };

            if let Some((old_root, child)) = collapsed {
                self.inners.del(old_root);
                let root_guard = stack.root_mut().expect("root latch held through collapse");
                debug_assert_eq!(root_guard.root, old_root);
                root_guard.root = child;
                root_guard.height -= 1;
                let new_height = root_guard.height;
                debug!(
                    "tree {} root collapse {} -> {}, height {}",
                    self.name, old_root, child, new_height
                );
                self.update_root(child, new_height)?;
            }
        }
        Ok(())
    }

    /// The optimistic shallow path: presence is checked before the safety
    /// test, so an absent key never escalates. Returns Ok(false) when the
    /// delete must run under exclusive latches.
    fn try_del(&self, key: &[u8]) -> Result<bool, KvError> {
        let (leaf_id, parent) = self.down(key)?;
        let node = self.leaves.get(leaf_id, &self.ctx);
        let mut leaf = self.write_leaf(&node)?;
        drop(parent);

        if !leaf.find(key) {
            return Err(KvError::key_not_found(key));
        }
        if !self.safe_to_del(leaf.size()) {
            return Ok(false);
        }

        leaf.del(key);
        leaf.write(&self.ctx.pool)?;
        Ok(true)
    }

    fn del_rec(
        &self,
        height: u32,
        id: PageId,
        key: &[u8],
        entry: &mut DelEntry,
        stack: &mut LatchStack,
    ) -> KvResult {
        if height == 1 {
            return self.del_leaf(id, key, entry, stack);
        }

        let node = self.inners.get(id, &self.ctx);
        let inner = self.write_inner(&node)?;
        if self.safe_to_del(inner.size()) {
            // losing one separator cannot underflow this node
            stack.clear();
        }
        let mut child_entry = DelEntry::default();
        let (child, pos) = inner.route_for_delete(key, &mut child_entry);
        let my_idx = stack.len();
        stack.push(Latch::Inner(id, inner));

        self.del_rec(height - 1, child, key, &mut child_entry, stack)?;

        if child_entry.update {
            let (stacked_id, inner) = stack
                .inner_at(my_idx)
                .expect("latch stack intact while a borrow propagates");
            debug_assert_eq!(stacked_id, id);
            inner.update_key_at(&self.ctx.freelist, pos, &child_entry.key)?;
            inner.write(&self.ctx.pool)?;
        } else if child_entry.del {
            let (stacked_id, inner) = stack
                .inner_at(my_idx)
                .expect("latch stack intact while a merge propagates");
            debug_assert_eq!(stacked_id, id);
            inner.del_at(pos);
            self.rebalance_inner(id, inner, entry)?;
        }
        Ok(())
    }

    fn del_leaf(
        &self,
        id: PageId,
        key: &[u8],
        entry: &mut DelEntry,
        stack: &mut LatchStack,
    ) -> KvResult {
        let node = self.leaves.get(id, &self.ctx);
        let mut leaf = self.write_leaf(&node)?;

        // the optimistic latch was dropped in between, re-check presence
        if !leaf.find(key) {
            return Err(KvError::key_not_found(key));
        }

        if self.safe_to_del(leaf.size()) {
            stack.clear();
            leaf.del(key);
            leaf.write(&self.ctx.pool)?;
            return Ok(());
        }

        leaf.del(key);

        // the right-most child of a parent has no delim to rotate through,
        // and the right-most leaf of the level has nobody to pull from
        if entry.last || leaf.next() == 0 {
            leaf.write(&self.ctx.pool)?;
            return Ok(());
        }

        let sibling_id = leaf.next();
        let sibling_node = self.leaves.get(sibling_id, &self.ctx);
        let mut sibling = self.write_leaf(&sibling_node)?;

        if self.has_more(sibling.size()) {
            debug!("leaf node {} borrows from {}", id, sibling_id);
            entry.key = leaf.borrow_from(&self.ctx.freelist, &mut sibling)?;
            entry.update = true;
            sibling.write(&self.ctx.pool)?;
            leaf.write(&self.ctx.pool)?;
            return Ok(());
        }

        debug!("leaf node {} merges with {}", id, sibling_id);
        leaf.merge_from(&self.ctx.freelist, &sibling)?;
        leaf.set_next(sibling.next());
        entry.del = true;
        sibling.free(&self.ctx.freelist, &self.ctx.pool)?;
        drop(sibling);
        self.leaves.del(sibling_id);
        leaf.write(&self.ctx.pool)
    }

    /// Inner-node handling on the way up, symmetric to the leaf case and
    /// joined through the parent-provided delim.
    fn rebalance_inner(
        &self,
        id: PageId,
        inner: &mut BTreeInternalPage,
        entry: &mut DelEntry,
    ) -> KvResult {
        if !self.if_merge(inner.size()) || entry.last || inner.next() == 0 {
            return inner.write(&self.ctx.pool);
        }

        let sibling_id = inner.next();
        let sibling_node = self.inners.get(sibling_id, &self.ctx);
        let mut sibling = self.write_inner(&sibling_node)?;

        if self.has_more(sibling.size()) {
            debug!("inner node {} borrows from {}", id, sibling_id);
            entry.key = inner.borrow_from(&self.ctx.freelist, &mut sibling, &entry.delim)?;
            entry.update = true;
            sibling.write(&self.ctx.pool)?;
            return inner.write(&self.ctx.pool);
        }

        debug!("inner node {} merges with {}", id, sibling_id);
        inner.merge_from(&self.ctx.freelist, &sibling, &entry.delim)?;
        inner.set_next(sibling.next());
        entry.del = true;
        sibling.free(&self.ctx.freelist, &self.ctx.pool)?;
        drop(sibling);
        self.inners.del(sibling_id);
        inner.write(&self.ctx.pool)
    }
}
