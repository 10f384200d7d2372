use log::debug;

use crate::{
    btree::{
        byte2page,
        node::{Latch, LatchStack, PutEntry},
        page::{BTreeInternalPage, BTreeLeafPage},
    },
    error::KvError,
    types::{KvResult, PageId},
};

use super::tree::Bptree;

/// insert-related methods
impl Bptree {
    /// Insert a new record; a duplicate key fails with `KeyRepeat` and
    /// mutates nothing.
    ///
    /// Two-phase: an optimistic read-crabbing pass that only takes the
    /// leaf latch exclusively, and a pessimistic exclusive descent when
    /// the leaf turned out full.
    pub fn put(&self, key: &[u8], val: &[u8]) -> KvResult {
        if self.try_put(key, val)? {
            return Ok(());
        }

        // leaf was full, restart from the root under exclusive latches
        let root_guard = self.root_latch.write_arc();
        let height = root_guard.height;
        let root = root_guard.root;
        let mut stack = LatchStack::new(height);
        stack.push(Latch::Root(root_guard));

        let entry = self.put_rec(height, root, key, val, &mut stack)?;

        if let Some(entry) = entry {
            // the root itself split; no node on the path was safe, so the
            // root latch is still held
            let newroot = self.ctx.freelist.alloc(1)?;
            BTreeInternalPage::new_on_disk(
                newroot,
                &self.ctx.pool,
                &self.ctx.freelist,
                self.ctx.page_size,
                self.ctx.cmp.clone(),
                &entry.key,
                root,
                entry.val,
            )?;

            let root_guard = stack.root_mut().expect("root latch held through root split");
            debug_assert_eq!(root_guard.root, root);
            root_guard.root = newroot;
            root_guard.height += 1;
            let height = root_guard.height;
            debug!(
                "tree {} root grows {} -> {}, height {}",
                self.name, root, newroot, height
            );
            self.update_root(newroot, height)?;
        }
        Ok(())
    }

    /// The optimistic shallow path. Returns Ok(false) when the leaf has no
    /// room and the pessimistic pass must run.
    fn try_put(&self, key: &[u8], val: &[u8]) -> Result<bool, KvError> {
        let (leaf_id, parent) = self.down(key)?;
        let node = self.leaves.get(leaf_id, &self.ctx);
        let mut leaf = self.write_leaf(&node)?;
        drop(parent);

        if leaf.find(key) {
            return Err(KvError::key_repeat(key));
        }
        if !self.safe_to_put(leaf.size()) {
            return Ok(false);
        }

        leaf.put(&self.ctx.freelist, key, val)?;
        leaf.write(&self.ctx.pool)?;
        Ok(true)
    }

    fn put_rec(
        &self,
        height: u32,
        id: PageId,
        key: &[u8],
        val: &[u8],
        stack: &mut LatchStack,
    ) -> Result<Option<PutEntry>, KvError> {
        if height == 1 {
            return self.put_leaf(id, key, val, stack);
        }

        let node = self.inners.get(id, &self.ctx);
        let inner = self.write_inner(&node)?;
        if self.safe_to_put(inner.size()) {
            // this node can absorb a promotion, every ancestor latch can go
            stack.clear();
        }
        let (child, pos) = inner.route(key);
        let my_idx = stack.len();
        stack.push(Latch::Inner(id, inner));

        let sub = self.put_rec(height - 1, child, key, val, stack)?;
        let Some(entry) = sub else {
            return Ok(None);
        };

        // the child split; our latch is still on the stack
        let (stacked_id, inner) = stack
            .inner_at(my_idx)
            .expect("latch stack intact while a split propagates");
        debug_assert_eq!(stacked_id, id);

        inner.put_at(&self.ctx.freelist, pos, &entry.key, entry.val)?;
        let result = if self.if_split(inner.size()) {
            debug!("inner node {} split", id);
            Some(self.split_inner(inner)?)
        } else {
            None
        };
        inner.write(&self.ctx.pool)?;
        Ok(result)
    }

    fn put_leaf(
        &self,
        id: PageId,
        key: &[u8],
        val: &[u8],
        stack: &mut LatchStack,
    ) -> Result<Option<PutEntry>, KvError> {
        let node = self.leaves.get(id, &self.ctx);
        let mut leaf = self.write_leaf(&node)?;

        // the optimistic latch was dropped in between, re-check presence
        if leaf.find(key) {
            return Err(KvError::key_repeat(key));
        }

        if self.safe_to_put(leaf.size()) {
            stack.clear();
            leaf.put(&self.ctx.freelist, key, val)?;
            leaf.write(&self.ctx.pool)?;
            return Ok(None);
        }

        leaf.put(&self.ctx.freelist, key, val)?;
        debug_assert!(self.if_split(leaf.size()));
        debug!("leaf node {} split", id);
        let entry = self.split_leaf(&mut leaf)?;
        leaf.write(&self.ctx.pool)?;
        Ok(Some(entry))
    }

    /// Carve the upper half of a full leaf into a fresh right sibling and
    /// hand the separator up.
    fn split_leaf(&self, leaf: &mut BTreeLeafPage) -> Result<PutEntry, KvError> {
        let pages = byte2page(leaf.bytes(), self.ctx.page_size);
        let newid = self.ctx.freelist.alloc(pages)?;

        let mut sibling = BTreeLeafPage::fresh(
            newid,
            self.ctx.page_size,
            pages,
            leaf.next(),
            self.ctx.cmp.clone(),
        );
        let sep = leaf.split_to(&mut sibling);
        leaf.set_next(newid);
        sibling.write(&self.ctx.pool)?;

        Ok(PutEntry { key: sep, val: newid })
    }

    fn split_inner(&self, inner: &mut BTreeInternalPage) -> Result<PutEntry, KvError> {
        let pages = byte2page(inner.bytes(), self.ctx.page_size);
        let newid = self.ctx.freelist.alloc(pages)?;

        let mut sibling = BTreeInternalPage::fresh(
            newid,
            self.ctx.page_size,
            pages,
            inner.next(),
            self.ctx.cmp.clone(),
        );
        let sep = inner.split_to(&mut sibling);
        inner.set_next(newid);
        sibling.write(&self.ctx.pool)?;

        Ok(PutEntry { key: sep, val: newid })
    }
}
