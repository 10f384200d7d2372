use std::cmp::Ordering;

use super::header::PageHeader;
use super::{get_u32, put_u32, VirtualPage, PAGE_HEADER_SIZE};
use crate::{
    btree::{buffer_pool::BufferPool, freelist::Freelist, node::DelEntry},
    error::KvError,
    types::{Comparator, KvResult, PageId},
};

/// Per-record prefix: `keylen: u32, child: u32`.
const ELEM_SIZE: usize = 8;

/// The left-most child pointer sits right after the page header.
const HEAD_OFFSET: usize = PAGE_HEADER_SIZE;

const DATA_START: usize = PAGE_HEADER_SIZE + 4;

/// Separator records `(key, child)` packed into one logical page, plus the
/// head child pointer. Every key of subtree(head) is smaller than the first
/// separator; the child of separator `i` holds keys in `[k_i, k_{i+1})`.
pub struct BTreeInternalPage {
    id: PageId,
    page_size: u32,
    cmp: Comparator,
    page: Option<VirtualPage>,
    slots: Vec<usize>,
}

impl BTreeInternalPage {
    pub fn raw(id: PageId, page_size: u32, cmp: Comparator) -> BTreeInternalPage {
        BTreeInternalPage {
            id,
            page_size,
            cmp,
            page: None,
            slots: Vec::new(),
        }
    }

    /// A fresh inner node with no head installed yet; `split_to` or `init`
    /// will install one.
    pub fn fresh(
        id: PageId,
        page_size: u32,
        pages: u32,
        next: PageId,
        cmp: Comparator,
    ) -> BTreeInternalPage {
        let mut pg = VirtualPage::new(id, page_size, pages);
        pg.set_header(&PageHeader::init(pages, next));
        BTreeInternalPage {
            id,
            page_size,
            cmp,
            page: Some(pg),
            slots: Vec::new(),
        }
    }

    pub fn from_page(page: VirtualPage, cmp: Comparator) -> BTreeInternalPage {
        let mut inner = BTreeInternalPage {
            id: page.id(),
            page_size: page.page_size(),
            cmp,
            page: Some(page),
            slots: Vec::new(),
        };
        inner.update_slots();
        inner
    }

    /// Format a brand-new root: head child plus one separator.
    pub fn new_on_disk(
        id: PageId,
        pool: &BufferPool,
        freelist: &Freelist,
        page_size: u32,
        cmp: Comparator,
        key: &[u8],
        child1: PageId,
        child2: PageId,
    ) -> KvResult {
        let mut inner = Self::fresh(id, page_size, 1, 0, cmp);
        inner.init(freelist, key, child1, child2)?;
        inner.write(pool)
    }

    pub fn is_loaded(&self) -> bool {
        self.page.is_some()
    }

    pub fn load(&mut self, pool: &BufferPool) -> KvResult {
        if self.page.is_none() {
            self.page = Some(VirtualPage::read(self.id, self.page_size, pool)?);
            self.update_slots();
        }
        Ok(())
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.pg().size()
    }

    pub fn bytes(&self) -> u32 {
        self.pg().bytes()
    }

    pub fn next(&self) -> PageId {
        self.pg().next()
    }

    pub fn set_next(&mut self, next: PageId) {
        self.pg_mut().set_next(next);
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn head(&self) -> PageId {
        get_u32(self.pg().data(), HEAD_OFFSET)
    }

    pub fn set_head(&mut self, child: PageId) {
        put_u32(self.pg_mut().data_mut(), HEAD_OFFSET, child);
    }

    pub fn elem_size(key: &[u8]) -> u32 {
        (ELEM_SIZE + key.len()) as u32
    }

    /// Install the head child and the first separator. Only valid on a
    /// fresh, empty node.
    pub fn init(
        &mut self,
        freelist: &Freelist,
        key: &[u8],
        child1: PageId,
        child2: PageId,
    ) -> KvResult {
        self.handle_overflow(freelist, 4 + Self::elem_size(key))?;
        self.install_head(child1);
        self.insert_record(DATA_START, key, child2);
        Ok(())
    }

    // ------------------------------------------------------------------
    // routing

    /// Route `key` with upper-bound search: descend into the child left of
    /// the first separator strictly greater than `key`, or the head child
    /// when every separator is greater. Returns `(child, pos)` where `pos`
    /// is the upper-bound index the parent uses for later `update_key_at`
    /// or `del_at` calls.
    pub fn route(&self, key: &[u8]) -> (PageId, u32) {
        let pos = self.upper_bound(key);
        if pos == 0 {
            return (self.head(), 0);
        }
        (self.child_at(pos - 1), pos as u32)
    }

    /// Like `route`, and additionally records the separator right of the
    /// routed child (`delim`) or the fact that the routed child is this
    /// node's right-most one (`last`).
    pub fn route_for_delete(&self, key: &[u8], entry: &mut DelEntry) -> (PageId, u32) {
        let pos = self.upper_bound(key);
        if pos == self.slots.len() {
            entry.last = true;
        } else {
            entry.delim = self.key_at(pos).to_vec();
        }
        if pos == 0 {
            return (self.head(), 0);
        }
        (self.child_at(pos - 1), pos as u32)
    }

    // ------------------------------------------------------------------
    // point operations

    /// Insert the separator `(key, child)` at `pos`, the position `route`
    /// reported when the split below was discovered.
    pub fn put_at(&mut self, freelist: &Freelist, pos: u32, key: &[u8], child: PageId) -> KvResult {
        self.handle_overflow(freelist, Self::elem_size(key))?;
        let pos = pos as usize;
        assert!(pos <= self.slots.len());
        let off = if pos == self.slots.len() {
            self.bytes() as usize
        } else {
            self.slots[pos]
        };
        self.insert_record(off, key, child);
        Ok(())
    }

    pub fn del_at(&mut self, pos: u32) {
        let pos = pos as usize;
        assert!(pos < self.slots.len());
        self.remove_record(self.slots[pos]);
    }

    pub fn update_key_at(&mut self, freelist: &Freelist, pos: u32, newkey: &[u8]) -> KvResult {
        self.handle_overflow(freelist, newkey.len() as u32)?;
        let pos = pos as usize;
        assert!(pos < self.slots.len());

        let off = self.slots[pos];
        let oldlen = get_u32(self.pg().data(), off) as usize;
        let delta = newkey.len() as i64 - oldlen as i64;
        let tail = off + ELEM_SIZE + oldlen;
        let end = self.bytes() as usize;

        let pg = self.pg_mut();
        let data = pg.data_mut();
        if delta != 0 {
            data.copy_within(tail..end, (tail as i64 + delta) as usize);
        }
        put_u32(data, off, newkey.len() as u32);
        data[off + ELEM_SIZE..off + ELEM_SIZE + newkey.len()].copy_from_slice(newkey);
        pg.set_bytes((end as i64 + delta) as u32);
        self.update_slots();
        Ok(())
    }

    // ------------------------------------------------------------------
    // structural operations

    /// Move the last `floor(size / 2)` separators into `other`. The
    /// separator just before the split point is removed from this node and
    /// returned for promotion; its child becomes `other`'s head.
    pub fn split_to(&mut self, other: &mut BTreeInternalPage) -> Vec<u8> {
        let size = self.slots.len();
        let pos = size - size / 2;

        let sep = self.key_at(pos - 1).to_vec();
        let promoted_child = self.child_at(pos - 1);

        let off = self.slots[pos];
        let end = self.bytes() as usize;
        let moved = (size - pos) as u32;

        other.install_head(promoted_child);
        other.append_raw(&self.pg().data()[off..end], moved);

        let new_end = self.slots[pos - 1];
        let pg = self.pg_mut();
        pg.set_bytes(new_end as u32);
        pg.set_size((pos - 1) as u32);
        self.update_slots();
        sep
    }

    /// Append the right sibling behind `delim`: the delim separator is
    /// paired with the sibling's head, then the sibling's records follow.
    pub fn merge_from(
        &mut self,
        freelist: &Freelist,
        other: &BTreeInternalPage,
        delim: &[u8],
    ) -> KvResult {
        let content = other.bytes() as usize - DATA_START;
        self.handle_overflow(freelist, Self::elem_size(delim) + content as u32)?;

        let end = self.bytes() as usize;
        self.insert_record(end, delim, other.head());
        let raw = other.pg().data()[DATA_START..other.bytes() as usize].to_vec();
        self.append_raw(&raw, other.size());
        Ok(())
    }

    /// Take one child from the right sibling: `delim` comes down from the
    /// parent paired with the sibling's head, the sibling's first separator
    /// is promoted as the new delim and its child becomes the new head.
    pub fn borrow_from(
        &mut self,
        freelist: &Freelist,
        other: &mut BTreeInternalPage,
        delim: &[u8],
    ) -> Result<Vec<u8>, KvError> {
        let promoted = other.key_at(0).to_vec();
        self.handle_overflow(freelist, Self::elem_size(delim))?;

        let end = self.bytes() as usize;
        self.insert_record(end, delim, other.head());
        other.set_head(other.child_at(0));
        let first = other.slots[0];
        other.remove_record(first);
        Ok(promoted)
    }

    // ------------------------------------------------------------------

    pub fn key_at(&self, pos: usize) -> &[u8] {
        let off = self.slots[pos];
        let keylen = get_u32(self.pg().data(), off) as usize;
        &self.pg().data()[off + ELEM_SIZE..off + ELEM_SIZE + keylen]
    }

    pub fn child_at(&self, pos: usize) -> PageId {
        get_u32(self.pg().data(), self.slots[pos] + 4)
    }

    /// Head child followed by every separator child, left to right.
    pub fn children(&self) -> Vec<PageId> {
        let mut out = Vec::with_capacity(self.slots.len() + 1);
        out.push(self.head());
        for i in 0..self.slots.len() {
            out.push(self.child_at(i));
        }
        out
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        (0..self.slots.len()).map(|i| self.key_at(i).to_vec()).collect()
    }

    pub fn write(&mut self, pool: &BufferPool) -> KvResult {
        self.page.as_mut().unwrap().write(pool)
    }

    pub fn free(&mut self, freelist: &Freelist, pool: &BufferPool) -> KvResult {
        self.slots.clear();
        match self.page.take() {
            Some(pg) => pg.free(freelist, pool),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------

    fn pg(&self) -> &VirtualPage {
        self.page.as_ref().unwrap()
    }

    fn pg_mut(&mut self) -> &mut VirtualPage {
        self.page.as_mut().unwrap()
    }

    fn upper_bound(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if (self.cmp)(self.key_at(mid), key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    fn handle_overflow(&mut self, freelist: &Freelist, extbytes: u32) -> KvResult {
        if self.pg().overflow(extbytes) {
            self.pg_mut().extend(freelist, extbytes)?;
        }
        Ok(())
    }

    /// Claim the 4 head bytes on a node that has none yet.
    fn install_head(&mut self, child: PageId) {
        let bytes = self.bytes();
        debug_assert_eq!(bytes as usize, PAGE_HEADER_SIZE);
        self.pg_mut().set_bytes(bytes + 4);
        self.set_head(child);
    }

    fn insert_record(&mut self, off: usize, key: &[u8], child: PageId) {
        let esize = ELEM_SIZE + key.len();
        let end = self.bytes() as usize;
        let pg = self.pg_mut();
        let data = pg.data_mut();
        data.copy_within(off..end, off + esize);
        put_u32(data, off, key.len() as u32);
        put_u32(data, off + 4, child);
        data[off + ELEM_SIZE..off + ELEM_SIZE + key.len()].copy_from_slice(key);
        pg.set_bytes((end + esize) as u32);
        pg.set_size(pg.size() + 1);
        self.update_slots();
    }

    fn remove_record(&mut self, off: usize) {
        let keylen = get_u32(self.pg().data(), off) as usize;
        let esize = ELEM_SIZE + keylen;
        let end = self.bytes() as usize;
        let pg = self.pg_mut();
        pg.data_mut().copy_within(off + esize..end, off);
        pg.set_bytes((end - esize) as u32);
        pg.set_size(pg.size() - 1);
        self.update_slots();
    }

    fn append_raw(&mut self, raw: &[u8], count: u32) {
        debug_assert!(!self.pg().overflow(raw.len() as u32));
        let end = self.bytes() as usize;
        let pg = self.pg_mut();
        pg.data_mut()[end..end + raw.len()].copy_from_slice(raw);
        pg.set_bytes((end + raw.len()) as u32);
        pg.set_size(pg.size() + count);
        self.update_slots();
    }

    fn update_slots(&mut self) {
        self.slots.clear();
        let pg = self.page.as_ref().unwrap();
        let data = pg.data();
        let mut off = DATA_START;
        for _ in 0..pg.size() {
            self.slots.push(off);
            let keylen = get_u32(data, off) as usize;
            off += ELEM_SIZE + keylen;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{btree::buffer_pool::BufferPool, io::DbFile, types::lexicographic};

    const PS: u32 = 256;

    fn harness() -> (tempfile::TempDir, Arc<BufferPool>, Freelist) {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(DbFile::open(dir.path().join("inner.db"), true, false).unwrap());
        let pool = BufferPool::new(file, PS as usize, 64);
        Freelist::new_on_disk(1, &pool, PS, 64).unwrap();
        let freelist = Freelist::open(1, PS, pool.clone()).unwrap();
        (dir, pool, freelist)
    }

    /// head -> 10, "f" -> 11, "m" -> 12, "t" -> 13
    fn sample(fl: &Freelist) -> BTreeInternalPage {
        let mut node = BTreeInternalPage::fresh(2, PS, 1, 0, lexicographic());
        node.init(fl, b"f", 10, 11).unwrap();
        node.put_at(fl, 1, b"m", 12).unwrap();
        node.put_at(fl, 2, b"t", 13).unwrap();
        node
    }

    #[test]
    fn test_route_upper_bound() {
        let (_dir, _pool, fl) = harness();
        let node = sample(&fl);

        assert_eq!(node.route(b"a"), (10, 0));
        // a key equal to a separator belongs to that separator's child
        assert_eq!(node.route(b"f"), (11, 1));
        assert_eq!(node.route(b"g"), (11, 1));
        assert_eq!(node.route(b"m"), (12, 2));
        assert_eq!(node.route(b"z"), (13, 3));
    }

    #[test]
    fn test_route_for_delete_records_delim() {
        let (_dir, _pool, fl) = harness();
        let node = sample(&fl);

        let mut entry = DelEntry::default();
        assert_eq!(node.route_for_delete(b"g", &mut entry), (11, 1));
        assert!(!entry.last);
        assert_eq!(entry.delim, b"m".to_vec());

        let mut entry = DelEntry::default();
        assert_eq!(node.route_for_delete(b"z", &mut entry), (13, 3));
        assert!(entry.last);
    }

    #[test]
    fn test_bytes_bookkeeping() {
        let (_dir, _pool, fl) = harness();
        let node = sample(&fl);

        let expected: u32 = node
            .keys()
            .iter()
            .map(|k| BTreeInternalPage::elem_size(k))
            .sum();
        assert_eq!(node.bytes(), PAGE_HEADER_SIZE as u32 + 4 + expected);

        assert_eq!(node.children(), vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_split_promotes_middle_key() {
        let (_dir, _pool, fl) = harness();
        let mut node = sample(&fl);
        node.put_at(&fl, 3, b"x", 14).unwrap();
        // separators: f m t x, children: 10 11 12 13 14

        let mut sibling = BTreeInternalPage::fresh(3, PS, 1, 0, lexicographic());
        let sep = node.split_to(&mut sibling);

        // 4 separators: "m" is promoted, "t" and "x" move right
        assert_eq!(sep, b"m".to_vec());
        assert_eq!(node.keys(), vec![b"f".to_vec()]);
        assert_eq!(node.children(), vec![10, 11]);
        assert_eq!(sibling.head(), 12);
        assert_eq!(sibling.keys(), vec![b"t".to_vec(), b"x".to_vec()]);
        assert_eq!(sibling.children(), vec![12, 13, 14]);
    }

    #[test]
    fn test_borrow_rotates_through_delim() {
        let (_dir, _pool, fl) = harness();
        let mut left = BTreeInternalPage::fresh(2, PS, 1, 0, lexicographic());
        left.init(&fl, b"b", 10, 11).unwrap();

        let mut right = BTreeInternalPage::fresh(3, PS, 1, 0, lexicographic());
        right.init(&fl, b"p", 20, 21).unwrap();
        right.put_at(&fl, 1, b"s", 22).unwrap();

        // parent delim between the two nodes is "k"
        let promoted = left.borrow_from(&fl, &mut right, b"k").unwrap();

        assert_eq!(promoted, b"p".to_vec());
        assert_eq!(left.keys(), vec![b"b".to_vec(), b"k".to_vec()]);
        assert_eq!(left.children(), vec![10, 11, 20]);
        assert_eq!(right.head(), 21);
        assert_eq!(right.keys(), vec![b"s".to_vec()]);
    }

    #[test]
    fn test_merge_joins_through_delim() {
        let (_dir, _pool, fl) = harness();
        let mut left = BTreeInternalPage::fresh(2, PS, 1, 0, lexicographic());
        left.init(&fl, b"b", 10, 11).unwrap();

        let mut right = BTreeInternalPage::fresh(3, PS, 1, 0, lexicographic());
        right.init(&fl, b"p", 20, 21).unwrap();

        left.merge_from(&fl, &right, b"k").unwrap();

        assert_eq!(left.keys(), vec![b"b".to_vec(), b"k".to_vec(), b"p".to_vec()]);
        assert_eq!(left.children(), vec![10, 11, 20, 21]);
    }
}
