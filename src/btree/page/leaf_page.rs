use std::cmp::Ordering;

use bytes::Bytes;

use super::header::PageHeader;
use super::{get_u32, put_u32, VirtualPage, PAGE_HEADER_SIZE};
use crate::{
    btree::{buffer_pool::BufferPool, freelist::Freelist},
    error::KvError,
    types::{Comparator, KvResult, PageId},
};

/// Per-record prefix: `keylen: u32, vallen: u32`.
const ELEM_SIZE: usize = 8;

/// Where the packed record array starts.
const DATA_START: usize = PAGE_HEADER_SIZE;

/// Variable-length `(key, value)` records packed into one logical page,
/// ordered by key. `slots` is the in-memory index of record offsets,
/// rebuilt after every mutation; the page buffer itself is the single
/// source of truth.
pub struct BTreeLeafPage {
    id: PageId,
    page_size: u32,
    cmp: Comparator,
    page: Option<VirtualPage>,
    slots: Vec<usize>,
}

impl BTreeLeafPage {
    /// An unmaterialized leaf; `load` pulls the page in on first use.
    pub fn raw(id: PageId, page_size: u32, cmp: Comparator) -> BTreeLeafPage {
        BTreeLeafPage {
            id,
            page_size,
            cmp,
            page: None,
            slots: Vec::new(),
        }
    }

    /// A fresh, empty leaf spanning `pages` pages, not yet on disk.
    pub fn fresh(
        id: PageId,
        page_size: u32,
        pages: u32,
        next: PageId,
        cmp: Comparator,
    ) -> BTreeLeafPage {
        let mut pg = VirtualPage::new(id, page_size, pages);
        pg.set_header(&PageHeader::init(pages, next));
        BTreeLeafPage {
            id,
            page_size,
            cmp,
            page: Some(pg),
            slots: Vec::new(),
        }
    }

    /// Wrap an already-read page image.
    pub fn from_page(page: VirtualPage, cmp: Comparator) -> BTreeLeafPage {
        let mut leaf = BTreeLeafPage {
            id: page.id(),
            page_size: page.page_size(),
            cmp,
            page: Some(page),
            slots: Vec::new(),
        };
        leaf.update_slots();
        leaf
    }

    /// Format a brand-new empty leaf at `id`.
    pub fn new_on_disk(id: PageId, pool: &BufferPool, page_size: u32) -> KvResult {
        let mut pg = VirtualPage::new(id, page_size, 1);
        pg.set_header(&PageHeader::init(1, 0));
        pg.write(pool)
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

    pub fn elem_size(key: &[u8], val: &[u8]) -> u32 {
        (ELEM_SIZE + key.len() + val.len()) as u32
    }

    // ------------------------------------------------------------------
    // point operations

    pub fn find(&self, key: &[u8]) -> bool {
        self.search(key).is_ok()
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        match self.search(key) {
            Ok(pos) => Some(self.val_bytes(pos)),
            Err(_) => None,
        }
    }

    /// Insert a record the caller has verified to be absent. Grows the
    /// page first when the record does not fit.
    pub fn put(&mut self, freelist: &Freelist, key: &[u8], val: &[u8]) -> KvResult {
        self.handle_overflow(freelist, Self::elem_size(key, val))?;
        let pos = match self.search(key) {
            Ok(_) => unreachable!("duplicate key reached leaf put"),
            Err(pos) => pos,
        };
        let off = if pos == self.slots.len() {
            self.bytes() as usize
        } else {
            self.slots[pos]
        };
        self.insert_record(off, key, val);
        Ok(())
    }

    pub fn del(&mut self, key: &[u8]) -> bool {
        match self.search(key) {
            Ok(pos) => {
                self.remove_record(self.slots[pos]);
                true
            }
            Err(_) => false,
        }
    }

    /// Replace the value of an existing record, resizing it in place.
    pub fn update(&mut self, freelist: &Freelist, key: &[u8], val: &[u8]) -> Result<bool, KvError> {
        let pos = match self.search(key) {
            Ok(pos) => pos,
            Err(_) => return Ok(false),
        };

        let off = self.slots[pos];
        let keylen = get_u32(self.pg().data(), off) as usize;
        let old_vallen = get_u32(self.pg().data(), off + 4) as usize;
        let delta = val.len() as i64 - old_vallen as i64;
        if delta > 0 {
            self.handle_overflow(freelist, delta as u32)?;
        }

        let end = self.bytes() as usize;
        let tail = off + ELEM_SIZE + keylen + old_vallen;
        let pg = self.pg_mut();
        let data = pg.data_mut();
        if delta != 0 {
            data.copy_within(tail..end, (tail as i64 + delta) as usize);
        }
        put_u32(data, off + 4, val.len() as u32);
        let val_off = off + ELEM_SIZE + keylen;
        data[val_off..val_off + val.len()].copy_from_slice(val);
        pg.set_bytes((end as i64 + delta) as u32);
        self.update_slots();
        Ok(true)
    }

    // ------------------------------------------------------------------
    // structural operations

    /// Move the last `floor(size / 2)` records into `other` (an empty
    /// sibling with enough room) and return a copy of the first moved key,
    /// the separator promoted to the parent.
    pub fn split_to(&mut self, other: &mut BTreeLeafPage) -> Vec<u8> {
        let size = self.slots.len();
        let pos = size - size / 2;
        let sep = self.key_at(pos).to_vec();

        let off = self.slots[pos];
        let end = self.bytes() as usize;
        let moved = (size - pos) as u32;
        other.append_raw(&self.pg().data()[off..end], moved);

        let pg = self.pg_mut();
        pg.set_bytes(off as u32);
        pg.set_size(pos as u32);
        self.update_slots();
        sep
    }

    /// Append every record of the right sibling; the caller fixes the leaf
    /// chain and the parent.
    pub fn merge_from(&mut self, freelist: &Freelist, other: &BTreeLeafPage) -> KvResult {
        let content = other.bytes() as usize - DATA_START;
        self.handle_overflow(freelist, content as u32)?;
        let raw = other.pg().data()[DATA_START..other.bytes() as usize].to_vec();
        self.append_raw(&raw, other.size());
        Ok(())
    }

    /// Move one record from the right sibling's front to our back and
    /// return the sibling's new first key, the parent's new separator.
    pub fn borrow_from(
        &mut self,
        freelist: &Freelist,
        other: &mut BTreeLeafPage,
    ) -> Result<Vec<u8>, KvError> {
        let first = other.slots[0];
        let esize = other.record_size_at(first);
        self.handle_overflow(freelist, esize as u32)?;

        let raw = other.pg().data()[first..first + esize].to_vec();
        self.append_raw(&raw, 1);
        other.remove_record(first);
        Ok(other.key_at(0).to_vec())
    }

    // ------------------------------------------------------------------

    pub fn key_at(&self, pos: usize) -> &[u8] {
        let off = self.slots[pos];
        let keylen = get_u32(self.pg().data(), off) as usize;
        &self.pg().data()[off + ELEM_SIZE..off + ELEM_SIZE + keylen]
    }

    pub fn val_at(&self, pos: usize) -> &[u8] {
        let off = self.slots[pos];
        let keylen = get_u32(self.pg().data(), off) as usize;
        let vallen = get_u32(self.pg().data(), off + 4) as usize;
        let start = off + ELEM_SIZE + keylen;
        &self.pg().data()[start..start + vallen]
    }

    pub fn key_bytes(&self, pos: usize) -> Bytes {
        Bytes::copy_from_slice(self.key_at(pos))
    }

    pub fn val_bytes(&self, pos: usize) -> Bytes {
        Bytes::copy_from_slice(self.val_at(pos))
    }

    pub fn min_key(&self) -> Option<Vec<u8>> {
        self.slots.first().map(|_| self.key_at(0).to_vec())
    }

    pub fn max_key(&self) -> Option<Vec<u8>> {
        match self.slots.len() {
            0 => None,
            n => Some(self.key_at(n - 1).to_vec()),
        }
    }

    /// First position whose key is >= `key`; `size()` when all keys are
    /// smaller.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(pos) => pos,
            Err(pos) => pos,
        }
    }

    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..self.slots.len())
            .map(|i| (self.key_at(i).to_vec(), self.val_at(i).to_vec()))
            .collect()
    }

    pub fn write(&mut self, pool: &BufferPool) -> KvResult {
        self.page.as_mut().unwrap().write(pool)
    }

    /// Return the page to the freelist; the container becomes raw again.
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

    fn search(&self, key: &[u8]) -> Result<usize, usize> {
        let mut lo = 0;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match (self.cmp)(self.key_at(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok(mid),
                Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    fn handle_overflow(&mut self, freelist: &Freelist, extbytes: u32) -> KvResult {
        if self.pg().overflow(extbytes) {
            self.pg_mut().extend(freelist, extbytes)?;
        }
        Ok(())
    }

    fn record_size_at(&self, off: usize) -> usize {
        let keylen = get_u32(self.pg().data(), off) as usize;
        let vallen = get_u32(self.pg().data(), off + 4) as usize;
        ELEM_SIZE + keylen + vallen
    }

    fn insert_record(&mut self, off: usize, key: &[u8], val: &[u8]) {
        let esize = ELEM_SIZE + key.len() + val.len();
        let end = self.bytes() as usize;
        let pg = self.pg_mut();
        let data = pg.data_mut();
        data.copy_within(off..end, off + esize);
        put_u32(data, off, key.len() as u32);
        put_u32(data, off + 4, val.len() as u32);
        data[off + ELEM_SIZE..off + ELEM_SIZE + key.len()].copy_from_slice(key);
        let val_off = off + ELEM_SIZE + key.len();
        data[val_off..val_off + val.len()].copy_from_slice(val);
        pg.set_bytes((end + esize) as u32);
        pg.set_size(pg.size() + 1);
        self.update_slots();
    }

    fn remove_record(&mut self, off: usize) {
        let esize = self.record_size_at(off);
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
            let vallen = get_u32(data, off + 4) as usize;
            off += ELEM_SIZE + keylen + vallen;
        }
        debug_assert_eq!(off, pg.bytes() as usize);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{io::DbFile, types::lexicographic};

    const PS: u32 = 256;

    fn harness() -> (tempfile::TempDir, Arc<BufferPool>, Freelist) {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(DbFile::open(dir.path().join("leaf.db"), true, false).unwrap());
        let pool = BufferPool::new(file, PS as usize, 64);
        Freelist::new_on_disk(1, &pool, PS, 16).unwrap();
        let freelist = Freelist::open(1, PS, pool.clone()).unwrap();
        (dir, pool, freelist)
    }

    fn leaf(id: PageId) -> BTreeLeafPage {
        BTreeLeafPage::fresh(id, PS, 1, 0, lexicographic())
    }

    #[test]
    fn test_put_keeps_keys_sorted() {
        let (_dir, _pool, fl) = harness();
        let mut page = leaf(3);

        for key in ["d", "a", "c", "b"] {
            page.put(&fl, key.as_bytes(), b"v").unwrap();
        }

        assert_eq!(page.size(), 4);
        let keys: Vec<_> = page.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        // bytes is the exact packed size
        let expected: u32 = page
            .entries()
            .iter()
            .map(|(k, v)| BTreeLeafPage::elem_size(k, v))
            .sum();
        assert_eq!(page.bytes(), PAGE_HEADER_SIZE as u32 + expected);
    }

    #[test]
    fn test_get_del_round_trip() {
        let (_dir, _pool, fl) = harness();
        let mut page = leaf(3);

        page.put(&fl, b"k1", b"v1").unwrap();
        page.put(&fl, b"k2", b"v2").unwrap();

        assert_eq!(page.get(b"k1").unwrap(), Bytes::from_static(b"v1"));
        assert!(page.get(b"k3").is_none());

        assert!(page.del(b"k1"));
        assert!(!page.del(b"k1"));
        assert!(page.get(b"k1").is_none());
        assert_eq!(page.size(), 1);
    }

    #[test]
    fn test_update_resizes_value() {
        let (_dir, _pool, fl) = harness();
        let mut page = leaf(3);

        page.put(&fl, b"a", b"short").unwrap();
        page.put(&fl, b"b", b"tail").unwrap();

        assert!(page.update(&fl, b"a", b"a much longer value").unwrap());
        assert_eq!(page.get(b"a").unwrap(), Bytes::from_static(b"a much longer value"));
        // the record behind the resized one survives the shift
        assert_eq!(page.get(b"b").unwrap(), Bytes::from_static(b"tail"));

        assert!(page.update(&fl, b"a", b"x").unwrap());
        assert_eq!(page.get(b"a").unwrap(), Bytes::from_static(b"x"));
        assert!(!page.update(&fl, b"missing", b"x").unwrap());
    }

    #[test]
    fn test_split_moves_upper_half() {
        let (_dir, _pool, fl) = harness();
        let mut page = leaf(3);
        for i in 0..7u32 {
            page.put(&fl, format!("k{}", i).as_bytes(), b"v").unwrap();
        }

        let mut sibling = leaf(4);
        let sep = page.split_to(&mut sibling);

        // 7 records: 4 stay, floor(7 / 2) = 3 move
        assert_eq!(page.size(), 4);
        assert_eq!(sibling.size(), 3);
        assert_eq!(sep, b"k4".to_vec());
        assert_eq!(sibling.min_key().unwrap(), sep);
        assert!(page.max_key().unwrap() < sep);
    }

    #[test]
    fn test_borrow_and_merge() {
        let (_dir, _pool, fl) = harness();
        let mut left = leaf(3);
        let mut right = leaf(4);

        left.put(&fl, b"a", b"1").unwrap();
        right.put(&fl, b"m", b"2").unwrap();
        right.put(&fl, b"n", b"3").unwrap();
        right.put(&fl, b"o", b"4").unwrap();

        let delim = left.borrow_from(&fl, &mut right).unwrap();
        assert_eq!(delim, b"n".to_vec());
        assert_eq!(left.entries().last().unwrap().0, b"m".to_vec());
        assert_eq!(right.size(), 2);

        left.merge_from(&fl, &right).unwrap();
        assert_eq!(left.size(), 4);
        let keys: Vec<_> = left.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec(), b"n".to_vec(), b"o".to_vec()]);
    }

    #[test]
    fn test_oversized_record_grows_page() {
        let (_dir, _pool, fl) = harness();
        let mut page = leaf(3);

        let big = vec![0x5au8; 2 * PS as usize];
        page.put(&fl, b"big", &big).unwrap();
        assert_eq!(page.get(b"big").unwrap().len(), big.len());
        assert!(page.bytes() > PS);
    }
}
