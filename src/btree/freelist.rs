use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::{
    btree::{
        buffer_pool::BufferPool,
        byte2page,
        page::{header::PageHeader, get_u32, put_u32, VirtualPage, PAGE_HEADER_SIZE},
    },
    error::KvError,
    types::{KvResult, PageId},
};

/// Bytes of one `{pos, len}` extent record.
const EXTENT_SIZE: usize = 8;

/// The free-page allocator. Free extents are kept sorted by position and
/// maximally merged inside the allocator's own logical page (rooted at page
/// 1); the header's `next` field is the bump cursor, the lowest page id
/// never yet allocated.
///
/// The freelist page grows through the same overflow mechanism as any
/// other page, but growth pages are taken straight from the bump cursor so
/// `free` never re-enters `alloc`; a displaced overflow extent is folded
/// back in by a second-pass insert on the already-locked state.
pub struct Freelist {
    pool: Arc<BufferPool>,
    page: Mutex<VirtualPage>,
}

impl Freelist {
    pub fn new_on_disk(
        root: PageId,
        pool: &BufferPool,
        page_size: u32,
        first_unallocated: PageId,
    ) -> KvResult {
        let mut pg = VirtualPage::new(root, page_size, 1);
        pg.set_header(&PageHeader::init(1, first_unallocated));
        pg.write(pool)
    }

    pub fn open(root: PageId, page_size: u32, pool: Arc<BufferPool>) -> Result<Freelist, KvError> {
        let pg = VirtualPage::read(root, page_size, &pool)?;
        Ok(Freelist {
            pool,
            page: Mutex::new(pg),
        })
    }

    /// Hand out `len` contiguous pages: the first free extent that fits is
    /// shrunk or removed, and the bump cursor serves the rest.
    pub fn alloc(&self, len: u32) -> Result<PageId, KvError> {
        assert!(len > 0);
        let mut pg = self.page.lock();
        let id = Self::alloc_inner(&mut pg, len);
        pg.write(&self.pool)?;
        Ok(id)
    }

    /// Return `len` pages at `pos`, merging with the neighboring extents
    /// when they touch.
    pub fn free(&self, pos: PageId, len: u32) -> KvResult {
        let mut pg = self.page.lock();
        Self::free_inner(&mut pg, pos, len);
        pg.write(&self.pool)
    }

    pub fn realloc(&self, pos: PageId, len: u32, newlen: u32) -> Result<PageId, KvError> {
        assert!(len > 0);
        assert!(newlen > len);
        let mut pg = self.page.lock();
        Self::free_inner(&mut pg, pos, len);
        let id = Self::alloc_inner(&mut pg, newlen);
        pg.write(&self.pool)?;
        Ok(id)
    }

    // ------------------------------------------------------------------

    fn alloc_inner(pg: &mut VirtualPage, len: u32) -> PageId {
        let count = pg.size() as usize;
        for i in 0..count {
            let (pos, elen) = Self::extent_at(pg, i);
            if elen >= len {
                if elen == len {
                    Self::remove_extent(pg, i);
                } else {
                    Self::set_extent(pg, i, pos + len, elen - len);
                }
                return pos;
            }
        }
        let ret = pg.next();
        pg.set_next(ret + len);
        ret
    }

    fn free_inner(pg: &mut VirtualPage, pos: PageId, len: u32) {
        assert!(len > 0);
        let count = pg.size() as usize;

        // first extent at or after pos
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if Self::extent_at(pg, mid).0 < pos {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let idx = lo;
        if idx < count {
            debug_assert_ne!(Self::extent_at(pg, idx).0, pos);
        }

        let prev_adjacent = idx > 0 && {
            let (ppos, plen) = Self::extent_at(pg, idx - 1);
            ppos + plen == pos
        };
        let next_adjacent = idx < count && pos + len == Self::extent_at(pg, idx).0;

        if prev_adjacent && next_adjacent {
            let (ppos, plen) = Self::extent_at(pg, idx - 1);
            let (_, nlen) = Self::extent_at(pg, idx);
            Self::set_extent(pg, idx - 1, ppos, plen + len + nlen);
            Self::remove_extent(pg, idx);
        } else if prev_adjacent {
            let (ppos, plen) = Self::extent_at(pg, idx - 1);
            Self::set_extent(pg, idx - 1, ppos, plen + len);
        } else if next_adjacent {
            let (_, nlen) = Self::extent_at(pg, idx);
            Self::set_extent(pg, idx, pos, nlen + len);
        } else {
            Self::insert_extent(pg, idx, pos, len);
        }

        // keep room for the next insert; growth pages come straight from
        // the bump cursor, a displaced overflow extent is re-inserted
        if pg.overflow(EXTENT_SIZE as u32) {
            if let Some((dpos, dlen)) = Self::extend_self(pg, EXTENT_SIZE as u32) {
                Self::free_inner(pg, dpos, dlen);
            }
        }
    }

    /// The freelist's own flavor of `VirtualPage::extend`. Returns the
    /// displaced overflow extent, if one existed.
    fn extend_self(pg: &mut VirtualPage, extbytes: u32) -> Option<(PageId, u32)> {
        let need = byte2page(pg.bytes() + extbytes, pg.page_size());
        if need <= pg.data_pgs() {
            return None;
        }
        let extpages = need - pg.data_pgs();

        let mut displaced = None;
        if need > pg.realpages() {
            let reslen = pg.realpages() - pg.hdrpages();
            if pg.overflow_page() == 0 {
                pg.set_overflow(pg.next());
                pg.set_next(pg.next() + extpages);
            } else {
                displaced = Some((pg.overflow_page(), reslen));
                pg.set_overflow(pg.next());
                pg.set_next(pg.next() + reslen + extpages);
            }
            pg.set_realpages(pg.realpages() + extpages);
        }
        pg.grow_pages(extpages);
        debug!("freelist extends itself by {} pages", extpages);
        displaced
    }

    fn extent_at(pg: &VirtualPage, i: usize) -> (PageId, u32) {
        let off = PAGE_HEADER_SIZE + i * EXTENT_SIZE;
        (get_u32(pg.data(), off), get_u32(pg.data(), off + 4))
    }

    fn set_extent(pg: &mut VirtualPage, i: usize, pos: PageId, len: u32) {
        let off = PAGE_HEADER_SIZE + i * EXTENT_SIZE;
        put_u32(pg.data_mut(), off, pos);
        put_u32(pg.data_mut(), off + 4, len);
    }

    fn insert_extent(pg: &mut VirtualPage, i: usize, pos: PageId, len: u32) {
        let off = PAGE_HEADER_SIZE + i * EXTENT_SIZE;
        let end = pg.bytes() as usize;
        pg.data_mut().copy_within(off..end, off + EXTENT_SIZE);
        Self::set_extent(pg, i, pos, len);
        pg.set_bytes((end + EXTENT_SIZE) as u32);
        pg.set_size(pg.size() + 1);
    }

    fn remove_extent(pg: &mut VirtualPage, i: usize) {
        let off = PAGE_HEADER_SIZE + i * EXTENT_SIZE;
        let end = pg.bytes() as usize;
        pg.data_mut().copy_within(off + EXTENT_SIZE..end, off);
        pg.set_bytes((end - EXTENT_SIZE) as u32);
        pg.set_size(pg.size() - 1);
    }

    #[cfg(test)]
    pub(crate) fn extents(&self) -> Vec<(PageId, u32)> {
        let pg = self.page.lock();
        (0..pg.size() as usize)
            .map(|i| Self::extent_at(&pg, i))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> PageId {
        self.page.lock().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::DbFile;

    fn harness(page_size: u32) -> (tempfile::TempDir, Arc<BufferPool>, Freelist) {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(DbFile::open(dir.path().join("fl.db"), true, false).unwrap());
        let pool = BufferPool::new(file, page_size as usize, 256);
        Freelist::new_on_disk(1, &pool, page_size, 2).unwrap();
        let freelist = Freelist::open(1, page_size, pool.clone()).unwrap();
        (dir, pool, freelist)
    }

    fn assert_well_formed(extents: &[(u32, u32)]) {
        for w in extents.windows(2) {
            let (apos, alen) = w[0];
            let (bpos, _) = w[1];
            assert!(apos + alen < bpos, "extents not disjoint or mergeable: {:?}", w);
        }
    }

    #[test]
    fn test_alloc_bumps_cursor() {
        let (_dir, _pool, fl) = harness(4096);

        assert_eq!(fl.alloc(1).unwrap(), 2);
        assert_eq!(fl.alloc(3).unwrap(), 3);
        assert_eq!(fl.alloc(1).unwrap(), 6);
        assert_eq!(fl.cursor(), 7);
    }

    #[test]
    fn test_free_merges_neighbors() {
        let (_dir, _pool, fl) = harness(4096);

        let _ = fl.alloc(10).unwrap(); // pages 2..12

        fl.free(4, 2).unwrap();
        fl.free(8, 2).unwrap();
        assert_eq!(fl.extents(), vec![(4, 2), (8, 2)]);

        // fills the hole, all three collapse into one extent
        fl.free(6, 2).unwrap();
        assert_eq!(fl.extents(), vec![(4, 6)]);

        // merge with predecessor only
        fl.free(10, 1).unwrap();
        assert_eq!(fl.extents(), vec![(4, 7)]);

        // merge with successor only
        fl.free(3, 1).unwrap();
        assert_eq!(fl.extents(), vec![(3, 8)]);

        assert_well_formed(&fl.extents());
    }

    #[test]
    fn test_alloc_reuses_freed_extents() {
        let (_dir, _pool, fl) = harness(4096);

        let a = fl.alloc(4).unwrap();
        let _b = fl.alloc(4).unwrap();
        fl.free(a, 4).unwrap();

        // exact fit removes the extent
        assert_eq!(fl.alloc(4).unwrap(), a);
        assert!(fl.extents().is_empty());

        fl.free(a, 4).unwrap();
        // partial fit shrinks it in place
        assert_eq!(fl.alloc(1).unwrap(), a);
        assert_eq!(fl.extents(), vec![(a + 1, 3)]);
    }

    #[test]
    fn test_realloc_moves_extent() {
        let (_dir, _pool, fl) = harness(4096);

        let a = fl.alloc(2).unwrap();
        let moved = fl.realloc(a, 2, 5).unwrap();
        // the old pages are free again and the new extent is larger
        assert_ne!(moved, a);
        assert_eq!(fl.extents(), vec![(a, 2)]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(DbFile::open(dir.path().join("fl.db"), true, false).unwrap());
        let pool = BufferPool::new(file.clone(), 4096, 256);

        Freelist::new_on_disk(1, &pool, 4096, 2).unwrap();
        let (a, extents, cursor) = {
            let fl = Freelist::open(1, 4096, pool.clone()).unwrap();
            let a = fl.alloc(6).unwrap();
            fl.free(a + 1, 2).unwrap();
            (a, fl.extents(), fl.cursor())
        };
        pool.flush_all().unwrap();

        // a second pool simulates a fresh process
        let pool = BufferPool::new(file, 4096, 256);
        let fl = Freelist::open(1, 4096, pool).unwrap();
        assert_eq!(fl.extents(), extents);
        assert_eq!(fl.cursor(), cursor);
        assert_eq!(fl.alloc(2).unwrap(), a + 1);
    }

    #[test]
    fn test_self_extension_under_pressure() {
        // 64-byte pages keep only (64 - 28) / 8 = 4 extents per page, so a
        // burst of non-mergeable frees forces the freelist to grow itself.
        let (_dir, _pool, fl) = harness(64);

        let base = fl.alloc(64).unwrap();
        for i in 0..24 {
            fl.free(base + i * 2, 1).unwrap();
        }

        // the 24 singletons plus whatever overflow extents were displaced
        // while the freelist grew itself
        let extents = fl.extents();
        assert!(extents.len() >= 24);
        assert_well_formed(&extents);

        // the freed singletons are served back, lowest first
        assert_eq!(fl.alloc(1).unwrap(), base);
        assert_eq!(fl.alloc(1).unwrap(), base + 2);
    }
}
