use log::warn;

use super::header::{
    PageHeader, OFF_BYTES, OFF_CHECKSUM, OFF_HDRPAGES, OFF_NEXT, OFF_OVERFLOW, OFF_REALPAGES,
    OFF_SIZE,
};
use super::{get_u32, put_u32};
use crate::{
    btree::{buffer_pool::BufferPool, byte2page, freelist::Freelist},
    error::KvError,
    io::{Decodeable, Encodeable},
    types::{KvResult, PageId},
};

/// A logical page: one contiguous in-memory image whose on-disk storage may
/// be split between the primary extent `[id, id + hdrpages)` and an
/// overflow extent starting at `overflow`. Node code sees a flat byte
/// buffer; all disk traffic goes through the page cache.
pub struct VirtualPage {
    id: PageId,
    page_size: u32,
    /// Pages currently materialized in `data`. May trail `realpages` when
    /// content shrank in a previous life of this page.
    data_pgs: u32,
    data: Vec<u8>,
}

impl VirtualPage {
    /// A fresh, zeroed logical page of `data_pgs` pages. The caller
    /// installs the header before use.
    pub fn new(id: PageId, page_size: u32, data_pgs: u32) -> VirtualPage {
        assert!(id > 0);
        assert!(data_pgs > 0);
        VirtualPage {
            id,
            page_size,
            data_pgs,
            data: vec![0u8; (data_pgs * page_size) as usize],
        }
    }

    /// Materialize the logical page: read the first primary page, size the
    /// buffer from the header, then pull in the remaining primary pages and
    /// the overflow extent.
    pub fn read(id: PageId, page_size: u32, pool: &BufferPool) -> Result<VirtualPage, KvError> {
        assert!(id > 0);
        let ps = page_size as usize;

        let mut data = vec![0u8; ps];
        pool.read(id, &mut data)?;

        let bytes = get_u32(&data, OFF_BYTES);
        let hdrpages = get_u32(&data, OFF_HDRPAGES);
        let overflow = get_u32(&data, OFF_OVERFLOW);

        let data_pgs = byte2page(bytes, page_size).max(1);
        data.resize(data_pgs as usize * ps, 0);

        let mut remaining = data_pgs - 1;
        let primary = remaining.min(hdrpages.saturating_sub(1));
        for i in 0..primary {
            let off = (1 + i) as usize * ps;
            pool.read(id + 1 + i, &mut data[off..off + ps])?;
        }
        remaining -= primary;
        for i in 0..remaining {
            let off = (hdrpages + i) as usize * ps;
            pool.read(overflow + i, &mut data[off..off + ps])?;
        }

        let pg = VirtualPage {
            id,
            page_size,
            data_pgs,
            data,
        };
        let stored = pg.checksum();
        let computed = pg.compute_checksum();
        if stored != computed {
            warn!(
                "checksum mismatch on page {}: stored {:08x}, computed {:08x}",
                id, stored, computed
            );
        }
        Ok(pg)
    }

    /// True iff `extbytes` more content bytes would no longer fit in the
    /// materialized pages.
    pub fn overflow(&self, extbytes: u32) -> bool {
        self.bytes() + extbytes > self.data_pgs * self.page_size
    }

    /// Grow the logical page by the minimum number of pages that fit
    /// `extbytes` more bytes. When the growth exceeds the pages owned on
    /// disk, a larger overflow extent is taken from the freelist and the
    /// old one, if any, is returned to it.
    pub fn extend(&mut self, freelist: &Freelist, extbytes: u32) -> KvResult {
        let need = byte2page(self.bytes() + extbytes, self.page_size);
        if need <= self.data_pgs {
            return Ok(());
        }
        let extpages = need - self.data_pgs;
        self.data_pgs = need;

        if self.data_pgs > self.realpages() {
            let reslen = self.realpages() - self.hdrpages();
            let overflow = if self.overflow_page() == 0 {
                freelist.alloc(extpages)?
            } else {
                freelist.realloc(self.overflow_page(), reslen, reslen + extpages)?
            };
            self.set_overflow(overflow);
            self.set_realpages(self.realpages() + extpages);
        }

        self.data
            .resize((self.data_pgs * self.page_size) as usize, 0);
        Ok(())
    }

    /// Write the primary pages to `[id, id + hdrpages)` and the remainder
    /// to the overflow extent, all through the page cache.
    pub fn write(&mut self, pool: &BufferPool) -> KvResult {
        let checksum = self.compute_checksum();
        self.set_checksum(checksum);

        let ps = self.page_size as usize;
        let towrite = self.hdrpages().min(self.data_pgs);
        for i in 0..towrite {
            let off = i as usize * ps;
            pool.write(self.id + i, &self.data[off..off + ps])?;
        }
        let overflow = self.overflow_page();
        for i in 0..(self.data_pgs - towrite) {
            let off = (towrite + i) as usize * ps;
            pool.write(overflow + i, &self.data[off..off + ps])?;
        }
        Ok(())
    }

    /// Return both extents to the freelist and drop every covered page
    /// from the cache.
    pub fn free(self, freelist: &Freelist, pool: &BufferPool) -> KvResult {
        let hdrpages = self.hdrpages();
        let overflow = self.overflow_page();
        let reslen = self.realpages() - hdrpages;

        freelist.free(self.id, hdrpages)?;
        for p in self.id..self.id + hdrpages {
            pool.discard(p);
        }
        if overflow != 0 {
            freelist.free(overflow, reslen)?;
            for p in overflow..overflow + reslen {
                pool.discard(p);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // header accessors, all little-endian in-place

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn data_pgs(&self) -> u32 {
        self.data_pgs
    }

    pub fn bytes(&self) -> u32 {
        get_u32(&self.data, OFF_BYTES)
    }

    pub fn set_bytes(&mut self, v: u32) {
        put_u32(&mut self.data, OFF_BYTES, v);
    }

    pub fn size(&self) -> u32 {
        get_u32(&self.data, OFF_SIZE)
    }

    pub fn set_size(&mut self, v: u32) {
        put_u32(&mut self.data, OFF_SIZE, v);
    }

    pub fn next(&self) -> PageId {
        get_u32(&self.data, OFF_NEXT)
    }

    pub fn set_next(&mut self, v: PageId) {
        put_u32(&mut self.data, OFF_NEXT, v);
    }

    pub fn hdrpages(&self) -> u32 {
        get_u32(&self.data, OFF_HDRPAGES)
    }

    pub fn realpages(&self) -> u32 {
        get_u32(&self.data, OFF_REALPAGES)
    }

    pub fn set_realpages(&mut self, v: u32) {
        put_u32(&mut self.data, OFF_REALPAGES, v);
    }

    pub fn overflow_page(&self) -> PageId {
        get_u32(&self.data, OFF_OVERFLOW)
    }

    pub fn set_overflow(&mut self, v: PageId) {
        put_u32(&mut self.data, OFF_OVERFLOW, v);
    }

    pub fn checksum(&self) -> u32 {
        get_u32(&self.data, OFF_CHECKSUM)
    }

    fn set_checksum(&mut self, v: u32) {
        put_u32(&mut self.data, OFF_CHECKSUM, v);
    }

    pub fn header(&self) -> PageHeader {
        let mut reader = std::io::Cursor::new(&self.data[..]);
        PageHeader::decode_from(&mut reader)
    }

    pub fn set_header(&mut self, hdr: &PageHeader) {
        let encoded = hdr.encode();
        self.data[..encoded.len()].copy_from_slice(&encoded);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Grow the in-memory buffer only; disk bookkeeping is the caller's
    /// business. Used by the freelist when it extends its own page.
    pub(crate) fn grow_pages(&mut self, extpages: u32) {
        self.data_pgs += extpages;
        self.data
            .resize((self.data_pgs * self.page_size) as usize, 0);
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = (self.bytes() as usize).clamp(OFF_CHECKSUM + 4, self.data.len());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..OFF_CHECKSUM]);
        hasher.update(&self.data[OFF_CHECKSUM + 4..bytes]);
        hasher.finalize()
    }
}
