use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, warn};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::{
    io::DbFile,
    types::{KvResult, PageId},
};

/// A single in-memory page image. The byte buffer is guarded by its own
/// latch; the dirty bit is toggled without holding it.
pub struct Page {
    id: PageId,
    buf: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

impl Page {
    fn new(id: PageId, buf: Vec<u8>, dirty: bool) -> Arc<Page> {
        Arc::new(Page {
            id,
            buf: RwLock::new(buf),
            dirty: AtomicBool::new(dirty),
        })
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the page image to disk if it is dirty. A concurrent writer
    /// racing with the flush leaves the dirty bit set and the page is
    /// simply written again on the next pass.
    fn flush_to(&self, file: &DbFile, page_size: usize) -> KvResult {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let buf = self.buf.read();
        file.write_at(&buf, self.id as u64 * page_size as u64)
    }
}

/// Bounded write-back cache from page id to page image with LRU eviction.
///
/// A read miss faults the page in from the file. A write updates the
/// in-memory image and sets the dirty bit; the data reaches disk when the
/// page is evicted, when the background flusher passes by, or on an
/// explicit `flush_all`.
pub struct BufferPool {
    cache: Mutex<LruCache<PageId, Arc<Page>>>,
    file: Arc<DbFile>,
    page_size: usize,
    max_pages: usize,
}

impl BufferPool {
    pub fn new(file: Arc<DbFile>, page_size: usize, max_pages: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(max_pages).unwrap())),
            file,
            page_size,
            max_pages,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Copy the current image of page `id` into `dest`, faulting it in
    /// from the file on a miss.
    pub fn read(&self, id: PageId, dest: &mut [u8]) -> KvResult {
        assert_eq!(dest.len(), self.page_size);

        let page = self.get_or_load(id)?;
        let buf = page.buf.read();
        dest.copy_from_slice(&buf);
        Ok(())
    }

    /// Replace the image of page `id` with `src` and mark it dirty.
    pub fn write(&self, id: PageId, src: &[u8]) -> KvResult {
        assert_eq!(src.len(), self.page_size);

        let hit = {
            let mut cache = self.cache.lock();
            cache.get(&id).cloned()
        };

        match hit {
            Some(page) => {
                let mut buf = page.buf.write();
                buf.copy_from_slice(src);
                page.dirty.store(true, Ordering::Release);
            }
            None => {
                let page = Page::new(id, src.to_vec(), true);
                let mut cache = self.cache.lock();
                self.insert_locked(&mut cache, id, page)?;
            }
        }
        Ok(())
    }

    /// Write every dirty page to disk.
    pub fn flush_all(&self) -> KvResult {
        let dirty: Vec<Arc<Page>> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(_, page)| page.dirty())
                .map(|(_, page)| page.clone())
                .collect()
        };

        for page in dirty {
            page.flush_to(&self.file, self.page_size)?;
        }
        Ok(())
    }

    /// Drop page `id` from the cache without flushing it. Used when the
    /// page has been returned to the freelist and its content is dead.
    pub fn discard(&self, id: PageId) {
        let mut cache = self.cache.lock();
        cache.pop(&id);
    }

    fn get_or_load(&self, id: PageId) -> Result<Arc<Page>, crate::error::KvError> {
        let mut cache = self.cache.lock();
        if let Some(page) = cache.get(&id) {
            return Ok(page.clone());
        }

        let mut buf = vec![0u8; self.page_size];
        self.file
            .read_at(&mut buf, id as u64 * self.page_size as u64)?;
        let page = Page::new(id, buf, false);
        self.insert_locked(&mut cache, id, page.clone())?;
        Ok(page)
    }

    /// Insert under the map latch, evicting the LRU tail first when the
    /// cache is full. A dirty victim is written out before it is dropped.
    fn insert_locked(
        &self,
        cache: &mut LruCache<PageId, Arc<Page>>,
        id: PageId,
        page: Arc<Page>,
    ) -> KvResult {
        if cache.len() >= self.max_pages {
            if let Some((victim_id, victim)) = cache.pop_lru() {
                debug!("page cache evicts page {}", victim_id);
                victim.flush_to(&self.file, self.page_size)?;
            }
        }
        cache.push(id, page);
        Ok(())
    }
}

/// Spawn the background flusher. It wakes on a fixed interval, flushes all
/// currently dirty pages, and performs one final flush when the sender side
/// of the returned channel is dropped.
pub(crate) fn start_flusher(
    pool: Arc<BufferPool>,
    interval: Duration,
) -> (Sender<()>, JoinHandle<()>) {
    let (stop_tx, stop_rx) = channel::bounded::<()>(1);

    let handle = std::thread::spawn(move || {
        debug!("page cache flusher started");
        loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = pool.flush_all() {
                        warn!("periodic flush failed: {}", e);
                    }
                }
                _ => break,
            }
        }
        if let Err(e) = pool.flush_all() {
            warn!("final flush failed: {}", e);
        }
        debug!("page cache flusher exited");
    });

    (stop_tx, handle)
}
