use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::Sender;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    btree::{
        buffer_pool::{start_flusher, BufferPool},
        freelist::Freelist,
        node::TreeContext,
        page::{get_u32, BTreeInternalPage, BTreeLeafPage, VirtualPage},
        tree::{tree::RootSink, Bptree},
    },
    bucket::{Bucket, BucketMeta},
    error::KvError,
    io::{ByteWriter, DbFile, Decodeable},
    types::{lexicographic, Comparator, KvResult, PageId},
};

const FREELIST_ROOT: PageId = 1;
const BUCKET_DIR_ROOT: PageId = 2;
const BUCKET_DIR_NAME: &str = "__bucket_dir__";
const BUCKET_DIR_ORDER: u32 = 96;
const DEFAULT_BUCKET_ORDER: u32 = 128;
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Size of the encoded `FileMeta` on page 0, checksum included.
const FILE_META_SIZE: usize = 12 + crate::bucket::BUCKET_META_SIZE + 4;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub page_size: u32,
    pub max_buffer_pages: u32,
    /// When set, every file write is followed by a data sync.
    pub sync: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            page_size: 4096,
            max_buffer_pages: 8192,
            sync: false,
        }
    }
}

/// Page 0 of the file: the database-level settings plus the inline
/// metadata of the bucket directory tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FileMeta {
    pub page_size: u32,
    pub max_buffer_pages: u32,
    pub freelist_root: PageId,
    pub bucket_dir_meta: BucketMeta,
}

impl FileMeta {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.page_size);
        writer.write(&self.max_buffer_pages);
        writer.write(&self.freelist_root);
        writer.write(&self.bucket_dir_meta);
        let checksum = crc32fast::hash(&writer.to_bytes());
        writer.write(&checksum);
        writer.to_bytes()
    }

    fn from_bytes(buf: &[u8]) -> Result<FileMeta, KvError> {
        let stored = get_u32(buf, FILE_META_SIZE - 4);
        if crc32fast::hash(&buf[..FILE_META_SIZE - 4]) != stored {
            return Err(KvError::open_failed("file meta checksum mismatch"));
        }
        let mut reader = std::io::Cursor::new(buf);
        Ok(FileMeta {
            page_size: u32::decode_from(&mut reader),
            max_buffer_pages: u32::decode_from(&mut reader),
            freelist_root: u32::decode_from(&mut reader),
            bucket_dir_meta: BucketMeta::decode_from(&mut reader),
        })
    }
}

/// Owner of the persisted file meta. The bucket directory reports its root
/// changes here; every update rewrites page 0 immediately.
pub(crate) struct MetaStore {
    file: Arc<DbFile>,
    meta: Mutex<FileMeta>,
}

impl MetaStore {
    pub(crate) fn update_dir_root(&self, root: PageId, height: u32) -> KvResult {
        let mut meta = self.meta.lock();
        meta.bucket_dir_meta.root = root;
        meta.bucket_dir_meta.height = height;
        self.file.write_at(&meta.to_bytes(), 0)
    }
}

/// The database: opens or creates the single backing file, owns the shared
/// page layer and the bucket directory, and vends bucket handles.
///
/// Dropping the database stops the background flusher, which writes all
/// remaining dirty pages on its way out.
pub struct Database {
    pool: Arc<BufferPool>,
    freelist: Arc<Freelist>,
    dir: Arc<Bptree>,
    /// Live bucket trees by name; handles to one bucket share one tree so
    /// they also share its latches.
    buckets: Mutex<HashMap<String, Arc<Bptree>>>,
    page_size: u32,
    flusher: Option<(Sender<()>, JoinHandle<()>)>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open the database at `path`, creating it when missing and
    /// `create_if_missing` is set. The stored page size and buffer budget
    /// win over `options` for an existing file.
    pub fn open<P: AsRef<Path>>(
        path: P,
        create_if_missing: bool,
        options: Options,
    ) -> Result<Database, KvError> {
        let path = path.as_ref();
        if !path.exists() {
            if create_if_missing {
                return Self::create(path, options);
            }
            return Err(KvError::open_failed(&format!(
                "no such database file: {}",
                path.display()
            )));
        }

        let file = Arc::new(
            DbFile::open(path, false, options.sync)
                .map_err(|e| KvError::open_failed(&e.to_string()))?,
        );

        let mut buf = vec![0u8; FILE_META_SIZE];
        file.read_at(&mut buf, 0)?;
        let meta = FileMeta::from_bytes(&buf)?;

        let pool = BufferPool::new(
            file.clone(),
            meta.page_size as usize,
            meta.max_buffer_pages as usize,
        );
        info!(
            "database opened: {}, page_size {}, max_buffer_pages {}",
            path.display(),
            meta.page_size,
            meta.max_buffer_pages
        );
        Self::assemble(file, pool, meta)
    }

    fn create(path: &Path, options: Options) -> Result<Database, KvError> {
        let file = Arc::new(
            DbFile::open(path, true, options.sync)
                .map_err(|e| KvError::create_failed(&e.to_string()))?,
        );

        let meta = FileMeta {
            page_size: options.page_size,
            max_buffer_pages: options.max_buffer_pages,
            freelist_root: FREELIST_ROOT,
            bucket_dir_meta: BucketMeta {
                root: BUCKET_DIR_ROOT,
                first_leaf: BUCKET_DIR_ROOT,
                height: 1,
                order: BUCKET_DIR_ORDER,
            },
        };
        file.write_at(&meta.to_bytes(), 0)?;

        let pool = BufferPool::new(
            file.clone(),
            meta.page_size as usize,
            meta.max_buffer_pages as usize,
        );
        // pages 0..=2 are spoken for, the allocation cursor starts behind
        // them
        Freelist::new_on_disk(FREELIST_ROOT, &pool, meta.page_size, BUCKET_DIR_ROOT + 1)?;
        BTreeLeafPage::new_on_disk(BUCKET_DIR_ROOT, &pool, meta.page_size)?;

        info!("database created: {}", path.display());
        Self::assemble(file, pool, meta)
    }

    fn assemble(
        file: Arc<DbFile>,
        pool: Arc<BufferPool>,
        meta: FileMeta,
    ) -> Result<Database, KvError> {
        let page_size = meta.page_size;
        let freelist = Arc::new(Freelist::open(meta.freelist_root, page_size, pool.clone())?);
        let meta_store = Arc::new(MetaStore {
            file,
            meta: Mutex::new(meta),
        });

        let dir = Arc::new(Bptree::new(
            BUCKET_DIR_NAME,
            meta.bucket_dir_meta,
            TreeContext {
                page_size,
                pool: pool.clone(),
                freelist: freelist.clone(),
                cmp: lexicographic(),
            },
            RootSink::Meta(meta_store),
        ));

        let flusher = start_flusher(pool.clone(), FLUSH_INTERVAL);

        Ok(Database {
            pool,
            freelist,
            dir,
            buckets: Mutex::new(HashMap::new()),
            page_size,
            flusher: Some(flusher),
        })
    }

    /// Create a bucket with the default order and key order, failing with
    /// `KeyRepeat` when the name is taken.
    pub fn create_bucket(&self, name: &str) -> Result<Bucket, KvError> {
        self.create_bucket_with(name, DEFAULT_BUCKET_ORDER, lexicographic())
    }

    pub fn create_bucket_with(
        &self,
        name: &str,
        order: u32,
        cmp: Comparator,
    ) -> Result<Bucket, KvError> {
        let id = self.freelist.alloc(1)?;
        let meta = BucketMeta {
            root: id,
            first_leaf: id,
            height: 1,
            order,
        };

        if let Err(e) = self.dir.put(name.as_bytes(), &meta.to_bytes()) {
            // roll the page allocation back before surfacing the failure
            if let Err(undo) = self.freelist.free(id, 1) {
                warn!("rollback of bucket page {} failed: {}", id, undo);
            }
            return Err(e);
        }
        BTreeLeafPage::new_on_disk(id, &self.pool, self.page_size)?;

        Ok(self.install_bucket(name, meta, cmp))
    }

    /// Open a handle to an existing bucket, failing with `KeyNotFound`
    /// when absent.
    pub fn get_bucket(&self, name: &str) -> Result<Bucket, KvError> {
        self.get_bucket_with(name, lexicographic())
    }

    /// The comparator must match the one the bucket was created with; it
    /// is ignored when another handle to the bucket is already live.
    pub fn get_bucket_with(&self, name: &str, cmp: Comparator) -> Result<Bucket, KvError> {
        if let Some(tree) = self.buckets.lock().get(name) {
            return Ok(Bucket { tree: tree.clone() });
        }
        let val = self.dir.get(name.as_bytes())?;
        let meta = BucketMeta::from_bytes(&val);
        Ok(self.install_bucket(name, meta, cmp))
    }

    /// Drop a bucket: remove its directory record and return every page of
    /// its tree to the freelist. Must not race with live handles to the
    /// same bucket; coordination is the caller's business.
    pub fn delete_bucket(&self, name: &str) -> KvResult {
        let val = self.dir.get(name.as_bytes())?;
        let meta = BucketMeta::from_bytes(&val);

        self.dir.del(name.as_bytes())?;
        self.buckets.lock().remove(name);
        self.free_subtree(meta.height, meta.root)
    }

    /// Write every dirty page out now instead of waiting for the flusher.
    pub fn flush(&self) -> KvResult {
        self.pool.flush_all()
    }

    fn install_bucket(&self, name: &str, meta: BucketMeta, cmp: Comparator) -> Bucket {
        let mut buckets = self.buckets.lock();
        let tree = buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Bptree::new(
                    name,
                    meta,
                    TreeContext {
                        page_size: self.page_size,
                        pool: self.pool.clone(),
                        freelist: self.freelist.clone(),
                        cmp,
                    },
                    RootSink::Directory(self.dir.clone()),
                ))
            })
            .clone();
        Bucket { tree }
    }

    fn free_subtree(&self, height: u32, id: PageId) -> KvResult {
        let page = VirtualPage::read(id, self.page_size, &self.pool)?;
        if height > 1 {
            let mut inner = BTreeInternalPage::from_page(page, lexicographic());
            for child in inner.children() {
                self.free_subtree(height - 1, child)?;
            }
            inner.free(&self.freelist, &self.pool)
        } else {
            page.free(&self.freelist, &self.pool)
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some((stop, handle)) = self.flusher.take() {
            // dropping the sender wakes the flusher for one final pass
            drop(stop);
            let _ = handle.join();
        }
        debug!("database closed");
    }
}
