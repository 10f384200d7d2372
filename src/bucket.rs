use std::sync::Arc;

use bytes::Bytes;

use crate::{
    btree::tree::{Bptree, BucketIter},
    error::KvError,
    io::{ByteWriter, Decodeable, Encodeable},
    types::{KvResult, PageId},
};

/// Size of the encoded `BucketMeta`, 4 little-endian u32 fields.
pub const BUCKET_META_SIZE: usize = 16;

/// Per-bucket tree metadata, stored as the value of the bucket's record in
/// the bucket directory (and inline in the file meta for the directory
/// itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketMeta {
    pub root: PageId,
    pub first_leaf: PageId,
    pub height: u32,
    pub order: u32,
}

impl BucketMeta {
    pub fn from_bytes(buf: &[u8]) -> BucketMeta {
        let mut reader = std::io::Cursor::new(buf);
        Self::decode_from(&mut reader)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode()
    }
}

impl Encodeable for BucketMeta {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.root);
        writer.write(&self.first_leaf);
        writer.write(&self.height);
        writer.write(&self.order);
        writer.to_bytes()
    }
}

impl Decodeable for BucketMeta {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        BucketMeta {
            root: u32::decode_from(reader),
            first_leaf: u32::decode_from(reader),
            height: u32::decode_from(reader),
            order: u32::decode_from(reader),
        }
    }
}

/// A named, independent B+ tree inside the database. Handles are cheap to
/// clone and several handles to the same bucket may be used concurrently;
/// a handle stays usable for the lifetime of its database.
#[derive(Clone)]
pub struct Bucket {
    pub(crate) tree: Arc<Bptree>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").finish_non_exhaustive()
    }
}

impl Bucket {
    /// Look up `key`, failing with `KeyNotFound` when absent.
    pub fn get(&self, key: &[u8]) -> Result<Bytes, KvError> {
        self.tree.get(key)
    }

    /// Insert `key`, failing with `KeyRepeat` when it already exists.
    pub fn put(&self, key: &[u8], val: &[u8]) -> KvResult {
        self.tree.put(key, val)
    }

    /// Replace the value of `key`, failing with `KeyNotFound` when absent.
    pub fn update(&self, key: &[u8], val: &[u8]) -> KvResult {
        self.tree.update(key, val)
    }

    /// Delete `key`, failing with `KeyNotFound` when absent.
    pub fn del(&self, key: &[u8]) -> KvResult {
        self.tree.del(key)
    }

    /// In-order cursor over the whole bucket.
    pub fn begin(&self) -> BucketIter {
        BucketIter::begin(self.tree.clone())
    }

    /// Cursor positioned at the first record >= `key`.
    pub fn at(&self, key: &[u8]) -> BucketIter {
        BucketIter::at(self.tree.clone(), key)
    }

    #[cfg(test)]
    pub(crate) fn height(&self) -> u32 {
        self.tree.height()
    }
}
