use std::{cmp::Ordering, sync::Arc};

use parking_lot::RwLock;

use crate::error::KvError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type KvResult = Result<(), KvError>;

/// On-disk page ordinal. Page 0 holds the file meta, page 1 the freelist
/// root, pages >= 2 hold tree data.
pub type PageId = u32;

/// Total order over byte-string keys. Shared by bisection inside nodes and
/// by routing in inner nodes.
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// The default key order: plain lexicographic ascending.
pub fn lexicographic() -> Comparator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

pub(crate) type ArcReadGuard<T> =
    parking_lot::lock_api::ArcRwLockReadGuard<parking_lot::RawRwLock, T>;
pub(crate) type ArcWriteGuard<T> =
    parking_lot::lock_api::ArcRwLockWriteGuard<parking_lot::RawRwLock, T>;
