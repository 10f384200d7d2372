/*
End-to-end tests driving the public api: bucket operations, tree shape
under small orders, concurrency, reopen persistence, and freelist reuse
under bucket churn.
*/

mod concurrent_test;
mod structure_test;
mod validate;

use std::sync::Once;

use crate::{Database, Options};

static INIT: Once = Once::new();

pub(crate) fn setup() {
    INIT.call_once(crate::init_log);
}

pub(crate) fn new_db() -> (tempfile::TempDir, Database) {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("kv.db"), true, Options::default()).unwrap();
    (dir, db)
}

/// Collect every `(key, value)` a cursor yields, in order.
pub(crate) fn drain(mut iter: crate::BucketIter) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    while !iter.done() {
        out.push((iter.key().to_vec(), iter.val().to_vec()));
        iter.next();
    }
    out
}
