use std::{collections::HashSet, sync::Arc, thread};

use rand::Rng;

use super::{drain, new_db, validate};

/// 10,000 random distinct keys inserted from 4 threads, each thread owning
/// a disjoint partition. Every thread works through its own handle to the
/// same bucket.
#[test]
fn test_parallel_disjoint_inserts() {
    let (_dir, db) = new_db();
    db.create_bucket("b").unwrap();
    let db = Arc::new(db);

    let mut rng = rand::thread_rng();
    let mut keys = HashSet::new();
    while keys.len() < 10_000 {
        keys.insert(rng.gen::<u64>());
    }
    let keys: Vec<u64> = keys.into_iter().collect();

    let mut workers = vec![];
    for t in 0..4 {
        let db = Arc::clone(&db);
        let partition: Vec<u64> = keys.iter().copied().skip(t).step_by(4).collect();

        let handle = thread::spawn(move || {
            let bucket = db.get_bucket("b").unwrap();
            for k in partition {
                let key = format!("{:016x}", k);
                bucket.put(key.as_bytes(), key.as_bytes()).unwrap();
            }
        });
        workers.push(handle);
    }
    for handle in workers {
        handle.join().unwrap();
    }

    let bucket = db.get_bucket("b").unwrap();
    let all = drain(bucket.begin());
    assert_eq!(all.len(), 10_000);

    for k in &keys {
        let key = format!("{:016x}", k);
        assert_eq!(&bucket.get(key.as_bytes()).unwrap()[..], key.as_bytes());
    }
    validate::check_integrity(&bucket);
}

/// Inserters feed a channel, deleters drain it, everyone hammers the same
/// tree. The surviving record count must come out exact.
#[test]
fn test_concurrent_insert_delete() {
    let (_dir, db) = new_db();
    db.create_bucket("b").unwrap();
    let db = Arc::new(db);

    let (sender, receiver) = crossbeam::channel::unbounded::<String>();

    let mut workers = vec![];
    for t in 0..4u64 {
        let db = Arc::clone(&db);
        let sender = sender.clone();
        workers.push(thread::spawn(move || {
            let bucket = db.get_bucket("b").unwrap();
            for i in 0..500u64 {
                let key = format!("{:03}-{:08}", t, i);
                bucket.put(key.as_bytes(), b"v").unwrap();
                sender.send(key).unwrap();
            }
        }));
    }
    for _ in 0..2 {
        let db = Arc::clone(&db);
        let receiver = receiver.clone();
        workers.push(thread::spawn(move || {
            let bucket = db.get_bucket("b").unwrap();
            for _ in 0..400 {
                let key = receiver.recv().unwrap();
                bucket.del(key.as_bytes()).unwrap();
            }
        }));
    }
    for handle in workers {
        handle.join().unwrap();
    }

    let bucket = db.get_bucket("b").unwrap();
    assert_eq!(drain(bucket.begin()).len(), 4 * 500 - 2 * 400);
    validate::check_integrity(&bucket);
}

/// Readers riding alongside writers never see torn records: every value
/// either matches its key or the key is reported absent.
#[test]
fn test_reads_during_writes() {
    let (_dir, db) = new_db();
    db.create_bucket("b").unwrap();
    let db = Arc::new(db);

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let bucket = db.get_bucket("b").unwrap();
            for i in 0..2_000u32 {
                let key = format!("{:06}", i);
                bucket.put(key.as_bytes(), key.as_bytes()).unwrap();
            }
        })
    };

    let mut readers = vec![];
    for _ in 0..3 {
        let db = Arc::clone(&db);
        readers.push(thread::spawn(move || {
            let bucket = db.get_bucket("b").unwrap();
            let mut rng = rand::thread_rng();
            for _ in 0..2_000 {
                let i: u32 = rng.gen_range(0, 2_000);
                let key = format!("{:06}", i);
                if let Ok(val) = bucket.get(key.as_bytes()) {
                    assert_eq!(&val[..], key.as_bytes());
                }
            }
        }));
    }

    writer.join().unwrap();
    for handle in readers {
        handle.join().unwrap();
    }

    let bucket = db.get_bucket("b").unwrap();
    assert_eq!(drain(bucket.begin()).len(), 2_000);
}
