use itertools::assert_equal;

use crate::types::lexicographic;

use super::{drain, new_db, validate};

/// Keys "01".."16" with values equal to the keys, order 4.
fn two_digit(i: u32) -> Vec<u8> {
    format!("{:02}", i).into_bytes()
}

#[test]
fn test_order_four_tree_shape() {
    let (_dir, db) = new_db();
    let bucket = db.create_bucket_with("b", 4, lexicographic()).unwrap();

    for i in 1..=16 {
        bucket.put(&two_digit(i), &two_digit(i)).unwrap();
    }

    assert_eq!(bucket.height(), 2);

    let sizes = validate::leaf_sizes(&bucket);
    assert!(
        sizes.iter().all(|&s| (2..=4).contains(&s)),
        "leaf occupancy out of bounds: {:?}",
        sizes
    );

    assert_equal(
        drain(bucket.begin()).into_iter().map(|(k, _)| k),
        (1..=16).map(two_digit),
    );
    validate::check_integrity(&bucket);
}

#[test]
fn test_order_four_deletion_rebalances() {
    let (_dir, db) = new_db();
    let bucket = db.create_bucket_with("b", 4, lexicographic()).unwrap();

    for i in 1..=16 {
        bucket.put(&two_digit(i), &two_digit(i)).unwrap();
    }
    for i in 1..=4 {
        bucket.del(&two_digit(i)).unwrap();
    }

    let sizes = validate::leaf_sizes(&bucket);
    assert!(
        sizes.iter().all(|&s| s >= 2),
        "deletion left a leaf under half: {:?}",
        sizes
    );

    assert_equal(
        drain(bucket.begin()).into_iter().map(|(k, _)| k),
        (5..=16).map(two_digit),
    );
    validate::check_integrity(&bucket);
}

#[test]
fn test_root_grows_and_collapses() {
    let (_dir, db) = new_db();
    let bucket = db.create_bucket_with("b", 4, lexicographic()).unwrap();

    assert_eq!(bucket.height(), 1);

    for i in 1..=64 {
        bucket.put(&two_digit(i), &two_digit(i)).unwrap();
    }
    assert!(bucket.height() >= 3);
    validate::check_integrity(&bucket);

    for i in 1..=64 {
        bucket.del(&two_digit(i)).unwrap();
    }
    assert_eq!(bucket.height(), 1);
    assert!(bucket.begin().done());
    validate::check_integrity(&bucket);
}

#[test]
fn test_interleaved_insert_delete_keeps_shape() {
    let (_dir, db) = new_db();
    let bucket = db.create_bucket_with("b", 4, lexicographic()).unwrap();

    for round in 0..4u32 {
        for i in 1..=40 {
            let key = format!("{:02}-{:02}", i, round).into_bytes();
            bucket.put(&key, b"v").unwrap();
        }
        validate::check_integrity(&bucket);
        for i in (1..=40).step_by(2) {
            let key = format!("{:02}-{:02}", i, round).into_bytes();
            bucket.del(&key).unwrap();
        }
        validate::check_integrity(&bucket);
    }

    // every even key of every round is still there
    let remaining = drain(bucket.begin());
    assert_eq!(remaining.len(), 4 * 20);
}

#[test]
fn test_positioned_cursor_crosses_leaves() {
    let (_dir, db) = new_db();
    let bucket = db.create_bucket_with("b", 4, lexicographic()).unwrap();

    for i in 1..=16 {
        bucket.put(&two_digit(i), &two_digit(i)).unwrap();
    }

    // "03" sits at the tail of the first leaf; the cursor must keep
    // walking across the chain to the very end
    let tail: Vec<_> = drain(bucket.at(&two_digit(3)))
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_equal(tail, (3..=16).map(two_digit));

    // a key past the last record of a leaf but before the next leaf's
    // first record lands on the next leaf
    bucket.del(&two_digit(4)).unwrap();
    let from_gap: Vec<_> = drain(bucket.at(&two_digit(4)))
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_equal(from_gap, (5..=16).map(two_digit));
}

#[test]
fn test_odd_order_keeps_minimum_occupancy() {
    let (_dir, db) = new_db();
    let bucket = db.create_bucket_with("b", 5, lexicographic()).unwrap();

    for i in 1..=25 {
        bucket.put(&two_digit(i), &two_digit(i)).unwrap();
    }
    for i in 1..=5 {
        bucket.del(&two_digit(i)).unwrap();
    }

    // minimum occupancy rounds up: ceil(5 / 2) = 3, not 2. Only the
    // right-most leaf of the level is allowed to run lower.
    let sizes = validate::leaf_sizes(&bucket);
    assert!(
        sizes[..sizes.len() - 1].iter().all(|&s| s >= 3),
        "odd-order deletion left a leaf under half: {:?}",
        sizes
    );
    assert!(sizes.iter().all(|&s| s <= 5), "leaf over order: {:?}", sizes);

    assert_equal(
        drain(bucket.begin()).into_iter().map(|(k, _)| k),
        (6..=25).map(two_digit),
    );
    validate::check_integrity(&bucket);
}
