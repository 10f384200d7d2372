use crate::{
    btree::{
        page::{BTreeInternalPage, BTreeLeafPage, VirtualPage, PAGE_HEADER_SIZE},
        tree::Bptree,
    },
    bucket::Bucket,
};

/// Walk the whole tree and assert the structural invariants: in-node key
/// order, separator bounds on every subtree, exact byte accounting, and
/// occupancy. Single-threaded use only, the walk takes no latches.
pub(crate) fn check_integrity(bucket: &Bucket) {
    let tree = &bucket.tree;
    let (root, height) = {
        let root = tree.root_latch.read();
        (root.root, root.height)
    };
    check_subtree(tree, height, root, None, None, true);
    check_leaf_chain(bucket);
}

/// Entry counts of every leaf, left to right along the chain.
pub(crate) fn leaf_sizes(bucket: &Bucket) -> Vec<u32> {
    let tree = &bucket.tree;
    let mut out = Vec::new();
    let mut id = tree.first_leaf;
    while id != 0 {
        let page = VirtualPage::read(id, tree.ctx.page_size, &tree.ctx.pool).unwrap();
        let leaf = BTreeLeafPage::from_page(page, tree.ctx.cmp.clone());
        out.push(leaf.size());
        id = leaf.next();
    }
    out
}

fn check_subtree(
    tree: &Bptree,
    height: u32,
    id: u32,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    is_root: bool,
) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let page = VirtualPage::read(id, tree.ctx.page_size, &tree.ctx.pool).unwrap();

    if height == 1 {
        let leaf = BTreeLeafPage::from_page(page, tree.ctx.cmp.clone());
        let entries = leaf.entries();

        for pair in entries.windows(2) {
            assert!(pair[0].0 < pair[1].0, "leaf {} keys out of order", id);
        }
        let payload: u32 = entries
            .iter()
            .map(|(k, v)| BTreeLeafPage::elem_size(k, v))
            .sum();
        assert_eq!(
            leaf.bytes(),
            PAGE_HEADER_SIZE as u32 + payload,
            "leaf {} byte accounting is off",
            id
        );
        if !is_root {
            assert!(leaf.size() <= tree.order, "leaf {} over order", id);
        }
        if let (Some(lo), Some(min)) = (lower, leaf.min_key()) {
            assert!(min.as_slice() >= lo, "leaf {} underruns its separator", id);
        }
        if let (Some(hi), Some(max)) = (upper, leaf.max_key()) {
            assert!(max.as_slice() < hi, "leaf {} overruns its separator", id);
        }
        return (leaf.min_key(), leaf.max_key());
    }

    let inner = BTreeInternalPage::from_page(page, tree.ctx.cmp.clone());
    let keys = inner.keys();
    let children = inner.children();

    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "inner {} separators out of order", id);
    }
    let payload: u32 = keys.iter().map(|k| BTreeInternalPage::elem_size(k)).sum();
    assert_eq!(
        inner.bytes(),
        PAGE_HEADER_SIZE as u32 + 4 + payload,
        "inner {} byte accounting is off",
        id
    );
    if !is_root {
        assert!(inner.size() <= tree.order, "inner {} over order", id);
    }

    let mut subtree_min = None;
    let mut subtree_max = None;
    for (i, child) in children.iter().enumerate() {
        let lo = if i == 0 {
            lower
        } else {
            Some(keys[i - 1].as_slice())
        };
        let hi = if i == keys.len() {
            upper
        } else {
            Some(keys[i].as_slice())
        };
        let (child_min, child_max) = check_subtree(tree, height - 1, *child, lo, hi, false);
        if i == 0 {
            subtree_min = child_min;
        }
        if child_max.is_some() {
            subtree_max = child_max;
        }
    }
    (subtree_min, subtree_max)
}

/// The leaf chain yields every record in ascending order, each exactly
/// once, and agrees with a full cursor walk.
fn check_leaf_chain(bucket: &Bucket) {
    let tree = &bucket.tree;
    let mut chained = Vec::new();
    let mut id = tree.first_leaf;
    while id != 0 {
        let page = VirtualPage::read(id, tree.ctx.page_size, &tree.ctx.pool).unwrap();
        let leaf = BTreeLeafPage::from_page(page, tree.ctx.cmp.clone());
        chained.extend(leaf.entries());
        id = leaf.next();
    }

    for pair in chained.windows(2) {
        assert!(pair[0].0 < pair[1].0, "leaf chain out of order");
    }

    let walked = super::drain(bucket.begin());
    assert_eq!(chained, walked);
}
