pub mod delete;
pub mod insert;
pub mod tree;
pub mod tree_iter;

pub use tree::Bptree;
pub use tree_iter::BucketIter;
