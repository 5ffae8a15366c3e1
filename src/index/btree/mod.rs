pub mod error;
pub mod iterator;
pub mod node;
pub mod tree;

pub use error::BTreeError;
pub use iterator::TreeIterator;
pub use tree::BPlusTree;
