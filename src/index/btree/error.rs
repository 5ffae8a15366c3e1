use thiserror::Error;

use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Tree node does not fit in a page")]
    NodeTooLarge,

    #[error("Corrupted tree page: {0}")]
    Corrupted(String),

    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
}
