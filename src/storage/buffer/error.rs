use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Invalid page ID")]
    InvalidPageId,

    #[error("Page {0} is not resident in the buffer pool")]
    PageNotResident(PageId),

    #[error("Page {0} is not pinned")]
    NotPinned(PageId),

    #[error("Page {0} is pinned")]
    PagePinned(PageId),

    #[error("All frames are pinned")]
    PoolExhausted,

    #[error("Disk manager error: {0}")]
    Disk(#[from] DiskManagerError),
}
