use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Sentinel meaning "no page". Real page ids start at 1.
pub const INVALID_PAGE_ID: PageId = 0;

/// Record ID: the page holding the record plus its slot within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

/// How a page access reached the buffer pool. The replacer uses this to
/// classify frames: scan accesses are cheaper to evict than point lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessType {
    #[default]
    Point,
    Scan,
    Index,
}

/// Page structure: the unit of transfer between disk and memory.
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the page contents.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }
}

/// Smart pointer to a page; the `RwLock` is the page's data latch.
pub type PagePtr = Arc<RwLock<Page>>;
