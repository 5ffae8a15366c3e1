use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::types::{Page, PageId};
use crate::storage::buffer::manager::{BufferPoolManager, Frame};

type PageLatchRead = ArcRwLockReadGuard<RawRwLock, Page>;
type PageLatchWrite = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Scoped holder over a pinned page with no latch of its own.
///
/// Constructing the guard consumes one pin; dropping it unpins exactly
/// once, dirty if the page was accessed through [`PageGuard::write`].
/// Guards are move-only; a copy would double-unpin.
pub struct PageGuard {
    bpm: Arc<BufferPoolManager>,
    frame: Arc<Frame>,
    page_id: PageId,
    is_dirty: bool,
}

impl PageGuard {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, frame: Arc<Frame>, page_id: PageId) -> Self {
        Self {
            bpm,
            frame,
            page_id,
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Take the page's shared latch for the duration of the returned
    /// borrow.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    /// Take the page's exclusive latch for the duration of the returned
    /// borrow and mark the guard dirty.
    pub fn write(&mut self) -> RwLockWriteGuard<'_, Page> {
        self.is_dirty = true;
        self.frame.page.write()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let _ = self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}

/// Scoped holder over a pinned page with the shared latch held for the
/// guard's whole lifetime. Readers are recursive: any number of read
/// guards may coexist on one page.
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    // Dropped before the unpin so the latch is never held on an
    // unpinned page.
    latch: Option<PageLatchRead>,
}

impl ReadPageGuard {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, frame: &Arc<Frame>, page_id: PageId) -> Self {
        let latch = frame.page.read_arc();
        Self {
            bpm,
            page_id,
            latch: Some(latch),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for ReadPageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.latch.as_ref().expect("read guard already released")
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        drop(self.latch.take());
        let _ = self.bpm.unpin_page(self.page_id, false);
    }
}

/// Scoped holder over a pinned page with the exclusive latch held for
/// the guard's whole lifetime. Mutable access marks the page dirty.
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    latch: Option<PageLatchWrite>,
    is_dirty: bool,
}

impl WritePageGuard {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, frame: &Arc<Frame>, page_id: PageId) -> Self {
        let latch = frame.page.write_arc();
        Self {
            bpm,
            page_id,
            latch: Some(latch),
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for WritePageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.latch.as_ref().expect("write guard already released")
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Page {
        self.is_dirty = true;
        self.latch.as_mut().expect("write guard already released")
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        drop(self.latch.take());
        let _ = self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}
