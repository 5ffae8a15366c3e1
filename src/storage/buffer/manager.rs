use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{AccessType, FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_guard::{PageGuard, ReadPageGuard, WritePageGuard};
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::{DiskManager, DiskScheduler};

/// A buffer pool frame: one slot of page-sized memory plus bookkeeping.
///
/// The `meta` mutex guards the pin count, dirty flag and resident page
/// id; the `page` lock doubles as the per-page data latch that read and
/// write guards hold.
pub(crate) struct Frame {
    pub(crate) meta: Mutex<FrameMeta>,
    pub(crate) page: PagePtr,
}

pub(crate) struct FrameMeta {
    pub(crate) page_id: PageId,
    pub(crate) pin_count: u32,
    pub(crate) is_dirty: bool,
}

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Buffer pool manager: virtualizes disk pages as a bounded in-memory
/// cache with explicit pinning.
///
/// The page table, free list and replacer form one short critical
/// section; disk I/O happens through the scheduler after that section
/// ends, with the victim frame's data latch held so concurrent fetches
/// of the incoming page wait for its bytes.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<Arc<Frame>>,
    inner: Mutex<PoolInner>,
    replacer: LruKReplacer,
    scheduler: DiskScheduler,
    disk: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk = Arc::new(DiskManager::new(db_path)?);
        let scheduler = DiskScheduler::new(Arc::clone(&disk));

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size as FrameId {
            frames.push(Arc::new(Frame {
                meta: Mutex::new(FrameMeta {
                    page_id: INVALID_PAGE_ID,
                    pin_count: 0,
                    is_dirty: false,
                }),
                page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            }));
            free_list.push_back(frame_id);
        }

        Ok(Self {
            pool_size,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
            }),
            replacer: LruKReplacer::new(pool_size, replacer_k),
            scheduler,
            disk,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Frames a new allocation could claim right now: free frames plus
    /// evictable resident ones.
    pub fn available_frames(&self) -> usize {
        self.inner.lock().free_list.len() + self.replacer.size()
    }

    /// Pin count of a resident page, if any.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        let &frame_id = inner.page_table.get(&page_id)?;
        Some(self.frames[frame_id as usize].meta.lock().pin_count)
    }

    /// Allocate a brand-new page and pin it in a frame. The returned
    /// page is zeroed and clean with pin count 1.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let (frame, page_id) = self.new_frame()?;
        Ok((Arc::clone(&frame.page), page_id))
    }

    /// Fetch a page, pinning its frame. Resident pages are returned
    /// directly; otherwise a frame is claimed from the free list or the
    /// replacer and the page is read through the disk scheduler.
    pub fn fetch_page(
        &self,
        page_id: PageId,
        access_type: AccessType,
    ) -> Result<PagePtr, BufferPoolError> {
        let frame = self.fetch_frame(page_id, access_type)?;
        Ok(Arc::clone(&frame.page))
    }

    /// Release one pin on a page, OR-accumulating the dirty flag. The
    /// frame becomes evictable when its pin count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let inner = self.inner.lock();
        let &frame_id = inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotResident(page_id))?;
        let frame = &self.frames[frame_id as usize];

        let mut meta = frame.meta.lock();
        if meta.pin_count == 0 {
            return Err(BufferPoolError::NotPinned(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Write a resident page to disk and clear its dirty flag.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let frame = {
            let inner = self.inner.lock();
            let &frame_id = inner
                .page_table
                .get(&page_id)
                .ok_or(BufferPoolError::PageNotResident(page_id))?;
            Arc::clone(&self.frames[frame_id as usize])
        };

        let snapshot = {
            let mut meta = frame.meta.lock();
            let snapshot = Page::clone(&frame.page.read());
            meta.is_dirty = false;
            snapshot
        };
        self.scheduler.write_page_sync(snapshot)?;
        Ok(())
    }

    /// Flush every resident page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let page_ids: Vec<PageId> = self.inner.lock().page_table.keys().copied().collect();
        for page_id in page_ids {
            match self.flush_page(page_id) {
                Ok(()) | Err(BufferPoolError::PageNotResident(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate it. Deleting an absent
    /// page succeeds; deleting a pinned page fails.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => {
                self.disk.deallocate_page(page_id);
                return Ok(());
            }
        };
        let frame = &self.frames[frame_id as usize];

        let mut meta = frame.meta.lock();
        if meta.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }
        inner.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        inner.free_list.push_back(frame_id);
        meta.page_id = INVALID_PAGE_ID;
        meta.is_dirty = false;
        drop(meta);
        drop(inner);

        self.disk.deallocate_page(page_id);
        Ok(())
    }

    /// Flush everything and sync the backing file.
    pub fn shut_down(&self) -> Result<(), BufferPoolError> {
        self.flush_all_pages()?;
        self.disk.shut_down()?;
        Ok(())
    }

    /// Fetch with no page latch.
    pub fn fetch_page_basic(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> Result<PageGuard, BufferPoolError> {
        let frame = self.fetch_frame(page_id, AccessType::Point)?;
        Ok(PageGuard::new(Arc::clone(self), frame, page_id))
    }

    /// Fetch holding the page's shared latch.
    pub fn fetch_page_read(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> Result<ReadPageGuard, BufferPoolError> {
        self.fetch_page_read_with(page_id, AccessType::Point)
    }

    /// Fetch holding the shared latch, with an access hint for the
    /// replacer (scans are preferred eviction victims).
    pub fn fetch_page_read_with(
        self: &Arc<Self>,
        page_id: PageId,
        access_type: AccessType,
    ) -> Result<ReadPageGuard, BufferPoolError> {
        let frame = self.fetch_frame(page_id, access_type)?;
        Ok(ReadPageGuard::new(Arc::clone(self), &frame, page_id))
    }

    /// Fetch holding the page's exclusive latch.
    pub fn fetch_page_write(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> Result<WritePageGuard, BufferPoolError> {
        let frame = self.fetch_frame(page_id, AccessType::Point)?;
        Ok(WritePageGuard::new(Arc::clone(self), &frame, page_id))
    }

    /// Allocate a new page behind a latch-free guard.
    pub fn new_page_guarded(self: &Arc<Self>) -> Result<(PageGuard, PageId), BufferPoolError> {
        let (frame, page_id) = self.new_frame()?;
        Ok((PageGuard::new(Arc::clone(self), frame, page_id), page_id))
    }

    fn fetch_frame(
        &self,
        page_id: PageId,
        access_type: AccessType,
    ) -> Result<Arc<Frame>, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId);
        }
        let mut inner = self.inner.lock();

        // Resident: pin and return. The caller blocks on the data latch
        // if another thread is still installing the bytes.
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = Arc::clone(&self.frames[frame_id as usize]);
            self.replacer.record_access(frame_id, access_type);
            let mut meta = frame.meta.lock();
            if meta.pin_count == 0 {
                self.replacer.set_evictable(frame_id, false);
            }
            meta.pin_count += 1;
            drop(meta);
            drop(inner);
            return Ok(frame);
        }

        let frame_id = self.claim_frame(&mut inner)?;
        let frame = Arc::clone(&self.frames[frame_id as usize]);
        self.replacer.record_access(frame_id, access_type);
        self.replacer.set_evictable(frame_id, false);

        let mut meta = frame.meta.lock();
        let old_page_id = meta.page_id;
        let old_dirty = meta.is_dirty;
        if old_page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&old_page_id);
        }
        inner.page_table.insert(page_id, frame_id);
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        // Take the data latch before publishing the mapping any further;
        // the global latch is released before any I/O happens.
        let mut data = frame.page.write();
        drop(meta);
        drop(inner);

        if old_dirty {
            debug!("evicting dirty page {old_page_id} from frame {frame_id}");
            self.scheduler.submit_write(Page::clone(&data));
        }
        *data = self.scheduler.read_page(page_id)?;
        drop(data);

        Ok(frame)
    }

    fn new_frame(&self) -> Result<(Arc<Frame>, PageId), BufferPoolError> {
        let mut inner = self.inner.lock();
        let frame_id = self.claim_frame(&mut inner)?;
        let page_id = self.disk.allocate_page();

        let frame = Arc::clone(&self.frames[frame_id as usize]);
        self.replacer.record_access(frame_id, AccessType::Point);
        self.replacer.set_evictable(frame_id, false);

        let mut meta = frame.meta.lock();
        let old_page_id = meta.page_id;
        let old_dirty = meta.is_dirty;
        if old_page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&old_page_id);
        }
        inner.page_table.insert(page_id, frame_id);
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        let mut data = frame.page.write();
        drop(meta);
        drop(inner);

        if old_dirty {
            debug!("evicting dirty page {old_page_id} from frame {frame_id}");
            self.scheduler.submit_write(Page::clone(&data));
        }
        *data = Page::new(page_id);
        drop(data);

        Ok((frame, page_id))
    }

    /// Claim a frame from the free list, falling back to eviction.
    fn claim_frame(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        self.replacer.evict().ok_or(BufferPoolError::PoolExhausted)
    }
}
