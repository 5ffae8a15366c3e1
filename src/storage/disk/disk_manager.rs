use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
    #[error("Disk scheduler has shut down")]
    SchedulerStopped,
}

/// DiskManager stores pages in a single file of concatenated PAGE_SIZE
/// blocks. Page `p` lives at offset `(p - 1) * PAGE_SIZE`; id 0 is the
/// invalid sentinel.
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    /// Open (or create) the database file at the given path.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        // Resume page id allocation after any pages already on disk.
        let file_size = file.metadata()?.len();
        let next_page_id = (file_size / PAGE_SIZE as u64) as PageId + 1;

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    /// Read a page from disk. Reads past the end of the file yield a
    /// zeroed page, matching the contents of never-written allocations.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset as u64 >= file_size {
            page.reset();
            page.page_id = page_id;
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(&mut page.data)?;
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk, extending the file if necessary.
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Hand out the next sequential page id. The file is extended lazily
    /// by the first write; unwritten pages read back as zeroes.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Marker for page deallocation. Freed ids are not recycled.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Flush the backing file to stable storage.
    pub fn shut_down(&self) -> Result<(), DiskManagerError> {
        self.db_file.lock().sync_all()?;
        Ok(())
    }

    fn page_offset(page_id: PageId) -> usize {
        (page_id as usize - 1) * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn allocates_sequential_ids_from_one() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        assert_eq!(disk.allocate_page(), 1);
        assert_eq!(disk.allocate_page(), 2);
        assert_eq!(disk.allocate_page(), 3);
    }

    #[test]
    fn unwritten_pages_read_back_zeroed() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        let page_id = disk.allocate_page();

        let mut page = Page::new(INVALID_PAGE_ID);
        disk.read_page(page_id, &mut page).unwrap();
        assert_eq!(page.page_id, page_id);
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_read_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        let page_id = disk.allocate_page();

        let mut page = Page::new(page_id);
        page.data[0] = 1;
        page.data[PAGE_SIZE - 1] = 2;
        disk.write_page(&page).unwrap();

        let mut read_back = Page::new(INVALID_PAGE_ID);
        disk.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back.data[0], 1);
        assert_eq!(read_back.data[PAGE_SIZE - 1], 2);
    }

    #[test]
    fn rejects_the_invalid_page_id() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        let mut page = Page::new(INVALID_PAGE_ID);
        assert!(disk.read_page(INVALID_PAGE_ID, &mut page).is_err());
        assert!(disk.write_page(&page).is_err());
    }
}
