use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::common::types::{Page, PageId};
use crate::storage::disk::disk_manager::{DiskManager, DiskManagerError};

const WORKER_COUNT: usize = 2;

enum DiskRequest {
    /// Write the pending copy of `page_id` to disk. The payload lives in
    /// the pending-write table, not in the request, so a newer write to
    /// the same page coalesces with a queued one.
    Write {
        page_id: PageId,
        done: Option<Sender<Result<(), DiskManagerError>>>,
    },
    Read {
        page_id: PageId,
        done: Sender<Result<Page, DiskManagerError>>,
    },
    Shutdown,
}

/// A pending write: the page bytes plus a sequence number so a worker can
/// tell whether the table entry it wrote is still the latest.
struct PendingWrite {
    seq: u64,
    page: Page,
}

/// Asynchronous disk scheduler. Requests are queued per submission and
/// drained by a small worker pool; writes against the same page id
/// coalesce, and a read that finds a pending write is served from the
/// in-memory copy without touching the disk.
pub struct DiskScheduler {
    disk: Arc<DiskManager>,
    queue: Mutex<Sender<DiskRequest>>,
    pending_writes: Arc<Mutex<HashMap<PageId, PendingWrite>>>,
    next_seq: Mutex<u64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DiskScheduler {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        let (tx, rx) = mpsc::channel();
        let rx = Arc::new(Mutex::new(rx));
        let pending_writes = Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for _ in 0..WORKER_COUNT {
            workers.push(Self::spawn_worker(
                Arc::clone(&disk),
                Arc::clone(&rx),
                Arc::clone(&pending_writes),
            ));
        }

        Self {
            disk,
            queue: Mutex::new(tx),
            pending_writes,
            next_seq: Mutex::new(0),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a write of the given page. Returns once the request is
    /// accepted; the disk write happens on a worker thread.
    pub fn submit_write(&self, page: Page) {
        let page_id = page.page_id;
        {
            let mut pending = self.pending_writes.lock();
            let mut seq = self.next_seq.lock();
            *seq += 1;
            pending.insert(page_id, PendingWrite { seq: *seq, page });
        }
        // A send failure means the workers are gone; the pending table
        // still holds the bytes, so later reads stay correct.
        let _ = self
            .queue
            .lock()
            .send(DiskRequest::Write { page_id, done: None });
    }

    /// Write the page and wait for it to reach the disk.
    pub fn write_page_sync(&self, page: Page) -> Result<(), DiskManagerError> {
        let page_id = page.page_id;
        {
            let mut pending = self.pending_writes.lock();
            let mut seq = self.next_seq.lock();
            *seq += 1;
            pending.insert(page_id, PendingWrite { seq: *seq, page });
        }
        let (done_tx, done_rx) = mpsc::channel();
        self.queue
            .lock()
            .send(DiskRequest::Write {
                page_id,
                done: Some(done_tx),
            })
            .map_err(|_| DiskManagerError::SchedulerStopped)?;
        done_rx
            .recv()
            .map_err(|_| DiskManagerError::SchedulerStopped)?
    }

    /// Read a page, blocking until the bytes are available. A pending
    /// write of the same page is served from memory.
    pub fn read_page(&self, page_id: PageId) -> Result<Page, DiskManagerError> {
        if let Some(pending) = self.pending_writes.lock().get(&page_id) {
            return Ok(pending.page.clone());
        }

        let (done_tx, done_rx) = mpsc::channel();
        self.queue
            .lock()
            .send(DiskRequest::Read {
                page_id,
                done: done_tx,
            })
            .map_err(|_| DiskManagerError::SchedulerStopped)?;
        done_rx
            .recv()
            .map_err(|_| DiskManagerError::SchedulerStopped)?
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    fn spawn_worker(
        disk: Arc<DiskManager>,
        rx: Arc<Mutex<Receiver<DiskRequest>>>,
        pending_writes: Arc<Mutex<HashMap<PageId, PendingWrite>>>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || loop {
            let request = {
                let rx = rx.lock();
                match rx.recv() {
                    Ok(request) => request,
                    Err(_) => return,
                }
            };

            match request {
                DiskRequest::Write { page_id, done } => {
                    // Snapshot the latest pending copy; the entry is only
                    // removed afterwards if no newer write replaced it.
                    let snapshot = pending_writes
                        .lock()
                        .get(&page_id)
                        .map(|p| (p.seq, p.page.clone()));
                    let result = match snapshot {
                        Some((seq, page)) => {
                            let result = disk.write_page(&page);
                            if result.is_ok() {
                                let mut pending = pending_writes.lock();
                                if pending.get(&page_id).map(|p| p.seq) == Some(seq) {
                                    pending.remove(&page_id);
                                }
                            }
                            result
                        }
                        // A coalesced write already handled this page.
                        None => Ok(()),
                    };
                    if let Some(done) = done {
                        let _ = done.send(result);
                    }
                }
                DiskRequest::Read { page_id, done } => {
                    // Re-check the pending table: a write may have been
                    // queued between the caller's check and now.
                    let pending_copy = pending_writes.lock().get(&page_id).map(|p| p.page.clone());
                    let result = match pending_copy {
                        Some(page) => Ok(page),
                        None => {
                            let mut page = Page::new(page_id);
                            disk.read_page(page_id, &mut page).map(|_| page)
                        }
                    };
                    let _ = done.send(result);
                }
                DiskRequest::Shutdown => return,
            }
        })
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        {
            let queue = self.queue.lock();
            for _ in workers.iter() {
                let _ = queue.send(DiskRequest::Shutdown);
            }
        }
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}
