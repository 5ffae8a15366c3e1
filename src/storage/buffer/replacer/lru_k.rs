use std::collections::HashMap;

use hashlink::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::{AccessType, FrameId};

/// Which eviction queue a frame currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    /// Fewer than K accesses, first touched by a point or index access.
    Cold,
    /// Fewer than K accesses, first touched by a scan.
    Warm,
    /// K or more accesses, ordered by K-th-from-last access time.
    Hot,
}

#[derive(Debug)]
struct LruKNode {
    access_count: usize,
    queue: Queue,
    evictable: bool,
}

struct ReplacerInner {
    nodes: HashMap<FrameId, LruKNode>,
    // Insertion-ordered queues: front = least recently touched, so the
    // front-to-back scan in evict() visits candidates oldest-first.
    cold: LinkedHashMap<FrameId, ()>,
    warm: LinkedHashMap<FrameId, ()>,
    hot: LinkedHashMap<FrameId, ()>,
    evictable_count: usize,
}

/// LRU-K replacement policy over buffer pool frames.
///
/// Frames with fewer than K recorded accesses have infinite backward
/// K-distance and are evicted first (cold before warm before hot); within
/// a queue the least recently touched frame wins.
pub struct LruKReplacer {
    inner: Mutex<ReplacerInner>,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            inner: Mutex::new(ReplacerInner {
                nodes: HashMap::with_capacity(num_frames),
                cold: LinkedHashMap::new(),
                warm: LinkedHashMap::new(),
                hot: LinkedHashMap::new(),
                evictable_count: 0,
            }),
            k,
        }
    }

    /// Record an access to the given frame, creating its node on first
    /// touch. Reaching K accesses migrates the node to the hot queue,
    /// where every further access moves it to the back.
    pub fn record_access(&self, frame_id: FrameId, access_type: AccessType) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.nodes.contains_key(&frame_id) {
            let queue = match access_type {
                AccessType::Scan => Queue::Warm,
                _ => Queue::Cold,
            };
            match queue {
                Queue::Warm => inner.warm.insert(frame_id, ()),
                _ => inner.cold.insert(frame_id, ()),
            };
            inner.nodes.insert(
                frame_id,
                LruKNode {
                    access_count: 1,
                    queue,
                    evictable: false,
                },
            );
            return;
        }

        let node = inner.nodes.get_mut(&frame_id).unwrap();
        if node.access_count >= self.k {
            // Already hot: refresh its position at the back.
            inner.hot.remove(&frame_id);
            inner.hot.insert(frame_id, ());
            return;
        }

        node.access_count += 1;
        if node.access_count >= self.k {
            let from = node.queue;
            node.queue = Queue::Hot;
            match from {
                Queue::Cold => inner.cold.remove(&frame_id),
                Queue::Warm => inner.warm.remove(&frame_id),
                Queue::Hot => unreachable!("frame below K access count in hot queue"),
            };
            inner.hot.insert(frame_id, ());
        }
    }

    /// Evict the best candidate frame, removing its node. Returns `None`
    /// when no tracked frame is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.evictable_count == 0 {
            return None;
        }

        for queue in [Queue::Cold, Queue::Warm, Queue::Hot] {
            let list = match queue {
                Queue::Cold => &mut inner.cold,
                Queue::Warm => &mut inner.warm,
                Queue::Hot => &mut inner.hot,
            };
            let victim = list
                .iter()
                .map(|(frame_id, _)| *frame_id)
                .find(|frame_id| inner.nodes[frame_id].evictable);
            if let Some(frame_id) = victim {
                list.remove(&frame_id);
                inner.nodes.remove(&frame_id);
                inner.evictable_count -= 1;
                return Some(frame_id);
            }
        }

        None
    }

    /// Flip the evictable flag of a tracked frame. Untracked frames are
    /// ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let node = match inner.nodes.get_mut(&frame_id) {
            Some(node) => node,
            None => return,
        };
        if node.evictable == evictable {
            return;
        }
        node.evictable = evictable;
        if evictable {
            inner.evictable_count += 1;
        } else {
            inner.evictable_count -= 1;
        }
    }

    /// Drop a frame from the replacer entirely.
    ///
    /// Panics if the frame is tracked but not evictable; that is a
    /// caller bug (removing a frame that may still be pinned).
    pub fn remove(&self, frame_id: FrameId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let node = match inner.nodes.remove(&frame_id) {
            Some(node) => node,
            None => return,
        };
        assert!(
            node.evictable,
            "removed non-evictable frame {frame_id} from the replacer"
        );
        match node.queue {
            Queue::Cold => inner.cold.remove(&frame_id),
            Queue::Warm => inner.warm.remove(&frame_id),
            Queue::Hot => inner.hot.remove(&frame_id),
        };
        inner.evictable_count -= 1;
    }

    /// Number of evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}
