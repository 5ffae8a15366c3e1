use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{AccessType, PageId, INVALID_PAGE_ID};
use crate::index::btree::node::LeafNode;
use crate::storage::buffer::BufferPoolManager;

/// Forward iterator over the leaf chain.
///
/// Holds a decoded snapshot of the current leaf; advancing past it takes
/// a shared latch on the next leaf just long enough to snapshot it.
/// There are no guarantees against concurrent writers restructuring the
/// leaves mid-scan.
pub struct TreeIterator<K, V> {
    bpm: Arc<BufferPoolManager>,
    current_page_id: PageId,
    next_page_id: PageId,
    entries: Vec<(K, V)>,
    index: usize,
}

impl<K, V> TreeIterator<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub(crate) fn start(
        bpm: Arc<BufferPoolManager>,
        page_id: PageId,
        leaf: LeafNode<K, V>,
        index: usize,
    ) -> Self {
        Self {
            bpm,
            current_page_id: page_id,
            next_page_id: leaf.next_page_id,
            entries: leaf.entries,
            index,
        }
    }

    /// True once the iterator has moved past the last entry.
    pub fn is_end(&self) -> bool {
        self.current_page_id == INVALID_PAGE_ID
            || (self.index >= self.entries.len() && self.next_page_id == INVALID_PAGE_ID)
    }

    fn finish(&mut self) {
        self.current_page_id = INVALID_PAGE_ID;
        self.next_page_id = INVALID_PAGE_ID;
        self.entries.clear();
        self.index = 0;
    }
}

impl<K, V> Iterator for TreeIterator<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if self.current_page_id == INVALID_PAGE_ID {
                return None;
            }
            if self.index < self.entries.len() {
                let item = self.entries[self.index].clone();
                self.index += 1;
                return Some(item);
            }
            if self.next_page_id == INVALID_PAGE_ID {
                self.finish();
                return None;
            }

            let guard = match self
                .bpm
                .fetch_page_read_with(self.next_page_id, AccessType::Scan)
            {
                Ok(guard) => guard,
                Err(_) => {
                    self.finish();
                    return None;
                }
            };
            let leaf = match LeafNode::<K, V>::decode(&guard) {
                Ok(leaf) => leaf,
                Err(_) => {
                    self.finish();
                    return None;
                }
            };
            self.current_page_id = self.next_page_id;
            self.next_page_id = leaf.next_page_id;
            self.entries = leaf.entries;
            self.index = 0;
        }
    }
}
