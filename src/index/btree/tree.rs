use std::collections::VecDeque;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::TreeIterator;
use crate::index::btree::node::{page_kind, HeaderNode, InternalNode, LeafNode, PageKind};
use crate::storage::buffer::{BufferPoolManager, WritePageGuard};

/// Concurrent B+ tree index over buffer-pool pages.
///
/// Keys are unique. Lookups crab shared latches down the tree; inserts
/// and removes first try an optimistic pass that write-latches only the
/// target leaf, then restart pessimistically with a write-set of
/// exclusive latches when the leaf needs structural changes.
pub struct BPlusTree<K, V> {
    bpm: Arc<BufferPoolManager>,
    header_page_id: PageId,
    leaf_max_size: usize,
    internal_max_size: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BPlusTree<K, V>
where
    K: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a new tree: one header page plus an empty root leaf.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 2, "leaf pages must hold at least 2 entries");
        assert!(
            internal_max_size >= 3,
            "internal pages must hold at least 3 children"
        );

        let (mut header_guard, header_page_id) = bpm.new_page_guarded()?;
        let (mut root_guard, root_page_id) = bpm.new_page_guarded()?;

        LeafNode::<K, V>::new(leaf_max_size).encode(&mut root_guard.write())?;
        HeaderNode {
            root_page_id,
            tree_depth: 1,
        }
        .encode(&mut header_guard.write())?;

        Ok(Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// Re-attach to a tree whose header page already exists.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        }
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    /// True when the tree holds no keys.
    pub fn is_empty(&self) -> Result<bool, BTreeError> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&header_guard)?;
        if header.tree_depth > 1 {
            return Ok(false);
        }
        let root_guard = self.bpm.fetch_page_read(header.root_page_id)?;
        drop(header_guard);
        let root = LeafNode::<K, V>::decode(&root_guard)?;
        Ok(root.size() == 0)
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> Result<Option<V>, BTreeError> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&guard)?;
        let mut next = header.root_page_id;
        let mut level = header.tree_depth;

        while level > 1 {
            guard = self.bpm.fetch_page_read(next)?;
            let node = InternalNode::<K>::decode(&guard)?;
            next = node.child_for(key);
            level -= 1;
        }
        let leaf_guard = self.bpm.fetch_page_read(next)?;
        drop(guard);
        let leaf = LeafNode::<K, V>::decode(&leaf_guard)?;
        Ok(leaf.get(key).cloned())
    }

    /// Insert a unique key. Returns false (tree unchanged) if the key is
    /// already present.
    pub fn insert(&self, key: K, value: V) -> Result<bool, BTreeError> {
        // Optimistic pass: shared latches down, exclusive latch on just
        // the target leaf.
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&guard)?;
        let mut next = header.root_page_id;
        let mut level = header.tree_depth;
        while level > 1 {
            guard = self.bpm.fetch_page_read(next)?;
            let node = InternalNode::<K>::decode(&guard)?;
            next = node.child_for(&key);
            level -= 1;
        }
        let mut leaf_guard = self.bpm.fetch_page_write(next)?;
        drop(guard);

        let mut leaf = LeafNode::<K, V>::decode(&leaf_guard)?;
        if leaf.contains(&key) {
            return Ok(false);
        }
        if leaf.size() + 1 < self.leaf_max_size {
            leaf.insert(key, value);
            leaf.encode(&mut leaf_guard)?;
            return Ok(true);
        }

        // The insert would fill the leaf: drop all latches and restart
        // with exclusive crabbing. Another thread may restructure in
        // between; the pessimistic pass re-routes and re-checks from
        // scratch.
        drop(leaf_guard);
        self.split_insert(key, value)
    }

    /// Remove a key. Absent keys are a silent no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&guard)?;
        let root_page_id = header.root_page_id;
        let mut next = root_page_id;
        let mut level = header.tree_depth;
        while level > 1 {
            guard = self.bpm.fetch_page_read(next)?;
            let node = InternalNode::<K>::decode(&guard)?;
            next = node.child_for(key);
            level -= 1;
        }
        let mut leaf_guard = self.bpm.fetch_page_write(next)?;
        drop(guard);

        let mut leaf = LeafNode::<K, V>::decode(&leaf_guard)?;
        if !leaf.contains(key) {
            return Ok(());
        }
        if leaf.over_half_full() || leaf_guard.page_id() == root_page_id {
            leaf.remove(key);
            leaf.encode(&mut leaf_guard)?;
            return Ok(());
        }

        drop(leaf_guard);
        self.merge_remove(key)
    }

    /// Iterator over the whole tree in key order.
    pub fn iter(&self) -> Result<TreeIterator<K, V>, BTreeError> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&guard)?;
        let mut next = header.root_page_id;
        let mut level = header.tree_depth;
        while level > 1 {
            guard = self.bpm.fetch_page_read(next)?;
            let node = InternalNode::<K>::decode(&guard)?;
            next = node.child_at(0);
            level -= 1;
        }
        let leaf_guard = self.bpm.fetch_page_read(next)?;
        drop(guard);
        let leaf = LeafNode::<K, V>::decode(&leaf_guard)?;
        Ok(TreeIterator::start(
            Arc::clone(&self.bpm),
            leaf_guard.page_id(),
            leaf,
            0,
        ))
    }

    /// Iterator starting at the smallest key not less than `key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K, V>, BTreeError> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&guard)?;
        let mut next = header.root_page_id;
        let mut level = header.tree_depth;
        while level > 1 {
            guard = self.bpm.fetch_page_read(next)?;
            let node = InternalNode::<K>::decode(&guard)?;
            next = node.child_for(key);
            level -= 1;
        }
        let leaf_guard = self.bpm.fetch_page_read(next)?;
        drop(guard);
        let leaf = LeafNode::<K, V>::decode(&leaf_guard)?;
        let start = leaf.lower_bound(key);
        Ok(TreeIterator::start(
            Arc::clone(&self.bpm),
            leaf_guard.page_id(),
            leaf,
            start,
        ))
    }

    fn leaf_min_size(&self) -> usize {
        (self.leaf_max_size + 1) / 2
    }

    fn internal_min_size(&self) -> usize {
        (self.internal_max_size + 1) / 2
    }

    /// Pessimistic insert: exclusive crabbing from the header, keeping a
    /// write-set of every page that a split below might touch. Ancestors
    /// above a non-full internal page are released during the descent.
    fn split_insert(&self, key: K, value: V) -> Result<bool, BTreeError> {
        let mut write_set: VecDeque<WritePageGuard> = VecDeque::new();
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let header = HeaderNode::decode(&header_guard)?;
        let mut level = header.tree_depth;
        let mut next = header.root_page_id;
        write_set.push_front(header_guard);

        loop {
            let guard = self.bpm.fetch_page_write(next)?;
            if level == 1 {
                write_set.push_front(guard);
                break;
            }
            let node = InternalNode::<K>::decode(&guard)?;
            write_set.push_front(guard);
            if !node.is_full() {
                // This page absorbs any split from below; everything
                // above it can go.
                write_set.truncate(1);
            }
            next = node.child_for(&key);
            level -= 1;
        }

        // Leaf step.
        let mut leaf_guard = write_set.pop_front().expect("descent left an empty write set");
        let mut leaf = LeafNode::<K, V>::decode(&leaf_guard)?;
        if leaf.contains(&key) {
            return Ok(false);
        }
        leaf.insert(key, value);
        if leaf.size() <= self.leaf_max_size {
            leaf.encode(&mut leaf_guard)?;
            return Ok(true);
        }

        // The leaf overflowed. Try shifting entries to a sibling before
        // allocating a new page.
        if let Some(parent_guard) = write_set.front_mut() {
            if page_kind(parent_guard)? == PageKind::Internal {
                let mut parent = InternalNode::<K>::decode(parent_guard)?;
                if self.shed_leaf_overflow(&mut leaf, &mut leaf_guard, &mut parent)? {
                    parent.encode(parent_guard)?;
                    return Ok(true);
                }
            }
        }

        let (split_key, mut right) = leaf.split();
        let (mut right_guard, right_page_id) = self.bpm.new_page_guarded()?;
        right.next_page_id = leaf.next_page_id;
        leaf.next_page_id = right_page_id;
        right.encode(&mut right_guard.write())?;
        leaf.encode(&mut leaf_guard)?;
        drop(right_guard);
        drop(leaf_guard);
        debug!("split leaf, new sibling page {right_page_id}");

        let mut carry_key = split_key;
        let mut carry_child = right_page_id;

        // Unwind: push the (separator, new page) pair into each ancestor
        // in turn, splitting further as needed.
        loop {
            let mut guard = write_set
                .pop_front()
                .expect("split propagation outran the write set");
            match page_kind(&guard)? {
                PageKind::Header => {
                    let mut header = HeaderNode::decode(&guard)?;
                    let (mut root_guard, new_root_id) = self.bpm.new_page_guarded()?;
                    InternalNode::new_root(
                        self.internal_max_size,
                        header.root_page_id,
                        carry_key,
                        carry_child,
                    )
                    .encode(&mut root_guard.write())?;
                    header.root_page_id = new_root_id;
                    header.tree_depth += 1;
                    header.encode(&mut guard)?;
                    debug!("tree grew to depth {}", header.tree_depth);
                    return Ok(true);
                }
                PageKind::Internal => {
                    let mut node = InternalNode::<K>::decode(&guard)?;
                    node.insert_child(carry_key, carry_child);
                    if node.size() <= self.internal_max_size {
                        node.encode(&mut guard)?;
                        return Ok(true);
                    }

                    if let Some(parent_guard) = write_set.front_mut() {
                        if page_kind(parent_guard)? == PageKind::Internal {
                            let mut parent = InternalNode::<K>::decode(parent_guard)?;
                            if self.shed_internal_overflow(&mut node, &mut guard, &mut parent)? {
                                parent.encode(parent_guard)?;
                                return Ok(true);
                            }
                        }
                    }

                    let (promote, right) = node.split();
                    let (mut right_guard, right_page_id) = self.bpm.new_page_guarded()?;
                    right.encode(&mut right_guard.write())?;
                    node.encode(&mut guard)?;
                    carry_key = promote;
                    carry_child = right_page_id;
                }
                PageKind::Leaf => {
                    unreachable!("leaf page encountered while propagating a split")
                }
            }
        }
    }

    /// Shift entries from an overflowed leaf into a sibling with room,
    /// updating one separator in the parent. Returns false when neither
    /// sibling can take the spill.
    fn shed_leaf_overflow(
        &self,
        leaf: &mut LeafNode<K, V>,
        leaf_guard: &mut WritePageGuard,
        parent: &mut InternalNode<K>,
    ) -> Result<bool, BTreeError> {
        let idx = parent
            .child_index_of(leaf_guard.page_id())
            .expect("leaf missing from its parent");

        // Sibling latches are taken left before right, with the parent
        // and child latches already held.
        let mut left_guard = match idx.checked_sub(1) {
            Some(left_idx) => Some(self.bpm.fetch_page_write(parent.child_at(left_idx))?),
            None => None,
        };
        let mut right_guard = if idx + 1 < parent.size() {
            Some(self.bpm.fetch_page_write(parent.child_at(idx + 1))?)
        } else {
            None
        };

        if let Some(lg) = left_guard.as_mut() {
            let mut left = LeafNode::<K, V>::decode(lg)?;
            if balanced_fit(left.size() + leaf.size(), self.leaf_min_size(), self.leaf_max_size) {
                let n = (left.size() + leaf.size()) / 2 - left.size();
                leaf.push_to_left(&mut left, n);
                parent.set_key_of_child(idx, leaf.first_key().clone());
                left.encode(lg)?;
                leaf.encode(leaf_guard)?;
                return Ok(true);
            }
        }
        if let Some(rg) = right_guard.as_mut() {
            let mut right = LeafNode::<K, V>::decode(rg)?;
            if balanced_fit(right.size() + leaf.size(), self.leaf_min_size(), self.leaf_max_size) {
                let n = (right.size() + leaf.size()) / 2 - right.size();
                leaf.push_to_right(&mut right, n);
                parent.set_key_of_child(idx + 1, right.first_key().clone());
                right.encode(rg)?;
                leaf.encode(leaf_guard)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Internal-page counterpart of [`Self::shed_leaf_overflow`]; the
    /// separator rotates through the parent.
    fn shed_internal_overflow(
        &self,
        node: &mut InternalNode<K>,
        node_guard: &mut WritePageGuard,
        parent: &mut InternalNode<K>,
    ) -> Result<bool, BTreeError> {
        let idx = parent
            .child_index_of(node_guard.page_id())
            .expect("internal page missing from its parent");

        let mut left_guard = match idx.checked_sub(1) {
            Some(left_idx) => Some(self.bpm.fetch_page_write(parent.child_at(left_idx))?),
            None => None,
        };
        let mut right_guard = if idx + 1 < parent.size() {
            Some(self.bpm.fetch_page_write(parent.child_at(idx + 1))?)
        } else {
            None
        };

        if let Some(lg) = left_guard.as_mut() {
            let mut left = InternalNode::<K>::decode(lg)?;
            if balanced_fit(
                left.size() + node.size(),
                self.internal_min_size(),
                self.internal_max_size,
            ) {
                let n = (left.size() + node.size()) / 2 - left.size();
                let separator = parent.key_of_child(idx).clone();
                let new_separator = node.push_to_left(&mut left, separator, n);
                parent.set_key_of_child(idx, new_separator);
                left.encode(lg)?;
                node.encode(node_guard)?;
                return Ok(true);
            }
        }
        if let Some(rg) = right_guard.as_mut() {
            let mut right = InternalNode::<K>::decode(rg)?;
            if balanced_fit(
                right.size() + node.size(),
                self.internal_min_size(),
                self.internal_max_size,
            ) {
                let n = (right.size() + node.size()) / 2 - right.size();
                let separator = parent.key_of_child(idx + 1).clone();
                let new_separator = node.push_to_right(&mut right, separator, n);
                parent.set_key_of_child(idx + 1, new_separator);
                right.encode(rg)?;
                node.encode(node_guard)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pessimistic remove: exclusive crabbing with a write-set, merging
    /// or redistributing underflowed pages on the way back up.
    fn merge_remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut write_set: VecDeque<WritePageGuard> = VecDeque::new();
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let header = HeaderNode::decode(&header_guard)?;
        let root_page_id = header.root_page_id;
        let mut level = header.tree_depth;
        let mut next = root_page_id;
        write_set.push_front(header_guard);

        loop {
            let guard = self.bpm.fetch_page_write(next)?;
            if level == 1 {
                write_set.push_front(guard);
                break;
            }
            let node = InternalNode::<K>::decode(&guard)?;
            write_set.push_front(guard);
            if node.over_half_full() {
                // A merge below removes at most one child here; this
                // page stays within bounds, so ancestors are safe.
                write_set.truncate(1);
            }
            next = node.child_for(key);
            level -= 1;
        }

        // Leaf step.
        let mut leaf_guard = write_set.pop_front().expect("descent left an empty write set");
        let leaf_page_id = leaf_guard.page_id();
        let mut leaf = LeafNode::<K, V>::decode(&leaf_guard)?;
        if !leaf.contains(key) {
            return Ok(());
        }
        leaf.remove(key);
        if leaf.size() >= self.leaf_min_size() || leaf_page_id == root_page_id {
            leaf.encode(&mut leaf_guard)?;
            return Ok(());
        }

        // Underflow: a non-root leaf always has a latched parent here.
        let parent_guard = write_set
            .front_mut()
            .expect("underflowed leaf without a latched parent");
        let mut parent = InternalNode::<K>::decode(parent_guard)?;
        let idx = parent
            .child_index_of(leaf_page_id)
            .expect("leaf missing from its parent");

        let left_id = idx.checked_sub(1).map(|left_idx| parent.child_at(left_idx));
        let right_id = (idx + 1 < parent.size()).then(|| parent.child_at(idx + 1));
        let mut left_guard = match left_id {
            Some(id) => Some(self.bpm.fetch_page_write(id)?),
            None => None,
        };
        let mut right_guard = match right_id {
            Some(id) => Some(self.bpm.fetch_page_write(id)?),
            None => None,
        };
        let mut left = match left_guard.as_ref() {
            Some(g) => Some(LeafNode::<K, V>::decode(g)?),
            None => None,
        };
        let mut right = match right_guard.as_ref() {
            Some(g) => Some(LeafNode::<K, V>::decode(g)?),
            None => None,
        };

        // Redistribute from the fuller side first.
        let left_size = left.as_ref().map_or(0, LeafNode::size);
        let right_size = right.as_ref().map_or(0, LeafNode::size);
        let sides = if right_size >= left_size {
            [Side::Right, Side::Left]
        } else {
            [Side::Left, Side::Right]
        };
        for side in sides {
            match side {
                Side::Right => {
                    if let Some(right) = right.as_mut() {
                        if balanced_fit(
                            right.size() + leaf.size(),
                            self.leaf_min_size(),
                            self.leaf_max_size,
                        ) {
                            let n = (right.size() + leaf.size()) / 2 - leaf.size();
                            right.push_to_left(&mut leaf, n);
                            parent.set_key_of_child(idx + 1, right.first_key().clone());
                            right.encode(right_guard.as_mut().unwrap())?;
                            leaf.encode(&mut leaf_guard)?;
                            parent.encode(parent_guard)?;
                            return Ok(());
                        }
                    }
                }
                Side::Left => {
                    if let Some(left) = left.as_mut() {
                        if balanced_fit(
                            left.size() + leaf.size(),
                            self.leaf_min_size(),
                            self.leaf_max_size,
                        ) {
                            let n = (left.size() + leaf.size()) / 2 - leaf.size();
                            left.push_to_right(&mut leaf, n);
                            parent.set_key_of_child(idx, leaf.first_key().clone());
                            left.encode(left_guard.as_mut().unwrap())?;
                            leaf.encode(&mut leaf_guard)?;
                            parent.encode(parent_guard)?;
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Merge. The dead page's separator is removed from the parent in
        // the next unwind step.
        let dead_page_id = if let Some(right) = right.take() {
            let right_page_id = right_id.unwrap();
            leaf.merge_right(right);
            leaf.encode(&mut leaf_guard)?;
            drop(right_guard);
            drop(left_guard);
            drop(leaf_guard);
            right_page_id
        } else if let Some(mut left) = left.take() {
            left.merge_right(leaf);
            left.encode(left_guard.as_mut().unwrap())?;
            drop(right_guard);
            drop(left_guard);
            drop(leaf_guard);
            leaf_page_id
        } else {
            unreachable!("non-root leaf has no siblings")
        };
        debug!("merged leaf, dropping page {dead_page_id}");
        // The page is unreachable once the parent entry goes; a failure
        // here (an iterator still pinning it) only leaks the page.
        let _ = self.bpm.delete_page(dead_page_id);

        self.unwind_remove(write_set, root_page_id, dead_page_id)
    }

    /// Propagate a child removal up the write-set.
    fn unwind_remove(
        &self,
        mut write_set: VecDeque<WritePageGuard>,
        root_page_id: PageId,
        mut dead_child: PageId,
    ) -> Result<(), BTreeError> {
        loop {
            let mut guard = write_set
                .pop_front()
                .expect("merge propagation outran the write set");
            assert_eq!(
                page_kind(&guard)?,
                PageKind::Internal,
                "merge propagation reached a non-internal page"
            );

            let node_page_id = guard.page_id();
            let mut node = InternalNode::<K>::decode(&guard)?;
            node.remove_child(dead_child);

            if node_page_id == root_page_id {
                if node.size() == 1 {
                    // The root routes to a single child: collapse a level.
                    let mut header_guard = write_set
                        .pop_front()
                        .expect("root collapse without the header latched");
                    let mut header = HeaderNode::decode(&header_guard)?;
                    header.root_page_id = node.child_at(0);
                    header.tree_depth -= 1;
                    header.encode(&mut header_guard)?;
                    drop(header_guard);
                    drop(guard);
                    debug!("tree shrank, page {node_page_id} released");
                    let _ = self.bpm.delete_page(node_page_id);
                } else {
                    node.encode(&mut guard)?;
                }
                return Ok(());
            }

            if node.size() >= self.internal_min_size() {
                node.encode(&mut guard)?;
                return Ok(());
            }

            // Underflowed non-root internal page.
            let parent_guard = write_set
                .front_mut()
                .expect("underflowed internal page without a latched parent");
            let mut parent = InternalNode::<K>::decode(parent_guard)?;
            let idx = parent
                .child_index_of(node_page_id)
                .expect("internal page missing from its parent");

            let left_id = idx.checked_sub(1).map(|left_idx| parent.child_at(left_idx));
            let right_id = (idx + 1 < parent.size()).then(|| parent.child_at(idx + 1));
            let mut left_guard = match left_id {
                Some(id) => Some(self.bpm.fetch_page_write(id)?),
                None => None,
            };
            let mut right_guard = match right_id {
                Some(id) => Some(self.bpm.fetch_page_write(id)?),
                None => None,
            };
            let mut left = match left_guard.as_ref() {
                Some(g) => Some(InternalNode::<K>::decode(g)?),
                None => None,
            };
            let mut right = match right_guard.as_ref() {
                Some(g) => Some(InternalNode::<K>::decode(g)?),
                None => None,
            };

            let left_size = left.as_ref().map_or(0, InternalNode::size);
            let right_size = right.as_ref().map_or(0, InternalNode::size);
            let sides = if right_size >= left_size {
                [Side::Right, Side::Left]
            } else {
                [Side::Left, Side::Right]
            };
            for side in sides {
                match side {
                    Side::Right => {
                        if let Some(right) = right.as_mut() {
                            if balanced_fit(
                                right.size() + node.size(),
                                self.internal_min_size(),
                                self.internal_max_size,
                            ) {
                                let n = (right.size() + node.size()) / 2 - node.size();
                                let separator = parent.key_of_child(idx + 1).clone();
                                let new_separator = right.push_to_left(&mut node, separator, n);
                                parent.set_key_of_child(idx + 1, new_separator);
                                right.encode(right_guard.as_mut().unwrap())?;
                                node.encode(&mut guard)?;
                                parent.encode(parent_guard)?;
                                return Ok(());
                            }
                        }
                    }
                    Side::Left => {
                        if let Some(left) = left.as_mut() {
                            if balanced_fit(
                                left.size() + node.size(),
                                self.internal_min_size(),
                                self.internal_max_size,
                            ) {
                                let n = (left.size() + node.size()) / 2 - node.size();
                                let separator = parent.key_of_child(idx).clone();
                                let new_separator = left.push_to_right(&mut node, separator, n);
                                parent.set_key_of_child(idx, new_separator);
                                left.encode(left_guard.as_mut().unwrap())?;
                                node.encode(&mut guard)?;
                                parent.encode(parent_guard)?;
                                return Ok(());
                            }
                        }
                    }
                }
            }

            // Merge with a sibling, pulling the separator down.
            dead_child = if let Some(right) = right.take() {
                let right_page_id = right_id.unwrap();
                let separator = parent.key_of_child(idx + 1).clone();
                node.merge_right(right, separator);
                node.encode(&mut guard)?;
                drop(right_guard);
                drop(left_guard);
                drop(guard);
                right_page_id
            } else if let Some(mut left) = left.take() {
                let separator = parent.key_of_child(idx).clone();
                left.merge_right(node, separator);
                left.encode(left_guard.as_mut().unwrap())?;
                drop(right_guard);
                drop(left_guard);
                drop(guard);
                node_page_id
            } else {
                unreachable!("non-root internal page has no siblings")
            };
            debug!("merged internal page, dropping page {dead_child}");
            let _ = self.bpm.delete_page(dead_child);
        }
    }

    /// Walk the whole tree checking its structural invariants: uniform
    /// leaf depth, size bounds on every non-root page, ordered separator
    /// routing, and a leaf chain that visits every key in ascending
    /// order. Panics with a diagnostic on violation.
    pub fn verify_integrity(&self) -> Result<(), BTreeError> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&header_guard)?;
        drop(header_guard);

        let mut structure_keys = Vec::new();
        self.check_subtree(
            header.root_page_id,
            header.tree_depth,
            None,
            None,
            true,
            &mut structure_keys,
        )?;

        for pair in structure_keys.windows(2) {
            assert!(
                pair[0] < pair[1],
                "keys out of order: {:?} before {:?}",
                pair[0],
                pair[1]
            );
        }

        // The leaf chain must visit exactly the same keys in order.
        let mut chain_keys = Vec::new();
        let mut next = self.leftmost_leaf(header.root_page_id, header.tree_depth)?;
        while next != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page_read(next)?;
            let leaf = LeafNode::<K, V>::decode(&guard)?;
            chain_keys.extend(leaf.entries.iter().map(|(k, _)| k.clone()));
            next = leaf.next_page_id;
        }
        assert_eq!(
            structure_keys, chain_keys,
            "leaf chain disagrees with tree structure"
        );

        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        level: u32,
        lower: Option<&K>,
        upper: Option<&K>,
        is_root: bool,
        keys: &mut Vec<K>,
    ) -> Result<(), BTreeError> {
        let guard = self.bpm.fetch_page_read(page_id)?;
        if level == 1 {
            let leaf = LeafNode::<K, V>::decode(&guard)?;
            if !is_root {
                assert!(
                    leaf.size() >= leaf.min_size() && leaf.size() <= leaf.max_size(),
                    "leaf page {page_id} size {} outside [{}, {}]",
                    leaf.size(),
                    leaf.min_size(),
                    leaf.max_size()
                );
            }
            for (k, _) in &leaf.entries {
                if let Some(lower) = lower {
                    assert!(k >= lower, "leaf page {page_id} key {k:?} below bound {lower:?}");
                }
                if let Some(upper) = upper {
                    assert!(k < upper, "leaf page {page_id} key {k:?} above bound {upper:?}");
                }
                keys.push(k.clone());
            }
            return Ok(());
        }

        let node = InternalNode::<K>::decode(&guard)?;
        drop(guard);
        if is_root {
            assert!(
                node.size() >= 2,
                "internal root page {page_id} routes to a single child"
            );
        } else {
            assert!(
                node.size() >= node.min_size() && node.size() <= node.max_size(),
                "internal page {page_id} size {} outside [{}, {}]",
                node.size(),
                node.min_size(),
                node.max_size()
            );
        }

        for i in 0..node.size() {
            let child_lower = if i == 0 { lower } else { Some(node.key_of_child(i)) };
            let child_upper = if i + 1 < node.size() {
                Some(node.key_of_child(i + 1))
            } else {
                upper
            };
            if let (Some(lo), Some(hi)) = (child_lower, child_upper) {
                assert!(lo < hi, "internal page {page_id} separators out of order");
            }
            self.check_subtree(node.child_at(i), level - 1, child_lower, child_upper, false, keys)?;
        }
        Ok(())
    }

    fn leftmost_leaf(&self, root_page_id: PageId, depth: u32) -> Result<PageId, BTreeError> {
        let mut next = root_page_id;
        let mut level = depth;
        while level > 1 {
            let guard = self.bpm.fetch_page_read(next)?;
            let node = InternalNode::<K>::decode(&guard)?;
            next = node.child_at(0);
            level -= 1;
        }
        Ok(next)
    }

    /// Render the tree as rows of centred key lists, one row per level.
    pub fn draw(&self) -> Result<String, BTreeError> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let header = HeaderNode::decode(&header_guard)?;
        drop(header_guard);

        let root = self.printable(header.root_page_id, header.tree_depth)?;
        let mut out = String::new();
        let mut row: Vec<&Printable> = vec![&root];
        while !row.is_empty() {
            let mut next_row = Vec::new();
            for node in row {
                let padding = (node.width.saturating_sub(node.keys.len())) / 2;
                out.push_str(&" ".repeat(padding));
                out.push_str(&node.keys);
                out.push_str(&" ".repeat(padding));
                next_row.extend(node.children.iter());
            }
            out.push('\n');
            row = next_row;
        }
        Ok(out)
    }

    fn printable(&self, page_id: PageId, level: u32) -> Result<Printable, BTreeError> {
        let guard = self.bpm.fetch_page_read(page_id)?;
        if level == 1 {
            let leaf = LeafNode::<K, V>::decode(&guard)?;
            let keys = format_keys(leaf.entries.iter().map(|(k, _)| k));
            return Ok(Printable {
                width: keys.len() + 4,
                keys,
                children: Vec::new(),
            });
        }
        let node = InternalNode::<K>::decode(&guard)?;
        drop(guard);
        let keys = format_keys(node.entries.iter().map(|(k, _)| k));
        let mut children = Vec::with_capacity(node.size());
        let mut width = 0;
        for i in 0..node.size() {
            let child = self.printable(node.child_at(i), level - 1)?;
            width += child.width;
            children.push(child);
        }
        Ok(Printable {
            width,
            keys,
            children,
        })
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

struct Printable {
    width: usize,
    keys: String,
    children: Vec<Printable>,
}

fn format_keys<'a, K: Debug + 'a>(keys: impl Iterator<Item = &'a K>) -> String {
    let mut out = String::from("(");
    for (i, key) in keys.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{key:?}"));
    }
    out.push(')');
    out
}

/// Redistribution guard: the combined size must fill both pages to their
/// minimum and still sit comfortably below two full pages, so the shift
/// is not immediately undone by the next insert or remove.
fn balanced_fit(total: usize, min_size: usize, max_size: usize) -> bool {
    total >= 2 * min_size && total * 100 < max_size * 2 * 95
}
