use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::index::btree::error::BTreeError;

// Every tree page starts with a one-byte page kind. Header pages follow
// with root id and depth; internal and leaf pages follow with:
// - size: u16 (2 bytes)
// - max_size: u16 (2 bytes)
// - first_child / next_leaf: u32 (4 bytes)
// - payload length: u32 (4 bytes)
// - bincode-encoded entry array
const KIND_HEADER: u8 = 1;
const KIND_INTERNAL: u8 = 2;
const KIND_LEAF: u8 = 3;

const NODE_HEADER_SIZE: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Header,
    Internal,
    Leaf,
}

/// Read the page-kind tag without decoding the whole page.
pub fn page_kind(page: &Page) -> Result<PageKind, BTreeError> {
    match page.data[0] {
        KIND_HEADER => Ok(PageKind::Header),
        KIND_INTERNAL => Ok(PageKind::Internal),
        KIND_LEAF => Ok(PageKind::Leaf),
        other => Err(BTreeError::Corrupted(format!(
            "unknown page kind {other} on page {}",
            page.page_id
        ))),
    }
}

fn check_kind(page: &Page, expected: PageKind) -> Result<(), BTreeError> {
    let kind = page_kind(page)?;
    if kind != expected {
        return Err(BTreeError::Corrupted(format!(
            "page {} holds a {kind:?} page where a {expected:?} page was expected",
            page.page_id
        )));
    }
    Ok(())
}

/// The tree's single header page: location of the root plus tree depth
/// (1 = the root is a leaf).
#[derive(Debug, Clone)]
pub struct HeaderNode {
    pub root_page_id: PageId,
    pub tree_depth: u32,
}

impl HeaderNode {
    pub fn decode(page: &Page) -> Result<Self, BTreeError> {
        check_kind(page, PageKind::Header)?;
        Ok(Self {
            root_page_id: LittleEndian::read_u32(&page.data[1..5]),
            tree_depth: LittleEndian::read_u32(&page.data[5..9]),
        })
    }

    pub fn encode(&self, page: &mut Page) -> Result<(), BTreeError> {
        page.data[0] = KIND_HEADER;
        LittleEndian::write_u32(&mut page.data[1..5], self.root_page_id);
        LittleEndian::write_u32(&mut page.data[5..9], self.tree_depth);
        Ok(())
    }
}

fn encode_entries<T: Serialize>(
    kind: u8,
    size: usize,
    max_size: usize,
    extra: u32,
    entries: &T,
    page: &mut Page,
) -> Result<(), BTreeError> {
    let payload = bincode::serialize(entries)
        .map_err(|e| BTreeError::Corrupted(format!("entry serialization failed: {e}")))?;
    if NODE_HEADER_SIZE + payload.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }
    page.data[0] = kind;
    LittleEndian::write_u16(&mut page.data[1..3], size as u16);
    LittleEndian::write_u16(&mut page.data[3..5], max_size as u16);
    LittleEndian::write_u32(&mut page.data[5..9], extra);
    LittleEndian::write_u32(&mut page.data[9..13], payload.len() as u32);
    page.data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
    Ok(())
}

fn decode_entries<T: DeserializeOwned>(page: &Page) -> Result<(usize, usize, u32, T), BTreeError> {
    let size = LittleEndian::read_u16(&page.data[1..3]) as usize;
    let max_size = LittleEndian::read_u16(&page.data[3..5]) as usize;
    let extra = LittleEndian::read_u32(&page.data[5..9]);
    let payload_len = LittleEndian::read_u32(&page.data[9..13]) as usize;
    if NODE_HEADER_SIZE + payload_len > PAGE_SIZE {
        return Err(BTreeError::Corrupted(format!(
            "payload length {payload_len} overflows page {}",
            page.page_id
        )));
    }
    let entries =
        bincode::deserialize(&page.data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload_len])
            .map_err(|e| BTreeError::Corrupted(format!("entry deserialization failed: {e}")))?;
    Ok((size, max_size, extra, entries))
}

/// Internal page: a leftmost child pointer plus sorted (key, child)
/// pairs. Each entry's child subtree holds keys greater than or equal to
/// the entry key and less than the next entry key. Keeping the leftmost
/// child outside the entry array means the "minus infinity" first key of
/// the classic layout never exists as a comparable value.
#[derive(Debug, Clone)]
pub struct InternalNode<K> {
    max_size: usize,
    pub first_child: PageId,
    pub entries: Vec<(K, PageId)>,
}

impl<K> InternalNode<K>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
{
    pub fn new_root(max_size: usize, left_child: PageId, key: K, right_child: PageId) -> Self {
        Self {
            max_size,
            first_child: left_child,
            entries: vec![(key, right_child)],
        }
    }

    pub fn decode(page: &Page) -> Result<Self, BTreeError> {
        check_kind(page, PageKind::Internal)?;
        let (size, max_size, first_child, entries) = decode_entries::<Vec<(K, PageId)>>(page)?;
        if size != entries.len() + 1 {
            return Err(BTreeError::Corrupted(format!(
                "internal page {} header size {size} does not match {} entries",
                page.page_id,
                entries.len()
            )));
        }
        Ok(Self {
            max_size,
            first_child,
            entries,
        })
    }

    pub fn encode(&self, page: &mut Page) -> Result<(), BTreeError> {
        encode_entries(
            KIND_INTERNAL,
            self.size(),
            self.max_size,
            self.first_child,
            &self.entries,
            page,
        )
    }

    /// Number of children (entries plus the leftmost child).
    pub fn size(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn min_size(&self) -> usize {
        (self.max_size + 1) / 2
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.max_size
    }

    pub fn over_half_full(&self) -> bool {
        self.size() > self.min_size()
    }

    /// The child to follow when searching for `key`.
    pub fn child_for(&self, key: &K) -> PageId {
        let idx = self.entries.partition_point(|(k, _)| k <= key);
        if idx == 0 {
            self.first_child
        } else {
            self.entries[idx - 1].1
        }
    }

    pub fn child_at(&self, index: usize) -> PageId {
        if index == 0 {
            self.first_child
        } else {
            self.entries[index - 1].1
        }
    }

    /// Separator key guarding the child at `index` (index >= 1).
    pub fn key_of_child(&self, index: usize) -> &K {
        assert!(index >= 1, "the leftmost child has no separator key");
        &self.entries[index - 1].0
    }

    pub fn set_key_of_child(&mut self, index: usize, key: K) {
        assert!(index >= 1, "the leftmost child has no separator key");
        self.entries[index - 1].0 = key;
    }

    /// Position of a child page within this node, if present.
    pub fn child_index_of(&self, page_id: PageId) -> Option<usize> {
        if self.first_child == page_id {
            return Some(0);
        }
        self.entries
            .iter()
            .position(|&(_, child)| child == page_id)
            .map(|i| i + 1)
    }

    /// Insert a (separator, child) pair produced by a child split.
    pub fn insert_child(&mut self, key: K, child: PageId) {
        let idx = self.entries.partition_point(|(k, _)| k < &key);
        self.entries.insert(idx, (key, child));
    }

    /// Remove the entry routing to the given (merged-away) child.
    pub fn remove_child(&mut self, page_id: PageId) {
        let idx = self
            .entries
            .iter()
            .position(|&(_, child)| child == page_id)
            .expect("merged child missing from its parent");
        self.entries.remove(idx);
    }

    /// Split an overflowed node in half. Returns the promoted middle key
    /// and the new right sibling; the promoted key is not kept in either
    /// half.
    pub fn split(&mut self) -> (K, Self) {
        let keep = (self.size() + 1) / 2;
        let mut rest = self.entries.split_off(keep - 1);
        let (promote, right_first) = {
            let (k, c) = rest.remove(0);
            (k, c)
        };
        (
            promote,
            Self {
                max_size: self.max_size,
                first_child: right_first,
                entries: rest,
            },
        )
    }

    /// Move this node's first `n` children to the back of its left
    /// sibling, rotating the separator. Returns the new separator key
    /// for this node.
    pub fn push_to_left(&mut self, left: &mut Self, separator: K, n: usize) -> K {
        let mut sep = separator;
        for _ in 0..n {
            left.entries.push((sep, self.first_child));
            let (k, c) = self.entries.remove(0);
            sep = k;
            self.first_child = c;
        }
        sep
    }

    /// Move this node's last `n` children to the front of its right
    /// sibling, rotating the separator. Returns the new separator key
    /// for the right sibling.
    pub fn push_to_right(&mut self, right: &mut Self, separator: K, n: usize) -> K {
        let mut sep = separator;
        for _ in 0..n {
            right.entries.insert(0, (sep, right.first_child));
            let (k, c) = self.entries.pop().expect("push_to_right from empty node");
            sep = k;
            right.first_child = c;
        }
        sep
    }

    /// Absorb the right sibling, pulling the separator down as the
    /// connecting key.
    pub fn merge_right(&mut self, right: Self, separator: K) {
        self.entries.push((separator, right.first_child));
        self.entries.extend(right.entries);
    }
}

/// Leaf page: sorted (key, value) pairs plus the next-leaf link that
/// threads all leaves left to right.
#[derive(Debug, Clone)]
pub struct LeafNode<K, V> {
    max_size: usize,
    pub next_page_id: PageId,
    pub entries: Vec<(K, V)>,
}

impl<K, V> LeafNode<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            next_page_id: INVALID_PAGE_ID,
            entries: Vec::new(),
        }
    }

    pub fn decode(page: &Page) -> Result<Self, BTreeError> {
        check_kind(page, PageKind::Leaf)?;
        let (size, max_size, next_page_id, entries) = decode_entries::<Vec<(K, V)>>(page)?;
        if size != entries.len() {
            return Err(BTreeError::Corrupted(format!(
                "leaf page {} header size {size} does not match {} entries",
                page.page_id,
                entries.len()
            )));
        }
        Ok(Self {
            max_size,
            next_page_id,
            entries,
        })
    }

    pub fn encode(&self, page: &mut Page) -> Result<(), BTreeError> {
        encode_entries(
            KIND_LEAF,
            self.size(),
            self.max_size,
            self.next_page_id,
            &self.entries,
            page,
        )
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn min_size(&self) -> usize {
        (self.max_size + 1) / 2
    }

    pub fn over_half_full(&self) -> bool {
        self.size() > self.min_size()
    }

    /// First index whose key is not less than `key`.
    pub fn lower_bound(&self, key: &K) -> usize {
        self.entries.partition_point(|(k, _)| k < key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.binary_search_by(|(k, _)| k.cmp(key)).is_ok()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Insert a key that is not already present.
    pub fn insert(&mut self, key: K, value: V) {
        let idx = self.lower_bound(&key);
        self.entries.insert(idx, (key, value));
    }

    /// Remove a key, reporting whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => {
                self.entries.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    pub fn first_key(&self) -> &K {
        &self.entries.first().expect("empty leaf has no first key").0
    }

    /// Split an overflowed leaf in half. Returns the split key (the new
    /// right sibling's first key) and the right sibling. The caller
    /// links the sibling into the next-leaf chain.
    pub fn split(&mut self) -> (K, Self) {
        let mid = (self.entries.len() + 1) / 2;
        let right_entries = self.entries.split_off(mid);
        let split_key = right_entries[0].0.clone();
        (
            split_key,
            Self {
                max_size: self.max_size,
                next_page_id: INVALID_PAGE_ID,
                entries: right_entries,
            },
        )
    }

    /// Move this leaf's first `n` entries to the back of its left
    /// sibling.
    pub fn push_to_left(&mut self, left: &mut Self, n: usize) {
        left.entries.extend(self.entries.drain(..n));
    }

    /// Move this leaf's last `n` entries to the front of its right
    /// sibling.
    pub fn push_to_right(&mut self, right: &mut Self, n: usize) {
        let start = self.entries.len() - n;
        let moved: Vec<(K, V)> = self.entries.split_off(start);
        right.entries.splice(0..0, moved);
    }

    /// Absorb the right sibling, taking over its next-leaf link.
    pub fn merge_right(&mut self, right: Self) {
        self.entries.extend(right.entries);
        self.next_page_id = right.next_page_id;
    }
}
