use std::sync::Arc;

use anyhow::Result;
use rand::prelude::*;

use tarndb::common::types::Rid;
use tarndb::index::btree::BPlusTree;

mod common;
use common::create_test_buffer_pool;

fn rid(key: i32) -> Rid {
    Rid::new(0, key as u32)
}

#[test]
fn test_insert_and_get() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 8, 8)?;

    assert!(tree.is_empty()?);
    assert!(tree.insert(42, rid(42))?);
    assert!(!tree.is_empty()?);
    assert_eq!(tree.get(&42)?, Some(rid(42)));
    assert_eq!(tree.get(&41)?, None);

    // A duplicate insert fails and leaves the stored value alone.
    assert!(!tree.insert(42, rid(999))?);
    assert_eq!(tree.get(&42)?, Some(rid(42)));
    Ok(())
}

#[test]
fn test_insert_remove_get() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 4, 4)?;

    for key in 1..=20 {
        assert!(tree.insert(key, rid(key))?);
    }
    for key in 1..=20 {
        assert_eq!(tree.get(&key)?, Some(rid(key)));
    }

    for key in (1..=20).step_by(2) {
        tree.remove(&key)?;
    }
    for key in 1..=20 {
        let expected = if key % 2 == 0 { Some(rid(key)) } else { None };
        assert_eq!(tree.get(&key)?, expected);
    }

    // Removing an absent key is a silent no-op.
    tree.remove(&1)?;
    tree.remove(&1000)?;
    tree.verify_integrity()?;
    Ok(())
}

// Small fan-out forces splits on insert and merges on remove; the tree
// must stay balanced with every leaf at the same depth.
#[test]
fn test_split_and_merge_shapes() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(50, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 3, 3)?;

    for key in 1..=13 {
        assert!(tree.insert(key, rid(key))?);
        tree.verify_integrity()?;
    }

    let picture = tree.draw()?;
    assert!(picture.lines().count() >= 2, "tree should have split:\n{picture}");

    let keys: Vec<i32> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, (1..=13).collect::<Vec<_>>());

    // Peeling keys off the right edge forces merges or redistributions.
    for key in [13, 12, 11] {
        tree.remove(&key)?;
        tree.verify_integrity()?;
    }
    let keys: Vec<i32> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_random_order_inserts_and_removes() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 6, 6)?;

    let mut keys: Vec<i32> = (0..300).collect();
    let mut rng = rand::thread_rng();
    keys.shuffle(&mut rng);
    for &key in &keys {
        assert!(tree.insert(key, rid(key))?);
    }
    tree.verify_integrity()?;

    keys.shuffle(&mut rng);
    for &key in keys.iter().take(150) {
        tree.remove(&key)?;
    }
    tree.verify_integrity()?;

    let expected: Vec<i32> = {
        let mut remaining: Vec<i32> = keys.iter().skip(150).copied().collect();
        remaining.sort_unstable();
        remaining
    };
    let scanned: Vec<i32> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn test_iterator_scans_in_order() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 16, 16)?;

    let mut keys: Vec<i32> = (0..500).collect();
    keys.shuffle(&mut rand::thread_rng());
    for &key in &keys {
        tree.insert(key, rid(key))?;
    }

    let scanned: Vec<(i32, Rid)> = tree.iter()?.collect();
    assert_eq!(scanned.len(), 500);
    for (i, (key, value)) in scanned.iter().enumerate() {
        assert_eq!(*key, i as i32);
        assert_eq!(*value, rid(i as i32));
    }
    Ok(())
}

// Iterating from a mid-range key yields exactly the upper half in
// order, then reports the end.
#[test]
fn test_iterator_from_key() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 16, 16)?;

    for key in 0..1000 {
        tree.insert(key, rid(key))?;
    }

    let mut iter = tree.iter_from(&500)?;
    for expected in 500..1000 {
        assert_eq!(iter.next().map(|(k, _)| k), Some(expected));
    }
    assert_eq!(iter.next(), None);
    assert!(iter.is_end());

    // Starting past every key is immediately exhausted.
    let mut iter = tree.iter_from(&1000)?;
    assert_eq!(iter.next(), None);
    Ok(())
}

// A tree handle can be dropped and re-attached through its header page.
#[test]
fn test_reopen_by_header_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(Arc::clone(&buffer_pool), 8, 8)?;
    for key in 0..50 {
        tree.insert(key, rid(key))?;
    }
    let header_page_id = tree.header_page_id();
    drop(tree);

    let reopened = BPlusTree::<i32, Rid>::open(buffer_pool, header_page_id, 8, 8);
    assert_eq!(reopened.get(&25)?, Some(rid(25)));
    reopened.verify_integrity()?;
    Ok(())
}

#[test]
fn test_drain_to_empty_and_reuse() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(50, 2)?;
    let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 3, 3)?;

    for key in 0..50 {
        tree.insert(key, rid(key))?;
    }
    for key in 0..50 {
        tree.remove(&key)?;
    }
    tree.verify_integrity()?;
    assert!(tree.is_empty()?);
    assert_eq!(tree.iter()?.count(), 0);

    // The drained tree keeps working.
    for key in 0..20 {
        assert!(tree.insert(key, rid(key))?);
    }
    tree.verify_integrity()?;
    assert_eq!(tree.iter()?.count(), 20);
    Ok(())
}
