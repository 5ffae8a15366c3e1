use std::sync::Arc;
use std::thread;

use anyhow::Result;

use tarndb::common::types::Rid;
use tarndb::index::btree::BPlusTree;

mod common;
use common::create_test_buffer_pool;

fn rid(key: i32) -> Rid {
    Rid::new(0, key as u32)
}

// Two threads insert interleaved odd and even key ranges; the final
// scan must contain every key exactly once with the tree intact.
#[test]
fn test_concurrent_interleaved_inserts() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(50, 2)?;
    let tree = Arc::new(BPlusTree::<i32, Rid>::new(buffer_pool, 4, 5)?);

    let evens = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in (2..=200).step_by(2) {
                tree.insert(key, rid(key)).unwrap();
            }
        })
    };
    let odds = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in (1..=199).step_by(2) {
                tree.insert(key, rid(key)).unwrap();
            }
        })
    };
    evens.join().unwrap();
    odds.join().unwrap();

    tree.verify_integrity()?;
    let keys: Vec<i32> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, (1..=200).collect::<Vec<_>>());
    Ok(())
}

// Threads operating on disjoint key ranges must end in the same state
// as any sequential interleaving of the same operations.
#[test]
fn test_concurrent_disjoint_ranges() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64, 2)?;
    let tree = Arc::new(BPlusTree::<i32, Rid>::new(buffer_pool, 6, 6)?);

    let mut handles = Vec::new();
    for t in 0..4 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            let base = t * 100;
            for key in base..base + 100 {
                tree.insert(key, rid(key)).unwrap();
            }
            // Remove the lower half of the range again.
            for key in base..base + 50 {
                tree.remove(&key).unwrap();
            }
            for key in base + 50..base + 100 {
                assert_eq!(tree.get(&key).unwrap(), Some(rid(key)));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    tree.verify_integrity()?;
    let keys: Vec<i32> = tree.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i32> = (0..4)
        .flat_map(|t| (t * 100 + 50)..(t * 100 + 100))
        .collect();
    assert_eq!(keys, expected);
    Ok(())
}

// Readers run against a writer without tearing: every lookup sees
// either the value or nothing, never an error.
#[test]
fn test_concurrent_readers_and_writer() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64, 2)?;
    let tree = Arc::new(BPlusTree::<i32, Rid>::new(buffer_pool, 8, 8)?);

    for key in 0..200 {
        tree.insert(key, rid(key))?;
    }

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in 200..400 {
                tree.insert(key, rid(key)).unwrap();
            }
        })
    };
    let mut readers = Vec::new();
    for _ in 0..3 {
        let tree = Arc::clone(&tree);
        readers.push(thread::spawn(move || {
            for key in 0..200 {
                assert_eq!(tree.get(&key).unwrap(), Some(rid(key)));
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    tree.verify_integrity()?;
    assert_eq!(tree.iter()?.count(), 400);
    Ok(())
}
