use tarndb::common::types::AccessType;
use tarndb::storage::buffer::LruKReplacer;

// Walk the replacer through the classic mixed sequence: cold frames go
// first in access order, hot frames last by K-th-recent access.
#[test]
fn test_eviction_sequence() {
    let replacer = LruKReplacer::new(7, 2);

    for frame in [1, 2, 3, 4, 5] {
        replacer.record_access(frame, AccessType::Point);
    }
    // Frame 1 reaches K accesses and turns hot.
    replacer.record_access(1, AccessType::Point);

    for frame in [1, 2, 3, 4, 5] {
        replacer.set_evictable(frame, true);
    }
    assert_eq!(replacer.size(), 5);

    // Frames 2..5 have fewer than K accesses: infinite backward
    // distance, evicted in access order, all before hot frame 1.
    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.evict(), Some(3));
    assert_eq!(replacer.evict(), Some(4));
    assert_eq!(replacer.size(), 2);

    assert_eq!(replacer.evict(), Some(5));
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), None);
    assert_eq!(replacer.size(), 0);
}

#[test]
fn test_eviction_respects_pins() {
    let replacer = LruKReplacer::new(4, 2);

    for frame in [1, 2, 3] {
        replacer.record_access(frame, AccessType::Point);
    }
    replacer.set_evictable(2, true);

    // Only frame 2 is evictable.
    assert_eq!(replacer.size(), 1);
    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.evict(), None);

    // Unpinning the rest makes them candidates again.
    replacer.set_evictable(1, true);
    replacer.set_evictable(3, true);
    assert_eq!(replacer.size(), 2);
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), Some(3));
}

#[test]
fn test_scan_accesses_are_preferred_victims_over_hot() {
    let replacer = LruKReplacer::new(4, 2);

    // Frame 1: hot. Frame 2: touched once by a scan. Frame 3: touched
    // once by a point lookup.
    replacer.record_access(1, AccessType::Point);
    replacer.record_access(1, AccessType::Point);
    replacer.record_access(2, AccessType::Scan);
    replacer.record_access(3, AccessType::Point);

    for frame in [1, 2, 3] {
        replacer.set_evictable(frame, true);
    }

    // Cold point frame, then the scan frame, then the hot frame.
    assert_eq!(replacer.evict(), Some(3));
    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.evict(), Some(1));
}

#[test]
fn test_size_is_evictable_count() {
    let replacer = LruKReplacer::new(8, 3);
    assert_eq!(replacer.size(), 0);

    for frame in 1..=4 {
        replacer.record_access(frame, AccessType::Point);
    }
    assert_eq!(replacer.size(), 0);

    replacer.set_evictable(1, true);
    replacer.set_evictable(2, true);
    assert_eq!(replacer.size(), 2);

    replacer.remove(1);
    assert_eq!(replacer.size(), 1);

    replacer.set_evictable(2, false);
    assert_eq!(replacer.size(), 0);
    assert_eq!(replacer.evict(), None);
}
