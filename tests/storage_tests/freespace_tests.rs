//! Free-Space Bitmap Tests
//!
//! Tests verify:
//! - Region geometry (bitmap page positions, data page location)
//! - Allocation order, exhaustion and reuse after free
//! - Double free detection
//! - Allocation across a region boundary

use pagekv::storage::freespace::{self, FreeSpaceMap};
use pagekv::storage::{PageNo, PAGES_PER_REGION, PAGE_SIZE};
use pagekv::PageKvError;

// =============================================================================
// Helper Functions
// =============================================================================

fn formatted_buffer(page_count: u32) -> Vec<u8> {
    let mut buf = vec![0u8; page_count as usize * PAGE_SIZE];
    FreeSpaceMap::format_regions(&mut buf, 0, freespace::region_count(page_count)).unwrap();
    buf
}

// =============================================================================
// Geometry Tests
// =============================================================================

#[test]
fn test_bitmap_page_positions() {
    assert_eq!(freespace::bitmap_page(0), 1);
    assert_eq!(freespace::bitmap_page(1), 1 + PAGES_PER_REGION);
}

#[test]
fn test_locate_skips_header_and_bitmap_pages() {
    assert_eq!(freespace::locate(0), None);
    assert_eq!(freespace::locate(1), None);
    assert_eq!(freespace::locate(2), Some((0, 0)));
    assert_eq!(freespace::locate(freespace::bitmap_page(1)), None);
    assert_eq!(freespace::locate(freespace::bitmap_page(1) + 1), Some((1, 0)));
}

#[test]
fn test_region_count() {
    assert_eq!(freespace::region_count(1), 0);
    assert_eq!(freespace::region_count(3), 1);
    assert_eq!(freespace::region_count(1 + PAGES_PER_REGION), 1);
    assert_eq!(freespace::region_count(2 + PAGES_PER_REGION), 2);
}

#[test]
fn test_verify_regions_detects_bad_magic() {
    let mut buf = formatted_buffer(8);
    FreeSpaceMap::verify_regions(&buf, 8).unwrap();

    buf[PAGE_SIZE] ^= 0xFF;
    let err = FreeSpaceMap::verify_regions(&buf, 8).unwrap_err();
    assert!(matches!(err, PageKvError::InvalidFile(_)));
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_allocate_in_page_order() {
    let mut buf = formatted_buffer(8);
    let map = FreeSpaceMap::new();

    let pages: Vec<PageNo> = (0..6)
        .map(|_| map.allocate(&mut buf, 8).unwrap().unwrap())
        .collect();
    assert_eq!(pages, vec![2, 3, 4, 5, 6, 7]);

    // exhausted
    assert_eq!(map.allocate(&mut buf, 8).unwrap(), None);
    assert_eq!(FreeSpaceMap::free_count(&buf, 8).unwrap(), 0);
}

#[test]
fn test_freed_page_is_reused() {
    let mut buf = formatted_buffer(8);
    let map = FreeSpaceMap::new();
    for _ in 0..6 {
        map.allocate(&mut buf, 8).unwrap();
    }

    map.free(&mut buf, 4).unwrap();
    assert!(!FreeSpaceMap::is_used(&buf, 4).unwrap());
    assert_eq!(map.allocate(&mut buf, 8).unwrap(), Some(4));
    assert!(FreeSpaceMap::is_used(&buf, 4).unwrap());
}

#[test]
fn test_scan_wraps_to_earlier_free_pages() {
    let mut buf = formatted_buffer(40);
    let map = FreeSpaceMap::new();
    for _ in 0..30 {
        map.allocate(&mut buf, 40).unwrap();
    }
    map.free(&mut buf, 3).unwrap();

    // the cursor sits past page 3; the next free pages are found first
    let next = map.allocate(&mut buf, 40).unwrap().unwrap();
    assert_eq!(next, 32);
    for _ in 0..7 {
        map.allocate(&mut buf, 40).unwrap().unwrap();
    }
    // only page 3 remains
    assert_eq!(map.allocate(&mut buf, 40).unwrap(), Some(3));
    assert_eq!(map.allocate(&mut buf, 40).unwrap(), None);
}

#[test]
fn test_used_pages_lists_allocations() {
    let mut buf = formatted_buffer(10);
    let map = FreeSpaceMap::new();
    for _ in 0..4 {
        map.allocate(&mut buf, 10).unwrap();
    }
    map.free(&mut buf, 3).unwrap();

    assert_eq!(FreeSpaceMap::used_pages(&buf, 10).unwrap(), vec![2, 4, 5]);
    assert_eq!(FreeSpaceMap::free_count(&buf, 10).unwrap(), 5);
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_double_free_is_detected() {
    let mut buf = formatted_buffer(8);
    let map = FreeSpaceMap::new();
    let page = map.allocate(&mut buf, 8).unwrap().unwrap();

    map.free(&mut buf, page).unwrap();
    let err = map.free(&mut buf, page).unwrap_err();
    assert!(matches!(err, PageKvError::DoubleFree { page: p } if p == page));
    assert!(err.is_fatal());
}

#[test]
fn test_free_of_bitmap_page_is_rejected() {
    let mut buf = formatted_buffer(8);
    let map = FreeSpaceMap::new();
    assert!(map.free(&mut buf, 1).is_err());
    assert!(map.free(&mut buf, 0).is_err());
    assert!(!FreeSpaceMap::is_used(&buf, 1).unwrap());
}

// =============================================================================
// Region Boundary Tests
// =============================================================================

#[test]
fn test_allocation_crosses_into_second_region() {
    let page_count = PAGES_PER_REGION + 4;
    let mut buf = formatted_buffer(page_count);
    let map = FreeSpaceMap::new();

    let first_region_pages = PAGES_PER_REGION - 1;
    for _ in 0..first_region_pages {
        map.allocate(&mut buf, page_count).unwrap().unwrap();
    }

    let next = map.allocate(&mut buf, page_count).unwrap().unwrap();
    assert_eq!(next, freespace::bitmap_page(1) + 1);
    assert_eq!(freespace::locate(next), Some((1, 0)));
}
