//! Page-run allocator tests
//!
//! FrameAllocator never touches the memory it manages, so these tests
//! run it over a made-up physical region.

use hypervisor_virtio::mm::{FrameAllocator, PageAllocator};
use hypervisor_virtio::platform::PAGE_SIZE;

const BASE: u64 = 0x4000_0000;

fn allocator(pages: u64) -> FrameAllocator {
    unsafe { FrameAllocator::new(BASE, pages * PAGE_SIZE) }
}

#[test]
fn allocates_contiguous_runs() {
    let mut fa = allocator(16);
    assert_eq!(fa.remaining(), 16 * PAGE_SIZE);

    // Test 1: runs come out back to back
    let a = fa.alloc_pages(3).unwrap();
    let b = fa.alloc_pages(2).unwrap();
    let c = fa.alloc_page().unwrap();
    assert_eq!(a, BASE);
    assert_eq!(b, BASE + 3 * PAGE_SIZE);
    assert_eq!(c, BASE + 5 * PAGE_SIZE);
    assert_eq!(fa.allocated(), 6 * PAGE_SIZE);
    assert_eq!(fa.remaining(), 10 * PAGE_SIZE);
}

#[test]
fn free_reuses_first_fit() {
    let mut fa = allocator(8);
    let a = fa.alloc_pages(2).unwrap();
    let _b = fa.alloc_pages(2).unwrap();
    let _c = fa.alloc_pages(2).unwrap();

    assert!(fa.free_pages(a));

    // Test 1: a 3-page run does not fit the 2-page hole
    let d = fa.alloc_pages(3);
    assert_eq!(d, None);

    // Test 2: a 2-page run reuses it
    assert_eq!(fa.alloc_pages(2), Some(a));
}

#[test]
fn rejects_unknown_and_double_free() {
    let mut fa = allocator(4);
    let a = fa.alloc_pages(2).unwrap();

    assert!(!fa.free_pages(a + PAGE_SIZE));
    assert!(fa.free_pages(a));
    assert!(!fa.free_pages(a));
    assert_eq!(fa.allocated(), 0);
}

#[test]
fn exhaustion_and_zero_count() {
    let mut fa = allocator(4);
    assert_eq!(fa.alloc_pages(0), None);
    assert_eq!(fa.alloc_pages(5), None);
    assert!(fa.alloc_pages(4).is_some());
    assert_eq!(fa.alloc_page(), None);
}

#[test]
fn unaligned_region_is_trimmed() {
    let fa = unsafe { FrameAllocator::new(BASE + 0x10, 4 * PAGE_SIZE) };
    assert_eq!(fa.start(), BASE + PAGE_SIZE);
    assert_eq!(fa.remaining(), 3 * PAGE_SIZE);
}

#[test]
fn spin_mutex_wrapper_implements_page_allocator() {
    let pages = spin::Mutex::new(allocator(4));
    let alloc: &dyn PageAllocator = &pages;

    let a = alloc.alloc_pages(2).unwrap();
    assert_eq!(pages.lock().allocated(), 2 * PAGE_SIZE);
    alloc.free_pages(a);
    assert_eq!(pages.lock().allocated(), 0);
}
