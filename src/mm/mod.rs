//! Memory management subsystem

pub mod allocator;
pub mod stage2;

pub use allocator::FrameAllocator;
pub use stage2::{AddressSpace, MapFlags, Stage2Space};

use spin::Mutex;

/// Host page allocator consumed by the aperture.
pub trait PageAllocator: Send + Sync {
    /// Allocate `count` physically contiguous pages. Returns the host
    /// address of the first page; the hypervisor accesses the pages at
    /// that address.
    fn alloc_pages(&self, count: usize) -> Option<u64>;

    /// Free a run returned by `alloc_pages`.
    fn free_pages(&self, addr: u64);
}

impl PageAllocator for Mutex<FrameAllocator> {
    fn alloc_pages(&self, count: usize) -> Option<u64> {
        self.lock().alloc_pages(count)
    }

    fn free_pages(&self, addr: u64) {
        if !self.lock().free_pages(addr) {
            log::warn!("[MM] free of unknown page run {:#x}", addr);
        }
    }
}
