//! Virtual interrupt lines for emulated devices
//!
//! Each virtio device owns one SPI taken from a per-VM pool. The device
//! layer only needs three things from the interrupt subsystem: get a free
//! line, give it back, and mark it pending for the vCPU run loop to
//! inject through the list registers.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Guest virtual interrupt allocator.
pub trait VirqAllocator: Send + Sync {
    /// Allocate a free line. Never returns 0 (0 means "unassigned").
    fn alloc_virq(&self) -> Option<u32>;

    /// Return a line to the pool.
    fn release_virq(&self, irq: u32);

    /// Mark a line pending for injection into the guest.
    fn inject_virq(&self, irq: u32);
}

/// Bitmap pool of SPI INTIDs `[first, first + count)`, at most 64 lines.
pub struct VirqPool {
    first: u32,
    count: u32,
    used: Mutex<u64>,
    /// Bit N = INTID `first + N` is pending
    pending: AtomicU64,
}

impl VirqPool {
    pub fn new(first: u32, count: u32) -> Self {
        // INTID 0 doubles as "no interrupt", never hand it out.
        let first = first.max(1);
        Self {
            first,
            count: count.min(64),
            used: Mutex::new(0),
            pending: AtomicU64::new(0),
        }
    }

    fn bit(&self, irq: u32) -> Option<u64> {
        if irq >= self.first && irq < self.first + self.count {
            Some(1 << (irq - self.first))
        } else {
            None
        }
    }

    pub fn in_use(&self, irq: u32) -> bool {
        self.bit(irq).is_some_and(|b| *self.used.lock() & b != 0)
    }

    pub fn free_count(&self) -> u32 {
        self.count - self.used.lock().count_ones()
    }

    /// Drain pending INTIDs (called by the run loop before guest entry).
    /// Returns a bitmask relative to `first()`.
    pub fn take_pending(&self) -> u64 {
        self.pending.swap(0, Ordering::Acquire)
    }

    pub fn first(&self) -> u32 {
        self.first
    }
}

impl VirqAllocator for VirqPool {
    fn alloc_virq(&self) -> Option<u32> {
        let mut used = self.used.lock();
        let free = !*used;
        let idx = free.trailing_zeros();
        if idx >= self.count {
            return None;
        }
        *used |= 1 << idx;
        Some(self.first + idx)
    }

    fn release_virq(&self, irq: u32) {
        match self.bit(irq) {
            Some(b) => {
                *self.used.lock() &= !b;
                self.pending.fetch_and(!b, Ordering::Release);
            }
            None => log::warn!("[VIRQ] release of foreign irq {}", irq),
        }
    }

    fn inject_virq(&self, irq: u32) {
        if let Some(b) = self.bit(irq) {
            self.pending.fetch_or(b, Ordering::Release);
        }
    }
}
