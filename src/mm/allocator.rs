//! Page-run allocator for hypervisor-owned I/O pages

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::platform::{PAGE_SHIFT, PAGE_SIZE};

/// First-fit allocator handing out physically contiguous page runs from
/// a fixed region. Each run's length is remembered so `free_pages` only
/// needs the start address.
pub struct FrameAllocator {
    start: u64,
    frames: usize,
    /// One bit per frame, set = in use
    bitmap: Vec<u64>,
    /// Start address → page count of every live run
    runs: BTreeMap<u64, usize>,
    allocated: u64,
}

impl FrameAllocator {
    /// Manage `[start, start + size)`. Both are truncated to page granularity.
    ///
    /// # Safety
    /// The region must be memory the hypervisor owns and can access at
    /// the same addresses it hands out; pages are zero-filled through
    /// those addresses by their users.
    pub unsafe fn new(start: u64, size: u64) -> Self {
        let aligned = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let usable = size.saturating_sub(aligned - start);
        let frames = (usable >> PAGE_SHIFT) as usize;
        Self {
            start: aligned,
            frames,
            bitmap: vec![0; frames.div_ceil(64)],
            runs: BTreeMap::new(),
            allocated: 0,
        }
    }

    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set_used(&mut self, frame: usize, used: bool) {
        if used {
            self.bitmap[frame / 64] |= 1 << (frame % 64);
        } else {
            self.bitmap[frame / 64] &= !(1 << (frame % 64));
        }
    }

    /// Allocate `count` contiguous pages. Returns the start address.
    pub fn alloc_pages(&mut self, count: usize) -> Option<u64> {
        if count == 0 || count > self.frames {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 0..self.frames {
            if self.is_used(frame) {
                run_len = 0;
                run_start = frame + 1;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set_used(f, true);
                }
                let addr = self.start + ((run_start as u64) << PAGE_SHIFT);
                self.runs.insert(addr, count);
                self.allocated += (count as u64) << PAGE_SHIFT;
                return Some(addr);
            }
        }
        None
    }

    pub fn alloc_page(&mut self) -> Option<u64> {
        self.alloc_pages(1)
    }

    /// Free a run previously returned by `alloc_pages`.
    /// Returns false if `addr` is not the start of a live run.
    pub fn free_pages(&mut self, addr: u64) -> bool {
        let Some(count) = self.runs.remove(&addr) else {
            return false;
        };
        let first = ((addr - self.start) >> PAGE_SHIFT) as usize;
        for f in first..first + count {
            self.set_used(f, false);
        }
        self.allocated -= (count as u64) << PAGE_SHIFT;
        true
    }

    /// Bytes not currently handed out (may be fragmented).
    pub fn remaining(&self) -> u64 {
        ((self.frames as u64) << PAGE_SHIFT) - self.allocated
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}
