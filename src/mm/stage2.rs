//! Stage-2 address spaces
//!
//! The virtio aperture is mapped twice: read-only into the guest's
//! Stage-2 so register reads pass through and writes fault, and
//! read-write into the backend VM's Stage-2 so the backend can see the
//! same registers. [`AddressSpace`] is the interface both sides are
//! driven through; [`Stage2Space`] is a software implementation that
//! records mappings instead of writing hardware descriptors.

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::MapError;
use crate::platform::PAGE_SIZE;

bitflags! {
    /// Stage-2 mapping permissions and memory type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Device memory (no speculation, no caching)
        const IO      = 1 << 3;
    }
}

impl MapFlags {
    /// Guest view of the aperture: reads pass through, writes trap.
    pub const IO_RO: Self = Self::READ.union(Self::IO);
    /// Backend view of the aperture.
    pub const IO_RW: Self = Self::READ.union(Self::WRITE).union(Self::IO);
}

/// Guest-physical address space of one VM, as seen by the aperture
/// allocator.
pub trait AddressSpace: Send + Sync {
    /// Reserve `size` bytes of guest-physical I/O space. Returns the base IPA.
    fn reserve_io_range(&self, size: u64) -> Option<u64>;

    /// Give back a range obtained from `reserve_io_range`.
    fn release_io_range(&self, base: u64, size: u64);

    /// Map `[ipa, ipa + size)` to host physical `pa` with `flags`.
    fn map(&self, ipa: u64, pa: u64, size: u64, flags: MapFlags) -> Result<(), MapError>;

    /// Remove a mapping established by `map`.
    fn unmap(&self, ipa: u64, size: u64);
}

#[derive(Debug, Clone, Copy)]
struct Stage2Mapping {
    pa: u64,
    size: u64,
    flags: MapFlags,
}

struct Stage2Inner {
    io_base: u64,
    io_end: u64,
    /// Bump pointer for fresh reservations
    next: u64,
    /// Released holes by base, coalesced, reused first-fit
    holes: BTreeMap<u64, u64>,
    mappings: BTreeMap<u64, Stage2Mapping>,
}

impl Stage2Inner {
    fn overlaps(&self, ipa: u64, size: u64) -> bool {
        let end = ipa + size;
        // Only the closest mapping below `end` can overlap.
        self.mappings
            .range(..end)
            .next_back()
            .is_some_and(|(&base, m)| base + m.size > ipa)
    }
}

/// Software Stage-2 table for one VM.
pub struct Stage2Space {
    inner: Mutex<Stage2Inner>,
}

impl Stage2Space {
    /// Create an address space whose I/O reservations come from
    /// `[io_base, io_base + io_size)`.
    pub fn new(io_base: u64, io_size: u64) -> Self {
        Self {
            inner: Mutex::new(Stage2Inner {
                io_base,
                io_end: io_base + io_size,
                next: io_base,
                holes: BTreeMap::new(),
                mappings: BTreeMap::new(),
            }),
        }
    }

    /// Translate a guest IPA. Returns the host physical address and the
    /// permissions of the mapping that covers it.
    pub fn translate(&self, ipa: u64) -> Option<(u64, MapFlags)> {
        let inner = self.inner.lock();
        let (&base, m) = inner.mappings.range(..=ipa).next_back()?;
        if ipa < base + m.size {
            Some((m.pa + (ipa - base), m.flags))
        } else {
            None
        }
    }

    pub fn mapping_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// Bytes of the I/O window not reserved.
    pub fn io_available(&self) -> u64 {
        let inner = self.inner.lock();
        let holes: u64 = inner.holes.values().sum();
        (inner.io_end - inner.next) + holes
    }

    pub fn io_base(&self) -> u64 {
        self.inner.lock().io_base
    }
}

impl AddressSpace for Stage2Space {
    fn reserve_io_range(&self, size: u64) -> Option<u64> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return None;
        }
        let mut inner = self.inner.lock();

        let fit = inner.holes.iter().find(|&(_, &s)| s >= size).map(|(&b, &s)| (b, s));
        if let Some((base, hole)) = fit {
            inner.holes.remove(&base);
            if hole > size {
                inner.holes.insert(base + size, hole - size);
            }
            return Some(base);
        }

        if inner.io_end - inner.next < size {
            return None;
        }
        let base = inner.next;
        inner.next += size;
        Some(base)
    }

    fn release_io_range(&self, base: u64, size: u64) {
        let mut inner = self.inner.lock();
        let (mut base, mut end) = (base, base + size);

        let below = inner.holes.range(..base).next_back().map(|(&b, &s)| (b, s));
        if let Some((b, s)) = below {
            if b + s == base {
                inner.holes.remove(&b);
                base = b;
            }
        }
        if let Some(s) = inner.holes.remove(&end) {
            end += s;
        }

        if end == inner.next {
            inner.next = base;
        } else {
            inner.holes.insert(base, end - base);
        }
    }

    fn map(&self, ipa: u64, pa: u64, size: u64, flags: MapFlags) -> Result<(), MapError> {
        if size == 0 || ipa % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        ipa.checked_add(size).ok_or(MapError::OutOfRange)?;

        let mut inner = self.inner.lock();
        if inner.overlaps(ipa, size) {
            return Err(MapError::Overlap);
        }
        inner.mappings.insert(ipa, Stage2Mapping { pa, size, flags });
        log::trace!("[S2] map {:#x}+{:#x} -> {:#x} {:?}", ipa, size, pa, flags);
        Ok(())
    }

    fn unmap(&self, ipa: u64, size: u64) {
        let mut inner = self.inner.lock();
        match inner.mappings.get(&ipa) {
            Some(m) if m.size == size => {
                inner.mappings.remove(&ipa);
                log::trace!("[S2] unmap {:#x}+{:#x}", ipa, size);
            }
            _ => log::warn!("[S2] unmap of unknown range {:#x}+{:#x}", ipa, size),
        }
    }
}
