//! Shared virtio-mmio aperture
//!
//! One contiguous run of hypervisor pages backs the register windows of
//! every virtio device in a VM. The run is mapped read-only (I/O) into
//! the guest, so guest reads hit the registers directly and guest writes
//! fault into the write handler, and read-write into the backend VM so
//! the backend sees the same registers.

use core::ptr::NonNull;

use super::regs::RegisterWindow;
use crate::error::{Result, VirtioMmioError};
use crate::mm::{AddressSpace, MapFlags, PageAllocator};
use crate::platform::{page_align_up, page_count};

/// Collaborators the aperture draws from.
pub struct ApertureResources<'a> {
    pub pages: &'a dyn PageAllocator,
    pub guest_space: &'a dyn AddressSpace,
    pub backend_space: &'a dyn AddressSpace,
}

/// Per-VM aperture state. All fields are zero while uninitialized.
#[derive(Debug, Default)]
pub struct SharedAperture {
    guest_base: u64,
    host_base: u64,
    size: u64,
    /// Hypervisor address of the backing pages
    iomem: u64,
}

impl SharedAperture {
    pub const fn new() -> Self {
        Self { guest_base: 0, host_base: 0, size: 0, iomem: 0 }
    }

    /// Allocate and map the aperture. Returns `(guest_base, host_base)`.
    ///
    /// Fails without touching the current state if already initialized;
    /// on any later failure every completed step is rolled back.
    pub fn init(&mut self, size: u64, res: &ApertureResources<'_>) -> Result<(u64, u64)> {
        if self.is_initialized() {
            log::error!("[VIRTIO] virtio mmio has been inited");
            return Err(VirtioMmioError::AlreadyInitialized);
        }
        if size == 0 {
            log::error!("[VIRTIO] invalid virtio mmio size");
            return Err(VirtioMmioError::InvalidSize);
        }

        let size = page_align_up(size);

        let gbase = res.guest_space.reserve_io_range(size)
            .ok_or(VirtioMmioError::OutOfMemory)?;

        let Some(iomem) = res.pages.alloc_pages(page_count(size)) else {
            res.guest_space.release_io_range(gbase, size);
            return Err(VirtioMmioError::OutOfMemory);
        };

        // SAFETY: freshly allocated pages owned by us, `size` bytes long.
        unsafe { core::ptr::write_bytes(iomem as *mut u8, 0, size as usize) };

        let unwind_pages = || {
            res.pages.free_pages(iomem);
            res.guest_space.release_io_range(gbase, size);
        };

        // Backend mapping first: the backend must see the registers
        // before any guest can reach them.
        let Some(hbase) = res.backend_space.reserve_io_range(size) else {
            unwind_pages();
            return Err(VirtioMmioError::OutOfMemory);
        };
        if let Err(e) = res.backend_space.map(hbase, iomem, size, MapFlags::IO_RW) {
            res.backend_space.release_io_range(hbase, size);
            unwind_pages();
            return Err(VirtioMmioError::MappingFailed(e));
        }

        if let Err(e) = res.guest_space.map(gbase, iomem, size, MapFlags::IO_RO) {
            res.backend_space.unmap(hbase, size);
            res.backend_space.release_io_range(hbase, size);
            unwind_pages();
            return Err(VirtioMmioError::MappingFailed(e));
        }

        self.guest_base = gbase;
        self.host_base = hbase;
        self.size = size;
        self.iomem = iomem;

        log::info!(
            "[VIRTIO] aperture gpa {:#x} hva {:#x} size {:#x}",
            gbase, hbase, size
        );
        Ok((gbase, hbase))
    }

    /// Unmap and free the aperture. Safe to call when uninitialized.
    ///
    /// Register windows handed out by `window()` dangle afterwards; the
    /// caller destroys its devices first.
    pub fn deinit(&mut self, res: &ApertureResources<'_>) {
        if self.iomem != 0 {
            res.guest_space.unmap(self.guest_base, self.size);
            res.backend_space.unmap(self.host_base, self.size);
            res.backend_space.release_io_range(self.host_base, self.size);
            res.guest_space.release_io_range(self.guest_base, self.size);
            res.pages.free_pages(self.iomem);
            log::info!("[VIRTIO] aperture at {:#x} released", self.guest_base);
        }

        self.guest_base = 0;
        self.host_base = 0;
        self.size = 0;
        self.iomem = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.iomem != 0
    }

    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    pub fn host_base(&self) -> u64 {
        self.host_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hypervisor address of the backing pages.
    pub fn iomem(&self) -> u64 {
        self.iomem
    }

    /// True if `gpa` lies inside `[guest_base, guest_base + size)`.
    pub fn contains(&self, gpa: u64) -> bool {
        self.is_initialized() && gpa >= self.guest_base && gpa - self.guest_base < self.size
    }

    /// Host view of `[gpa, gpa + len)`, which must lie inside the aperture.
    pub fn window(&self, gpa: u64, len: u64) -> Result<RegisterWindow> {
        if !self.is_initialized() {
            return Err(VirtioMmioError::NotInitialized);
        }
        if !self.contains(gpa) || len > self.size - (gpa - self.guest_base) {
            return Err(VirtioMmioError::InvalidAddress(gpa));
        }

        let offset = gpa - self.guest_base;
        let base = NonNull::new((self.iomem + offset) as *mut u8)
            .ok_or(VirtioMmioError::NotInitialized)?;
        // SAFETY: inside the live aperture run, bounded by `size`.
        Ok(unsafe { RegisterWindow::new(base, len as usize) })
    }
}
