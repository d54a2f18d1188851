//! Platform/Board Constants (QEMU virt machine)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform.

// ── Pages ────────────────────────────────────────────────────────────
pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_SHIFT: u64 = 12;

/// Round `size` up to the next page boundary.
#[inline]
pub const fn page_align_up(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Number of pages needed to cover `size` bytes.
#[inline]
pub const fn page_count(size: u64) -> usize {
    (page_align_up(size) >> PAGE_SHIFT) as usize
}

// ── Virtio-MMIO ──────────────────────────────────────────────────────

/// Register window carved out of the aperture for one virtio device.
/// Standard registers + config space (0x000-0x1FF), hypervisor-private
/// fields from 0x200, padded to a page so every window shares the
/// aperture's read-only mapping granularity.
pub const VIRTIO_DEVICE_IOMEM_SIZE: u64 = 0x1000;

/// Guest IPA window the aperture is reserved from (QEMU virt leaves
/// 0x0a00_0000 - 0x0a00_3fff for virtio-mmio transports; we use the
/// 16MB above it).
pub const GUEST_VIRTIO_IO_BASE: u64 = 0x0a00_0000;
pub const GUEST_VIRTIO_IO_SIZE: u64 = 0x100_0000;

// ── Virtual interrupts ───────────────────────────────────────────────

/// First SPI handed to virtio devices (SPI 16 = INTID 48).
pub const VIRTIO_SPI_BASE: u32 = 48;
/// Number of SPIs reserved for virtio devices (INTID 48-63).
pub const VIRTIO_SPI_COUNT: u32 = 16;

// ── Device dispatch ──────────────────────────────────────────────────

/// Maximum number of emulated MMIO windows per VM.
pub const MAX_DEVICES: usize = 32;
