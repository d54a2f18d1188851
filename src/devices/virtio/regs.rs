//! Virtio-MMIO register layout and the host view of a register window.
//!
//! Offsets 0x000-0x1FF follow the virtio-mmio transport (legacy names,
//! so HOST_FEATURES is the device-features word and QUEUE_AVAIL/USED are
//! the driver/device areas). Offsets from 0x200 are hypervisor-private:
//! the backend publishes the full 128-bit feature set at HOST_FEATURE0..3
//! and the write handler collects the driver's words at DRIVER_FEATURE0..3.

use core::ptr::NonNull;

// ── Virtio-MMIO register offsets ────────────────────────────────────
pub const MAGIC_VALUE: u64 = 0x000;
pub const VERSION: u64 = 0x004;
pub const DEVICE_ID: u64 = 0x008;
pub const VENDOR_ID: u64 = 0x00C;
pub const HOST_FEATURES: u64 = 0x010;
pub const HOST_FEATURES_SEL: u64 = 0x014;
pub const GUEST_FEATURES: u64 = 0x020;
pub const GUEST_FEATURES_SEL: u64 = 0x024;
pub const GUEST_PAGE_SIZE: u64 = 0x028;
pub const QUEUE_SEL: u64 = 0x030;
pub const QUEUE_NUM_MAX: u64 = 0x034;
pub const QUEUE_NUM: u64 = 0x038;
pub const QUEUE_ALIGN: u64 = 0x03C;
pub const QUEUE_PFN: u64 = 0x040;
pub const QUEUE_READY: u64 = 0x044;
pub const QUEUE_NOTIFY: u64 = 0x050;
pub const INTERRUPT_STATUS: u64 = 0x060;
pub const INTERRUPT_ACK: u64 = 0x064;
pub const STATUS: u64 = 0x070;
pub const QUEUE_DESC_LOW: u64 = 0x080;
pub const QUEUE_DESC_HIGH: u64 = 0x084;
pub const QUEUE_AVAIL_LOW: u64 = 0x090;
pub const QUEUE_AVAIL_HIGH: u64 = 0x094;
pub const QUEUE_USED_LOW: u64 = 0x0A0;
pub const QUEUE_USED_HIGH: u64 = 0x0A4;
pub const CONFIG_GENERATION: u64 = 0x0FC;
pub const CONFIG_SPACE: u64 = 0x100;

// ── Hypervisor-private fields ───────────────────────────────────────
/// Guest virq assigned to the device, read by the guest driver to find
/// its interrupt line.
pub const GVM_IRQ: u64 = 0x208;
pub const HOST_FEATURE0: u64 = 0x210;
pub const DRIVER_FEATURE0: u64 = 0x220;
/// Number of 32-bit words in HOST_FEATURE*/DRIVER_FEATURE*
pub const FEATURE_WORDS: u32 = 4;

// ── Magic and version ───────────────────────────────────────────────
pub const VIRTIO_MMIO_MAGIC: u32 = 0x74726976; // "virt"

// ── Interrupt status bits ───────────────────────────────────────────
pub const VIRTIO_MMIO_INT_VRING: u32 = 1 << 0;
pub const VIRTIO_MMIO_INT_CONFIG: u32 = 1 << 1;

/// Per-queue registers cleared when the driver selects a queue.
pub const QUEUE_CONFIG_REGS: [u64; 8] = [
    QUEUE_READY,
    QUEUE_NUM,
    QUEUE_DESC_LOW,
    QUEUE_DESC_HIGH,
    QUEUE_AVAIL_LOW,
    QUEUE_AVAIL_HIGH,
    QUEUE_USED_LOW,
    QUEUE_USED_HIGH,
];

/// Host-side view of one device's register window.
///
/// A non-owning alias into the aperture's pages: the same bytes are
/// mapped read-only into the guest, so every store here is visible to
/// the guest's next load. Only valid while the aperture is initialized;
/// the VM destroys devices before releasing the aperture.
#[derive(Clone, Copy)]
pub struct RegisterWindow {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the window is plain device memory; concurrent writers are
// serialized by the device manager lock.
unsafe impl Send for RegisterWindow {}
unsafe impl Sync for RegisterWindow {}

impl RegisterWindow {
    /// # Safety
    /// `[base, base + len)` must be valid, writable memory for as long as
    /// the window (or any copy of it) is used.
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    fn slot(&self, offset: u64) -> Option<*mut u32> {
        let off = usize::try_from(offset).ok()?;
        if off % 4 != 0 || off.checked_add(4)? > self.len {
            return None;
        }
        // SAFETY: bounds checked against the window length above.
        Some(unsafe { self.base.as_ptr().add(off) as *mut u32 })
    }

    /// Read a 32-bit register. Out-of-window or unaligned offsets read 0.
    #[inline]
    pub fn read(&self, offset: u64) -> u32 {
        match self.slot(offset) {
            Some(p) => unsafe { core::ptr::read_volatile(p) },
            None => 0,
        }
    }

    /// Write a 32-bit register. Returns false if the offset is outside the
    /// window or unaligned.
    #[inline]
    pub fn write(&self, offset: u64, val: u32) -> bool {
        match self.slot(offset) {
            Some(p) => {
                unsafe { core::ptr::write_volatile(p, val) };
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host address of the first register.
    pub fn host_address(&self) -> u64 {
        self.base.as_ptr() as u64
    }
}
