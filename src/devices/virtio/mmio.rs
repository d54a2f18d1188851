//! Virtio-MMIO transport write handler.
//!
//! The register file lives in the shared aperture, not in this struct:
//! the guest reads it through its read-only Stage-2 mapping, so every
//! value the guest must observe is stored there by `handle_write`. The
//! struct only carries what is needed to interpret writes: where the
//! window is, which virq the device owns, and who to notify.

use alloc::sync::Arc;

use super::regs::*;
use crate::devices::MmioDevice;
use crate::relay::{MmioEvent, NotifyRelay};
use crate::virq::VirqAllocator;

/// Split a guest store into the 32-bit register writes it amounts to.
///
/// Byte and halfword stores are masked to their width and keep their
/// address, so unaligned config-space stores reach the relay as-is. A
/// doubleword store is two word stores, low half first.
pub(crate) fn register_writes(gpa: u64, value: u64, size: u8) -> impl Iterator<Item = (u64, u32)> {
    let words = match size {
        1 => [Some((gpa, value as u8 as u32)), None],
        2 => [Some((gpa, value as u16 as u32)), None],
        8 => [Some((gpa, value as u32)), Some((gpa.wrapping_add(4), (value >> 32) as u32))],
        _ => [Some((gpa, value as u32)), None],
    };
    words.into_iter().flatten()
}

/// One virtio-mmio device instance.
pub struct VirtioMmioDevice {
    /// Guest physical base of the register window
    base: u64,
    /// Host view of the register window
    regs: RegisterWindow,
    /// Assigned guest virq (0 = unassigned)
    gvm_irq: u32,
    relay: Arc<dyn NotifyRelay>,
    virqs: Arc<dyn VirqAllocator>,
}

impl VirtioMmioDevice {
    pub fn new(
        base: u64,
        regs: RegisterWindow,
        relay: Arc<dyn NotifyRelay>,
        virqs: Arc<dyn VirqAllocator>,
    ) -> Self {
        Self { base, regs, gvm_irq: 0, relay, virqs }
    }

    /// Record the assigned virq and publish it at GVM_IRQ so the guest
    /// driver can discover its interrupt line.
    pub fn assign_irq(&mut self, irq: u32) {
        self.gvm_irq = irq;
        self.regs.write(GVM_IRQ, irq);
    }

    pub fn irq(&self) -> u32 {
        self.gvm_irq
    }

    pub fn registers(&self) -> RegisterWindow {
        self.regs
    }

    /// Latch `status` bits into INTERRUPT_STATUS and inject the device's virq.
    pub fn raise_interrupt(&mut self, status: u32) {
        let cur = self.regs.read(INTERRUPT_STATUS);
        self.regs.write(INTERRUPT_STATUS, cur | status);
        if self.gvm_irq != 0 {
            self.virqs.inject_virq(self.gvm_irq);
        } else {
            log::warn!("[VIRTIO] interrupt raised on {:#x} without a virq", self.base);
        }
    }

    /// Apply a 32-bit guest store at `gpa` to the register file and
    /// return the notification the backend has to receive, if any.
    ///
    /// The event is returned rather than sent so the caller can release
    /// the device table first: a blocking relay may call back into the VM.
    /// Never fails: malformed writes are logged and dropped, like a bus
    /// that ignores writes to bad registers.
    pub(crate) fn handle_write(&mut self, gpa: u64, value: u32) -> Option<MmioEvent> {
        let Some(offset) = gpa.checked_sub(self.base).filter(|&off| off < self.regs.len() as u64) else {
            log::warn!("[VIRTIO] write at {:#x} outside window {:#x}", gpa, self.base);
            return None;
        };
        let regs = self.regs;

        log::trace!("[VIRTIO] {:#x} write {:#x} = {:#x}", self.base, offset, value);

        match offset {
            HOST_FEATURES => {}

            HOST_FEATURES_SEL => {
                if value >= FEATURE_WORDS {
                    log::warn!("[VIRTIO] invalid features sel value {}", value);
                    return None;
                }
                let word = regs.read(HOST_FEATURE0 + value as u64 * 4);
                regs.write(HOST_FEATURES, word);
            }

            GUEST_FEATURES_SEL => {
                regs.write(GUEST_FEATURES_SEL, value);
            }

            GUEST_FEATURES => {
                let sel = regs.read(GUEST_FEATURES_SEL);
                if sel >= FEATURE_WORDS {
                    log::warn!("[VIRTIO] guest features sel {} out of range, dropped", sel);
                    return None;
                }
                regs.write(DRIVER_FEATURE0 + sel as u64 * 4, value);
            }

            // Legacy (version 1) transport fields
            GUEST_PAGE_SIZE | QUEUE_ALIGN | QUEUE_PFN => {
                regs.write(offset, value);
            }

            QUEUE_SEL => {
                regs.write(QUEUE_SEL, value);
                // A freshly selected queue must not show another queue's setup.
                for reg in QUEUE_CONFIG_REGS {
                    regs.write(reg, 0);
                }
            }

            QUEUE_NUM => {
                let max = regs.read(QUEUE_NUM_MAX);
                if value > max {
                    log::warn!("[VIRTIO] invalid queue num {} (max {})", value, max);
                }
                regs.write(QUEUE_NUM, value);
            }

            QUEUE_NOTIFY => {
                return Some(MmioEvent::non_blocking(gpa, value));
            }

            STATUS => {
                // The backend is told which bits changed, not the new value.
                // A status that goes down (other than through reset) wraps.
                let delta = value.wrapping_sub(regs.read(STATUS));
                regs.write(STATUS, delta);
                return Some(MmioEvent::blocking(gpa, delta));
            }

            QUEUE_DESC_LOW | QUEUE_DESC_HIGH
            | QUEUE_AVAIL_LOW | QUEUE_AVAIL_HIGH
            | QUEUE_USED_LOW | QUEUE_USED_HIGH => {
                regs.write(offset, value);
            }

            QUEUE_READY => {
                // Backend learns which queue went ready, not the flag itself.
                let sel = regs.read(QUEUE_SEL);
                return Some(MmioEvent::blocking(gpa, sel));
            }

            INTERRUPT_ACK => {
                regs.write(INTERRUPT_ACK, 0);
                regs.write(INTERRUPT_STATUS, 0);
            }

            _ => {
                return Some(MmioEvent::blocking(gpa, value));
            }
        }
        None
    }

    /// Return driver-negotiated state to power-on defaults, keeping what
    /// the backend published (identity, host features, queue limits,
    /// config space) and the virq.
    pub fn reset(&mut self) {
        log::info!("[VIRTIO] virtio device {:#x} reset", self.base);
        let regs = self.regs;

        for reg in [
            STATUS,
            HOST_FEATURES_SEL,
            GUEST_FEATURES,
            GUEST_FEATURES_SEL,
            GUEST_PAGE_SIZE,
            QUEUE_SEL,
            QUEUE_ALIGN,
            QUEUE_PFN,
            INTERRUPT_STATUS,
            INTERRUPT_ACK,
        ] {
            regs.write(reg, 0);
        }
        for reg in QUEUE_CONFIG_REGS {
            regs.write(reg, 0);
        }
        for word in 0..FEATURE_WORDS as u64 {
            regs.write(DRIVER_FEATURE0 + word * 4, 0);
        }
        regs.write(HOST_FEATURES, regs.read(HOST_FEATURE0));
    }

    /// Release the virq. Runs when the window is unregistered.
    pub fn release(&mut self) {
        if self.gvm_irq != 0 {
            self.virqs.release_virq(self.gvm_irq);
            log::info!("[VIRTIO] device {:#x} released virq {}", self.base, self.gvm_irq);
            self.gvm_irq = 0;
        }
    }
}

impl MmioDevice for VirtioMmioDevice {
    /// Guest loads are served by the read-only mapping; a trapped load
    /// just observes the same backing word.
    fn read(&mut self, offset: u64, size: u8) -> Option<u64> {
        if size != 4 {
            return Some(0);
        }
        Some(self.regs.read(offset) as u64)
    }

    /// Direct dispatch without a VM in between: the relay runs inline.
    fn write(&mut self, offset: u64, value: u64, size: u8) -> bool {
        for (gpa, word) in register_writes(self.base + offset, value, size) {
            if let Some(event) = self.handle_write(gpa, word) {
                self.relay.send(event);
            }
        }
        true
    }

    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.regs.len() as u64
    }

    fn reset(&mut self) {
        VirtioMmioDevice::reset(self);
    }

    fn teardown(&mut self) {
        self.release();
    }
}
