//! Device Emulation Framework
//!
//! Routes trapped MMIO accesses to emulated devices via enum dispatch.
//! Devices are registered dynamically into an array of up to `MAX_DEVICES`
//! slots; a slot index doubles as the window handle.

pub mod virtio;

use alloc::boxed::Box;

use crate::error::DeviceError;
use crate::platform::MAX_DEVICES;
use virtio::VirtioMmioDevice;

/// Trait for MMIO-accessible devices
///
/// - `read()`/`write()` receive offsets relative to `base_address()`
/// - `size` parameter indicates access width (1, 2, 4, or 8 bytes)
/// - Return `None`/`false` for invalid offsets
pub trait MmioDevice {
    fn read(&mut self, offset: u64, size: u8) -> Option<u64>;
    fn write(&mut self, offset: u64, value: u64, size: u8) -> bool;
    fn base_address(&self) -> u64;
    fn size(&self) -> u64;

    fn contains(&self, addr: u64) -> bool {
        let base = self.base_address();
        addr >= base && addr - base < self.size()
    }

    /// Return the device to its power-on state.
    fn reset(&mut self) {}

    /// Release resources the device holds outside its window.
    /// Called once, when the window is unregistered.
    fn teardown(&mut self) {}
}

// ── Enum dispatch ──────────────────────────────────────────────────

/// Device variant enum.
///
/// Virtio devices get their own variant so the VM can reach their
/// transport state (virq, register window) without downcasting.
pub enum Device {
    VirtioMmio(VirtioMmioDevice),
    Emulated(Box<dyn MmioDevice + Send>),
}

impl MmioDevice for Device {
    fn read(&mut self, offset: u64, size: u8) -> Option<u64> {
        match self {
            Device::VirtioMmio(d) => d.read(offset, size),
            Device::Emulated(d) => d.read(offset, size),
        }
    }

    fn write(&mut self, offset: u64, value: u64, size: u8) -> bool {
        match self {
            Device::VirtioMmio(d) => d.write(offset, value, size),
            Device::Emulated(d) => d.write(offset, value, size),
        }
    }

    fn base_address(&self) -> u64 {
        match self {
            Device::VirtioMmio(d) => d.base_address(),
            Device::Emulated(d) => d.base_address(),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Device::VirtioMmio(d) => d.size(),
            Device::Emulated(d) => d.size(),
        }
    }

    fn reset(&mut self) {
        match self {
            Device::VirtioMmio(d) => MmioDevice::reset(d),
            Device::Emulated(d) => d.reset(),
        }
    }

    fn teardown(&mut self) {
        match self {
            Device::VirtioMmio(d) => d.teardown(),
            Device::Emulated(d) => d.teardown(),
        }
    }
}

// ── Device Manager ─────────────────────────────────────────────────

/// Handle of a registered MMIO window (its slot index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(usize);

impl WindowId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// MMIO Device Manager: routes accesses to registered devices by address.
pub struct DeviceManager {
    devices: [Option<Device>; MAX_DEVICES],
    count: usize,
}

impl DeviceManager {
    pub const fn new() -> Self {
        Self {
            devices: [const { None }; MAX_DEVICES],
            count: 0,
        }
    }

    /// Register a device. Fails if its range is empty, overlaps a
    /// registered window, or no slot is free.
    pub fn register_device(&mut self, dev: Device) -> Result<WindowId, DeviceError> {
        let base = dev.base_address();
        let size = dev.size();
        if size == 0 {
            return Err(DeviceError::EmptyWindow);
        }
        let overlaps = self.iter().any(|d| {
            let b = d.base_address();
            base < b.saturating_add(d.size()) && b < base.saturating_add(size)
        });
        if overlaps {
            log::warn!("[DEVMGR] window {:#x}+{:#x} overlaps a registered device", base, size);
            return Err(DeviceError::Overlap { base, size });
        }

        let idx = self.devices.iter().position(Option::is_none)
            .ok_or(DeviceError::TooManyDevices)?;
        self.devices[idx] = Some(dev);
        self.count += 1;
        log::debug!("[DEVMGR] slot {} = {:#x}+{:#x}", idx, base, size);
        Ok(WindowId(idx))
    }

    /// Remove a device, running its teardown hook. Returns false if the
    /// slot was already empty.
    pub fn unregister_device(&mut self, id: WindowId) -> bool {
        match self.devices.get_mut(id.0).and_then(Option::take) {
            Some(mut dev) => {
                dev.teardown();
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    /// Remove every device, running each teardown hook.
    pub fn remove_all(&mut self) {
        for slot in self.devices.iter_mut() {
            if let Some(mut dev) = slot.take() {
                dev.teardown();
            }
        }
        self.count = 0;
    }

    /// Handle MMIO access by scanning registered devices.
    pub fn handle_mmio(&mut self, addr: u64, value: u64, size: u8, is_write: bool) -> Option<u64> {
        for slot in self.devices.iter_mut() {
            if let Some(dev) = slot {
                if dev.contains(addr) {
                    let offset = addr - dev.base_address();
                    return if is_write {
                        dev.write(offset, value, size);
                        None
                    } else {
                        dev.read(offset, size)
                    };
                }
            }
        }
        // Unknown device: return 0 for reads, ignore writes
        if is_write { None } else { Some(0) }
    }

    /// True if any registered window covers `addr`.
    pub fn claims(&self, addr: u64) -> bool {
        self.iter().any(|d| d.contains(addr))
    }

    /// Run every device's reset hook.
    pub fn reset_devices(&mut self) {
        for dev in self.devices.iter_mut().flatten() {
            dev.reset();
        }
    }

    /// Get the virtio transport registered under `id`.
    pub fn virtio(&self, id: WindowId) -> Option<&VirtioMmioDevice> {
        match self.devices.get(id.0)? {
            Some(Device::VirtioMmio(d)) => Some(d),
            _ => None,
        }
    }

    /// Get a mutable reference to the virtio transport registered under `id`.
    pub fn virtio_mut(&mut self, id: WindowId) -> Option<&mut VirtioMmioDevice> {
        match self.devices.get_mut(id.0)? {
            Some(Device::VirtioMmio(d)) => Some(d),
            _ => None,
        }
    }

    /// Get the virtio transport whose window covers `addr`.
    pub fn virtio_at_mut(&mut self, addr: u64) -> Option<&mut VirtioMmioDevice> {
        self.devices.iter_mut().flatten().find_map(|dev| match dev {
            Device::VirtioMmio(d) if d.contains(addr) => Some(d),
            _ => None,
        })
    }

    /// Handles of every registered virtio transport.
    pub fn virtio_ids(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.devices.iter().enumerate().filter_map(|(i, slot)| match slot {
            Some(Device::VirtioMmio(_)) => Some(WindowId(i)),
            _ => None,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().flatten()
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
