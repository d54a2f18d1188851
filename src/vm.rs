//! Virtual Machine Management
//!
//! This module provides the [`Vm`] type: the per-VM owner of the virtio
//! shared aperture and of the emulated MMIO device table. The aperture is
//! a plain field with an explicit init/deinit pair; dropping the VM tears
//! down every device and then the aperture.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::devices::virtio::{register_writes, ApertureResources, RegisterWindow, SharedAperture, VirtioMmioDevice};
use crate::devices::{Device, DeviceManager, WindowId};
use crate::dtb;
use crate::error::{Result, VirtioMmioError};
use crate::mm::{AddressSpace, PageAllocator};
use crate::platform::VIRTIO_DEVICE_IOMEM_SIZE;
use crate::relay::NotifyRelay;
use crate::trap::MmioAccess;
use crate::virq::VirqAllocator;

/// Handle of a virtio device instance.
pub type VirtioHandle = WindowId;

/// Collaborators a VM's virtio transport is wired to.
#[derive(Clone)]
pub struct VmResources {
    /// Hypervisor page allocator backing the aperture
    pub pages: Arc<dyn PageAllocator>,
    /// This VM's Stage-2
    pub guest_space: Arc<dyn AddressSpace>,
    /// The backend VM's Stage-2
    pub backend_space: Arc<dyn AddressSpace>,
    pub virqs: Arc<dyn VirqAllocator>,
    pub relay: Arc<dyn NotifyRelay>,
}

impl VmResources {
    fn aperture(&self) -> ApertureResources<'_> {
        ApertureResources {
            pages: &*self.pages,
            guest_space: &*self.guest_space,
            backend_space: &*self.backend_space,
        }
    }
}

/// Virtual Machine
pub struct Vm {
    /// Unique identifier for this VM
    id: usize,

    /// Shared virtio-mmio aperture (zeroed until `virtio_mmio_init`)
    virtio_mmio: SharedAperture,

    /// Emulated MMIO windows; the lock serializes register writes
    devices: Mutex<DeviceManager>,

    res: VmResources,
}

impl Vm {
    /// Create a new VM
    pub fn new(id: usize, res: VmResources) -> Self {
        Self {
            id,
            virtio_mmio: SharedAperture::new(),
            devices: Mutex::new(DeviceManager::new()),
            res,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn aperture(&self) -> &SharedAperture {
        &self.virtio_mmio
    }

    pub fn resources(&self) -> &VmResources {
        &self.res
    }

    // ── Aperture ────────────────────────────────────────────────────

    /// Allocate the shared aperture and map it into this VM (read-only)
    /// and into the backend VM. Returns `(guest_base, host_base)`.
    pub fn virtio_mmio_init(&mut self, size: u64) -> Result<(u64, u64)> {
        let res = self.res.aperture();
        let bases = self.virtio_mmio.init(size, &res)?;
        log::info!("[VM] vm {} virtio mmio ready", self.id);
        Ok(bases)
    }

    /// Destroy every virtio device, then release the aperture.
    /// Idempotent.
    pub fn virtio_mmio_deinit(&mut self) {
        let devices = self.devices.get_mut();
        let ids: Vec<WindowId> = devices.virtio_ids().collect();
        for id in ids {
            devices.unregister_device(id);
        }
        let res = self.res.aperture();
        self.virtio_mmio.deinit(&res);
    }

    // ── Virtio device instances ─────────────────────────────────────

    /// Create a virtio device whose register window starts at `base`.
    ///
    /// The window is `VIRTIO_DEVICE_IOMEM_SIZE` bytes of the aperture.
    /// The device gets its own virq, published at GVM_IRQ.
    pub fn create_virtio_device(&self, base: u64) -> Result<VirtioHandle> {
        if !self.virtio_mmio.is_initialized() {
            log::error!("[VM] vm {} virtio mmio not initialized", self.id);
            return Err(VirtioMmioError::NotInitialized);
        }
        if base == 0 || !self.virtio_mmio.contains(base) {
            log::error!("[VM] invalid virtio mmio range {:#x}", base);
            return Err(VirtioMmioError::InvalidAddress(base));
        }

        let regs = self.virtio_mmio.window(base, VIRTIO_DEVICE_IOMEM_SIZE)?;
        let dev = VirtioMmioDevice::new(
            base,
            regs,
            Arc::clone(&self.res.relay),
            Arc::clone(&self.res.virqs),
        );

        let mut devices = self.devices.lock();
        let id = devices.register_device(Device::VirtioMmio(dev))?;

        let Some(irq) = self.res.virqs.alloc_virq() else {
            log::error!("[VM] no virq for virtio device {:#x}", base);
            devices.unregister_device(id);
            return Err(VirtioMmioError::IrqExhausted);
        };
        if let Some(dev) = devices.virtio_mut(id) {
            dev.assign_irq(irq);
        }

        log::info!("[VM] vm {} virtio device {:#x} irq {}", self.id, base, irq);
        Ok(id)
    }

    /// Destroy a virtio device: release its window and its virq.
    /// `None` is a no-op.
    pub fn destroy_virtio_device(&self, handle: Option<VirtioHandle>) {
        let Some(id) = handle else {
            return;
        };
        let mut devices = self.devices.lock();
        if devices.virtio(id).is_none() {
            log::warn!("[VM] destroy of unknown virtio device {}", id.index());
            return;
        }
        devices.unregister_device(id);
    }

    /// Reset a virtio device's transport registers. Returns false if
    /// `handle` is not a virtio device.
    pub fn reset_virtio_device(&self, handle: VirtioHandle) -> bool {
        match self.devices.lock().virtio_mut(handle) {
            Some(dev) => {
                dev.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every emulated device of this VM.
    pub fn reset_devices(&self) {
        self.devices.lock().reset_devices();
    }

    /// Raise `status` bits (`VIRTIO_MMIO_INT_*`) on a device and inject
    /// its virq. Called on behalf of the backend.
    pub fn send_virtio_irq(&self, handle: VirtioHandle, status: u32) -> bool {
        match self.devices.lock().virtio_mut(handle) {
            Some(dev) => {
                dev.raise_interrupt(status);
                true
            }
            None => false,
        }
    }

    pub fn virtio_registers(&self, handle: VirtioHandle) -> Option<RegisterWindow> {
        self.devices.lock().virtio(handle).map(VirtioMmioDevice::registers)
    }

    pub fn virtio_irq(&self, handle: VirtioHandle) -> Option<u32> {
        self.devices.lock().virtio(handle).map(VirtioMmioDevice::irq)
    }

    /// Create a device for every `virtio,mmio` node in `dtb`.
    ///
    /// Nodes outside the aperture are skipped. Any other failure destroys
    /// the devices created so far.
    pub fn create_virtio_devices_from_dtb(&self, dtb: &[u8]) -> Result<Vec<VirtioHandle>> {
        if !self.virtio_mmio.is_initialized() {
            return Err(VirtioMmioError::NotInitialized);
        }
        let nodes = dtb::virtio_mmio_nodes(dtb)?;

        let mut created = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !self.virtio_mmio.contains(node.base) {
                log::warn!("[VM] virtio,mmio node {:#x} outside the aperture, skipped", node.base);
                continue;
            }
            if node.size != VIRTIO_DEVICE_IOMEM_SIZE {
                log::debug!("[VM] virtio,mmio node {:#x} size {:#x} ignored", node.base, node.size);
            }
            match self.create_virtio_device(node.base) {
                Ok(handle) => created.push(handle),
                Err(e) => {
                    for handle in created {
                        self.destroy_virtio_device(Some(handle));
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    // ── Generic MMIO windows ────────────────────────────────────────

    /// Register a non-virtio emulated device.
    pub fn register_device(&self, dev: Device) -> Result<WindowId> {
        Ok(self.devices.lock().register_device(dev)?)
    }

    /// Remove a window, running its teardown hook.
    pub fn unregister_device(&self, id: WindowId) -> bool {
        self.devices.lock().unregister_device(id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().count()
    }

    /// Route an MMIO access. Unclaimed reads return 0, unclaimed writes
    /// are ignored.
    pub fn handle_mmio(&self, addr: u64, value: u64, size: u8, is_write: bool) -> Option<u64> {
        if is_write && self.virtio_store(addr, value, size) {
            return None;
        }
        self.devices.lock().handle_mmio(addr, value, size, is_write)
    }

    /// Apply a guest store to the virtio window covering `addr`. Returns
    /// false if no virtio window claims it.
    ///
    /// The device table is unlocked before each relay so a backend may
    /// re-enter the VM (raise an interrupt, reset a device) while the
    /// vCPU waits, and other devices stay writable meanwhile.
    fn virtio_store(&self, addr: u64, value: u64, size: u8) -> bool {
        for (i, (gpa, word)) in register_writes(addr, value, size).enumerate() {
            let event = {
                let mut devices = self.devices.lock();
                // Every word goes to the window the store started in.
                let Some(dev) = devices.virtio_at_mut(addr) else {
                    return i > 0;
                };
                dev.handle_write(gpa, word)
            };
            if let Some(event) = event {
                self.res.relay.send(event);
            }
        }
        true
    }

    /// Handle a stage-2 data abort at `gpa` with syndrome `iss`.
    ///
    /// Stores take their value from `regs`; loads write the result back.
    /// Returns false if the syndrome is not decodable or no device
    /// claims the address.
    pub fn handle_data_abort(&self, iss: u32, gpa: u64, regs: &mut [u64; 31]) -> bool {
        let Some(access) = MmioAccess::from_iss(iss) else {
            log::warn!("[VM] undecodable data abort at {:#x} (iss {:#x})", gpa, iss);
            return false;
        };

        if !self.devices.lock().claims(gpa) {
            log::warn!("[VM] vm {} data abort at unclaimed {:#x}", self.id, gpa);
            return false;
        }

        if access.is_store() {
            self.handle_mmio(gpa, access.store_value(regs), access.size(), true);
            true
        } else {
            match self.handle_mmio(gpa, 0, access.size(), false) {
                Some(value) => {
                    access.complete_load(regs, value);
                    true
                }
                None => {
                    log::warn!("[VM] read failed at {:#x}", gpa);
                    false
                }
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.devices.get_mut().remove_all();
        let res = self.res.aperture();
        self.virtio_mmio.deinit(&res);
    }
}
