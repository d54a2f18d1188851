//! Guest device tree parsing
//!
//! The VM configuration describes its virtio transports the same way
//! QEMU's virt machine does: one `compatible = "virtio,mmio"` node per
//! device, with the register window in `reg`. We only need the windows;
//! interrupts are assigned by the hypervisor and published at GVM_IRQ.
//!
//! The `fdt` crate does zero-copy parsing; only the result list allocates.

use alloc::vec::Vec;

use crate::error::DtbError;

/// Compatible string of a virtio-mmio transport node.
pub const VIRTIO_MMIO_COMPATIBLE: &str = "virtio,mmio";

/// Register window of one `virtio,mmio` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioMmioNode {
    pub base: u64,
    pub size: u64,
}

/// List every virtio-mmio transport described by `dtb`, in tree order.
///
/// Each node's first `reg` entry is used, decoded with its parent's
/// `#address-cells`/`#size-cells`.
pub fn virtio_mmio_nodes(dtb: &[u8]) -> Result<Vec<VirtioMmioNode>, DtbError> {
    let fdt = fdt::Fdt::new(dtb).map_err(|_| DtbError::Malformed)?;

    let mut nodes = Vec::new();
    for node in fdt.all_nodes() {
        let is_virtio = node
            .compatible()
            .is_some_and(|c| c.all().any(|s| s == VIRTIO_MMIO_COMPATIBLE));
        if !is_virtio {
            continue;
        }

        let reg = node.reg().and_then(|mut regs| regs.next()).ok_or(DtbError::BadReg)?;
        let size = match reg.size {
            Some(size) if size != 0 => size as u64,
            _ => return Err(DtbError::BadReg),
        };
        let base = reg.starting_address as u64;

        log::debug!("[DTB] {} at {:#x}+{:#x}", node.name, base, size);
        nodes.push(VirtioMmioNode { base, size });
    }
    Ok(nodes)
}
