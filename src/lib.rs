#![no_std]

//! Virtio-MMIO transport layer of an AArch64 type-1 hypervisor.
//!
//! Guest VMs see virtio devices as register windows inside one shared
//! aperture per VM. Reads hit a read-only Stage-2 mapping of the
//! registers; writes fault and are applied by the register state machine
//! in [`devices::virtio::mmio`], which relays what the backend VM needs
//! to know through [`relay::NotifyRelay`].

extern crate alloc;

pub mod devices;
pub mod dtb;
pub mod error;
pub mod mm;
pub mod platform;
pub mod relay;
pub mod trap;
pub mod virq;
pub mod vm;

pub use error::{Result, VirtioMmioError};
pub use vm::{Vm, VmResources, VirtioHandle};
