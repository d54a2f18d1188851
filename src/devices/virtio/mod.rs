//! Virtio-MMIO transport for guest VMs.
//!
//! Device register windows are carved out of a per-VM shared aperture
//! (`aperture`); the backend VM implements the device itself and learns
//! about guest register writes through the relay that `mmio` drives.

pub mod aperture;
pub mod mmio;
pub mod regs;

pub use aperture::{ApertureResources, SharedAperture};
pub use mmio::VirtioMmioDevice;
pub(crate) use mmio::register_writes;
pub use regs::RegisterWindow;
