//! Error types for aperture, device and mapping management.
//!
//! Per-write register anomalies are never errors; they are logged by the
//! write handler. Everything here is a construction or teardown failure
//! that propagates to the VM-management caller.

use thiserror::Error;

/// Stage-2 mapping failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("address or size not page aligned")]
    Unaligned,
    #[error("range overlaps an existing mapping")]
    Overlap,
    #[error("range outside the address space")]
    OutOfRange,
    #[error("range not mapped")]
    NotMapped,
}

/// Device window registration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device table full")]
    TooManyDevices,
    #[error("window {base:#x}+{size:#x} overlaps a registered device")]
    Overlap { base: u64, size: u64 },
    #[error("zero-sized device window")]
    EmptyWindow,
}

/// Device tree parsing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DtbError {
    #[error("malformed device tree blob")]
    Malformed,
    #[error("virtio,mmio node has an unusable reg property")]
    BadReg,
}

/// Virtio-MMIO aperture and device lifecycle failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VirtioMmioError {
    #[error("virtio mmio aperture already initialized")]
    AlreadyInitialized,
    #[error("invalid virtio mmio aperture size")]
    InvalidSize,
    #[error("virtio mmio aperture not initialized")]
    NotInitialized,
    #[error("guest address {0:#x} outside the virtio mmio aperture")]
    InvalidAddress(u64),
    #[error("out of memory")]
    OutOfMemory,
    #[error("mapping failed: {0}")]
    MappingFailed(#[from] MapError),
    #[error("no free virtual interrupt")]
    IrqExhausted,
    #[error("device registration failed: {0}")]
    Device(#[from] DeviceError),
    #[error("device tree: {0}")]
    Dtb(#[from] DtbError),
}

pub type Result<T> = core::result::Result<T, VirtioMmioError>;
