//! AArch64 data-abort decoding for MMIO emulation
//!
//! A guest store into the read-only aperture (or a load/store to any
//! other emulated window) arrives as a stage-2 data abort. The ESR_EL2
//! ISS tells us the access width and the general-purpose register
//! involved; the VM uses that to turn the fault into a device access.

/// Mask of the ISS field in ESR_EL2.
pub const ESR_ISS_MASK: u64 = 0x1FF_FFFF;

/// General-purpose register number that encodes XZR/WZR in SRT.
pub const XZR: u8 = 31;

/// Decoded load/store that caused a data abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioAccess {
    /// Load instruction: LDR, LDRB, LDRH, LDRSB, etc.
    Load {
        reg: u8,  // Destination register (0-31, 31 = XZR)
        size: u8, // Access size in bytes (1, 2, 4, 8)
        sign_extend: bool,
        /// Destination is an X register (SF); otherwise a W register
        wide: bool,
    },
    /// Store instruction: STR, STRB, STRH
    Store {
        reg: u8,  // Source register (0-31, 31 = XZR)
        size: u8, // Access size in bytes (1, 2, 4, 8)
    },
}

impl MmioAccess {
    /// Decode the data-abort ISS. Returns `None` if ISV is clear (the
    /// syndrome carries no instruction information).
    pub fn from_iss(iss: u32) -> Option<Self> {
        // ISS[24] = ISV
        if (iss >> 24) & 1 == 0 {
            return None;
        }

        let sas = (iss >> 22) & 0x3; // 00=byte, 01=half, 10=word, 11=double
        let sse = (iss >> 21) & 1 != 0;
        let srt = ((iss >> 16) & 0x1F) as u8;
        let sf = (iss >> 15) & 1 != 0;
        let wnr = (iss >> 6) & 1 != 0;

        let size = 1u8 << sas;

        Some(if wnr {
            MmioAccess::Store { reg: srt, size }
        } else {
            MmioAccess::Load { reg: srt, size, sign_extend: sse, wide: sf }
        })
    }

    /// Decode from the ISS, falling back to the faulting instruction
    /// when ISV is clear.
    pub fn decode(insn: u32, iss: u32) -> Option<Self> {
        Self::from_iss(iss).or_else(|| Self::decode_instruction(insn))
    }

    /// Only LDR/STR (immediate, unsigned offset) are handled here; that
    /// is what compilers emit for volatile register accesses.
    fn decode_instruction(insn: u32) -> Option<Self> {
        // size|111|0|01|opc|imm12|Rn|Rt
        if insn & 0x3B00_0000 != 0x3900_0000 {
            return None;
        }
        let size = 1u8 << ((insn >> 30) & 0x3);
        let rt = (insn & 0x1F) as u8;
        let opc = (insn >> 22) & 0x3;

        match opc {
            0 => Some(MmioAccess::Store { reg: rt, size }),
            1 => Some(MmioAccess::Load { reg: rt, size, sign_extend: false, wide: size == 8 }),
            // LDRS* to X (opc=2) or W (opc=3)
            2 if size < 8 => Some(MmioAccess::Load { reg: rt, size, sign_extend: true, wide: true }),
            3 if size < 4 => Some(MmioAccess::Load { reg: rt, size, sign_extend: true, wide: false }),
            _ => None,
        }
    }

    /// Get the register number
    pub fn reg(&self) -> u8 {
        match self {
            MmioAccess::Load { reg, .. } => *reg,
            MmioAccess::Store { reg, .. } => *reg,
        }
    }

    /// Get the access size in bytes
    pub fn size(&self) -> u8 {
        match self {
            MmioAccess::Load { size, .. } => *size,
            MmioAccess::Store { size, .. } => *size,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, MmioAccess::Store { .. })
    }

    /// Value a store writes, taken from the vCPU's register file.
    pub fn store_value(&self, regs: &[u64; 31]) -> u64 {
        let reg = self.reg();
        if reg == XZR {
            return 0;
        }
        regs[reg as usize] & width_mask(self.size())
    }

    /// Write a loaded `value` back into the destination register,
    /// applying the width mask and sign extension.
    pub fn complete_load(&self, regs: &mut [u64; 31], value: u64) {
        let MmioAccess::Load { reg, size, sign_extend, wide } = *self else {
            return;
        };
        if reg == XZR {
            return;
        }
        let mut v = value & width_mask(size);
        if sign_extend && size < 8 {
            let shift = 64 - u32::from(size) * 8;
            v = (((v << shift) as i64) >> shift) as u64;
        }
        if !wide {
            v &= 0xFFFF_FFFF;
        }
        regs[reg as usize] = v;
    }
}

fn width_mask(size: u8) -> u64 {
    match size {
        8 => u64::MAX,
        s => (1u64 << (u32::from(s) * 8)) - 1,
    }
}
