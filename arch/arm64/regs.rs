//! EL2 register layouts and exception syndrome decoding

use bitflags::bitflags;

use crate::mm::PAGE_SIZE;

/// HCR_EL2 bits
pub mod hcr {
    /// Enable stage-2 translation for EL1/EL0
    pub const VM: u64 = 1 << 0;
    /// Treat device stores as write-invalidate
    pub const SWIO: u64 = 1 << 1;
    /// Route FIQs to EL2
    pub const FMO: u64 = 1 << 3;
    /// Route IRQs to EL2, enable virtual interrupts
    pub const IMO: u64 = 1 << 4;
    /// Trap EL1/EL0 WFI to EL2
    pub const TWI: u64 = 1 << 13;
    /// Trap EL1/EL0 WFE to EL2
    pub const TWE: u64 = 1 << 14;
    /// Trap EL1 SMC to EL2
    pub const TSC: u64 = 1 << 19;
    /// EL1 executes in AArch64 state
    pub const RW: u64 = 1 << 31;
}

bitflags! {
    /// SPSR_EL2 fields the hypervisor cares about
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Spsr: u64 {
        /// EL1 with its own stack pointer (EL1h)
        const MODE_EL1H = 0b0101;
        /// FIQ mask
        const F = 1 << 6;
        /// IRQ mask
        const I = 1 << 7;
        /// SError mask
        const A = 1 << 8;
        /// Debug mask
        const D = 1 << 9;
    }
}

impl Spsr {
    /// Boot state for a fresh vCPU: EL1h with everything masked, so the
    /// guest enables interrupts on its own terms.
    pub const fn boot() -> Self {
        Self::MODE_EL1H
            .union(Self::F)
            .union(Self::I)
            .union(Self::A)
            .union(Self::D)
    }
}

/// RES1 bit in MPIDR_EL1
pub const MPIDR_RES1: u64 = 1 << 31;

const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3f;
const ESR_ISS_MASK: u64 = 0x1ff_ffff;

/// HPFAR_EL2.FIPA field (bits 43:4 hold IPA bits 51:12)
const HPFAR_FIPA_MASK: u64 = 0xffff_ffff_ff0;

/// Synchronous exception classes the dispatcher distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    /// Trapped WFI or WFE
    Wfx,
    /// HVC from AArch64
    Hvc64,
    /// SMC from AArch64
    Smc64,
    /// Trapped MSR/MRS or system instruction
    SysReg,
    /// Instruction abort from a lower exception level
    InstrAbortLower,
    /// PC alignment fault
    PcAlignment,
    /// Data abort from a lower exception level
    DataAbortLower,
    /// Data abort taken at EL2 itself
    DataAbortEl2,
    /// SP alignment fault
    SpAlignment,
    /// Anything else
    Unknown(u8),
}

impl ExceptionClass {
    /// Decode ESR_EL2.EC
    pub fn from_esr(esr: u64) -> Self {
        match ((esr >> ESR_EC_SHIFT) & ESR_EC_MASK) as u8 {
            0x01 => Self::Wfx,
            0x16 => Self::Hvc64,
            0x17 => Self::Smc64,
            0x18 => Self::SysReg,
            0x20 => Self::InstrAbortLower,
            0x22 => Self::PcAlignment,
            0x24 => Self::DataAbortLower,
            0x25 => Self::DataAbortEl2,
            0x26 => Self::SpAlignment,
            ec => Self::Unknown(ec),
        }
    }
}

/// Access width recorded in the data-abort syndrome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Halfword,
    Word,
    Doubleword,
}

impl AccessSize {
    fn from_sas(sas: u64) -> Self {
        match sas & 0x3 {
            0 => Self::Byte,
            1 => Self::Halfword,
            2 => Self::Word,
            _ => Self::Doubleword,
        }
    }

    /// Width in bytes
    pub fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Halfword => 2,
            Self::Word => 4,
            Self::Doubleword => 8,
        }
    }
}

/// Decoded ISS of a data abort from a lower exception level
#[derive(Debug, Clone, Copy)]
pub struct DataAbortIss {
    /// Access size
    pub sas: AccessSize,
    /// Syndrome register transfer: index of the general register involved
    pub srt: usize,
    /// Sixty-four-bit register transfer
    pub sf: bool,
    /// FAR not valid
    pub fnv: bool,
    /// Write (true) or read (false)
    pub wnr: bool,
    /// Data fault status code
    pub dfsc: u8,
}

impl DataAbortIss {
    /// Decode the ISS field of a data-abort ESR value
    pub fn decode(esr: u64) -> Self {
        let iss = esr & ESR_ISS_MASK;
        Self {
            sas: AccessSize::from_sas((iss >> 22) & 0x3),
            srt: ((iss >> 16) & 0x1f) as usize,
            sf: (iss >> 15) & 1 != 0,
            fnv: (iss >> 10) & 1 != 0,
            wnr: (iss >> 6) & 1 != 0,
            dfsc: (iss & 0x3f) as u8,
        }
    }
}

/// Reassemble the faulting IPA from HPFAR_EL2.FIPA (page number) and the
/// page offset in FAR_EL2.
pub fn fault_ipa(far: u64, hpfar: u64) -> u64 {
    ((hpfar & HPFAR_FIPA_MASK) << 8) | (far & (PAGE_SIZE - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x01, ExceptionClass::Wfx; "wfx")]
    #[test_case(0x16, ExceptionClass::Hvc64; "hvc")]
    #[test_case(0x17, ExceptionClass::Smc64; "smc")]
    #[test_case(0x24, ExceptionClass::DataAbortLower; "data abort lower")]
    #[test_case(0x25, ExceptionClass::DataAbortEl2; "data abort el2")]
    #[test_case(0x3f, ExceptionClass::Unknown(0x3f); "unknown")]
    fn test_exception_class(ec: u64, expect: ExceptionClass) {
        assert_eq!(ExceptionClass::from_esr(ec << 26), expect);
    }

    #[test]
    fn test_data_abort_decode() {
        // 4-byte write to register x3
        let iss = (2u64 << 22) | (3 << 16) | (1 << 6) | 0x04;
        let decoded = DataAbortIss::decode((0x24 << 26) | iss);
        assert_eq!(decoded.sas, AccessSize::Word);
        assert_eq!(decoded.sas.bytes(), 4);
        assert_eq!(decoded.srt, 3);
        assert!(decoded.wnr);
        assert!(!decoded.fnv);
        assert_eq!(decoded.dfsc, 0x04);
    }

    #[test]
    fn test_fault_ipa_composition() {
        // IPA 0x0801_0040: HPFAR carries bits 51:12 at offset 4
        let hpfar = (0x0801_0040u64 >> 12) << 4;
        let far = 0xdead_b040u64; // only the page offset is used
        assert_eq!(fault_ipa(far, hpfar), 0x0801_0040);
    }

    #[test]
    fn test_spsr_boot_template() {
        let spsr = Spsr::boot();
        assert!(spsr.contains(Spsr::MODE_EL1H));
        assert!(spsr.contains(Spsr::I));
        assert_eq!(spsr.bits(), 0x3c5);
    }
}
