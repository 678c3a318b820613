//! Stage-2 MMU control
//!
//! The stage-2 tables give each VM its guest-physical address space; this
//! module also owns the EL2 translation-control programming and the TLB
//! maintenance that table updates require.

pub mod stage2;

pub use stage2::Stage2Table;

/// Program VTCR_EL2 and MAIR_EL2 for stage-2 translation: 4KB granule,
/// 44-bit IPA starting at level 0, normal-WB and device attribute slots.
#[cfg(target_arch = "aarch64")]
pub fn stage2_mmu_init() {
    use aarch64_cpu::asm::barrier;

    // T0SZ=20, SL0=2 (start level 0), TG0=4K, inner shareable, PS=44-bit
    let vtcr: u64 = 20 | (2 << 6) | (3 << 8) | (3 << 10) | (3 << 12) | (4 << 16);
    // Slot 0: device nGnRnE; slot 1: normal non-cacheable
    let mair: u64 = 0x00 | (0x44 << 8);
    unsafe {
        core::arch::asm!("msr vtcr_el2, {}", in(reg) vtcr);
        core::arch::asm!("msr mair_el2, {}", in(reg) mair);
    }
    barrier::isb(barrier::SY);
}

#[cfg(not(target_arch = "aarch64"))]
pub fn stage2_mmu_init() {}

/// Invalidate all stage-1/stage-2 entries for the current VMID
#[cfg(target_arch = "aarch64")]
pub fn tlb_flush() {
    use aarch64_cpu::asm::barrier;

    barrier::dsb(barrier::ISHST);
    unsafe {
        core::arch::asm!("tlbi vmalls12e1");
    }
    barrier::dsb(barrier::ISH);
    barrier::isb(barrier::SY);
}

#[cfg(not(target_arch = "aarch64"))]
pub fn tlb_flush() {}
