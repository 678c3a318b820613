//! ARM64 (AArch64) support: EL2 register programming, stage-2 MMU,
//! interrupt virtualization, timer, PSCI, and the trap dispatcher.

pub mod interrupt;
pub mod mmu;
pub mod psci;
pub mod regs;
pub mod timer;

/// Physical CPU id of the calling core.
///
/// Reads MPIDR Aff0, which matches the linear core numbering on the QEMU
/// virt machine.
#[cfg(target_arch = "aarch64")]
pub fn cpuid() -> usize {
    use aarch64_cpu::registers::MPIDR_EL1;
    use tock_registers::interfaces::Readable;

    (MPIDR_EL1.get() & 0xf) as usize
}

/// Hosted builds act as core 0.
#[cfg(not(target_arch = "aarch64"))]
pub fn cpuid() -> usize {
    0
}

/// Program HCR_EL2 for guest execution: stage-2 on, IRQs routed to EL2,
/// AArch64 EL1, SMC/WFI/WFE trapped.
#[cfg(target_arch = "aarch64")]
pub fn hcr_setup() {
    use crate::arch::arm64::regs::hcr;
    use aarch64_cpu::asm::barrier;

    let val = hcr::VM | hcr::SWIO | hcr::IMO | hcr::RW | hcr::TSC | hcr::TWI | hcr::TWE;
    unsafe {
        core::arch::asm!("msr hcr_el2, {}", in(reg) val);
    }
    barrier::isb(barrier::SY);
}

#[cfg(not(target_arch = "aarch64"))]
pub fn hcr_setup() {}
