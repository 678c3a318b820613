//! Trap dispatcher
//!
//! Synchronous guest exceptions are classified by ESR_EL2.EC and routed to
//! the matching emulation; physical interrupts taken from guest context go
//! through list-register reclaim, acknowledge, priority drop and
//! pass-through injection. Everything the dispatcher cannot classify is a
//! guest protocol violation and fatal: the caller dumps the vCPU and halts
//! the core.

use crate::arch::arm64::interrupt::gic::IrqChip;
use crate::arch::arm64::interrupt::vgic;
use crate::arch::arm64::psci;
use crate::arch::arm64::regs::{fault_ipa, DataAbortIss, ExceptionClass};
use crate::arch::arm64::timer;
use crate::config::{PTIMER_IRQ, UART_IRQ};
use crate::drivers::uart;
use crate::vmm::mmio::{self, MmioAccess};
use crate::vmm::vcpu::Vcpu;
use crate::vmm::vm;
use crate::{Error, Result};

/// How long the WFI/WFE emulation polls for a pending list register before
/// handing the core back to the guest anyway. A cooperative yield, not a
/// real block.
pub const WFI_POLL_TIMEOUT_NS: u64 = 10_000;

/// Hypervisor tick period
const TIMER_TICK_NS: u64 = 100_000;

/// Trapped instructions are 4 bytes; the data-abort and SMC paths must
/// step over them by hand.
pub fn advance_pc(vcpu: &mut Vcpu) {
    vcpu.reg.elr_el2 += 4;
}

fn chip_of(vcpu: &Vcpu) -> Result<&'static dyn IrqChip> {
    vm::get(vcpu.vm_id().ok_or(Error::InvalidState)?).vgic().chip()
}

/// WFI/WFE emulation: poll for a pending virtual interrupt within a bounded
/// window, then resume the guest regardless of the outcome.
fn wfx_emulate(vcpu: &mut Vcpu) -> Result<()> {
    let chip = chip_of(vcpu)?;
    let deadline = timer::now_ns() + WFI_POLL_TIMEOUT_NS;

    while timer::now_ns() < deadline {
        if chip.has_pending_lr() {
            log::trace!("wfx: pending list register, resuming guest");
            break;
        }
        core::hint::spin_loop();
    }

    advance_pc(vcpu);
    Ok(())
}

fn standard_service_call(vcpu: &mut Vcpu) -> Result<i64> {
    let fid = vcpu.reg.x[0];
    let (x1, x2, x3) = (vcpu.reg.x[1], vcpu.reg.x[2], vcpu.reg.x[3]);

    if psci::is_psci_fid(fid) {
        psci::handler(vcpu, fid as u32, x1, x2, x3)
    } else {
        log::error!("service: unknown standard-service fid {:#x}", fid);
        Err(Error::Unsupported)
    }
}

/// Standardized service dispatch shared by HVC and SMC. Only
/// power-state-coordination calls are recognized.
fn service_call(vcpu: &mut Vcpu) -> Result<()> {
    let fid = vcpu.reg.x[0];
    if !psci::is_std_service_fid(fid) {
        log::error!("service: unknown service range for fid {:#x}", fid);
        return Err(Error::Unsupported);
    }
    let ret = standard_service_call(vcpu)?;
    vcpu.reg.x[0] = ret as u64;
    Ok(())
}

/// HVC already advanced the guest PC when it trapped; do not touch ELR_EL2.
fn hvc_handler(vcpu: &mut Vcpu) -> Result<()> {
    service_call(vcpu)
}

/// SMC does not auto-advance; step over the instruction after dispatch.
fn smc_handler(vcpu: &mut Vcpu) -> Result<()> {
    service_call(vcpu)?;
    advance_pc(vcpu);
    Ok(())
}

/// Decode a stage-2 data abort and hand it to the MMIO framework; on
/// success the trapping instruction is stepped over.
fn data_abort_handler(vcpu: &mut Vcpu, esr: u64, far: u64, hpfar: u64) -> Result<()> {
    let iss = DataAbortIss::decode(esr);
    if iss.fnv {
        log::error!("data abort: faulting address not valid");
        return Err(Error::InvalidArgument);
    }

    let access = MmioAccess {
        ipa: fault_ipa(far, hpfar),
        pc: vcpu.reg.elr_el2,
        sas: iss.sas,
        wnr: iss.wnr,
    };
    mmio::dispatch(vcpu, iss.srt, &access)?;

    advance_pc(vcpu);
    Ok(())
}

/// Synchronous exception dispatch for traps from guest context.
pub fn handle_sync(vcpu: &mut Vcpu, esr: u64, far: u64, hpfar: u64) -> Result<()> {
    match ExceptionClass::from_esr(esr) {
        ExceptionClass::Wfx => wfx_emulate(vcpu),
        ExceptionClass::Hvc64 => hvc_handler(vcpu),
        ExceptionClass::Smc64 => smc_handler(vcpu),
        ExceptionClass::DataAbortLower => data_abort_handler(vcpu, esr, far, hpfar),
        cls => {
            log::error!(
                "trap: unsupported exception class {:?} (esr {:#x}, far {:#x})",
                cls,
                esr,
                far
            );
            Err(Error::Unsupported)
        }
    }
}

/// Physical interrupt taken while a guest was running.
///
/// Order matters: reclaim inactive list registers before allocating a new
/// one, acknowledge, drop priority (deactivation rides on the guest's EOI
/// through the hardware-backed list register), then inject pass-through
/// (pirq == virq). Exhaustion drops the interrupt for this cycle; there is
/// no software pending queue to park it in.
pub fn handle_guest_irq(vcpu: &mut Vcpu) -> Result<()> {
    let chip = chip_of(vcpu)?;

    vcpu.vgic.used_lr_update(chip);

    let intid = chip.ack() & 0xff_ffff;
    if intid >= 1020 {
        // Spurious
        return Ok(());
    }

    if intid == PTIMER_IRQ {
        // Hypervisor tick; never guest-visible
        timer::disable();
        timer::reload(TIMER_TICK_NS);
        timer::enable();
        chip.host_eoi(intid, 1);
        return Ok(());
    }

    chip.guest_eoi(intid, 1);

    if vgic::inject_virq(&mut vcpu.vgic, chip, intid, intid, 1).is_err() {
        log::warn!("irq {}: dropped, no free list register", intid);
    }
    Ok(())
}

/// Physical interrupt taken in hypervisor context: console and tick are
/// consumed right here.
pub fn handle_el2_irq(chip: &dyn IrqChip) {
    let intid = chip.ack() & 0xff_ffff;
    if intid >= 1020 {
        return;
    }

    match intid {
        UART_IRQ => {
            log::trace!("el2 console interrupt, status {:#x}", uart::interrupt_status());
            uart::clear_interrupt();
        }
        PTIMER_IRQ => {
            timer::disable();
            timer::reload(TIMER_TICK_NS);
            timer::enable();
        }
        _ => log::warn!("el2: unexpected interrupt {}", intid),
    }

    chip.host_eoi(intid, 1);
}

// Vector-table entry points. The vector stubs in the boot assembly save the
// guest register file into the current vCPU and call these.
#[cfg(target_arch = "aarch64")]
mod vectors {
    use super::*;
    use crate::arch::arm64::interrupt::gic::v3::GICV3;
    use crate::vmm::vcpu;

    macro_rules! read_sysreg {
        ($reg:literal) => {{
            let v: u64;
            unsafe { core::arch::asm!(concat!("mrs {}, ", $reg), out(reg) v) };
            v
        }};
    }

    /// Synchronous trap from EL1/EL0
    #[no_mangle]
    pub extern "C" fn lower_el_sync_handler() {
        let esr = read_sysreg!("esr_el2");
        let far = read_sysreg!("far_el2");
        let hpfar = read_sysreg!("hpfar_el2");

        let Ok(slot) = vcpu::current() else {
            panic!("sync trap with no current vcpu (esr {:#x})", esr);
        };
        let mut vcpu = slot.lock();
        if let Err(e) = handle_sync(&mut vcpu, esr, far, hpfar) {
            vcpu::dump(&vcpu);
            panic!(
                "sync trap failed: {:?} (esr {:#x}, far {:#x}, hpfar {:#x})",
                e, esr, far, hpfar
            );
        }
    }

    /// Physical interrupt from guest context
    #[no_mangle]
    pub extern "C" fn lower_el_irq_handler() {
        let Ok(slot) = vcpu::current() else {
            panic!("irq trap with no current vcpu");
        };
        let mut vcpu = slot.lock();
        if let Err(e) = handle_guest_irq(&mut vcpu) {
            vcpu::dump(&vcpu);
            panic!("irq trap failed: {:?}", e);
        }
    }

    /// The hypervisor faulted on itself; nothing to recover.
    #[no_mangle]
    pub extern "C" fn el2_sync_handler() -> ! {
        let esr = read_sysreg!("esr_el2");
        let far = read_sysreg!("far_el2");
        let elr = read_sysreg!("elr_el2");
        panic!(
            "EL2 sync exception: esr {:#x}, far {:#x}, elr {:#x}",
            esr, far, elr
        );
    }

    /// Physical interrupt in hypervisor context
    #[no_mangle]
    pub extern "C" fn el2_irq_handler() {
        handle_el2_irq(&GICV3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::gic::fake::FakeGic;
    use crate::arch::arm64::interrupt::gic::{lr, make_lr};
    use crate::arch::arm64::regs::AccessSize;
    use crate::vmm::vcpu::{self, VcpuState};
    use crate::vmm::vm;
    use std::sync::Mutex;

    const DA_EC: u64 = 0x24 << 26;

    fn data_abort_esr(sas: u64, srt: u64, write: bool) -> u64 {
        DA_EC | (sas << 22) | (srt << 16) | ((write as u64) << 6)
    }

    fn fault_regs(ipa: u64) -> (u64, u64) {
        ((ipa & 0xfff) | 0x5000, (ipa >> 12) << 4)
    }

    #[test]
    fn test_data_abort_write_dispatch() {
        static WRITES: Mutex<Vec<(u64, u64, AccessSize)>> = Mutex::new(Vec::new());

        fn record(
            _v: &mut Vcpu,
            off: u64,
            val: u64,
            access: &MmioAccess,
        ) -> Result<()> {
            WRITES.lock().unwrap().push((off, val, access.sas));
            Ok(())
        }

        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);
        let base = 0x4200_0000u64;
        vm.trap_region(base, 0x1000, None, Some(record)).unwrap();

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();
        vcpu.reg.x[3] = 0xdead_beef;
        let pc = vcpu.reg.elr_el2;

        // 4-byte write through x3 at offset 0x40
        let (far, hpfar) = fault_regs(base + 0x40);
        handle_sync(&mut vcpu, data_abort_esr(2, 3, true), far, hpfar).unwrap();

        let writes = WRITES.lock().unwrap();
        assert_eq!(writes.as_slice(), &[(0x40, 0xdead_beef, AccessSize::Word)]);
        // Exactly one instruction width
        assert_eq!(vcpu.reg.elr_el2, pc + 4);
    }

    #[test]
    fn test_data_abort_read_dispatch() {
        fn supply(_v: &mut Vcpu, _off: u64, val: &mut u64, _a: &MmioAccess) -> Result<()> {
            *val = 0x77;
            Ok(())
        }

        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);
        let base = 0x4300_0000u64;
        vm.trap_region(base, 0x1000, Some(supply), None).unwrap();

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();
        let pc = vcpu.reg.elr_el2;

        let (far, hpfar) = fault_regs(base + 8);
        handle_sync(&mut vcpu, data_abort_esr(3, 5, false), far, hpfar).unwrap();
        assert_eq!(vcpu.reg.x[5], 0x77);
        assert_eq!(vcpu.reg.elr_el2, pc + 4);

        // Register 31 discards the result
        let (far, hpfar) = fault_regs(base + 8);
        handle_sync(&mut vcpu, data_abort_esr(3, 31, false), far, hpfar).unwrap();
        assert_eq!(vcpu.reg.x[30], 0);
    }

    #[test]
    fn test_data_abort_unclaimed_region_fails() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();

        let (far, hpfar) = fault_regs(0x4400_0000);
        assert_eq!(
            handle_sync(&mut vcpu, data_abort_esr(2, 0, true), far, hpfar),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_wfx_poll_resumes_guest() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();
        let pc = vcpu.reg.elr_el2;

        // Nothing pending: times out, still resumes
        handle_sync(&mut vcpu, 0x01 << 26, 0, 0).unwrap();
        assert_eq!(vcpu.reg.elr_el2, pc + 4);

        // Pending list register: resumes promptly
        chip.set_lr(0, make_lr(48, 48, 1));
        handle_sync(&mut vcpu, 0x01 << 26, 0, 0).unwrap();
        assert_eq!(vcpu.reg.elr_el2, pc + 8);
    }

    #[test]
    fn test_hvc_psci_version() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();
        vcpu.reg.x[0] = psci::fid::VERSION as u64;
        let pc = vcpu.reg.elr_el2;

        handle_sync(&mut vcpu, 0x16 << 26, 0, 0).unwrap();
        assert_eq!(vcpu.reg.x[0], psci::VERSION_0_2 as u64);
        // HVC already advanced the PC in hardware
        assert_eq!(vcpu.reg.elr_el2, pc);
    }

    #[test]
    fn test_smc_advances_pc() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();
        vcpu.reg.x[0] = psci::fid::FEATURES as u64;
        vcpu.reg.x[1] = psci::fid::VERSION as u64;
        let pc = vcpu.reg.elr_el2;

        handle_sync(&mut vcpu, 0x17 << 26, 0, 0).unwrap();
        assert_eq!(vcpu.reg.x[0], psci::status::SUCCESS as u64);
        assert_eq!(vcpu.reg.elr_el2, pc + 4);
    }

    #[test]
    fn test_psci_cpu_on_readies_secondary() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(2, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let v1 = vm.vcpu_id(1).unwrap();
        assert_eq!(vcpu::get(v1).lock().state(), VcpuState::Created);

        {
            let mut vcpu = vcpu::get(v0).lock();
            vcpu.reg.x[0] = psci::fid::CPU_ON64 as u64;
            vcpu.reg.x[1] = 1;
            vcpu.reg.x[2] = 0x4000_1000;
            handle_sync(&mut vcpu, 0x16 << 26, 0, 0).unwrap();
            assert_eq!(vcpu.reg.x[0], psci::status::SUCCESS as u64);
        }

        let target = vcpu::get(v1).lock();
        assert_eq!(target.state(), VcpuState::Ready);
        assert_eq!(target.reg.elr_el2, 0x4000_1000);
    }

    #[test]
    fn test_unknown_service_fid_is_fatal() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();
        vcpu.reg.x[0] = 0x8600_0001;
        assert_eq!(
            handle_sync(&mut vcpu, 0x16 << 26, 0, 0),
            Err(Error::Unsupported)
        );
    }

    #[test]
    fn test_unsupported_exception_class_is_fatal() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();
        // Instruction abort from a lower level is not emulated
        assert_eq!(
            handle_sync(&mut vcpu, 0x20 << 26, 0, 0),
            Err(Error::Unsupported)
        );
    }

    #[test]
    fn test_guest_irq_injected_passthrough() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();

        chip.push_ack(48);
        handle_guest_irq(&mut vcpu).unwrap();

        // Priority drop happened, and the same id went into a list register
        assert!(chip.state.lock().eois.contains(&(48, 1)));
        let lr_val = chip.lr(0);
        assert_eq!(lr_val, make_lr(48, 48, 1));
        assert_eq!(lr_val & lr::VINTID_MASK, 48);
    }

    #[test]
    fn test_timer_tick_not_injected() {
        let chip = FakeGic::leak(4, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();

        chip.push_ack(PTIMER_IRQ);
        handle_guest_irq(&mut vcpu).unwrap();

        // Consumed at EL2: dropped and deactivated, no list register used
        assert!(chip.state.lock().deactivated.contains(&PTIMER_IRQ));
        assert_eq!(chip.lr(0), 0);
        assert_eq!(vcpu.vgic.used_count(), 0);
    }

    #[test]
    fn test_irq_dropped_on_lr_exhaustion() {
        let chip = FakeGic::leak(2, 987);
        let vm_id = vm::testing::create_test_vm(1, chip);
        let vm = vm::get(vm_id);

        let v0 = vm.vcpu_id(0).unwrap();
        let mut vcpu = vcpu::get(v0).lock();

        for irq in [40u32, 41, 42] {
            chip.push_ack(irq);
            handle_guest_irq(&mut vcpu).unwrap();
        }
        // Two made it into hardware, the third was dropped without error
        assert_eq!(vcpu.vgic.used_count(), 2);
        assert_eq!(chip.lr(0) & lr::VINTID_MASK, 40);
        assert_eq!(chip.lr(1) & lr::VINTID_MASK, 41);

        // Once the guest drains one, the reclaim path frees it up again
        chip.set_lr(0, 0);
        chip.push_ack(43);
        handle_guest_irq(&mut vcpu).unwrap();
        assert_eq!(chip.lr(0) & lr::VINTID_MASK, 43);
    }

    #[test]
    fn test_el2_irq_consumed() {
        let chip = FakeGic::new(4, 987);
        chip.push_ack(UART_IRQ);
        handle_el2_irq(&chip);
        assert!(chip.state.lock().eois.contains(&(UART_IRQ, 1)));
        assert!(chip.state.lock().deactivated.contains(&UART_IRQ));
    }
}
