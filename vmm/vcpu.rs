//! Virtual CPU registry and world-switch
//!
//! vCPUs live in a fixed pool and walk a one-way lifecycle:
//! UNUSED -> CREATED (pool claim) -> READY (boot state set) -> RUNNING
//! (world-switch). There is no teardown transition; VMs are not destroyed
//! in-process.
//!
//! Each physical core runs exactly one vCPU and is hard-pinned to it: the
//! world-switch refuses a vCPU whose index does not match the calling core.
//! That makes the per-vCPU state effectively core-local between traps.

use crate::arch::arm64::{self, mmu};
use crate::arch::arm64::interrupt::gic::GicState;
use crate::arch::arm64::interrupt::vgic::VgicCpu;
use crate::arch::arm64::regs::{Spsr, MPIDR_RES1};
use crate::config::VCPU_MAX;
use crate::sync::SpinLock;
use crate::vmm::vm::{self, VmId};
use crate::{Error, Result};

pub type VcpuId = usize;

/// Synthetic CPU identity presented to guests: Cortex-A72 r0p1
const MIDR_CORTEX_A72: u64 = 0x410f_d081;
/// SCTLR_EL1 reset value: MMU and caches off
const SCTLR_EL1_RESET: u64 = 0x30c5_0830;
/// Counter frequency reported to guests
const CNTFRQ_DEFAULT: u64 = 62_500_000;

/// vCPU lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Free pool slot
    Unused,
    /// Claimed, boot state not final yet
    Created,
    /// Runnable; waiting for its physical core to enter it
    Ready,
    /// A physical core is executing guest code on it
    Running,
}

/// General register file saved across traps
#[derive(Debug, Clone, Copy)]
pub struct RegFile {
    pub x: [u64; 31],
    pub spsr_el2: u64,
    pub elr_el2: u64,
}

impl RegFile {
    const fn new() -> Self {
        Self {
            x: [0; 31],
            spsr_el2: 0,
            elr_el2: 0,
        }
    }
}

/// Emulated EL1/EL0 system registers, restored on guest entry
#[derive(Debug, Clone, Copy)]
pub struct SysRegs {
    pub spsr_el1: u64,
    pub elr_el1: u64,
    pub mpidr_el1: u64,
    pub midr_el1: u64,
    pub sp_el0: u64,
    pub sp_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub vbar_el1: u64,
    pub sctlr_el1: u64,
    pub cntv_ctl_el0: u64,
    pub cntv_tval_el0: u64,
    pub cntfrq_el0: u64,
}

impl SysRegs {
    const fn new() -> Self {
        Self {
            spsr_el1: 0,
            elr_el1: 0,
            mpidr_el1: 0,
            midr_el1: 0,
            sp_el0: 0,
            sp_el1: 0,
            ttbr0_el1: 0,
            ttbr1_el1: 0,
            tcr_el1: 0,
            vbar_el1: 0,
            sctlr_el1: 0,
            cntv_ctl_el0: 0,
            cntv_tval_el0: 0,
            cntfrq_el0: 0,
        }
    }
}

/// One virtual core
pub struct Vcpu {
    pub reg: RegFile,
    pub sys: SysRegs,
    /// Virtual-GIC hardware snapshot restored on entry
    pub gic: GicState,
    /// List-register accounting
    pub vgic: VgicCpu,
    state: VcpuState,
    vm: Option<VmId>,
    id: VcpuId,
    /// Index within the VM; doubles as the physical core this vCPU is
    /// pinned to
    vcpu_idx: usize,
}

impl Vcpu {
    const fn new() -> Self {
        Self {
            reg: RegFile::new(),
            sys: SysRegs::new(),
            gic: GicState::boot(),
            vgic: VgicCpu::new(),
            state: VcpuState::Unused,
            vm: None,
            id: 0,
            vcpu_idx: 0,
        }
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn vm_id(&self) -> Option<VmId> {
        self.vm
    }

    pub fn vcpu_idx(&self) -> usize {
        self.vcpu_idx
    }

    /// Mark runnable. For vCPU 0 this happens at VM construction; for
    /// secondaries it is the PSCI CPU_ON hand-off point.
    pub fn set_ready(&mut self) {
        self.state = VcpuState::Ready;
    }
}

const VCPU_INIT: SpinLock<Vcpu> = SpinLock::new(Vcpu::new());
static VCPUS: [SpinLock<Vcpu>; VCPU_MAX] = [VCPU_INIT; VCPU_MAX];

/// Serializes the UNUSED -> CREATED pool scan
static POOL_LOCK: SpinLock<()> = SpinLock::new(());

/// Access a vCPU slot
pub fn get(id: VcpuId) -> &'static SpinLock<Vcpu> {
    &VCPUS[id]
}

fn alloc() -> Result<VcpuId> {
    let _guard = POOL_LOCK.lock();
    for (id, slot) in VCPUS.iter().enumerate() {
        let mut vcpu = slot.lock();
        if vcpu.state == VcpuState::Unused {
            vcpu.state = VcpuState::Created;
            vcpu.id = id;
            return Ok(id);
        }
    }
    Err(Error::NoResource)
}

/// Claim a pool slot and initialize boot state for virtual core `vcpu_idx`
/// of `vm_id`, entering at `entry`. The vCPU is CREATED, not yet READY.
pub fn create(vm_id: VmId, vcpu_idx: usize, entry: u64) -> Result<VcpuId> {
    let id = alloc()?;
    let mut vcpu = get(id).lock();

    vcpu.vm = Some(vm_id);
    vcpu.vcpu_idx = vcpu_idx;

    vcpu.reg = RegFile::new();
    vcpu.reg.elr_el2 = entry;
    vcpu.reg.spsr_el2 = Spsr::boot().bits();

    vcpu.sys = SysRegs::new();
    vcpu.sys.mpidr_el1 = vcpu_idx as u64 | MPIDR_RES1;
    vcpu.sys.midr_el1 = MIDR_CORTEX_A72;
    vcpu.sys.sctlr_el1 = SCTLR_EL1_RESET;
    vcpu.sys.cntfrq_el0 = CNTFRQ_DEFAULT;

    vcpu.gic = GicState::boot();
    vcpu.vgic = VgicCpu::new();

    Ok(id)
}

/// Mark a vCPU READY
pub fn ready(id: VcpuId) {
    get(id).lock().set_ready();
}

// The current vCPU of this physical core. On hardware it rides in
// TPIDR_EL2 (as id + 1 so zero means none); hosted builds model a single
// core with a static.

#[cfg(target_arch = "aarch64")]
fn current_raw() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mrs {}, tpidr_el2", out(reg) v) };
    v
}

#[cfg(target_arch = "aarch64")]
fn set_current_raw(v: u64) {
    unsafe { core::arch::asm!("msr tpidr_el2, {}", in(reg) v) };
}

#[cfg(not(target_arch = "aarch64"))]
static CURRENT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

#[cfg(not(target_arch = "aarch64"))]
fn current_raw() -> u64 {
    CURRENT.load(core::sync::atomic::Ordering::Relaxed)
}

#[cfg(not(target_arch = "aarch64"))]
fn set_current_raw(v: u64) {
    CURRENT.store(v, core::sync::atomic::Ordering::Relaxed);
}

/// Bind the calling core to `id`
fn set_current(id: VcpuId) {
    set_current_raw(id as u64 + 1);
}

/// The vCPU the calling core is running, if any
pub fn try_current() -> Option<&'static SpinLock<Vcpu>> {
    match current_raw() {
        0 => None,
        n => Some(get(n as usize - 1)),
    }
}

/// The vCPU the calling core is running; the trap path has one by
/// construction.
pub fn current() -> Result<&'static SpinLock<Vcpu>> {
    try_current().ok_or(Error::InvalidState)
}

#[cfg(target_arch = "aarch64")]
fn restore_sysregs(sys: &SysRegs) {
    macro_rules! wr {
        ($reg:literal, $val:expr) => {
            unsafe { core::arch::asm!(concat!("msr ", $reg, ", {}"), in(reg) $val) }
        };
    }
    wr!("spsr_el1", sys.spsr_el1);
    wr!("elr_el1", sys.elr_el1);
    // MPIDR/MIDR are emulated through their EL2 shadows
    wr!("vmpidr_el2", sys.mpidr_el1);
    wr!("vpidr_el2", sys.midr_el1);
    wr!("sp_el0", sys.sp_el0);
    wr!("sp_el1", sys.sp_el1);
    wr!("ttbr0_el1", sys.ttbr0_el1);
    wr!("ttbr1_el1", sys.ttbr1_el1);
    wr!("tcr_el1", sys.tcr_el1);
    wr!("vbar_el1", sys.vbar_el1);
    wr!("sctlr_el1", sys.sctlr_el1);
    wr!("cntv_ctl_el0", sys.cntv_ctl_el0);
    wr!("cntv_tval_el0", sys.cntv_tval_el0);
    wr!("cntfrq_el0", sys.cntfrq_el0);
}

#[cfg(not(target_arch = "aarch64"))]
fn restore_sysregs(_sys: &SysRegs) {}

#[cfg(target_arch = "aarch64")]
fn install_vttbr(root: u64) {
    unsafe { core::arch::asm!("msr vttbr_el2, {}", in(reg) root) };
    mmu::tlb_flush();
}

#[cfg(not(target_arch = "aarch64"))]
fn install_vttbr(_root: u64) {
    mmu::tlb_flush();
}

/// Enter guest context through the exception-return stub. Restores the
/// general register file from the current vCPU and ERETs; provided by the
/// boot assembly.
#[cfg(target_arch = "aarch64")]
fn enter_guest() -> ! {
    extern "C" {
        fn eret_vm() -> !;
    }
    unsafe { eret_vm() }
}

/// Switch the calling physical core into guest context on vCPU `id`.
///
/// Preconditions are hard: the vCPU must be READY and its index must match
/// the calling core (this is an affinity pin, not a scheduler). Violations
/// return an error the boot path treats as fatal. On hardware this function
/// does not return on success; hosted builds stop short of the exception
/// return so the state transition stays testable.
pub fn world_switch(id: VcpuId) -> Result<()> {
    {
        let mut vcpu = get(id).lock();

        if vcpu.state != VcpuState::Ready {
            log::error!("vcpu {}: world switch while {:?}", id, vcpu.state);
            return Err(Error::InvalidState);
        }
        if arm64::cpuid() != vcpu.vcpu_idx {
            log::error!(
                "vcpu {}: affinity mismatch, core {} vs pin {}",
                id,
                arm64::cpuid(),
                vcpu.vcpu_idx
            );
            return Err(Error::InvalidState);
        }

        let vm = vm::get(vcpu.vm.ok_or(Error::InvalidState)?);

        set_current(id);
        vcpu.state = VcpuState::Running;

        install_vttbr(vm.stage2_root()?);
        restore_sysregs(&vcpu.sys);
        vm.vgic().chip()?.restore_state(&vcpu.gic);

        log::trace!("enter vm '{}' vcpu {}", vm.name(), vcpu.vcpu_idx);
    }

    #[cfg(target_arch = "aarch64")]
    enter_guest();

    #[cfg(not(target_arch = "aarch64"))]
    Ok(())
}

/// Enter the vCPU assigned to the calling core. VM construction lays vCPUs
/// out so that pool slot, VM index and physical core number coincide for
/// the boot VM.
pub fn enter_vcpu() -> Result<()> {
    world_switch(arm64::cpuid())
}

/// Structured diagnostic dump, the fatal-path contract
pub fn dump(vcpu: &Vcpu) {
    log::error!("vcpu[{}] register dump, state {:?}", vcpu.id, vcpu.state);
    for (i, chunk) in vcpu.reg.x.chunks(4).enumerate() {
        match chunk {
            [a, b, c, d] => log::error!(
                "x{:<2} {:#018x} x{:<2} {:#018x} x{:<2} {:#018x} x{:<2} {:#018x}",
                i * 4, a, i * 4 + 1, b, i * 4 + 2, c, i * 4 + 3, d
            ),
            [a, b, c] => log::error!(
                "x{:<2} {:#018x} x{:<2} {:#018x} x{:<2} {:#018x}",
                i * 4, a, i * 4 + 1, b, i * 4 + 2, c
            ),
            _ => {}
        }
    }
    log::error!(
        "spsr_el2 {:#018x} elr_el2 {:#018x}",
        vcpu.reg.spsr_el2,
        vcpu.reg.elr_el2
    );
    log::error!(
        "sctlr_el1 {:#018x} ttbr0_el1 {:#018x} ttbr1_el1 {:#018x}",
        vcpu.sys.sctlr_el1,
        vcpu.sys.ttbr0_el1,
        vcpu.sys.ttbr1_el1
    );
    log::error!(
        "vbar_el1 {:#018x} sp_el1 {:#018x} mpidr_el1 {:#018x}",
        vcpu.sys.vbar_el1,
        vcpu.sys.sp_el1,
        vcpu.sys.mpidr_el1
    );
}
