//! GICv3 driver and the physical interrupt controller contract
//!
//! The hypervisor core never touches GIC hardware directly; it goes through
//! the [`IrqChip`] trait so the virtual-interrupt logic stays testable and a
//! fuller interrupt state machine can be substituted without touching the
//! trap dispatcher. The one real implementation drives a GICv3 through its
//! memory-mapped distributor/redistributor and the ICC/ICH system registers.

/// Number of software-generated interrupt ids (0..16)
pub const SGI_COUNT: usize = 16;
/// Number of private peripheral interrupt ids (16..32)
pub const PPI_COUNT: usize = 16;
/// First shared peripheral interrupt id
pub const SPI_BASE: u32 = 32;
/// Highest interrupt id that is not architecturally reserved
pub const INTID_LIMIT: u32 = 1020;
/// Largest number of shared-peripheral records a VM can need
pub const SPI_RECORDS: usize = (INTID_LIMIT - SPI_BASE) as usize;

/// Hardware bound on list registers (ICH_LR0..ICH_LR15)
pub const LR_MAX: usize = 16;

/// Which class an interrupt id falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntIdClass {
    /// Software-generated interrupt, banked per vCPU
    Sgi,
    /// Private peripheral interrupt, banked per vCPU
    Ppi,
    /// Shared peripheral interrupt, per VM
    Spi,
}

/// Classify an interrupt id; ids in the reserved range have no class.
pub fn classify(intid: u32) -> Option<IntIdClass> {
    match intid {
        0..=15 => Some(IntIdClass::Sgi),
        16..=31 => Some(IntIdClass::Ppi),
        32..=1019 => Some(IntIdClass::Spi),
        _ => None,
    }
}

pub fn is_sgi(intid: u32) -> bool {
    intid < 16
}

pub fn is_ppi(intid: u32) -> bool {
    (16..32).contains(&intid)
}

pub fn is_spi(intid: u32) -> bool {
    (32..INTID_LIMIT).contains(&intid)
}

/// Distributor register offsets (GICv3)
pub mod gicd {
    pub const CTLR: u64 = 0x0;
    pub const TYPER: u64 = 0x4;
    pub const IIDR: u64 = 0x8;
    pub const TYPER2: u64 = 0xc;
    pub const IGROUPR: u64 = 0x080;
    pub const ISENABLER: u64 = 0x100;
    pub const ICENABLER: u64 = 0x180;
    pub const ISPENDR: u64 = 0x200;
    pub const ICPENDR: u64 = 0x280;
    pub const ISACTIVER: u64 = 0x300;
    pub const ICACTIVER: u64 = 0x380;
    pub const IPRIORITYR: u64 = 0x400;
    pub const ITARGETSR: u64 = 0x800;
    pub const ICFGR: u64 = 0xc00;
    pub const IROUTER: u64 = 0x6000;

    /// CTLR: enable non-secure Group 1 (double security state view)
    pub const CTLR_G1NS_EN: u32 = 1 << 1;
    /// CTLR: affinity routing enabled, non-secure
    pub const CTLR_ARE_NS: u32 = 1 << 5;
    /// CTLR: enable Group 0 (single security state view)
    pub const CTLR_SS_ENGRP0: u32 = 1 << 0;
    /// CTLR: enable Group 1 (single security state view)
    pub const CTLR_SS_ENGRP1: u32 = 1 << 1;
}

/// Redistributor register offsets; the SGI page sits 64K above RD_base
pub mod gicr {
    pub const CTLR: u64 = 0x0;
    pub const IIDR: u64 = 0x4;
    pub const TYPER: u64 = 0x8;
    pub const WAKER: u64 = 0x14;

    pub const SGI_BASE: u64 = 0x10000;
    pub const IGROUPR0: u64 = SGI_BASE + 0x80;
    pub const ISENABLER0: u64 = SGI_BASE + 0x100;
    pub const ICENABLER0: u64 = SGI_BASE + 0x180;
    pub const ISPENDR0: u64 = SGI_BASE + 0x200;
    pub const ICPENDR0: u64 = SGI_BASE + 0x280;
    pub const ISACTIVER0: u64 = SGI_BASE + 0x300;
    pub const ICACTIVER0: u64 = SGI_BASE + 0x380;
    pub const IPRIORITYR: u64 = SGI_BASE + 0x400;
    pub const ICFGR0: u64 = SGI_BASE + 0xc00;
    pub const ICFGR1: u64 = SGI_BASE + 0xc04;
    pub const IGRPMODR0: u64 = SGI_BASE + 0xd00;

    /// WAKER: processor sleep request
    pub const WAKER_PS: u32 = 1 << 1;
    /// WAKER: children asleep
    pub const WAKER_CA: u32 = 1 << 2;
}

/// ICH_LR_EL2 field encoding
pub mod lr {
    /// Virtual interrupt id, bits 31:0
    pub const VINTID_MASK: u64 = 0xffff_ffff;
    /// Physical interrupt id, bits 44:32
    pub const PINTID_SHIFT: u64 = 32;
    pub const PINTID_MASK: u64 = 0x1fff << PINTID_SHIFT;
    /// Interrupt group bit
    pub const GROUP_SHIFT: u64 = 60;
    /// Hardware-backed: guest EOI deactivates the physical interrupt
    pub const HW: u64 = 1 << 61;
    /// Delivery state, bits 63:62
    pub const STATE_SHIFT: u64 = 62;
    pub const STATE_MASK: u64 = 0b11 << STATE_SHIFT;
}

/// List-register delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrState {
    Inactive,
    Pending,
    Active,
    PendingActive,
}

/// Decode the state field of a list-register value
pub fn lr_state(val: u64) -> LrState {
    match (val >> lr::STATE_SHIFT) & 0b11 {
        0 => LrState::Inactive,
        1 => LrState::Pending,
        2 => LrState::Active,
        _ => LrState::PendingActive,
    }
}

pub fn lr_is_inactive(val: u64) -> bool {
    lr_state(val) == LrState::Inactive
}

pub fn lr_is_pending(val: u64) -> bool {
    lr_state(val) == LrState::Pending
}

/// Build a list-register value injecting `virq` as pending, hardware-backed
/// by `pirq`, in the given group. The only delivery path; assumes the
/// pass-through pirq == virq convention upstream.
pub fn make_lr(pirq: u32, virq: u32, group: u32) -> u64 {
    ((LrState::Pending as u64) << lr::STATE_SHIFT)
        | lr::HW
        | ((group as u64 & 1) << lr::GROUP_SHIFT)
        | (((pirq as u64) << lr::PINTID_SHIFT) & lr::PINTID_MASK)
        | (virq as u64 & lr::VINTID_MASK)
}

/// Per-vCPU snapshot of the virtual-GIC hardware state, restored on every
/// world-switch into the vCPU.
#[derive(Debug, Clone, Copy)]
pub struct GicState {
    /// List registers
    pub lr: [u64; LR_MAX],
    /// ICH_VMCR_EL2
    pub vmcr: u64,
    /// ICC_SRE_EL1 bits the guest turned on
    pub sre: u64,
}

/// ICH_VMCR_EL2: enable virtual Group 1
pub const ICH_VMCR_VENG1: u64 = 1 << 1;
/// ICH_HCR_EL2: virtual CPU interface enable
pub const ICH_HCR_EN: u64 = 1 << 0;

impl GicState {
    /// Boot state: empty list registers, virtual Group 1 enabled
    pub const fn boot() -> Self {
        Self {
            lr: [0; LR_MAX],
            vmcr: ICH_VMCR_VENG1,
            sre: 0,
        }
    }
}

impl Default for GicState {
    fn default() -> Self {
        Self::boot()
    }
}

/// Contract between the hypervisor core and the physical interrupt
/// controller.
pub trait IrqChip: Send + Sync {
    /// Highest implemented shared-peripheral interrupt id
    fn max_spi(&self) -> u32;

    /// Number of hardware list registers
    fn nr_list_regs(&self) -> usize;

    /// Read list register `n`
    fn read_lr(&self, n: usize) -> u64;

    /// Write list register `n`
    fn write_lr(&self, n: usize, val: u64);

    /// True if any list register holds a pending virtual interrupt
    fn has_pending_lr(&self) -> bool {
        (0..self.nr_list_regs()).any(|n| lr_is_pending(self.read_lr(n)))
    }

    /// Acknowledge the highest-priority pending interrupt (read IAR)
    fn ack(&self) -> u32;

    /// Priority drop only; deactivation is left to the guest EOI via the
    /// hardware-backed list register (EOImode == 1)
    fn guest_eoi(&self, intid: u32, group: u32);

    /// Priority drop plus explicit deactivation, for interrupts the
    /// hypervisor consumes itself
    fn host_eoi(&self, intid: u32, group: u32);

    /// Explicitly deactivate an interrupt
    fn deactivate(&self, intid: u32);

    /// Forward an enable to the distributor/redistributor
    fn enable_irq(&self, intid: u32);

    /// Forward a disable to the distributor/redistributor
    fn disable_irq(&self, intid: u32);

    /// Current hardware enable state
    fn is_irq_enabled(&self, intid: u32) -> bool;

    /// Program SPI routing by affinity (GICD_IROUTER)
    fn set_route_affinity(&self, intid: u32, aff: u64);

    /// Program SPI routing by PE target field (GICD_ITARGETSR)
    fn set_route_target(&self, intid: u32, target: u8);

    /// Raw distributor read, for identification fields passed through to
    /// guests
    fn gicd_read32(&self, offset: u64) -> u32;

    /// Raw redistributor read for the given core's frame
    fn gicr_read64(&self, cpu: usize, offset: u64) -> u64;

    /// Restore a vCPU's virtual-GIC hardware state. Every list register is
    /// written back; order does not matter.
    fn restore_state(&self, state: &GicState);
}

/// The GICv3 driver used on hardware.
#[cfg(target_arch = "aarch64")]
pub mod v3 {
    use super::*;
    use crate::config::{GICD_BASE, GICR_BASE, GICR_STRIDE};
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn gicd_read(offset: u64) -> u32 {
        unsafe { core::ptr::read_volatile((GICD_BASE + offset) as *const u32) }
    }

    fn gicd_write(offset: u64, val: u32) {
        unsafe { core::ptr::write_volatile((GICD_BASE + offset) as *mut u32, val) }
    }

    fn gicr_read32(cpu: usize, offset: u64) -> u32 {
        let base = GICR_BASE + cpu as u64 * GICR_STRIDE;
        unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
    }

    fn gicr_write32(cpu: usize, offset: u64, val: u32) {
        let base = GICR_BASE + cpu as u64 * GICR_STRIDE;
        unsafe { core::ptr::write_volatile((base + offset) as *mut u32, val) }
    }

    macro_rules! read_sysreg {
        ($reg:literal) => {{
            let v: u64;
            unsafe { core::arch::asm!(concat!("mrs {}, ", $reg), out(reg) v) };
            v
        }};
    }

    macro_rules! write_sysreg {
        ($reg:literal, $val:expr) => {{
            let v: u64 = $val;
            unsafe { core::arch::asm!(concat!("msr ", $reg, ", {}"), in(reg) v) };
        }};
    }

    fn read_lr_raw(n: usize) -> u64 {
        match n {
            0 => read_sysreg!("ich_lr0_el2"),
            1 => read_sysreg!("ich_lr1_el2"),
            2 => read_sysreg!("ich_lr2_el2"),
            3 => read_sysreg!("ich_lr3_el2"),
            4 => read_sysreg!("ich_lr4_el2"),
            5 => read_sysreg!("ich_lr5_el2"),
            6 => read_sysreg!("ich_lr6_el2"),
            7 => read_sysreg!("ich_lr7_el2"),
            8 => read_sysreg!("ich_lr8_el2"),
            9 => read_sysreg!("ich_lr9_el2"),
            10 => read_sysreg!("ich_lr10_el2"),
            11 => read_sysreg!("ich_lr11_el2"),
            12 => read_sysreg!("ich_lr12_el2"),
            13 => read_sysreg!("ich_lr13_el2"),
            14 => read_sysreg!("ich_lr14_el2"),
            15 => read_sysreg!("ich_lr15_el2"),
            _ => panic!("gicv3: list register {} out of range", n),
        }
    }

    fn write_lr_raw(n: usize, val: u64) {
        match n {
            0 => write_sysreg!("ich_lr0_el2", val),
            1 => write_sysreg!("ich_lr1_el2", val),
            2 => write_sysreg!("ich_lr2_el2", val),
            3 => write_sysreg!("ich_lr3_el2", val),
            4 => write_sysreg!("ich_lr4_el2", val),
            5 => write_sysreg!("ich_lr5_el2", val),
            6 => write_sysreg!("ich_lr6_el2", val),
            7 => write_sysreg!("ich_lr7_el2", val),
            8 => write_sysreg!("ich_lr8_el2", val),
            9 => write_sysreg!("ich_lr9_el2", val),
            10 => write_sysreg!("ich_lr10_el2", val),
            11 => write_sysreg!("ich_lr11_el2", val),
            12 => write_sysreg!("ich_lr12_el2", val),
            13 => write_sysreg!("ich_lr13_el2", val),
            14 => write_sysreg!("ich_lr14_el2", val),
            15 => write_sysreg!("ich_lr15_el2", val),
            _ => panic!("gicv3: list register {} out of range", n),
        }
    }

    /// The physical GICv3
    pub struct GicV3 {
        nr_lrs: AtomicUsize,
        max_spi: AtomicU32,
    }

    /// Global driver instance
    pub static GICV3: GicV3 = GicV3 {
        nr_lrs: AtomicUsize::new(0),
        max_spi: AtomicU32::new(0),
    };

    impl GicV3 {
        /// One-time distributor bring-up, then the per-core half for the
        /// boot core.
        pub fn init(&self) {
            let typer = gicd_read(gicd::TYPER);
            let spi_num = ((typer & 0x1f) + 1) * 32;
            let max_spi = (spi_num - 1).min(INTID_LIMIT - 1);
            self.max_spi.store(max_spi, Ordering::Relaxed);

            // Disable both groups while reconfiguring
            gicd_write(
                gicd::CTLR,
                gicd_read(gicd::CTLR) & !(gicd::CTLR_SS_ENGRP0 | gicd::CTLR_SS_ENGRP1),
            );

            // SPIs: disabled, not pending, default priority, level
            // triggered, routed to core 0, Group 1
            for i in (SPI_BASE / 32)..(spi_num / 32) {
                gicd_write(gicd::ICENABLER + i as u64 * 4, !0);
                gicd_write(gicd::ICPENDR + i as u64 * 4, !0);
                gicd_write(gicd::IGROUPR + i as u64 * 4, !0);
            }
            for i in (SPI_BASE / 4)..(spi_num / 4) {
                gicd_write(gicd::IPRIORITYR + i as u64 * 4, 0xA0A0_A0A0);
            }
            for i in (SPI_BASE / 16)..(spi_num / 16) {
                gicd_write(gicd::ICFGR + i as u64 * 4, 0);
            }
            for intid in SPI_BASE..spi_num {
                unsafe {
                    core::ptr::write_volatile(
                        (GICD_BASE + gicd::IROUTER + intid as u64 * 8) as *mut u64,
                        0,
                    );
                }
            }

            gicd_write(
                gicd::CTLR,
                gicd_read(gicd::CTLR) | gicd::CTLR_SS_ENGRP0 | gicd::CTLR_SS_ENGRP1,
            );

            self.init_percpu();
        }

        /// Per-core redistributor, CPU interface and hypervisor interface
        /// bring-up.
        pub fn init_percpu(&self) {
            let cpu = crate::arch::arm64::cpuid();

            // Wake the redistributor
            let waker = gicr_read32(cpu, gicr::WAKER);
            gicr_write32(cpu, gicr::WAKER, waker & !gicr::WAKER_PS);
            while gicr_read32(cpu, gicr::WAKER) & gicr::WAKER_CA != 0 {
                core::hint::spin_loop();
            }

            // SGI/PPI: non-secure Group 1, deactivated, PPIs disabled,
            // pending cleared, default priority, level triggered
            gicr_write32(cpu, gicr::IGROUPR0, !0);
            gicr_write32(cpu, gicr::IGRPMODR0, 0);
            gicr_write32(cpu, gicr::ICACTIVER0, !0);
            gicr_write32(cpu, gicr::ICENABLER0, 0xffff_0000);
            gicr_write32(cpu, gicr::ICPENDR0, !0);
            for i in 0..8u64 {
                gicr_write32(cpu, gicr::IPRIORITYR + i * 4, 0xA0A0_A0A0);
            }
            gicr_write32(cpu, gicr::ICFGR1, 0);

            // System register interface on, all priorities allowed
            write_sysreg!("icc_sre_el2", read_sysreg!("icc_sre_el2") | 0b1001);
            write_sysreg!("icc_sre_el1", read_sysreg!("icc_sre_el1") | 0b1);
            write_sysreg!("icc_pmr_el1", 0xff);

            // EOImode 1: EOIR is a priority drop, DIR deactivates
            write_sysreg!("icc_ctlr_el1", read_sysreg!("icc_ctlr_el1") | (1 << 1));
            write_sysreg!("icc_igrpen1_el1", 1);

            // Hypervisor interface: virtual Group 1 on, interface enabled
            write_sysreg!("ich_vmcr_el2", ICH_VMCR_VENG1);
            write_sysreg!("ich_hcr_el2", ICH_HCR_EN);

            let vtr = read_sysreg!("ich_vtr_el2");
            self.nr_lrs.store(((vtr & 0x1f) + 1) as usize, Ordering::Relaxed);
        }
    }

    impl IrqChip for GicV3 {
        fn max_spi(&self) -> u32 {
            self.max_spi.load(Ordering::Relaxed)
        }

        fn nr_list_regs(&self) -> usize {
            self.nr_lrs.load(Ordering::Relaxed)
        }

        fn read_lr(&self, n: usize) -> u64 {
            read_lr_raw(n)
        }

        fn write_lr(&self, n: usize, val: u64) {
            write_lr_raw(n, val);
        }

        fn ack(&self) -> u32 {
            read_sysreg!("icc_iar1_el1") as u32
        }

        fn guest_eoi(&self, intid: u32, group: u32) {
            match group {
                0 => write_sysreg!("icc_eoir0_el1", intid as u64),
                _ => write_sysreg!("icc_eoir1_el1", intid as u64),
            }
        }

        fn host_eoi(&self, intid: u32, group: u32) {
            self.guest_eoi(intid, group);
            self.deactivate(intid);
        }

        fn deactivate(&self, intid: u32) {
            write_sysreg!("icc_dir_el1", intid as u64);
        }

        fn enable_irq(&self, intid: u32) {
            if is_spi(intid) {
                let off = gicd::ISENABLER + (intid / 32) as u64 * 4;
                gicd_write(off, 1 << (intid % 32));
            } else {
                let cpu = crate::arch::arm64::cpuid();
                gicr_write32(cpu, gicr::ISENABLER0, 1 << (intid % 32));
            }
        }

        fn disable_irq(&self, intid: u32) {
            if is_spi(intid) {
                let off = gicd::ICENABLER + (intid / 32) as u64 * 4;
                gicd_write(off, 1 << (intid % 32));
            } else {
                let cpu = crate::arch::arm64::cpuid();
                gicr_write32(cpu, gicr::ICENABLER0, 1 << (intid % 32));
            }
        }

        fn is_irq_enabled(&self, intid: u32) -> bool {
            let val = if is_spi(intid) {
                gicd_read(gicd::ISENABLER + (intid / 32) as u64 * 4)
            } else {
                gicr_read32(crate::arch::arm64::cpuid(), gicr::ISENABLER0)
            };
            val & (1 << (intid % 32)) != 0
        }

        fn set_route_affinity(&self, intid: u32, aff: u64) {
            let was_enabled = self.is_irq_enabled(intid);
            if was_enabled {
                self.disable_irq(intid);
            }
            unsafe {
                core::ptr::write_volatile(
                    (GICD_BASE + gicd::IROUTER + intid as u64 * 8) as *mut u64,
                    aff,
                );
            }
            if was_enabled {
                self.enable_irq(intid);
            }
        }

        fn set_route_target(&self, intid: u32, target: u8) {
            let was_enabled = self.is_irq_enabled(intid);
            if was_enabled {
                self.disable_irq(intid);
            }
            let off = gicd::ITARGETSR + (intid / 4) as u64 * 4;
            let shift = (intid % 4) * 8;
            let val = gicd_read(off) & !(0xff << shift);
            gicd_write(off, val | ((target as u32) << shift));
            if was_enabled {
                self.enable_irq(intid);
            }
        }

        fn gicd_read32(&self, offset: u64) -> u32 {
            gicd_read(offset)
        }

        fn gicr_read64(&self, cpu: usize, offset: u64) -> u64 {
            let base = GICR_BASE + cpu as u64 * GICR_STRIDE;
            unsafe { core::ptr::read_volatile((base + offset) as *const u64) }
        }

        fn restore_state(&self, state: &GicState) {
            write_sysreg!("ich_vmcr_el2", state.vmcr);
            write_sysreg!("icc_sre_el1", read_sysreg!("icc_sre_el1") | state.sre);
            for n in (0..self.nr_list_regs()).rev() {
                write_lr_raw(n, state.lr[n]);
            }
        }
    }
}

/// In-memory interrupt controller used by hosted unit tests.
#[cfg(test)]
pub mod fake {
    use super::*;
    use crate::sync::SpinLock;
    use std::collections::{HashMap, VecDeque};

    #[derive(Default)]
    pub struct FakeState {
        pub nr_lrs: usize,
        pub max_spi: u32,
        pub lrs: [u64; LR_MAX],
        pub enabled: Vec<u32>,
        pub disabled: Vec<u32>,
        pub acks: VecDeque<u32>,
        pub eois: Vec<(u32, u32)>,
        pub deactivated: Vec<u32>,
        pub routed_aff: Vec<(u32, u64)>,
        pub routed_target: Vec<(u32, u8)>,
        pub gicd_regs: HashMap<u64, u32>,
        pub gicr_regs: HashMap<(usize, u64), u64>,
        pub restored: Vec<GicState>,
    }

    pub struct FakeGic {
        pub state: SpinLock<FakeState>,
    }

    impl FakeGic {
        pub fn new(nr_lrs: usize, max_spi: u32) -> Self {
            let mut state = FakeState::default();
            state.nr_lrs = nr_lrs;
            state.max_spi = max_spi;
            Self {
                state: SpinLock::new(state),
            }
        }

        /// Leak an instance so it can serve as a `'static` chip in tests
        pub fn leak(nr_lrs: usize, max_spi: u32) -> &'static Self {
            Box::leak(Box::new(Self::new(nr_lrs, max_spi)))
        }

        pub fn set_lr(&self, n: usize, val: u64) {
            self.state.lock().lrs[n] = val;
        }

        pub fn lr(&self, n: usize) -> u64 {
            self.state.lock().lrs[n]
        }

        pub fn push_ack(&self, intid: u32) {
            self.state.lock().acks.push_back(intid);
        }

        pub fn was_enabled(&self, intid: u32) -> bool {
            self.state.lock().enabled.contains(&intid)
        }

        pub fn was_disabled(&self, intid: u32) -> bool {
            self.state.lock().disabled.contains(&intid)
        }
    }

    impl IrqChip for FakeGic {
        fn max_spi(&self) -> u32 {
            self.state.lock().max_spi
        }

        fn nr_list_regs(&self) -> usize {
            self.state.lock().nr_lrs
        }

        fn read_lr(&self, n: usize) -> u64 {
            self.state.lock().lrs[n]
        }

        fn write_lr(&self, n: usize, val: u64) {
            self.state.lock().lrs[n] = val;
        }

        fn ack(&self) -> u32 {
            self.state.lock().acks.pop_front().unwrap_or(1023)
        }

        fn guest_eoi(&self, intid: u32, group: u32) {
            self.state.lock().eois.push((intid, group));
        }

        fn host_eoi(&self, intid: u32, group: u32) {
            self.guest_eoi(intid, group);
            self.deactivate(intid);
        }

        fn deactivate(&self, intid: u32) {
            self.state.lock().deactivated.push(intid);
        }

        fn enable_irq(&self, intid: u32) {
            self.state.lock().enabled.push(intid);
        }

        fn disable_irq(&self, intid: u32) {
            self.state.lock().disabled.push(intid);
        }

        fn is_irq_enabled(&self, intid: u32) -> bool {
            self.was_enabled(intid)
        }

        fn set_route_affinity(&self, intid: u32, aff: u64) {
            self.state.lock().routed_aff.push((intid, aff));
        }

        fn set_route_target(&self, intid: u32, target: u8) {
            self.state.lock().routed_target.push((intid, target));
        }

        fn gicd_read32(&self, offset: u64) -> u32 {
            self.state.lock().gicd_regs.get(&offset).copied().unwrap_or(0)
        }

        fn gicr_read64(&self, cpu: usize, offset: u64) -> u64 {
            self.state
                .lock()
                .gicr_regs
                .get(&(cpu, offset))
                .copied()
                .unwrap_or(0)
        }

        fn restore_state(&self, state: &GicState) {
            let mut inner = self.state.lock();
            let nr = inner.nr_lrs;
            inner.lrs[..nr].copy_from_slice(&state.lr[..nr]);
            inner.restored.push(*state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, Some(IntIdClass::Sgi); "sgi low")]
    #[test_case(15, Some(IntIdClass::Sgi); "sgi high")]
    #[test_case(16, Some(IntIdClass::Ppi); "ppi low")]
    #[test_case(31, Some(IntIdClass::Ppi); "ppi high")]
    #[test_case(32, Some(IntIdClass::Spi); "spi low")]
    #[test_case(1019, Some(IntIdClass::Spi); "spi high")]
    #[test_case(1020, None; "reserved")]
    fn test_intid_classification(intid: u32, expect: Option<IntIdClass>) {
        assert_eq!(classify(intid), expect);
    }

    #[test]
    fn test_make_lr_encoding() {
        let val = make_lr(48, 48, 1);
        assert_eq!(lr_state(val), LrState::Pending);
        assert!(val & lr::HW != 0);
        assert_eq!(val & lr::VINTID_MASK, 48);
        assert_eq!((val & lr::PINTID_MASK) >> lr::PINTID_SHIFT, 48);
        assert_eq!((val >> lr::GROUP_SHIFT) & 1, 1);
    }

    #[test]
    fn test_lr_state_decode() {
        assert!(lr_is_inactive(0));
        assert!(lr_is_pending(1 << lr::STATE_SHIFT));
        assert_eq!(lr_state(2 << lr::STATE_SHIFT), LrState::Active);
        assert_eq!(lr_state(3 << lr::STATE_SHIFT), LrState::PendingActive);
    }

    #[test]
    fn test_has_pending_lr_via_chip() {
        let chip = fake::FakeGic::new(4, 987);
        assert!(!chip.has_pending_lr());
        chip.set_lr(2, make_lr(48, 48, 1));
        assert!(chip.has_pending_lr());
    }
}
