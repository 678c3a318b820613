//! Virtual GIC state
//!
//! Each VM gets one virtual distributor; each vCPU gets a banked set of
//! SGI/PPI records and a bitmask of the hardware list registers it currently
//! occupies. The per-interrupt records are pure software state (enable,
//! priority, target, group); pending/active tracking is an explicit gap, see
//! the register-window emulation.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::arm64::interrupt::gic::{
    self, classify, make_lr, IntIdClass, IrqChip, SPI_BASE, SPI_RECORDS,
};
use crate::config::VCPUS_PER_VM;
use crate::sync::SpinLock;
use crate::{Error, Result};

/// Software state of one virtual interrupt.
///
/// No pending/active field: delivery state lives solely in the hardware list
/// registers today.
#[derive(Debug, Clone, Copy)]
pub struct VirqRecord {
    pub priority: u8,
    pub target: u8,
    pub enabled: bool,
    pub group1: bool,
}

impl VirqRecord {
    pub const fn new() -> Self {
        Self {
            priority: 0,
            target: 0,
            enabled: false,
            group1: true,
        }
    }
}

impl Default for VirqRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-vCPU banked records (SGIs and PPIs)
#[derive(Debug, Clone, Copy)]
pub struct VgicBank {
    pub sgis: [VirqRecord; gic::SGI_COUNT],
    pub ppis: [VirqRecord; gic::PPI_COUNT],
}

impl VgicBank {
    const fn new() -> Self {
        Self {
            sgis: [VirqRecord::new(); gic::SGI_COUNT],
            ppis: [VirqRecord::new(); gic::PPI_COUNT],
        }
    }

    /// Boot state for the bank of vCPU `vcpu_idx`: SGIs start enabled and
    /// self-targeted, PPIs disabled.
    fn reset(&mut self, vcpu_idx: usize) {
        for sgi in self.sgis.iter_mut() {
            *sgi = VirqRecord::new();
            sgi.enabled = true;
            sgi.target = vcpu_idx as u8;
        }
        for ppi in self.ppis.iter_mut() {
            *ppi = VirqRecord::new();
            ppi.target = vcpu_idx as u8;
        }
    }
}

/// Everything the single per-VM lock protects: the SPI records, the banked
/// SGI/PPI records of every vCPU, and the global group-1 enable.
pub struct DistState {
    pub grp1ns_enabled: bool,
    pub spis: [VirqRecord; SPI_RECORDS],
    pub banks: [VgicBank; VCPUS_PER_VM],
}

impl DistState {
    pub(crate) const fn new() -> Self {
        Self {
            grp1ns_enabled: false,
            spis: [VirqRecord::new(); SPI_RECORDS],
            banks: [VgicBank::new(); VCPUS_PER_VM],
        }
    }

    /// Look up the record for `intid` as seen by vCPU `vcpu_idx`. Ids in the
    /// reserved range have no record; callers treat that as fatal.
    pub fn record_mut(&mut self, vcpu_idx: usize, intid: u32) -> Result<&mut VirqRecord> {
        match classify(intid) {
            Some(IntIdClass::Sgi) => Ok(&mut self.banks[vcpu_idx].sgis[intid as usize]),
            Some(IntIdClass::Ppi) => Ok(&mut self.banks[vcpu_idx].ppis[intid as usize - 16]),
            Some(IntIdClass::Spi) => Ok(&mut self.spis[(intid - SPI_BASE) as usize]),
            None => {
                log::error!("vgic: interrupt id {} outside every class", intid);
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Read-only record lookup
    pub fn record(&mut self, vcpu_idx: usize, intid: u32) -> Result<VirqRecord> {
        self.record_mut(vcpu_idx, intid).map(|r| *r)
    }
}

/// Per-VM virtual distributor
pub struct Vgic {
    chip: SpinLock<Option<&'static dyn IrqChip>>,
    max_spi: AtomicU32,
    pub state: SpinLock<DistState>,
}

impl Vgic {
    pub const fn new() -> Self {
        Self {
            chip: SpinLock::new(None),
            max_spi: AtomicU32::new(0),
            state: SpinLock::new(DistState::new()),
        }
    }

    /// Bind to the physical controller and reset the software state for a VM
    /// with `nvcpu` virtual cores.
    pub fn init(&self, chip: &'static dyn IrqChip, nvcpu: usize) {
        *self.chip.lock() = Some(chip);
        self.max_spi.store(chip.max_spi(), Ordering::Relaxed);

        let mut state = self.state.lock();
        state.grp1ns_enabled = false;
        state.spis = [VirqRecord::new(); SPI_RECORDS];
        for (idx, bank) in state.banks.iter_mut().enumerate().take(nvcpu) {
            bank.reset(idx);
        }
    }

    /// The physical controller this distributor multiplexes
    pub fn chip(&self) -> Result<&'static dyn IrqChip> {
        (*self.chip.lock()).ok_or(Error::NotInitialized)
    }

    /// Highest SPI id presented to the guest
    pub fn max_spi(&self) -> u32 {
        self.max_spi.load(Ordering::Relaxed)
    }

    /// Number of SPI records backing the guest-visible range
    pub fn nr_spis(&self) -> u32 {
        self.max_spi().saturating_sub(SPI_BASE - 1)
    }
}

impl Default for Vgic {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-vCPU list-register accounting. Only the owning physical core touches
/// this in the steady state; the single cross-core write (secondary bring-up)
/// happens before the vCPU is READY.
#[derive(Debug, Clone, Copy)]
pub struct VgicCpu {
    used_lr: u16,
}

impl VgicCpu {
    pub const fn new() -> Self {
        Self { used_lr: 0 }
    }

    /// Reclaim every list register whose hardware state has gone inactive
    /// since the last check. Must run before allocation on the interrupt
    /// path or the pool reads as falsely exhausted.
    pub fn used_lr_update(&mut self, chip: &dyn IrqChip) {
        for n in 0..chip.nr_list_regs() {
            if self.used_lr & (1 << n) != 0 && gic::lr_is_inactive(chip.read_lr(n)) {
                self.used_lr &= !(1 << n);
            }
        }
    }

    /// Claim a free list register slot
    pub fn lr_alloc(&mut self, nr_lrs: usize) -> Result<usize> {
        for n in 0..nr_lrs {
            if self.used_lr & (1 << n) == 0 {
                self.used_lr |= 1 << n;
                return Ok(n);
            }
        }
        Err(Error::NoResource)
    }

    /// Number of occupied list registers
    pub fn used_count(&self) -> u32 {
        self.used_lr.count_ones()
    }
}

impl Default for VgicCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver physical interrupt `pirq` to the current vCPU as virtual
/// interrupt `virq`. Identity mapping (pirq == virq) is the only mode in
/// use; there is no remapping table. On list-register exhaustion the
/// interrupt is dropped for this guest cycle — there is no software pending
/// queue yet.
pub fn inject_virq(
    vgic_cpu: &mut VgicCpu,
    chip: &dyn IrqChip,
    pirq: u32,
    virq: u32,
    group: u32,
) -> Result<()> {
    let n = vgic_cpu.lr_alloc(chip.nr_list_regs()).map_err(|e| {
        log::warn!("vgic: no free list register, dropping virq {}", virq);
        e
    })?;
    chip.write_lr(n, make_lr(pirq, virq, group));
    Ok(())
}
