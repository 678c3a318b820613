//! MMIO emulation framework
//!
//! Emulated devices register guest-physical ranges with read/write
//! callbacks; stage-2 leaves those ranges unmapped so every access traps and
//! lands in [`dispatch`]. Regions are registered during VM construction and
//! immutable afterwards; dispatch does a first-match walk, so registration
//! rejects overlap outright rather than leaving lookup order-dependent.

use crate::arch::arm64::regs::AccessSize;
use crate::config::MMIO_REGIONS_PER_VM;
use crate::sync::SpinLock;
use crate::vmm::vcpu::Vcpu;
use crate::vmm::vm;
use crate::{Error, Result};

/// Decoded fault context handed to region callbacks
#[derive(Debug, Clone, Copy)]
pub struct MmioAccess {
    /// Faulting guest-physical address
    pub ipa: u64,
    /// Guest program counter at the fault
    pub pc: u64,
    /// Access width
    pub sas: AccessSize,
    /// Write (true) or read (false)
    pub wnr: bool,
}

/// Read callback: fill `val` for a read of `offset` bytes into the region
pub type MmioReadFn = fn(&mut Vcpu, u64, &mut u64, &MmioAccess) -> Result<()>;

/// Write callback: handle a write of `val` at `offset` into the region
pub type MmioWriteFn = fn(&mut Vcpu, u64, u64, &MmioAccess) -> Result<()>;

/// One registered guest-physical range
#[derive(Clone, Copy)]
pub struct MmioRegion {
    pub base: u64,
    pub size: u64,
    pub read: Option<MmioReadFn>,
    pub write: Option<MmioWriteFn>,
}

impl MmioRegion {
    fn contains(&self, ipa: u64) -> bool {
        self.base <= ipa && ipa < self.base + self.size
    }

    fn overlaps(&self, other: &MmioRegion) -> bool {
        self.base < other.base + other.size && other.base < self.base + self.size
    }
}

/// Per-VM region table. Append-only after VM construction; the lock only
/// serializes construction-time registration.
pub struct MmioBus {
    regions: SpinLock<heapless::Vec<MmioRegion, MMIO_REGIONS_PER_VM>>,
}

impl MmioBus {
    pub const fn new() -> Self {
        Self {
            regions: SpinLock::new(heapless::Vec::new()),
        }
    }

    /// Register a region. Zero-sized and overlapping regions are rejected;
    /// a full table is pool exhaustion.
    pub fn register(&self, region: MmioRegion) -> Result<()> {
        if region.size == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut regions = self.regions.lock();
        if regions.iter().any(|r| r.overlaps(&region)) {
            log::error!(
                "mmio: region {:#x}+{:#x} overlaps an existing registration",
                region.base,
                region.size
            );
            return Err(Error::InvalidArgument);
        }
        regions.push(region).map_err(|_| Error::NoResource)
    }

    /// First region containing `ipa`, in registration order
    pub fn find(&self, ipa: u64) -> Option<MmioRegion> {
        self.regions.lock().iter().find(|r| r.contains(ipa)).copied()
    }

    /// Number of registered regions
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Route a faulting access to the owning region's callback.
///
/// `srt` is the faulting instruction's transfer register; index 31 is the
/// zero register, so writes read as zero and read results are discarded.
/// Callers on the data-abort path advance the saved program counter after a
/// successful dispatch.
pub fn dispatch(vcpu: &mut Vcpu, srt: usize, access: &MmioAccess) -> Result<()> {
    let vm = vm::get(vcpu.vm_id().ok_or(Error::InvalidState)?);

    let Some(region) = vm.mmio().find(access.ipa) else {
        log::warn!("mmio: no region matches ipa {:#x}", access.ipa);
        return Err(Error::NotFound);
    };
    let offset = access.ipa - region.base;

    if access.wnr {
        let val = if srt == 31 { 0 } else { vcpu.reg.x[srt] };
        let write = region.write.ok_or(Error::NotFound)?;
        write(vcpu, offset, val, access)
    } else {
        let read = region.read.ok_or(Error::NotFound)?;
        let mut val = 0;
        read(vcpu, offset, &mut val, access)?;
        if srt != 31 {
            vcpu.reg.x[srt] = val;
        }
        Ok(())
    }
}
