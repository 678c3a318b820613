//! The VM container
//!
//! A VM owns its vCPU set, its stage-2 table, a virtual distributor and the
//! MMIO region table. Construction is the only phase that mutates the
//! topology: once `create` returns, the region table is append-only-done
//! and the stage-2 layout only changes under the single core handling a
//! fault for one of this VM's vCPUs. VMs are never destroyed in-process.

use crate::arch::arm64::interrupt::gic::IrqChip;
use crate::arch::arm64::interrupt::vgic::Vgic;
use crate::arch::arm64::interrupt::vgic_mmio;
use crate::arch::arm64::mmu::{self, stage2, Stage2Table};
use crate::config::{
    VmConfig, GICD_BASE, GICD_SIZE, GICR_BASE, GICR_SIZE, UART_BASE, VCPUS_PER_VM, VM_MAX,
    VM_NAME_LEN,
};
use crate::mm::{self, IpaAddr, PhysAddr, PAGE_SIZE};
use crate::sync::SpinLock;
use crate::vmm::mmio::{MmioBus, MmioReadFn, MmioRegion, MmioWriteFn};
use crate::vmm::vcpu::{self, VcpuId};
use crate::{Error, Result};

pub type VmId = usize;

struct VmInner {
    used: bool,
    name: heapless::String<VM_NAME_LEN>,
    nvcpu: usize,
    vcpus: [Option<VcpuId>; VCPUS_PER_VM],
}

/// One guest world
pub struct Vm {
    inner: SpinLock<VmInner>,
    stage2: SpinLock<Option<Stage2Table>>,
    vgic: Vgic,
    mmio: MmioBus,
}

impl Vm {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(VmInner {
                used: false,
                name: heapless::String::new(),
                nvcpu: 0,
                vcpus: [None; VCPUS_PER_VM],
            }),
            stage2: SpinLock::new(None),
            vgic: Vgic::new(),
            mmio: MmioBus::new(),
        }
    }

    pub fn name(&self) -> heapless::String<VM_NAME_LEN> {
        self.inner.lock().name.clone()
    }

    pub fn nvcpu(&self) -> usize {
        self.inner.lock().nvcpu
    }

    /// Pool id of virtual core `idx`
    pub fn vcpu_id(&self, idx: usize) -> Option<VcpuId> {
        if idx >= VCPUS_PER_VM {
            return None;
        }
        self.inner.lock().vcpus[idx]
    }

    pub fn vgic(&self) -> &Vgic {
        &self.vgic
    }

    pub fn mmio(&self) -> &MmioBus {
        &self.mmio
    }

    /// Root table address for VTTBR_EL2
    pub fn stage2_root(&self) -> Result<PhysAddr> {
        self.stage2
            .lock()
            .as_ref()
            .map(|s2| s2.root())
            .ok_or(Error::NotInitialized)
    }

    /// Resolve a guest-physical address through this VM's stage-2 table
    pub fn translate(&self, ipa: IpaAddr) -> Option<PhysAddr> {
        self.stage2.lock().as_ref()?.translate(ipa)
    }

    /// Re-present `[base, base + size)` as an emulated region: drop any
    /// stage-2 mapping, register the handlers, and flush the TLB, in that
    /// order, so a parallel fault cannot slip through unhandled.
    pub fn trap_region(
        &self,
        base: IpaAddr,
        size: u64,
        read: Option<MmioReadFn>,
        write: Option<MmioWriteFn>,
    ) -> Result<()> {
        {
            let mut guard = self.stage2.lock();
            let s2 = guard.as_mut().ok_or(Error::NotInitialized)?;
            if s2.is_mapped(base) {
                s2.unmap(base, size)?;
            }
        }

        self.mmio.register(MmioRegion {
            base,
            size,
            read,
            write,
        })?;

        mmu::tlb_flush();
        Ok(())
    }
}

const VM_INIT: Vm = Vm::new();
static VMS: [Vm; VM_MAX] = [VM_INIT; VM_MAX];

/// Serializes VM slot allocation
static POOL_LOCK: SpinLock<()> = SpinLock::new(());

/// Access a VM by id
pub fn get(id: VmId) -> &'static Vm {
    &VMS[id]
}

fn alloc_slot() -> Result<VmId> {
    let _guard = POOL_LOCK.lock();
    for (id, vm) in VMS.iter().enumerate() {
        let mut inner = vm.inner.lock();
        if !inner.used {
            inner.used = true;
            return Ok(id);
        }
    }
    Err(Error::NoResource)
}

/// Copy one guest image page's worth of content into a fresh frame
unsafe fn fill_page(dst: PhysAddr, src: PhysAddr, len: u64) {
    mm::zero_page(dst);
    core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize);
}

/// Build a VM from its configuration: claim a slot, create the vCPU set,
/// populate guest RAM with the image, wire the console passthrough page and
/// the virtual-GIC trap windows, and mark vCPU 0 runnable.
pub fn create(cfg: &VmConfig, chip: &'static dyn IrqChip) -> Result<VmId> {
    if cfg.nvcpu == 0 || cfg.nvcpu > VCPUS_PER_VM {
        return Err(Error::InvalidArgument);
    }
    if cfg.ram_size < cfg.image.size {
        return Err(Error::InvalidArgument);
    }

    let id = alloc_slot()?;
    let vm = get(id);

    {
        let mut inner = vm.inner.lock();
        inner.name.clear();
        for c in cfg.image.name.chars().take(VM_NAME_LEN) {
            let _ = inner.name.push(c);
        }
        inner.nvcpu = cfg.nvcpu;
    }

    // vCPU 0 boots at the image entry point; secondaries wait for PSCI
    // CPU_ON to give them one
    let vcpu0 = vcpu::create(id, 0, cfg.entrypoint)?;
    {
        let mut inner = vm.inner.lock();
        inner.vcpus[0] = Some(vcpu0);
        for i in 1..cfg.nvcpu {
            inner.vcpus[i] = Some(vcpu::create(id, i, 0)?);
        }
    }

    let mut s2 = Stage2Table::new()?;

    // Image content, then zero-fill out to the configured RAM size. The
    // image IPA must equal the guest's link address or the entry ERET lands
    // in unmapped space.
    let file_size = cfg.image.file_size();
    log::info!(
        "vm '{}': image {:#x} ({} bytes file, {} bytes mem), ram {} MiB at {:#x}",
        cfg.image.name,
        cfg.image.start,
        file_size,
        cfg.image.size,
        cfg.ram_size / (1024 * 1024),
        cfg.entrypoint
    );

    let mut p = 0u64;
    while p < file_size {
        let page = mm::alloc_page()?;
        let chunk = (file_size - p).min(PAGE_SIZE);
        unsafe { fill_page(page, cfg.image.start + p, chunk) };
        s2.map(cfg.entrypoint + p, page, PAGE_SIZE, stage2::ATTR_NORMAL_RW)?;
        p += PAGE_SIZE;
    }
    while p < cfg.ram_size {
        let page = mm::alloc_page()?;
        unsafe { mm::zero_page(page) };
        s2.map(cfg.entrypoint + p, page, PAGE_SIZE, stage2::ATTR_NORMAL_RW)?;
        p += PAGE_SIZE;
    }

    // Console passthrough: one device page, identity mapped
    s2.map(UART_BASE, UART_BASE, PAGE_SIZE, stage2::ATTR_DEVICE_RW)?;

    *vm.stage2.lock() = Some(s2);

    // Distributor and redistributor frames stay unmapped and trap into the
    // virtual GIC
    vm.vgic.init(chip, cfg.nvcpu);
    vm.trap_region(
        GICD_BASE,
        GICD_SIZE,
        Some(vgic_mmio::dist_read),
        Some(vgic_mmio::dist_write),
    )?;
    vm.trap_region(
        GICR_BASE,
        GICR_SIZE,
        Some(vgic_mmio::redist_read),
        Some(vgic_mmio::redist_write),
    )?;

    vcpu::ready(vcpu0);

    Ok(id)
}
