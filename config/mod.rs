//! Platform configuration and VM descriptors
//!
//! Memory map and interrupt assignments follow the QEMU virt machine.

/// Number of physical CPUs the hypervisor drives
pub const PCPU_COUNT: usize = 4;

/// Maximum number of vCPUs across all VMs
pub const VCPU_MAX: usize = 64;

/// Maximum number of vCPUs a single VM can have
pub const VCPUS_PER_VM: usize = 8;

/// Maximum number of VMs
pub const VM_MAX: usize = 32;

/// Maximum number of MMIO regions registered per VM
pub const MMIO_REGIONS_PER_VM: usize = 16;

/// Maximum length of a VM name
pub const VM_NAME_LEN: usize = 32;

/// Bytes of physical RAM the hypervisor's page allocator manages
pub const HYP_RAM_SIZE: u64 = 256 * 1024 * 1024;

/// PL011 UART base address
pub const UART_BASE: u64 = 0x0900_0000;

/// GIC distributor base address
pub const GICD_BASE: u64 = 0x0800_0000;
/// GIC distributor register window size
pub const GICD_SIZE: u64 = 0x10000;

/// GIC redistributor base address (first frame)
pub const GICR_BASE: u64 = 0x080A_0000;
/// Size of one redistributor frame (RD_base + SGI_base)
pub const GICR_STRIDE: u64 = 0x20000;
/// Total redistributor window size covering all PE frames
pub const GICR_SIZE: u64 = GICR_STRIDE * PCPU_COUNT as u64;

/// Physical interrupt id of the EL1 physical timer
pub const PTIMER_IRQ: u32 = 30;
/// Physical interrupt id of the EL1 virtual timer
pub const VTIMER_IRQ: u32 = 27;
/// Physical interrupt id of the PL011 UART
pub const UART_IRQ: u32 = 33;

/// A guest payload placed somewhere in hypervisor-visible memory.
///
/// `end - start` is the file size of the loadable segment; `size` is the
/// memory size including zero-initialized data.
#[derive(Debug, Clone, Copy)]
pub struct GuestImage {
    pub name: &'static str,
    /// Physical address the payload currently sits at
    pub start: u64,
    /// Memory footprint of the loaded payload in bytes
    pub size: u64,
    /// Physical address one past the last payload byte
    pub end: u64,
}

impl GuestImage {
    /// File size of the loadable content
    pub fn file_size(&self) -> u64 {
        self.end - self.start
    }
}

/// Everything VM construction needs to know about one guest.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub image: GuestImage,
    /// Requested virtual core count
    pub nvcpu: usize,
    /// Guest RAM size in bytes, image footprint included
    pub ram_size: u64,
    /// IPA the image is mapped at; also the boot program counter. Must match
    /// the guest's link address or the first instruction fetch walks off into
    /// unmapped space.
    pub entrypoint: u64,
}
