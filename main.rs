//! Wyvern entry points
//!
//! The boot assembly (vector table, per-CPU stacks, EL2 setup) brings each
//! core up and calls into `vmm_init_primary` / `vmm_init_secondary`; from
//! there the primary core builds the boot VM and every core world-switches
//! into its pinned vCPU.

#![cfg_attr(all(not(test), target_arch = "aarch64"), no_std)]
#![cfg_attr(target_arch = "aarch64", no_main)]

#[cfg(target_arch = "aarch64")]
mod boot {
    use wyvern::arch::arm64::interrupt::gic::v3::GICV3;
    use wyvern::arch::arm64::interrupt::gic::IrqChip;
    use wyvern::arch::arm64::{self, mmu, timer};
    use wyvern::config::{GuestImage, VmConfig, HYP_RAM_SIZE, UART_IRQ};
    use wyvern::mm::{self, PAGE_SIZE};
    use wyvern::utils::logger;
    use wyvern::vmm::{vcpu, vm};
    use wyvern::drivers::uart;

    const RAM_PAGES: usize = (HYP_RAM_SIZE / PAGE_SIZE) as usize;

    /// Page-frame occupancy bitmap for the whole managed RAM window
    static mut PAGE_BITMAP: [u64; RAM_PAGES / 64] = [0; RAM_PAGES / 64];

    extern "C" {
        /// First byte of allocator-managed RAM (linker script)
        static ram_start: u8;
        /// Exception vector table (boot assembly)
        fn hyp_vector_table();
        /// Embedded guest payload (objcopy'd into the image)
        static _guest_image_start: u8;
        static _guest_image_end: u8;
    }

    fn set_vbar() {
        unsafe {
            core::arch::asm!("msr vbar_el2, {}", in(reg) hyp_vector_table as usize as u64);
        }
        aarch64_cpu::asm::barrier::isb(aarch64_cpu::asm::barrier::SY);
    }

    fn guest_config() -> VmConfig {
        let start = unsafe { core::ptr::addr_of!(_guest_image_start) as u64 };
        let end = unsafe { core::ptr::addr_of!(_guest_image_end) as u64 };
        VmConfig {
            image: GuestImage {
                name: "xv6",
                start,
                size: end - start,
                end,
            },
            nvcpu: 4,
            ram_size: 128 * 1024 * 1024,
            entrypoint: 0x4000_0000,
        }
    }

    /// Boot-core bring-up: allocator, interrupt controller, timer, EL2
    /// traps, stage-2 translation, the boot VM, then guest entry.
    #[no_mangle]
    pub extern "C" fn vmm_init_primary() -> ! {
        uart::init();
        logger::init();
        log::info!("wyvern {} starting on core {}", wyvern::VERSION, arm64::cpuid());

        unsafe {
            let base = core::ptr::addr_of!(ram_start) as u64;
            let bitmap = core::ptr::addr_of_mut!(PAGE_BITMAP) as *mut u64;
            mm::init(bitmap, RAM_PAGES, base).expect("page allocator");
        }

        set_vbar();
        GICV3.init();
        timer::freq_init();

        // Console interrupt comes to the boot core
        GICV3.set_route_affinity(UART_IRQ, 0);
        GICV3.enable_irq(UART_IRQ);

        arm64::hcr_setup();
        mmu::stage2_mmu_init();

        let cfg = guest_config();
        vm::create(&cfg, &GICV3).expect("boot vm");

        vcpu::enter_vcpu().expect("guest entry");
        unreachable!("world switch returned");
    }

    /// Secondary cores arrive here off a PSCI CPU_ON and find their vCPU
    /// already READY.
    #[no_mangle]
    pub extern "C" fn vmm_init_secondary() -> ! {
        set_vbar();
        GICV3.init_percpu();
        arm64::hcr_setup();
        mmu::stage2_mmu_init();

        log::info!("core {} entering guest", arm64::cpuid());
        vcpu::enter_vcpu().expect("secondary guest entry");
        unreachable!("world switch returned");
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {
    // The hypervisor only runs on AArch64 hardware; hosted builds exist for
    // the test suite.
    eprintln!("wyvern {}: aarch64 EL2 only", wyvern::VERSION);
}
