//! Wyvern - a minimal Type-1 EL2 hypervisor
//!
//! Wyvern runs one or more guest virtual machines on a multicore ARM64
//! processor, intercepting privileged and device operations and re-presenting
//! them safely: stage-2 address translation, a vCPU state machine with
//! world-switch, a synchronous/asynchronous trap dispatcher, an MMIO
//! emulation framework, and a virtual GICv3 multiplexed over the hardware
//! list registers.

#![cfg_attr(not(test), no_std)]

// Core modules
pub mod config;
pub mod utils;

// Synchronization primitives
pub mod sync;

// Physical memory management
pub mod mm;

// Architecture-specific code
pub mod arch;

// Virtual machine monitor core
pub mod vmm;

// Device drivers
pub mod drivers;

/// Wyvern version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type for Wyvern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument,
    /// No free pages left in the physical page allocator
    OutOfMemory,
    /// A fixed pool (vCPU, VM, MMIO region, list register) is exhausted
    NoResource,
    /// Not found (MMIO region lookup miss, unknown register offset)
    NotFound,
    /// Operation is valid but not implemented by this hypervisor
    Unsupported,
    /// Object is in the wrong lifecycle state for the operation
    InvalidState,
    /// Stage-2 leaf is already valid
    AlreadyMapped,
    /// Stage-2 leaf is not mapped
    NotMapped,
    /// Address or size is not page-aligned
    BadAlignment,
    /// Subsystem was already initialized
    AlreadyInitialized,
    /// Subsystem is not initialized yet
    NotInitialized,
}

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// Panic handler for the bare-metal build. Hosted builds (tests, host-side
// tooling) use the platform runtime instead.
#[cfg(all(not(test), target_arch = "aarch64"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    let mut con = drivers::uart::Console;
    let _ = writeln!(con, "\n*** HYPERVISOR PANIC ***");
    let _ = writeln!(con, "{}", info);
    if let Some(vcpu) = vmm::vcpu::try_current() {
        vmm::vcpu::dump(&vcpu.lock());
    }

    loop {
        aarch64_cpu::asm::wfe();
    }
}
