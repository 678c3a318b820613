//! PSCI service handler
//!
//! Guests bring up their secondary cores through PSCI CPU_ON. The power
//! state machine itself is trivial: the substantive work is marking the
//! target vCPU runnable with the requested entry point before the call
//! returns, then asking firmware to start the matching physical core.

use crate::vmm::vcpu::{self, Vcpu, VcpuState};
use crate::vmm::vm;
use crate::{Error, Result};

/// PSCI function ids
pub mod fid {
    pub const VERSION: u32 = 0x8400_0000;
    pub const CPU_SUSPEND32: u32 = 0x8400_0001;
    pub const CPU_SUSPEND64: u32 = 0xc400_0001;
    pub const CPU_OFF: u32 = 0x8400_0002;
    pub const CPU_ON32: u32 = 0x8400_0003;
    pub const CPU_ON64: u32 = 0xc400_0003;
    pub const AFFINITY_INFO32: u32 = 0x8400_0004;
    pub const AFFINITY_INFO64: u32 = 0xc400_0004;
    pub const FEATURES: u32 = 0x8400_000a;
}

/// PSCI return codes
pub mod status {
    pub const SUCCESS: i64 = 0;
    pub const NOT_SUPPORTED: i64 = -1;
    pub const INVALID_PARAMS: i64 = -2;
    pub const ALREADY_ON: i64 = -4;
}

/// PSCI v0.2
pub const VERSION_0_2: i64 = 2;

const STD_SERVICE_MASK: u64 = 0xff00_0000;
const PSCI_FN_MASK: u64 = 0xffe0;

/// True for SMC32/SMC64 standard-service function ids
pub fn is_std_service_fid(fid: u64) -> bool {
    matches!(fid & STD_SERVICE_MASK, 0x8400_0000 | 0xc400_0000)
}

/// True for the PSCI slice of the standard service range
pub fn is_psci_fid(fid: u64) -> bool {
    is_std_service_fid(fid) && fid & PSCI_FN_MASK == 0
}

/// Ask firmware to power on physical core `target` at the hypervisor entry
/// point; the started core finds its vCPU READY and world-switches in.
#[cfg(target_arch = "aarch64")]
fn firmware_cpu_on(target: u64) -> i64 {
    extern "C" {
        fn _start();
    }

    let ret: u64;
    unsafe {
        core::arch::asm!(
            "smc #0",
            inout("x0") fid::CPU_ON64 as u64 => ret,
            in("x1") target,
            in("x2") _start as usize as u64,
            in("x3") 0u64,
        );
    }
    ret as i64
}

#[cfg(not(target_arch = "aarch64"))]
fn firmware_cpu_on(_target: u64) -> i64 {
    status::SUCCESS
}

/// CPU_ON: set the target vCPU's entry program counter and mark it READY,
/// synchronously, then kick the physical core.
fn cpu_on(vcpu: &Vcpu, target: u64, entry: u64) -> Result<i64> {
    let vm = vm::get(vcpu.vm_id().ok_or(Error::InvalidState)?);

    let Some(target_id) = vm.vcpu_id(target as usize) else {
        log::warn!("psci: CPU_ON for nonexistent vcpu {}", target);
        return Ok(status::INVALID_PARAMS);
    };
    if target_id == vcpu.id() {
        return Ok(status::ALREADY_ON);
    }

    log::info!("psci: bring up vcpu {} at {:#x}", target, entry);

    {
        let mut target_vcpu = vcpu::get(target_id).lock();
        if target_vcpu.state() != VcpuState::Created {
            return Ok(status::ALREADY_ON);
        }
        target_vcpu.reg.elr_el2 = entry;
        target_vcpu.set_ready();
    }

    Ok(firmware_cpu_on(target))
}

fn features(query: u32) -> i64 {
    match query {
        fid::VERSION
        | fid::CPU_OFF
        | fid::CPU_SUSPEND32
        | fid::CPU_SUSPEND64
        | fid::CPU_ON32
        | fid::CPU_ON64
        | fid::AFFINITY_INFO32
        | fid::AFFINITY_INFO64
        | fid::FEATURES => status::SUCCESS,
        _ => status::NOT_SUPPORTED,
    }
}

/// Dispatch one PSCI call. Unrecognized function ids are a guest protocol
/// violation and escalate at the trap dispatcher.
pub fn handler(vcpu: &Vcpu, fid_val: u32, x1: u64, x2: u64, _x3: u64) -> Result<i64> {
    match fid_val {
        fid::VERSION => Ok(VERSION_0_2),
        fid::CPU_ON64 => cpu_on(vcpu, x1, x2),
        fid::FEATURES => Ok(features(x1 as u32)),
        _ => {
            log::error!("psci: unsupported function id {:#x}", fid_val);
            Err(Error::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fid_classification() {
        assert!(is_std_service_fid(fid::VERSION as u64));
        assert!(is_std_service_fid(fid::CPU_ON64 as u64));
        assert!(!is_std_service_fid(0x8600_0000));

        assert!(is_psci_fid(fid::CPU_ON64 as u64));
        assert!(is_psci_fid(fid::FEATURES as u64));
        assert!(!is_psci_fid(0x8400_1000));
    }

    #[test]
    fn test_features() {
        assert_eq!(features(fid::CPU_ON64), status::SUCCESS);
        assert_eq!(features(fid::VERSION), status::SUCCESS);
        assert_eq!(features(0x8400_0009), status::NOT_SUPPORTED);
    }
}
