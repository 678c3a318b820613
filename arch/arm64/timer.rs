//! Generic timer driver
//!
//! The physical EL1 timer backs the hypervisor tick; the monotonic counter
//! feeds the WFI/WFE poll deadline. Hosted builds substitute an advancing
//! software counter so the poll logic terminates deterministically in tests.

use core::sync::atomic::{AtomicU64, Ordering};

pub const NS_PER_SECOND: u64 = 1_000_000_000;

/// Counter frequency, latched once at boot
static FREQ: AtomicU64 = AtomicU64::new(62_500_000);

#[cfg(target_arch = "aarch64")]
const CNT_CTL_ENABLE: u64 = 1 << 0;
#[cfg(target_arch = "aarch64")]
const CNT_CTL_IMASK: u64 = 1 << 1;

/// (a * b) / c without losing the high bits of the product
fn muldiv64(a: u64, b: u64, c: u64) -> u64 {
    if c == 0 {
        log::warn!("muldiv64: zero divisor");
        return 0;
    }
    ((a as u128 * b as u128) / c as u128) as u64
}

/// Convert a nanosecond interval to counter ticks
pub fn ns_to_count(ns: u64) -> u64 {
    muldiv64(ns, FREQ.load(Ordering::Relaxed), NS_PER_SECOND)
}

/// Convert counter ticks to nanoseconds
pub fn count_to_ns(count: u64) -> u64 {
    muldiv64(count, NS_PER_SECOND, FREQ.load(Ordering::Relaxed))
}

/// Latch the counter frequency
#[cfg(target_arch = "aarch64")]
pub fn freq_init() {
    use aarch64_cpu::registers::CNTFRQ_EL0;
    use tock_registers::interfaces::Readable;

    FREQ.store(CNTFRQ_EL0.get() & 0xffff_ffff, Ordering::Relaxed);
}

#[cfg(not(target_arch = "aarch64"))]
pub fn freq_init() {}

/// Raw monotonic counter
#[cfg(target_arch = "aarch64")]
fn syscount() -> u64 {
    use aarch64_cpu::registers::CNTPCT_EL0;
    use tock_registers::interfaces::Readable;

    CNTPCT_EL0.get()
}

#[cfg(not(target_arch = "aarch64"))]
fn syscount() -> u64 {
    // Advances on every read so bounded polls always make progress
    static TICKS: AtomicU64 = AtomicU64::new(0);
    TICKS.fetch_add(62_500, Ordering::Relaxed)
}

/// Monotonic time in nanoseconds
pub fn now_ns() -> u64 {
    count_to_ns(syscount())
}

#[cfg(target_arch = "aarch64")]
fn read_ctl() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mrs {}, cntp_ctl_el0", out(reg) v) };
    v
}

#[cfg(target_arch = "aarch64")]
fn write_ctl(v: u64) {
    unsafe { core::arch::asm!("msr cntp_ctl_el0, {}", in(reg) v) };
}

/// Unmask and enable the physical timer
#[cfg(target_arch = "aarch64")]
pub fn enable() {
    write_ctl((read_ctl() | CNT_CTL_ENABLE) & !CNT_CTL_IMASK);
}

/// Mask and disable the physical timer
#[cfg(target_arch = "aarch64")]
pub fn disable() {
    write_ctl((read_ctl() & !CNT_CTL_ENABLE) | CNT_CTL_IMASK);
}

/// Arm the timer `ns` nanoseconds from now
#[cfg(target_arch = "aarch64")]
pub fn reload(ns: u64) {
    let ticks = ns_to_count(ns);
    unsafe { core::arch::asm!("msr cntp_tval_el0, {}", in(reg) ticks) };
}

#[cfg(not(target_arch = "aarch64"))]
pub fn enable() {}

#[cfg(not(target_arch = "aarch64"))]
pub fn disable() {}

#[cfg(not(target_arch = "aarch64"))]
pub fn reload(_ns: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        // Default test frequency is 62.5 MHz: 16ns per tick
        assert_eq!(ns_to_count(NS_PER_SECOND), 62_500_000);
        assert_eq!(count_to_ns(62_500_000), NS_PER_SECOND);
        assert_eq!(count_to_ns(ns_to_count(1_000_000)), 1_000_000);
    }

    #[test]
    fn test_muldiv64_no_overflow() {
        // a * b overflows u64; the u128 intermediate must not
        let a = u64::MAX / 2;
        assert_eq!(muldiv64(a, 1_000_000_000, 1_000_000_000), a);
        assert_eq!(muldiv64(a, 0, 5), 0);
        assert_eq!(muldiv64(a, 7, 0), 0);
    }

    #[test]
    fn test_now_advances() {
        let t0 = now_ns();
        let t1 = now_ns();
        assert!(t1 > t0);
    }
}
