//! Physical device drivers
//!
//! Only what the hypervisor itself needs: a console for diagnostics. Guest
//! device models live behind the MMIO emulation framework instead.

pub mod uart;
