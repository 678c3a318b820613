//! Architecture-specific code
//!
//! Wyvern targets ARMv8-A at EL2; everything under `arm64` is written
//! against that architecture, with the hardware touch points stubbed on
//! hosted builds so the logic stays unit-testable.

pub mod arm64;
