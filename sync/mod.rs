//! Synchronization primitives
//!
//! The hypervisor has no scheduler and no blocking context, so everything
//! shared between physical cores is guarded by spinlocks.

pub mod spinlock;

pub use spinlock::SpinLock;
