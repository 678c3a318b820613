//! Physical memory management
//!
//! The hypervisor runs identity-mapped, so a physical address is directly
//! dereferenceable from EL2. Everything page-sized comes out of one global
//! bitmap allocator: stage-2 table pages, guest RAM frames, and vGIC
//! metadata.

pub mod page_alloc;

pub use page_alloc::PageAllocator;

use crate::Result;

/// Physical address
pub type PhysAddr = u64;

/// Guest-physical (intermediate physical) address
pub type IpaAddr = u64;

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Physical address to page frame number
pub const fn phys_to_pfn(pa: PhysAddr) -> u64 {
    pa >> PAGE_SHIFT
}

/// Page frame number to physical address
pub const fn pfn_to_phys(pfn: u64) -> PhysAddr {
    pfn << PAGE_SHIFT
}

/// Check page alignment
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// The global physical page allocator
static ALLOCATOR: PageAllocator = PageAllocator::new();

/// Initialize the global allocator over `[base_phys, base_phys + total_pages * PAGE_SIZE)`.
///
/// # Safety
/// `bitmap_storage` must point to enough writable u64 words for `total_pages`
/// bits and stay valid forever; the managed range must be free RAM.
pub unsafe fn init(bitmap_storage: *mut u64, total_pages: usize, base_phys: PhysAddr) -> Result<()> {
    ALLOCATOR.init(bitmap_storage, total_pages, base_phys)
}

/// Allocate `n` physically contiguous pages
pub fn alloc_pages(n: usize) -> Result<PhysAddr> {
    ALLOCATOR.alloc_pages(n)
}

/// Allocate a single page
pub fn alloc_page() -> Result<PhysAddr> {
    ALLOCATOR.alloc_pages(1)
}

/// Free `n` pages starting at `addr`
pub fn free_pages(addr: PhysAddr, n: usize) -> Result<()> {
    ALLOCATOR.free_pages(addr, n)
}

/// Free a single page
pub fn free_page(addr: PhysAddr) -> Result<()> {
    ALLOCATOR.free_pages(addr, 1)
}

/// Zero-fill one page.
///
/// # Safety
/// `pa` must be an identity-mapped page owned by the caller.
pub unsafe fn zero_page(pa: PhysAddr) {
    core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE as usize);
}

#[cfg(test)]
pub mod testing {
    //! Backs the global allocator with a leaked heap arena so page-table and
    //! VM-construction tests can treat host addresses as physical addresses
    //! (the hypervisor identity-maps its own memory, so pa == va there too).

    use super::*;
    use std::sync::OnceLock;

    const POOL_PAGES: usize = 16384; // 64 MiB

    static POOL_BASE: OnceLock<PhysAddr> = OnceLock::new();

    /// Initialize the global allocator over a test arena. Idempotent; shared
    /// by every test in the process.
    pub fn init_test_pool() -> PhysAddr {
        *POOL_BASE.get_or_init(|| {
            let bitmap = Box::leak(vec![0u64; POOL_PAGES.div_ceil(64)].into_boxed_slice());
            let memory = Box::leak(vec![0u8; (POOL_PAGES + 1) * PAGE_SIZE as usize].into_boxed_slice());
            let base = crate::utils::align_up(memory.as_mut_ptr() as u64, PAGE_SIZE);
            unsafe {
                init(bitmap.as_mut_ptr(), POOL_PAGES, base).expect("test pool init");
            }
            base
        })
    }
}
