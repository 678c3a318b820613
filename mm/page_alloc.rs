//! Bitmap-based physical page allocator
//!
//! One bit per page frame. Allocation scans for a contiguous free run
//! starting at a rolling cursor (`last_alloc`) so consecutive allocations
//! stay close together; freeing pulls the cursor back so low addresses get
//! reused first. A single lock covers the whole search; fine at this scale,
//! a production variant would keep a free list.

use crate::mm::{pfn_to_phys, phys_to_pfn, PhysAddr, PAGE_SIZE};
use crate::sync::SpinLock;
use crate::utils::bitmap::Bitmap;
use crate::{Error, Result};

struct Inner {
    bitmap: Option<Bitmap>,
    total_pages: usize,
    base_pfn: u64,
    /// Next search position, in frames relative to `base_pfn`
    last_alloc: usize,
}

/// Physical page allocator
pub struct PageAllocator {
    inner: SpinLock<Inner>,
}

impl PageAllocator {
    /// Create an uninitialized allocator
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                bitmap: None,
                total_pages: 0,
                base_pfn: 0,
                last_alloc: 0,
            }),
        }
    }

    /// Initialize over `total_pages` frames starting at `base_phys`, marking
    /// every page free.
    ///
    /// # Safety
    /// `bitmap_storage` must point to at least `total_pages.div_ceil(64)`
    /// writable u64 words that outlive the allocator.
    pub unsafe fn init(
        &self,
        bitmap_storage: *mut u64,
        total_pages: usize,
        base_phys: PhysAddr,
    ) -> Result<()> {
        if bitmap_storage.is_null() || total_pages == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        if inner.bitmap.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        inner.bitmap = Some(Bitmap::new(bitmap_storage, total_pages));
        inner.total_pages = total_pages;
        inner.base_pfn = phys_to_pfn(base_phys);
        inner.last_alloc = 0;
        Ok(())
    }

    /// Allocate `n` contiguous pages, returning the physical address of the
    /// first one.
    pub fn alloc_pages(&self, n: usize) -> Result<PhysAddr> {
        let mut inner = self.inner.lock();
        if inner.bitmap.is_none() {
            return Err(Error::NotInitialized);
        }
        if n == 0 || n > inner.total_pages {
            return Err(Error::InvalidArgument);
        }

        let start = inner
            .find_free_run(n)
            .ok_or(Error::OutOfMemory)?;

        let bitmap = inner.bitmap.as_mut().unwrap();
        for i in start..start + n {
            bitmap.set_bit(i);
        }
        inner.last_alloc = start + n;

        Ok(pfn_to_phys(inner.base_pfn + start as u64))
    }

    /// Free `n` pages starting at `addr`
    pub fn free_pages(&self, addr: PhysAddr, n: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.bitmap.is_none() {
            return Err(Error::NotInitialized);
        }

        let pfn = phys_to_pfn(addr);
        if pfn < inner.base_pfn || n == 0 {
            return Err(Error::InvalidArgument);
        }
        let start = (pfn - inner.base_pfn) as usize;
        if start + n > inner.total_pages {
            return Err(Error::InvalidArgument);
        }

        let bitmap = inner.bitmap.as_mut().unwrap();
        for i in start..start + n {
            bitmap.clear_bit(i);
        }

        // Bias the next search toward the freed region
        if start < inner.last_alloc {
            inner.last_alloc = start;
        }
        Ok(())
    }

    /// Number of free pages left
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.bitmap {
            Some(b) => b.count_zeros(),
            None => 0,
        }
    }

    /// Total size of the managed region in bytes
    pub fn managed_bytes(&self) -> u64 {
        self.inner.lock().total_pages as u64 * PAGE_SIZE
    }
}

impl Inner {
    /// Find a run of `n` free frames. Starts at the cursor, wraps around to
    /// the beginning once; a run never spans the wrap point.
    fn find_free_run(&self, n: usize) -> Option<usize> {
        let bitmap = self.bitmap.as_ref()?;
        let total = self.total_pages;
        let from = if self.last_alloc >= total { 0 } else { self.last_alloc };

        let mut start = 0;
        let mut count = 0;
        for i in from..total {
            if bitmap.test(i) {
                count = 0;
            } else {
                if count == 0 {
                    start = i;
                }
                count += 1;
                if count >= n {
                    return Some(start);
                }
            }
        }

        count = 0;
        for i in 0..from {
            if bitmap.test(i) {
                count = 0;
            } else {
                if count == 0 {
                    start = i;
                }
                count += 1;
                if count >= n {
                    return Some(start);
                }
            }
        }

        None
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}
