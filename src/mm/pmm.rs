//! Physical Memory Manager Contract
//!
//! The frame allocator itself lives outside this subsystem; the VMM only
//! depends on this narrow interface. Implementations must be safe to call
//! concurrently from every CPU and from page-fault context, which means the
//! allocator itself may never touch unmapped memory.

use super::address::PhysAddr;

/// Contract the VMM places on the physical page allocator.
pub trait FrameAllocator: Sync {
    /// Allocate `count` contiguous physical frames.
    fn allocate_pages(&self, count: usize) -> Option<PhysAddr>;

    /// Allocate `count` contiguous, zero-filled physical frames.
    fn callocate_pages(&self, count: usize) -> Option<PhysAddr>;

    /// Return `count` frames starting at `base` to the allocator.
    ///
    /// `base` must come from a matching allocation.
    fn free_pages(&self, base: PhysAddr, count: usize);
}

/// RAII guard for a freshly allocated run of frames.
///
/// Frees the frames on drop unless ownership is taken with
/// [`FrameGuard::into_base`], which keeps error paths from leaking memory
/// while a multi-step operation (allocate, then map, then commit) is in
/// flight.
pub struct FrameGuard {
    pmm: &'static dyn FrameAllocator,
    base: PhysAddr,
    count: usize,
}

impl FrameGuard {
    /// Allocate `count` zero-filled frames under guard.
    pub fn callocate(pmm: &'static dyn FrameAllocator, count: usize) -> Option<Self> {
        let base = pmm.callocate_pages(count)?;
        Some(Self { pmm, base, count })
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Take ownership of the frames without freeing them.
    #[inline]
    pub fn into_base(self) -> PhysAddr {
        let base = self.base;
        core::mem::forget(self);
        base
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.pmm.free_pages(self.base, self.count);
    }
}

#[cfg(test)]
pub(crate) use test_support::TestFrames;

#[cfg(test)]
pub(crate) mod test_support {
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};
    use alloc::collections::BTreeMap;

    use spin::Mutex;

    use super::super::address::{PhysAddr, PAGE_SIZE};
    use super::FrameAllocator;

    #[derive(Default)]
    struct TestFramesInner {
        /// Live allocations: base address -> frame count.
        live: BTreeMap<usize, usize>,
        /// Successful allocation calls so far.
        allocations: usize,
        /// Remaining allocation calls before injected failure kicks in.
        fail_after: Option<usize>,
        frames_allocated: usize,
        frames_freed: usize,
    }

    /// Arena-backed mock PMM for unit tests.
    ///
    /// "Physical" addresses are page-aligned host allocations, which line up
    /// with an `hhdm_offset` of zero so the page-table walk can dereference
    /// node addresses directly.
    pub(crate) struct TestFrames {
        inner: Mutex<TestFramesInner>,
    }

    impl TestFrames {
        pub(crate) fn new() -> Self {
            Self {
                inner: Mutex::new(TestFramesInner::default()),
            }
        }

        /// Leak an allocator so it satisfies the `&'static` PMM handle the
        /// VMM carries.
        pub(crate) fn leak() -> &'static Self {
            alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new()))
        }

        /// Let the next `n` allocation calls succeed, then fail the rest.
        pub(crate) fn fail_after(&self, n: usize) {
            self.inner.lock().fail_after = Some(n);
        }

        pub(crate) fn allocation_calls(&self) -> usize {
            self.inner.lock().allocations
        }

        pub(crate) fn frames_allocated(&self) -> usize {
            self.inner.lock().frames_allocated
        }

        pub(crate) fn frames_freed(&self) -> usize {
            self.inner.lock().frames_freed
        }

        pub(crate) fn live_allocations(&self) -> usize {
            self.inner.lock().live.len()
        }

        fn layout(count: usize) -> Layout {
            let size = count * PAGE_SIZE;
            // Large-tier-sized runs come back large-tier aligned, so tests
            // can exercise mappings above the base page size.
            let align = if size % (1 << 21) == 0 { 1 << 21 } else { PAGE_SIZE };
            Layout::from_size_align(size, align).unwrap()
        }

        fn alloc(&self, count: usize) -> Option<PhysAddr> {
            assert!(count > 0);
            let mut inner = self.inner.lock();
            if let Some(remaining) = inner.fail_after {
                if remaining == 0 {
                    return None;
                }
                inner.fail_after = Some(remaining - 1);
            }
            // SAFETY: the layout has non-zero size.
            let ptr = unsafe { alloc_zeroed(Self::layout(count)) };
            if ptr.is_null() {
                return None;
            }
            inner.allocations += 1;
            inner.frames_allocated += count;
            inner.live.insert(ptr as usize, count);
            Some(PhysAddr::new(ptr as usize))
        }
    }

    impl FrameAllocator for TestFrames {
        fn allocate_pages(&self, count: usize) -> Option<PhysAddr> {
            self.alloc(count)
        }

        fn callocate_pages(&self, count: usize) -> Option<PhysAddr> {
            self.alloc(count)
        }

        fn free_pages(&self, base: PhysAddr, count: usize) {
            let mut inner = self.inner.lock();
            let recorded = inner
                .live
                .remove(&base.as_usize())
                .expect("freeing frames that were never allocated");
            assert_eq!(recorded, count, "partial free of an allocation");
            inner.frames_freed += count;
            // SAFETY: `base` came from `alloc` with the identical layout.
            unsafe { dealloc(base.as_usize() as *mut u8, Self::layout(count)) };
        }
    }
}
