//! Kernel heap, serving the `alloc` crate.
//!
//! A linked-list allocator over one contiguous kernel mapping. The backing
//! frames are reserved up front and the heap never grows, so size it
//! generously at init time.

use linked_list_allocator::LockedHeap;

use crate::mm::address::{align_up, VirtAddr, PAGE_SIZE};
use crate::mm::attributes::PageAttributes;
use crate::mm::paging::MapError;
use crate::mm::pmm::FrameGuard;
use crate::mm::vmm::KernelVm;

#[cfg_attr(target_os = "none", global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Reserves frames, maps them into kernel space and returns the span the
/// allocator will live in.
fn prepare(vm: &KernelVm, size: usize) -> Result<(VirtAddr, usize), MapError> {
    let size = align_up(size, PAGE_SIZE);
    let frames = FrameGuard::callocate(vm.frame_allocator(), size / PAGE_SIZE)
        .ok_or(MapError::OutOfMemory)?;
    let virt = vm.allocate_space(size, PAGE_SIZE, false);

    let attrs =
        PageAttributes::RW | PageAttributes::WRITE_BACK | PageAttributes::GLOBAL;
    vm.kernel_map().map_range(virt, frames.base(), size, attrs)?;
    frames.into_base();
    Ok((virt, size))
}

/// Brings up the global allocator. Called once, before the first `alloc`
/// use.
pub fn init(vm: &KernelVm, size: usize) -> Result<(), MapError> {
    let (virt, size) = prepare(vm, size)?;
    // SAFETY: the span was just mapped read-write and is owned exclusively
    // by the allocator from here on.
    unsafe { ALLOCATOR.lock().init(virt.as_mut_ptr::<u8>(), size) };
    log::info!("heap: {} KiB at {}", size / 1024, virt);
    Ok(())
}

/// (used, free) bytes.
pub fn stats() -> (usize, usize) {
    let heap = ALLOCATOR.lock();
    (heap.used(), heap.free())
}
