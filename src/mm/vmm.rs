//! Kernel virtual memory bring-up and the kernel's own address space.
//!
//! [`KernelVm`] is the one handle the rest of the kernel talks to: it owns
//! the kernel page map, the bump cursor for kernel virtual space and the
//! kernel region bookkeeping. Bootstrap rebuilds the loader's provisional
//! tables from scratch: direct map, high physical memory, kernel image, then
//! switches to the new roots.

use core::cmp::max;

use crate::arch::vmm;
use crate::mm::address::{align_up, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mm::attributes::{AccessMode, PageAttributes};
use crate::mm::pagemap::{required_tier, PageMap};
use crate::mm::paging::MapError;
use crate::mm::pmm::{FrameAllocator, FrameGuard};
use crate::mm::region::{AddressSpace, Region};
use crate::sync::Spinlock;

const GIB: usize = 1 << 30;
/// Everything below this is unconditionally direct-mapped at bootstrap.
const DIRECT_MAP_FLOOR: usize = 4 * GIB;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    Framebuffer,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryMapEntry {
    pub base: PhysAddr,
    pub length: usize,
    pub kind: MemoryKind,
}

/// Everything the loader hands over that bootstrap needs.
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryMapEntry],
    pub kernel_phys: PhysAddr,
    pub kernel_virt: VirtAddr,
    pub kernel_size: usize,
    pub hhdm_offset: usize,
    pub paging_levels: usize,
}

pub struct KernelVm {
    pmm: &'static dyn FrameAllocator,
    hhdm_offset: usize,
    kernel_map: PageMap,
    cursor: Spinlock<usize>,
    kernel_space: Spinlock<AddressSpace>,
}

impl KernelVm {
    /// Builds the kernel's address space and switches to it.
    ///
    /// The direct map covers the first 4 GiB wholesale plus every usable or
    /// framebuffer memory-map entry above that, each at the largest page
    /// tier its alignment admits. The kernel image is mapped at its linked
    /// address, and the virtual allocation cursor starts past everything
    /// the direct map can ever reach.
    pub fn bootstrap(
        pmm: &'static dyn FrameAllocator,
        boot: &BootInfo,
    ) -> Result<Self, MapError> {
        vmm::init(boot);

        let kernel_map = PageMap::new_kernel(pmm, boot.hhdm_offset)?;
        let direct = PageAttributes::RW | PageAttributes::WRITE_BACK | PageAttributes::GLOBAL;

        map_physical_span(&kernel_map, boot.hhdm_offset, 0, DIRECT_MAP_FLOOR, direct)?;

        let mut memory_top = DIRECT_MAP_FLOOR;
        for entry in boot.memory_map {
            let end = entry.base.as_usize() + entry.length;
            memory_top = max(memory_top, end);

            if end <= DIRECT_MAP_FLOOR || entry.kind == MemoryKind::Reserved {
                continue;
            }
            let start = max(entry.base.as_usize(), DIRECT_MAP_FLOOR);
            let attrs = match entry.kind {
                MemoryKind::Framebuffer => {
                    PageAttributes::RW
                        | PageAttributes::WRITE_COMBINING
                        | PageAttributes::GLOBAL
                }
                _ => direct,
            };
            map_physical_span(&kernel_map, boot.hhdm_offset, start, end - start, attrs)?;
        }

        let image = PageAttributes::RWX | PageAttributes::WRITE_BACK | PageAttributes::GLOBAL;
        let image_size = align_up(boot.kernel_size, PAGE_SIZE);
        kernel_map.map_range(
            boot.kernel_virt,
            boot.kernel_phys,
            image_size,
            image | required_tier(boot.kernel_virt, boot.kernel_phys, image_size),
        )?;

        let cursor = boot.hhdm_offset + align_up(memory_top, GIB) + DIRECT_MAP_FLOOR;
        let vm = KernelVm {
            pmm,
            hhdm_offset: boot.hhdm_offset,
            kernel_map,
            cursor: Spinlock::new(cursor),
            kernel_space: Spinlock::new(AddressSpace::new(cursor, usize::MAX)),
        };

        log::info!(
            "vmm: bootstrapped, physical top {:#x}, kernel space cursor {:#x}",
            memory_top,
            cursor
        );

        // SAFETY: the new tables cover the direct map and the running kernel
        // image, so execution continues seamlessly after the switch.
        unsafe { vm.kernel_map.load() };
        Ok(vm)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(pmm: &'static dyn FrameAllocator) -> Self {
        let base = 0xffff_c000_0000_0000;
        KernelVm {
            pmm,
            hhdm_offset: 0,
            kernel_map: PageMap::new_kernel(pmm, 0).expect("root allocation"),
            cursor: Spinlock::new(base),
            kernel_space: Spinlock::new(AddressSpace::new(base, base + (1 << 40))),
        }
    }

    pub fn kernel_map(&self) -> &PageMap {
        &self.kernel_map
    }

    pub fn frame_allocator(&self) -> &'static dyn FrameAllocator {
        self.pmm
    }

    pub fn hhdm_offset(&self) -> usize {
        self.hhdm_offset
    }

    /// Bumps the kernel virtual allocation cursor by `size` (page-rounded),
    /// placing the base at any power-of-two `alignment`; large-tier mappings
    /// want large-tier-aligned windows. With `lower_half` set the
    /// reservation is mirrored into the lower half for address spaces that
    /// place their mappings below the kernel.
    pub fn allocate_space(&self, size: usize, alignment: usize, lower_half: bool) -> VirtAddr {
        assert!(alignment.is_power_of_two());

        let mut cursor = self.cursor.lock();
        let base = align_up(*cursor, alignment);
        *cursor = base + align_up(size, PAGE_SIZE);

        if lower_half {
            VirtAddr::new(base - self.hhdm_offset)
        } else {
            VirtAddr::new(base)
        }
    }

    /// Allocates, maps and commits a kernel region in one step. Kernel
    /// regions are always backed eagerly; only user regions fault their
    /// frames in.
    pub fn allocate_region(&self, size: usize, access: AccessMode) -> Result<Region, MapError> {
        let size = align_up(size, PAGE_SIZE);
        let frames =
            FrameGuard::callocate(self.pmm, size / PAGE_SIZE).ok_or(MapError::OutOfMemory)?;
        let virt = self.allocate_space(size, PAGE_SIZE, false);

        let mut attrs = access.page_attributes();
        if !access.contains(AccessMode::USER) {
            attrs |= PageAttributes::GLOBAL;
        }
        self.kernel_map.map_range(
            virt,
            frames.base(),
            size,
            attrs | required_tier(virt, frames.base(), size),
        )?;

        let mut region = Region::new(virt, size, access);
        region.commit(frames.into_base());
        let inserted = self.kernel_space.lock().insert(region);
        debug_assert!(inserted, "kernel space cursor produced an overlap");
        Ok(region)
    }

    /// Releases a region previously handed out by [`allocate_region`],
    /// unmapping it and returning its frames.
    ///
    /// [`allocate_region`]: KernelVm::allocate_region
    pub fn free_region(&self, base: VirtAddr) -> Result<(), MapError> {
        let region = self
            .kernel_space
            .lock()
            .erase(base)
            .ok_or(MapError::NotMapped)?;
        if let Some(phys) = region.physical_base() {
            let attrs = region.page_attributes()
                | required_tier(region.virtual_base(), phys, region.size());
            self.kernel_map
                .unmap_range(region.virtual_base(), region.size(), attrs)?;
            self.pmm.free_pages(phys, region.size() / PAGE_SIZE);
        }
        Ok(())
    }

    /// Maps a physical device range uncacheable into kernel space and
    /// returns the virtual address of `phys` itself, byte offset included.
    pub fn map_io_region(&self, phys: PhysAddr, size: usize) -> Result<VirtAddr, MapError> {
        let base = phys.align_down(PAGE_SIZE);
        let offset = phys.as_usize() - base.as_usize();
        let size = align_up(size + offset, PAGE_SIZE);

        let virt = self.allocate_space(size, PAGE_SIZE, false);
        let attrs = PageAttributes::RW
            | PageAttributes::UNCACHEABLE_STRONG
            | PageAttributes::GLOBAL;
        self.kernel_map
            .map_range(virt, base, size, attrs | required_tier(virt, base, size))?;
        Ok(virt.offset(offset))
    }
}

/// Direct-maps `[base, base + len)` into the higher half, greedily using the
/// largest page tier each step's alignment and remainder admit.
fn map_physical_span(
    map: &PageMap,
    hhdm_offset: usize,
    base: usize,
    len: usize,
    attrs: PageAttributes,
) -> Result<(), MapError> {
    let mut cur = crate::mm::address::align_down(base, PAGE_SIZE);
    let end = align_up(base + len, PAGE_SIZE);

    while cur < end {
        let (tier, step) = if cur % GIB == 0 && end - cur >= GIB {
            (PageAttributes::HUGE_TIER, GIB)
        } else if cur % (1 << 21) == 0 && end - cur >= 1 << 21 {
            (PageAttributes::LARGE_TIER, 1 << 21)
        } else {
            (PageAttributes::empty(), PAGE_SIZE)
        };

        let phys = PhysAddr::new(cur);
        map.map_range(phys.to_higher_half(hhdm_offset), phys, step, attrs | tier)?;
        cur += step;
    }
    Ok(())
}
