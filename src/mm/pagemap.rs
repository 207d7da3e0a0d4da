//! Portable page-table management.
//!
//! A [`PageMap`] owns one radix tree of translation tables (or two, on
//! backends with split translation roots) and serializes every walk behind a
//! spinlock. All architecture knowledge is confined to the backend selected
//! in [`crate::arch`]: this module only ever composes raw entries out of
//! backend-translated flags and follows table pointers through the direct
//! map.
//!
//! Kernel-half sharing: on single-root backends the top-level entries for
//! the upper half are pre-populated when the kernel map is built, and user
//! maps copy those entries so every address space aliases the same kernel
//! subtrees. On split-root backends user maps simply share the kernel's
//! upper root node.

use core::ptr;

use crate::arch::vmm;
use crate::mm::address::{PhysAddr, VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::mm::attributes::PageAttributes;
use crate::mm::paging::{MapError, PageTable, PageTableEntry};
use crate::mm::pmm::FrameAllocator;
use crate::mm::region::Region;
use crate::sync::Spinlock;

/// First top-level index belonging to the kernel half.
const KERNEL_HALF_START: usize = ENTRIES_PER_TABLE / 2;

/// Nominal span of a huge leaf, also the decomposition span on backends
/// without huge-leaf support.
const HUGE_SPAN: usize = 1 << 30;

/// Bytes covered by one entry of a table at `level` (level 1 holds 4 KiB
/// leaves).
fn tier_size(level: usize) -> usize {
    1 << (12 + 9 * (level - 1))
}

struct RootTables {
    lower: PhysAddr,
    upper: PhysAddr,
}

pub struct PageMap {
    tables: Spinlock<RootTables>,
    pmm: &'static dyn FrameAllocator,
    hhdm_offset: usize,
    owns_upper: bool,
}

impl PageMap {
    /// Builds the kernel's address space root. On single-root backends this
    /// eagerly allocates all upper-half children, so later kernel mappings
    /// never touch the top level and stay visible through every user map
    /// cloned from this one.
    pub fn new_kernel(
        pmm: &'static dyn FrameAllocator,
        hhdm_offset: usize,
    ) -> Result<Self, MapError> {
        let lower = pmm.callocate_pages(1).ok_or(MapError::OutOfMemory)?;
        let upper = if vmm::split_roots() {
            match pmm.callocate_pages(1) {
                Some(upper) => upper,
                None => {
                    pmm.free_pages(lower, 1);
                    return Err(MapError::OutOfMemory);
                }
            }
        } else {
            lower
        };

        let map = PageMap {
            tables: Spinlock::new(RootTables { lower, upper }),
            pmm,
            hhdm_offset,
            owns_upper: true,
        };

        if !vmm::split_roots() {
            let roots = map.tables.lock();
            let root = map.table_ptr(roots.lower);
            for index in KERNEL_HALF_START..ENTRIES_PER_TABLE {
                let node = match pmm.callocate_pages(1) {
                    Some(node) => node,
                    None => {
                        drop(roots);
                        return Err(MapError::OutOfMemory);
                    }
                };
                // SAFETY: `root` points at a zeroed, exclusively owned table.
                unsafe {
                    ptr::write_volatile(
                        PageTable::entry_ptr(root, index),
                        PageTableEntry::compose(node, vmm::traversal_flags()),
                    );
                }
            }
        }

        Ok(map)
    }

    /// Clones the kernel half of `self` into a fresh user map with an empty
    /// lower half. Called on the kernel map.
    pub fn new_user(&self) -> Result<Self, MapError> {
        let roots = self.tables.lock();
        let lower = self.pmm.callocate_pages(1).ok_or(MapError::OutOfMemory)?;

        let upper = if vmm::split_roots() {
            roots.upper
        } else {
            let src = self.table_ptr(roots.lower);
            let dst = self.table_ptr(lower);
            for index in KERNEL_HALF_START..ENTRIES_PER_TABLE {
                // SAFETY: both tables are live; `dst` is exclusively owned.
                unsafe {
                    let entry = ptr::read_volatile(PageTable::entry_ptr(src, index));
                    ptr::write_volatile(PageTable::entry_ptr(dst, index), entry);
                }
            }
            lower
        };

        Ok(PageMap {
            tables: Spinlock::new(RootTables { lower, upper }),
            pmm: self.pmm,
            hhdm_offset: self.hhdm_offset,
            owns_upper: false,
        })
    }

    fn table_ptr(&self, phys: PhysAddr) -> *mut PageTable {
        // SAFETY: table nodes are frame-allocated and reachable through the
        // direct map for the lifetime of the tree.
        unsafe { phys.to_higher_half(self.hhdm_offset).as_mut_ptr::<PageTable>() }
    }

    /// Walks from the root toward `virt`, stopping at the level holding a
    /// `target_size` leaf or at an existing larger leaf, whichever comes
    /// first. Returns the entry pointer together with the span the stopped
    /// level covers. With `allocate` set, missing intermediate nodes are
    /// created; without it their absence is a [`MapError::NotMapped`].
    fn virt_to_pte(
        &self,
        roots: &RootTables,
        virt: VirtAddr,
        allocate: bool,
        target_size: usize,
    ) -> Result<(*mut PageTableEntry, usize), MapError> {
        let target_level = match target_size {
            0x4000_0000 => 3,
            0x20_0000 => 2,
            _ => 1,
        };

        let root = if virt.is_kernel_half() {
            roots.upper
        } else {
            roots.lower
        };

        let mut table = self.table_ptr(root);
        let mut level = vmm::paging_levels();
        loop {
            let index = virt.table_index(level - 1);
            // SAFETY: `table` points at a live table node of this tree.
            let entry_ptr = unsafe { PageTable::entry_ptr(table, index) };
            let entry = unsafe { ptr::read_volatile(entry_ptr) };

            if level == target_level || entry.is_large() {
                return Ok((entry_ptr, tier_size(level)));
            }

            table = if entry.is_valid() {
                self.table_ptr(entry.address())
            } else if allocate {
                let node = self.pmm.callocate_pages(1).ok_or(MapError::OutOfMemory)?;
                // SAFETY: `entry_ptr` is within a live table node.
                unsafe {
                    ptr::write_volatile(
                        entry_ptr,
                        PageTableEntry::compose(node, vmm::traversal_flags()),
                    );
                }
                self.table_ptr(node)
            } else {
                return Err(MapError::NotMapped);
            };
            level -= 1;
        }
    }

    /// Ok when no translation exists at `virt`, [`MapError::AlreadyMapped`]
    /// when one does.
    fn check_vacant(
        &self,
        roots: &RootTables,
        virt: VirtAddr,
        target_size: usize,
    ) -> Result<(), MapError> {
        match self.virt_to_pte(roots, virt, false, target_size) {
            Ok((entry_ptr, _)) => {
                // SAFETY: pointer returned by a walk under the held lock.
                let entry = unsafe { ptr::read_volatile(entry_ptr) };
                if entry.is_valid() {
                    Err(MapError::AlreadyMapped)
                } else {
                    Ok(())
                }
            }
            Err(MapError::NotMapped) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn internal_map(
        &self,
        roots: &RootTables,
        virt: VirtAddr,
        phys: PhysAddr,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        if attrs.contains(PageAttributes::HUGE_TIER) && !vmm::huge_pages_supported() {
            let large = (attrs - PageAttributes::HUGE_TIER) | PageAttributes::LARGE_TIER;
            let step = vmm::page_size(large);
            let mut offset = 0;
            while offset < HUGE_SPAN {
                if let Err(err) =
                    self.internal_map(roots, virt.offset(offset), phys.offset(offset), large)
                {
                    let mut undo = 0;
                    while undo < offset {
                        let _ = self.internal_unmap(roots, virt.offset(undo), large);
                        undo += step;
                    }
                    return Err(err);
                }
                offset += step;
            }
            return Ok(());
        }

        let size = vmm::page_size(attrs);
        let (entry_ptr, _) = self.virt_to_pte(roots, virt, true, size)?;
        // SAFETY: single volatile store of a fully composed leaf.
        unsafe {
            ptr::write_volatile(
                entry_ptr,
                PageTableEntry::compose(phys, vmm::to_native_flags(attrs)),
            );
        }
        Ok(())
    }

    fn internal_unmap(
        &self,
        roots: &RootTables,
        virt: VirtAddr,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        if attrs.contains(PageAttributes::HUGE_TIER) && !vmm::huge_pages_supported() {
            let large = (attrs - PageAttributes::HUGE_TIER) | PageAttributes::LARGE_TIER;
            let step = vmm::page_size(large);
            let mut offset = 0;
            while offset < HUGE_SPAN {
                self.internal_unmap(roots, virt.offset(offset), large)?;
                offset += step;
            }
            return Ok(());
        }

        let size = vmm::page_size(attrs);
        let (entry_ptr, _) = self.virt_to_pte(roots, virt, false, size)?;
        // SAFETY: pointer returned by a walk under the held lock.
        let entry = unsafe { ptr::read_volatile(entry_ptr) };
        if !entry.is_valid() {
            return Err(MapError::NotMapped);
        }
        unsafe { ptr::write_volatile(entry_ptr, PageTableEntry::empty()) };
        vmm::flush_tlb(virt);
        Ok(())
    }

    fn internal_remap(
        &self,
        roots: &RootTables,
        from: VirtAddr,
        to: VirtAddr,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        if attrs.contains(PageAttributes::HUGE_TIER) && !vmm::huge_pages_supported() {
            let large = (attrs - PageAttributes::HUGE_TIER) | PageAttributes::LARGE_TIER;
            let step = vmm::page_size(large);
            let mut offset = 0;
            while offset < HUGE_SPAN {
                self.internal_remap(roots, from.offset(offset), to.offset(offset), large)?;
                offset += step;
            }
            return Ok(());
        }

        let size = vmm::page_size(attrs);
        let (entry_ptr, _) = self.virt_to_pte(roots, from, false, size)?;
        // SAFETY: pointer returned by a walk under the held lock.
        let entry = unsafe { ptr::read_volatile(entry_ptr) };
        if !entry.is_valid() {
            return Err(MapError::NotMapped);
        }
        // A valid entry above the base level that is not a leaf is a table
        // pointer; moving it would tear a whole subtree out of the tree.
        assert!(
            size == PAGE_SIZE || entry.is_large(),
            "remap walk for {from} stopped on a table pointer instead of a leaf"
        );
        let phys = entry.address();
        unsafe { ptr::write_volatile(entry_ptr, PageTableEntry::empty()) };
        vmm::flush_tlb(from);
        self.internal_map(roots, to, phys, attrs)
    }

    fn internal_set_flags(
        &self,
        roots: &RootTables,
        virt: VirtAddr,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        if attrs.contains(PageAttributes::HUGE_TIER) && !vmm::huge_pages_supported() {
            let large = (attrs - PageAttributes::HUGE_TIER) | PageAttributes::LARGE_TIER;
            let step = vmm::page_size(large);
            let mut offset = 0;
            while offset < HUGE_SPAN {
                self.internal_set_flags(roots, virt.offset(offset), large)?;
                offset += step;
            }
            return Ok(());
        }

        let size = vmm::page_size(attrs);
        let (entry_ptr, _) = self.virt_to_pte(roots, virt, false, size)?;
        // SAFETY: pointer returned by a walk under the held lock.
        let entry = unsafe { ptr::read_volatile(entry_ptr) };
        if !entry.is_valid() {
            return Err(MapError::NotMapped);
        }
        // Rewriting a table pointer's flags would corrupt the traversal bits
        // of a whole subtree.
        assert!(
            size == PAGE_SIZE || entry.is_large(),
            "set_flags walk for {virt} stopped on a table pointer instead of a leaf"
        );

        // Keep the leaf tier the entry already has.
        let tier = if entry.is_large() {
            PageAttributes::LARGE_TIER
        } else {
            PageAttributes::empty()
        };
        let cleaned =
            (attrs - (PageAttributes::LARGE_TIER | PageAttributes::HUGE_TIER)) | tier;
        unsafe {
            ptr::write_volatile(
                entry_ptr,
                PageTableEntry::compose(entry.address(), vmm::to_native_flags(cleaned)),
            );
        }
        vmm::flush_tlb(virt);
        Ok(())
    }

    pub fn map(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        let size = vmm::page_size(attrs);
        if !virt.is_aligned(size) || !phys.is_aligned(size) {
            return Err(MapError::MisalignedAddress);
        }
        let roots = self.tables.lock();
        self.check_vacant(&roots, virt, size)?;
        self.internal_map(&roots, virt, phys, attrs)
    }

    pub fn unmap(&self, virt: VirtAddr, attrs: PageAttributes) -> Result<(), MapError> {
        let roots = self.tables.lock();
        self.internal_unmap(&roots, virt, attrs)
    }

    /// Moves the translation at `from` to `to`, keeping the backing frame.
    pub fn remap(
        &self,
        from: VirtAddr,
        to: VirtAddr,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        let roots = self.tables.lock();
        self.internal_remap(&roots, from, to, attrs)
    }

    /// Rewrites the permissions and cache policy of an existing leaf without
    /// allocating or changing its target frame.
    pub fn set_flags(&self, virt: VirtAddr, attrs: PageAttributes) -> Result<(), MapError> {
        let roots = self.tables.lock();
        self.internal_set_flags(&roots, virt, attrs)
    }

    /// Resolves `virt` to the physical address it translates to, honoring
    /// whatever leaf tier the walk lands on.
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let roots = self.tables.lock();
        let (entry_ptr, tier) = self.virt_to_pte(&roots, virt, false, PAGE_SIZE).ok()?;
        // SAFETY: pointer returned by a walk under the held lock.
        let entry = unsafe { ptr::read_volatile(entry_ptr) };
        if !entry.is_valid() {
            return None;
        }
        Some(entry.address().offset(virt.as_usize() % tier))
    }

    /// Maps `size` bytes (rounded up to the tier in `attrs`) starting at
    /// `virt`. On failure every page mapped by this call is unmapped again
    /// before the error is returned.
    pub fn map_range(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        let step = vmm::page_size(attrs);
        if !virt.is_aligned(step) || !phys.is_aligned(step) {
            return Err(MapError::MisalignedAddress);
        }
        let size = crate::mm::address::align_up(size, step);

        let roots = self.tables.lock();
        let mut offset = 0;
        while offset < size {
            let result = self
                .check_vacant(&roots, virt.offset(offset), step)
                .and_then(|()| {
                    self.internal_map(&roots, virt.offset(offset), phys.offset(offset), attrs)
                });
            if let Err(err) = result {
                let mut undo = 0;
                while undo < offset {
                    let _ = self.internal_unmap(&roots, virt.offset(undo), attrs);
                    undo += step;
                }
                return Err(err);
            }
            offset += step;
        }
        Ok(())
    }

    pub fn unmap_range(
        &self,
        virt: VirtAddr,
        size: usize,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        let step = vmm::page_size(attrs);
        let size = crate::mm::address::align_up(size, step);

        let roots = self.tables.lock();
        let mut offset = 0;
        while offset < size {
            self.internal_unmap(&roots, virt.offset(offset), attrs)?;
            offset += step;
        }
        Ok(())
    }

    pub fn remap_range(
        &self,
        from: VirtAddr,
        to: VirtAddr,
        size: usize,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        let step = vmm::page_size(attrs);
        let size = crate::mm::address::align_up(size, step);

        let roots = self.tables.lock();
        let mut offset = 0;
        while offset < size {
            self.internal_remap(&roots, from.offset(offset), to.offset(offset), attrs)?;
            offset += step;
        }
        Ok(())
    }

    pub fn set_flags_range(
        &self,
        virt: VirtAddr,
        size: usize,
        attrs: PageAttributes,
    ) -> Result<(), MapError> {
        let step = vmm::page_size(attrs);
        let size = crate::mm::address::align_up(size, step);

        let roots = self.tables.lock();
        let mut offset = 0;
        while offset < size {
            self.internal_set_flags(&roots, virt.offset(offset), attrs)?;
            offset += step;
        }
        Ok(())
    }

    /// Maps a committed region with the largest tier its base alignment and
    /// size admit.
    ///
    /// # Panics
    ///
    /// Panics if the region has no committed backing, which is a caller bug.
    pub fn map_region(&self, region: &Region) -> Result<(), MapError> {
        let phys = region
            .physical_base()
            .expect("map_region called on a region with no committed backing");
        let attrs = region.page_attributes()
            | required_tier(region.virtual_base(), phys, region.size());
        self.map_range(region.virtual_base(), phys, region.size(), attrs)
    }

    /// Makes this map the active translation root(s) on the calling core.
    ///
    /// # Safety
    ///
    /// The kernel half must map all code and data live at the switch point.
    pub unsafe fn load(&self) {
        let roots = self.tables.lock();
        // SAFETY: forwarded to the caller.
        unsafe { vmm::load_root(roots.lower.as_u64(), roots.upper.as_u64()) };
    }

    fn destroy_level(&self, table: PhysAddr, level: usize, start: usize, end: usize) {
        if level > 1 {
            let node = self.table_ptr(table);
            for index in start..end {
                // SAFETY: exclusive access, the tree is being torn down.
                let entry = unsafe { ptr::read_volatile(PageTable::entry_ptr(node, index)) };
                if entry.is_valid() && !entry.is_large() {
                    self.destroy_level(entry.address(), level - 1, 0, ENTRIES_PER_TABLE);
                }
            }
        }
        self.pmm.free_pages(table, 1);
    }
}

impl Drop for PageMap {
    /// Returns every table node this map owns to the frame allocator. Leaf
    /// frames are untouched; their lifetime belongs to whoever mapped them.
    /// Kernel-half subtrees are only freed by the map that built them.
    fn drop(&mut self) {
        let levels = vmm::paging_levels();
        let roots = self.tables.lock();
        if vmm::split_roots() {
            self.destroy_level(roots.lower, levels, 0, ENTRIES_PER_TABLE);
            if self.owns_upper {
                self.destroy_level(roots.upper, levels, 0, ENTRIES_PER_TABLE);
            }
        } else {
            let end = if self.owns_upper {
                ENTRIES_PER_TABLE
            } else {
                KERNEL_HALF_START
            };
            self.destroy_level(roots.lower, levels, 0, end);
        }
    }
}

/// Largest page tier that `virt`, `phys` and `size` are all aligned to.
pub fn required_tier(virt: VirtAddr, phys: PhysAddr, size: usize) -> PageAttributes {
    for (span, tier) in [
        (1usize << 30, PageAttributes::HUGE_TIER),
        (1 << 21, PageAttributes::LARGE_TIER),
    ] {
        if size % span == 0 && virt.is_aligned(span) && phys.is_aligned(span) {
            return tier;
        }
    }
    PageAttributes::empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::test_support::TestFrames;

    const RW_WB: PageAttributes = PageAttributes::RW.union(PageAttributes::WRITE_BACK);

    fn kernel_map(frames: &'static TestFrames) -> PageMap {
        PageMap::new_kernel(frames, 0).expect("root allocation")
    }

    #[test]
    fn map_then_translate_then_unmap() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x0000_1234_5000);
        let phys = frames.allocate_pages(1).unwrap();

        map.map(virt, phys, RW_WB).unwrap();
        assert_eq!(map.virt_to_phys(virt), Some(phys));
        assert_eq!(
            map.virt_to_phys(virt.offset(0x123)),
            Some(phys.offset(0x123))
        );

        map.unmap(virt, RW_WB).unwrap();
        assert_eq!(map.virt_to_phys(virt), None);
    }

    #[test]
    fn unmap_of_unmapped_address_fails() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x4000_0000);
        assert_eq!(map.unmap(virt, RW_WB), Err(MapError::NotMapped));

        // Sibling mapping builds the intermediate nodes but not this leaf.
        map.map(virt, PhysAddr::new(0x10_0000), RW_WB).unwrap();
        assert_eq!(
            map.unmap(virt.offset(PAGE_SIZE), RW_WB),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn double_map_is_rejected() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x7000_0000);
        map.map(virt, PhysAddr::new(0x20_0000), RW_WB).unwrap();
        assert_eq!(
            map.map(virt, PhysAddr::new(0x40_0000), RW_WB),
            Err(MapError::AlreadyMapped)
        );
        // The original translation is untouched.
        assert_eq!(map.virt_to_phys(virt), Some(PhysAddr::new(0x20_0000)));
    }

    #[test]
    fn misaligned_addresses_are_rejected() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        assert_eq!(
            map.map(VirtAddr::new(0x1001), PhysAddr::new(0x2000), RW_WB),
            Err(MapError::MisalignedAddress)
        );
        assert_eq!(
            map.map(
                VirtAddr::new(0x20_0000),
                PhysAddr::new(0x1000),
                RW_WB | PageAttributes::LARGE_TIER
            ),
            Err(MapError::MisalignedAddress)
        );
    }

    #[test]
    fn large_tier_translation_covers_whole_leaf() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x8000_0000);
        map.map(virt, phys, RW_WB | PageAttributes::LARGE_TIER).unwrap();

        assert_eq!(map.virt_to_phys(virt), Some(phys));
        assert_eq!(
            map.virt_to_phys(virt.offset(0x10_2345)),
            Some(phys.offset(0x10_2345))
        );
    }

    #[test]
    fn huge_mapping_decomposes_into_large_leaves() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x1_0000_0000);
        map.map(virt, phys, RW_WB | PageAttributes::HUGE_TIER).unwrap();

        // Every 2 MiB constituent translates, with the right offset.
        for index in 0..512 {
            let offset = index * (1 << 21);
            assert_eq!(
                map.virt_to_phys(virt.offset(offset + 0xfff)),
                Some(phys.offset(offset + 0xfff)),
                "constituent {index}"
            );
        }

        map.unmap(virt, RW_WB | PageAttributes::HUGE_TIER).unwrap();
        for index in 0..512 {
            assert_eq!(map.virt_to_phys(virt.offset(index * (1 << 21))), None);
        }
    }

    #[test]
    fn map_range_rolls_back_on_allocation_failure() {
        // Cross a level-2 boundary so the range needs several table nodes;
        // try every possible failure point and demand all-or-nothing.
        let virt = VirtAddr::new(0x3fe000);
        let phys = PhysAddr::new(0x10_0000);
        let pages = 4;

        for budget in 0..8 {
            let frames = TestFrames::leak();
            let map = kernel_map(frames);
            frames.fail_after(budget);

            let result = map.map_range(virt, phys, pages * PAGE_SIZE, RW_WB);
            match result {
                Ok(()) => {
                    for page in 0..pages {
                        assert!(map.virt_to_phys(virt.offset(page * PAGE_SIZE)).is_some());
                    }
                }
                Err(MapError::OutOfMemory) => {
                    for page in 0..pages {
                        assert_eq!(
                            map.virt_to_phys(virt.offset(page * PAGE_SIZE)),
                            None,
                            "budget {budget} page {page} survived a failed map_range"
                        );
                    }
                }
                Err(err) => panic!("unexpected error {err}"),
            }
        }
    }

    #[test]
    fn user_maps_alias_the_kernel_half() {
        let frames = TestFrames::leak();
        let kernel = kernel_map(frames);

        let kvirt = VirtAddr::new(0xffff_8000_4000_0000);
        kernel.map(kvirt, PhysAddr::new(0x30_0000), RW_WB).unwrap();

        let before = frames.allocation_calls();
        let user = kernel.new_user().unwrap();
        assert_eq!(frames.allocation_calls() - before, 1);

        // Kernel mappings made before and after the clone are both visible.
        assert_eq!(user.virt_to_phys(kvirt), Some(PhysAddr::new(0x30_0000)));
        kernel
            .map(kvirt.offset(PAGE_SIZE), PhysAddr::new(0x31_0000), RW_WB)
            .unwrap();
        assert_eq!(
            user.virt_to_phys(kvirt.offset(PAGE_SIZE)),
            Some(PhysAddr::new(0x31_0000))
        );

        // Lower halves stay private.
        let uvirt = VirtAddr::new(0x40_0000);
        user.map(uvirt, PhysAddr::new(0x50_0000), RW_WB | PageAttributes::USER)
            .unwrap();
        assert_eq!(kernel.virt_to_phys(uvirt), None);
    }

    #[test]
    fn teardown_returns_every_table_node() {
        let frames = TestFrames::leak();
        {
            let kernel = kernel_map(frames);
            kernel
                .map(VirtAddr::new(0x12_3000), PhysAddr::new(0x60_0000), RW_WB)
                .unwrap();
            kernel
                .map(
                    VirtAddr::new(0xffff_8000_0000_1000),
                    PhysAddr::new(0x61_0000),
                    RW_WB,
                )
                .unwrap();
            let user = kernel.new_user().unwrap();
            user.map(
                VirtAddr::new(0x80_0000),
                PhysAddr::new(0x62_0000),
                RW_WB | PageAttributes::USER,
            )
            .unwrap();
            drop(user);
            drop(kernel);
        }
        assert_eq!(frames.frames_allocated(), frames.frames_freed());
        assert_eq!(frames.live_allocations(), 0);
    }

    #[test]
    fn set_flags_changes_permissions_in_place() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x9_0000_0000);
        let phys = PhysAddr::new(0x70_0000);
        map.map(virt, phys, RW_WB).unwrap();

        let before = frames.allocation_calls();
        map.set_flags(virt, PageAttributes::READ | PageAttributes::WRITE_BACK)
            .unwrap();
        assert_eq!(frames.allocation_calls(), before);
        assert_eq!(map.virt_to_phys(virt), Some(phys));

        assert_eq!(
            map.set_flags(VirtAddr::new(0xa_0000_0000), RW_WB),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn remap_preserves_huge_decomposition() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let from = VirtAddr::new(0x4000_0000);
        let to = VirtAddr::new(0x1_4000_0000);
        let phys = PhysAddr::new(0x2_0000_0000);
        map.map(from, phys, RW_WB | PageAttributes::HUGE_TIER).unwrap();

        map.remap(from, to, RW_WB | PageAttributes::HUGE_TIER).unwrap();
        for index in [0usize, 1, 255, 511] {
            let offset = index * (1 << 21);
            assert_eq!(
                map.virt_to_phys(to.offset(offset)),
                Some(phys.offset(offset)),
                "constituent {index} lost its frame"
            );
            assert_eq!(map.virt_to_phys(from.offset(offset)), None);
        }
    }

    #[test]
    fn set_flags_walks_a_decomposed_huge_mapping() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x8000_0000);
        let phys = PhysAddr::new(0x2_4000_0000);
        map.map(virt, phys, RW_WB | PageAttributes::HUGE_TIER).unwrap();

        let before = frames.allocation_calls();
        map.set_flags(
            virt,
            PageAttributes::READ | PageAttributes::WRITE_BACK | PageAttributes::HUGE_TIER,
        )
        .unwrap();
        assert_eq!(frames.allocation_calls(), before);
        for index in [0usize, 17, 511] {
            let offset = index * (1 << 21);
            assert_eq!(
                map.virt_to_phys(virt.offset(offset)),
                Some(phys.offset(offset))
            );
        }
    }

    #[test]
    #[should_panic(expected = "table pointer")]
    fn remap_above_the_mapped_tier_panics() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let virt = VirtAddr::new(0x4000_0000);
        map.map(virt, PhysAddr::new(0x10_0000), RW_WB).unwrap();
        let _ = map.remap(
            virt,
            VirtAddr::new(0x8000_0000),
            RW_WB | PageAttributes::LARGE_TIER,
        );
    }

    #[test]
    fn remap_moves_the_backing_frame() {
        let frames = TestFrames::leak();
        let map = kernel_map(frames);

        let from = VirtAddr::new(0x11_0000_0000);
        let to = VirtAddr::new(0x12_0000_0000);
        let phys = PhysAddr::new(0x80_0000);
        map.map(from, phys, RW_WB).unwrap();

        map.remap(from, to, RW_WB).unwrap();
        assert_eq!(map.virt_to_phys(from), None);
        assert_eq!(map.virt_to_phys(to), Some(phys));
    }
}
