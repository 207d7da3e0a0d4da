//! Per-address-space region tracking.
//!
//! An [`AddressSpace`] is pure bookkeeping: it records which virtual ranges
//! a process owns and what backs them, while [`PageMap`] holds the actual
//! translations. Regions start out reserved-but-unbacked and are committed
//! exactly once, either eagerly at allocation time or lazily from the page
//! fault handler.

use alloc::collections::BTreeMap;

use crate::mm::address::{align_up, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mm::attributes::{AccessMode, PageAttributes};
use crate::mm::pagemap::{required_tier, PageMap};
use crate::mm::pmm::FrameAllocator;

/// One owned virtual range. `physical_base` is `None` until the region is
/// committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    virtual_base: VirtAddr,
    size: usize,
    physical_base: Option<PhysAddr>,
    access: AccessMode,
}

impl Region {
    pub fn new(virtual_base: VirtAddr, size: usize, access: AccessMode) -> Self {
        Self {
            virtual_base,
            size,
            physical_base: None,
            access,
        }
    }

    pub fn virtual_base(&self) -> VirtAddr {
        self.virtual_base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn physical_base(&self) -> Option<PhysAddr> {
        self.physical_base
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> VirtAddr {
        self.virtual_base.offset(self.size)
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.virtual_base && addr < self.end()
    }

    pub fn is_committed(&self) -> bool {
        self.physical_base.is_some()
    }

    /// Attaches physical backing. A region is committed at most once.
    ///
    /// # Panics
    ///
    /// Panics if the region already has backing.
    pub fn commit(&mut self, phys: PhysAddr) {
        assert!(
            self.physical_base.is_none(),
            "region at {} committed twice",
            self.virtual_base
        );
        self.physical_base = Some(phys);
    }

    pub fn page_attributes(&self) -> PageAttributes {
        self.access.page_attributes()
    }
}

/// Region map for one process (or for the kernel itself), keyed by base
/// address so containment lookups are a single predecessor query.
pub struct AddressSpace {
    regions: BTreeMap<usize, Region>,
    cursor: usize,
    limit: usize,
}

impl AddressSpace {
    pub fn new(base: usize, limit: usize) -> Self {
        Self {
            regions: BTreeMap::new(),
            cursor: base,
            limit,
        }
    }

    fn overlaps(&self, base: usize, size: usize) -> bool {
        // A range that wraps the address space collides with everything.
        let Some(end) = base.checked_add(size) else {
            return true;
        };
        if let Some((_, before)) = self.regions.range(..=base).next_back() {
            if before.end().as_usize() > base {
                return true;
            }
        }
        self.regions.range(base..end).next().is_some()
    }

    /// Reserves `size` bytes (page-rounded) at the allocation cursor. The
    /// returned region is not yet committed or mapped.
    pub fn allocate_region(&mut self, size: usize, access: AccessMode) -> Option<Region> {
        let size = align_up(size, PAGE_SIZE);
        if size == 0 || self.limit - self.cursor < size {
            return None;
        }
        let base = self.cursor;
        self.cursor += size;

        let region = Region::new(VirtAddr::new(base), size, access);
        self.regions.insert(base, region);
        Some(region)
    }

    /// Reserves a caller-chosen range, failing on overlap with any existing
    /// region.
    pub fn allocate_fixed(
        &mut self,
        base: VirtAddr,
        size: usize,
        access: AccessMode,
    ) -> Option<Region> {
        let size = align_up(size, PAGE_SIZE);
        if size == 0 || !base.is_aligned(PAGE_SIZE) || self.overlaps(base.as_usize(), size) {
            return None;
        }
        let region = Region::new(base, size, access);
        self.regions.insert(base.as_usize(), region);
        Some(region)
    }

    pub fn find(&self, addr: VirtAddr) -> Option<&Region> {
        let (_, region) = self.regions.range(..=addr.as_usize()).next_back()?;
        region.contains(addr).then_some(region)
    }

    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut Region> {
        let (_, region) = self.regions.range_mut(..=addr.as_usize()).next_back()?;
        region.contains(addr).then_some(region)
    }

    pub fn insert(&mut self, region: Region) -> bool {
        let base = region.virtual_base().as_usize();
        if self.overlaps(base, region.size()) {
            return false;
        }
        self.regions.insert(base, region);
        true
    }

    /// Drops the bookkeeping for the region based at `base`, returning it so
    /// the caller can unmap and free the backing.
    pub fn erase(&mut self, base: VirtAddr) -> Option<Region> {
        self.regions.remove(&base.as_usize())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Tears down every region: committed ones are unmapped and their frames
    /// returned, reservations are simply forgotten.
    pub fn clear(&mut self, pmm: &dyn FrameAllocator, page_map: &PageMap) {
        for region in self.regions.values() {
            if let Some(phys) = region.physical_base() {
                // Committed regions were mapped at the tier their alignment
                // admitted, so teardown must walk at that same tier.
                let attrs = region.page_attributes()
                    | required_tier(region.virtual_base(), phys, region.size());
                page_map
                    .unmap_range(region.virtual_base(), region.size(), attrs)
                    .expect("committed region had no live translation");
                pmm.free_pages(phys, region.size() / PAGE_SIZE);
            }
        }
        self.regions.clear();
    }
}
