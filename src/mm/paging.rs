//! Page Table Nodes and Entries
//!
//! One radix-tree node of native-width slots, plus the 64-bit entry type.
//! These are address and flag accessors only; all mapping policy lives in
//! [`PageMap`](super::pagemap::PageMap), and the native meaning of flag bits
//! is owned by the selected architecture backend.
//!
//! An entry is always in exactly one of three states:
//! - *empty* (all zero),
//! - a *table pointer* (child node address plus traversal flags), or
//! - a *leaf* (physical frame at the tier implied by its level, plus the
//!   full translated attribute flags).

use core::ops::{Index, IndexMut};

use crate::arch::vmm;

use super::address::{PhysAddr, ENTRIES_PER_TABLE};

/// A single page table entry.
///
/// The physical address and the flag bits share the 64-bit slot; the split
/// between them is the backend-supplied address mask.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create an empty (invalid) entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Compose an entry from a physical address and native flags.
    ///
    /// The result is written to the table as one store, so a concurrent
    /// walker never observes a torn intermediate state.
    #[inline]
    pub fn compose(phys: PhysAddr, native_flags: u64) -> Self {
        Self((phys.as_u64() & vmm::address_mask()) | native_flags)
    }

    /// Get the physical address from this entry.
    #[inline]
    pub fn address(self) -> PhysAddr {
        PhysAddr::new((self.0 & vmm::address_mask()) as usize)
    }

    /// Get the native flag bits from this entry.
    #[inline]
    pub fn flags(self) -> u64 {
        self.0 & !vmm::address_mask()
    }

    /// Check if the entry is valid (present).
    #[inline]
    pub fn is_valid(self) -> bool {
        vmm::pte_valid(self.0)
    }

    /// Check if the entry is a large/huge leaf terminating the walk above
    /// the base level.
    #[inline]
    pub fn is_large(self) -> bool {
        self.is_valid() && vmm::pte_large(self.0)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_valid() {
            write!(f, "PTE(addr={}, flags={:#x})", self.address(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

/// A page table node (one level of the radix tree).
///
/// Node storage comes from the physical allocator, zero-filled, and is
/// owned by exactly one parent entry until whole-PageMap teardown.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Pointer to the slot at `index`.
    ///
    /// # Safety
    /// `self` must point into a live, exclusively owned table node and
    /// `index` must be below [`ENTRIES_PER_TABLE`].
    #[inline]
    pub unsafe fn entry_ptr(this: *mut Self, index: usize) -> *mut PageTableEntry {
        debug_assert!(index < ENTRIES_PER_TABLE);
        // SAFETY: caller guarantees the node is live and the index in range.
        unsafe { (&raw mut (*this).entries).cast::<PageTableEntry>().add(index) }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Error type for mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The virtual address is not mapped.
    NotMapped,
    /// No physical frames available (for table nodes or backing memory).
    OutOfMemory,
    /// The address is not aligned to the requested tier.
    MisalignedAddress,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::MisalignedAddress => write!(f, "address not aligned to page tier"),
        }
    }
}
