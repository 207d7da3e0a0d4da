//! Physical and Virtual Address Types
//!
//! Type-safe wrappers for memory addresses that prevent mixing
//! physical and virtual addresses at compile time.
//!
//! Physical addresses cannot be dereferenced directly; kernel code reaches
//! physical memory through the higher-half direct map (a fixed offset added
//! to every physical address, established once at bootstrap).

use core::fmt;

/// Base page size (4 KiB) on both supported architectures.
pub const PAGE_SIZE: usize = 4096;
/// Page size mask.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number.
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table node (9-bit indices).
pub const ENTRIES_PER_TABLE: usize = 512;

/// Align `value` down to a multiple of `align` (power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Align `value` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A physical memory address.
///
/// Newtype wrapper so physical frame numbers never get used as pointers by
/// accident. At most 52 significant bits on either supported architecture.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    ///
    /// # Panics
    /// Panics in debug mode if the address uses more than 52 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        debug_assert!(addr <= 0x000F_FFFF_FFFF_FFFF);
        Self(addr)
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Check if the address is aligned to `align` bytes.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline]
    pub const fn align_up(self, align: usize) -> Self {
        Self(align_up(self.0, align))
    }

    /// Get the page frame number.
    #[inline]
    pub const fn frame_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Add a byte offset to this address.
    #[inline]
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Translate into the higher-half direct map.
    #[inline]
    pub const fn to_higher_half(self, hhdm_offset: usize) -> VirtAddr {
        VirtAddr::new(self.0 + hhdm_offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Check if the address is aligned to `align` bytes.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline]
    pub const fn align_up(self, align: usize) -> Self {
        Self(align_up(self.0, align))
    }

    /// Radix-tree index for the given table level.
    ///
    /// Level 0 is the leaf (4 KiB) level; level 4 is the optional fifth
    /// level. Each level consumes 9 bits of the address.
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        (self.0 >> (PAGE_SHIFT + 9 * level)) & (ENTRIES_PER_TABLE - 1)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add a byte offset to this address.
    #[inline]
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Check if this address lives in the kernel (upper) half.
    ///
    /// Both supported architectures put kernel space at the top of the
    /// canonical range, so bit 63 selects the half (the ttbr1-equivalent
    /// root on AArch64, the upper 256 top-level entries on x86_64).
    #[inline]
    pub const fn is_kernel_half(self) -> bool {
        self.0 & (1 << 63) != 0
    }

    /// Translate a direct-map address back to its physical address.
    #[inline]
    pub const fn to_lower_half(self, hhdm_offset: usize) -> PhysAddr {
        PhysAddr::new(self.0 - hhdm_offset)
    }

    /// Convert to a raw pointer.
    ///
    /// # Safety
    /// The caller must ensure the address is valid and properly mapped.
    #[inline]
    pub const unsafe fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Convert to a mutable raw pointer.
    ///
    /// # Safety
    /// The caller must ensure the address is valid, properly mapped,
    /// and that mutable access is safe.
    #[inline]
    pub const unsafe fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
