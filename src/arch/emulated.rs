//! Software paging backend for hosted builds.
//!
//! Implements the backend contract with a synthetic PTE encoding so the
//! portable table walk can be exercised on a development host. Table nodes
//! come from whatever [`FrameAllocator`](crate::mm::pmm::FrameAllocator) the
//! caller supplies and "physical" addresses are plain host pointers, so no
//! privileged instructions are needed anywhere.
//!
//! The encoding is deliberately not any real ISA's: permissions live in the
//! low bits, the cache policy is a three-bit code at bits 8..=10, and the
//! large-leaf marker sits at bit 7. Huge (1 GiB) leaves are reported as
//! unsupported so the decomposition fallback in the portable layer is the
//! path under test.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::address::VirtAddr;
use crate::mm::attributes::PageAttributes;
use crate::mm::vmm::BootInfo;

const PTE_VALID: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_GLOBAL: u64 = 1 << 3;
const PTE_NO_EXEC: u64 = 1 << 4;
const PTE_LARGE: u64 = 1 << 7;

const CACHE_SHIFT: u64 = 8;
const CACHE_MASK: u64 = 0b111 << CACHE_SHIFT;
const CACHE_WRITE_BACK: u64 = 1;
const CACHE_WRITE_THROUGH: u64 = 2;
const CACHE_WRITE_COMBINING: u64 = 3;
const CACHE_WRITE_PROTECTED: u64 = 4;
const CACHE_UNCACHEABLE: u64 = 5;
const CACHE_UNCACHEABLE_STRONG: u64 = 6;

static LEVELS: AtomicUsize = AtomicUsize::new(4);

pub fn init(boot: &BootInfo) {
    LEVELS.store(boot.paging_levels, Ordering::Relaxed);
}

pub fn paging_levels() -> usize {
    LEVELS.load(Ordering::Relaxed)
}

pub fn to_native_flags(attrs: PageAttributes) -> u64 {
    let mut flags = PTE_VALID;

    if attrs.contains(PageAttributes::WRITE) {
        flags |= PTE_WRITABLE;
    }
    if !attrs.contains(PageAttributes::EXECUTABLE) {
        flags |= PTE_NO_EXEC;
    }
    if attrs.contains(PageAttributes::USER) {
        flags |= PTE_USER;
    }
    if attrs.contains(PageAttributes::GLOBAL) {
        flags |= PTE_GLOBAL;
    }
    if attrs.intersects(PageAttributes::LARGE_TIER | PageAttributes::HUGE_TIER) {
        flags |= PTE_LARGE;
    }

    let cache = if attrs.contains(PageAttributes::WRITE_BACK) {
        CACHE_WRITE_BACK
    } else if attrs.contains(PageAttributes::WRITE_THROUGH) {
        CACHE_WRITE_THROUGH
    } else if attrs.contains(PageAttributes::WRITE_COMBINING) {
        CACHE_WRITE_COMBINING
    } else if attrs.contains(PageAttributes::WRITE_PROTECTED) {
        CACHE_WRITE_PROTECTED
    } else if attrs.contains(PageAttributes::UNCACHEABLE_STRONG) {
        CACHE_UNCACHEABLE_STRONG
    } else if attrs.contains(PageAttributes::UNCACHEABLE) {
        CACHE_UNCACHEABLE
    } else {
        0
    };
    flags |= cache << CACHE_SHIFT;

    flags
}

pub fn from_native_flags(flags: u64) -> PageAttributes {
    let mut attrs = PageAttributes::empty();

    if flags & PTE_VALID != 0 {
        attrs |= PageAttributes::READ;
    }
    if flags & PTE_WRITABLE != 0 {
        attrs |= PageAttributes::WRITE;
    }
    if flags & PTE_NO_EXEC == 0 {
        attrs |= PageAttributes::EXECUTABLE;
    }
    if flags & PTE_USER != 0 {
        attrs |= PageAttributes::USER;
    }
    if flags & PTE_GLOBAL != 0 {
        attrs |= PageAttributes::GLOBAL;
    }
    if flags & PTE_LARGE != 0 {
        attrs |= PageAttributes::LARGE_TIER;
    }

    attrs |= match (flags & CACHE_MASK) >> CACHE_SHIFT {
        CACHE_WRITE_BACK => PageAttributes::WRITE_BACK,
        CACHE_WRITE_THROUGH => PageAttributes::WRITE_THROUGH,
        CACHE_WRITE_COMBINING => PageAttributes::WRITE_COMBINING,
        CACHE_WRITE_PROTECTED => PageAttributes::WRITE_PROTECTED,
        CACHE_UNCACHEABLE => PageAttributes::UNCACHEABLE,
        CACHE_UNCACHEABLE_STRONG => PageAttributes::UNCACHEABLE_STRONG,
        _ => PageAttributes::empty(),
    };

    attrs
}

pub fn page_size(attrs: PageAttributes) -> usize {
    if attrs.contains(PageAttributes::HUGE_TIER) {
        1 << 30
    } else if attrs.contains(PageAttributes::LARGE_TIER) {
        1 << 21
    } else {
        1 << 12
    }
}

pub fn huge_pages_supported() -> bool {
    false
}

pub fn split_roots() -> bool {
    false
}

pub fn address_mask() -> u64 {
    0x000f_ffff_ffff_f000
}

pub fn traversal_flags() -> u64 {
    PTE_VALID | PTE_WRITABLE | PTE_USER
}

pub fn pte_valid(raw: u64) -> bool {
    raw & PTE_VALID != 0
}

pub fn pte_large(raw: u64) -> bool {
    raw & PTE_VALID != 0 && raw & PTE_LARGE != 0
}

pub fn flush_tlb(_virt: VirtAddr) {}

/// No privileged state on a host; installing a root is a no-op.
///
/// # Safety
///
/// Trivially safe, unsafe only to match the contract of the real backends.
pub unsafe fn load_root(_lower: u64, _upper: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHE_POLICIES: &[PageAttributes] = &[
        PageAttributes::empty(),
        PageAttributes::WRITE_BACK,
        PageAttributes::WRITE_THROUGH,
        PageAttributes::WRITE_COMBINING,
        PageAttributes::WRITE_PROTECTED,
        PageAttributes::UNCACHEABLE,
        PageAttributes::UNCACHEABLE_STRONG,
    ];

    #[test]
    fn attribute_round_trip() {
        for perm_bits in 0u32..8 {
            let mut perms = PageAttributes::READ;
            if perm_bits & 1 != 0 {
                perms |= PageAttributes::WRITE;
            }
            if perm_bits & 2 != 0 {
                perms |= PageAttributes::EXECUTABLE;
            }
            if perm_bits & 4 != 0 {
                perms |= PageAttributes::USER;
            }
            for &cache in CACHE_POLICIES {
                let attrs = perms | cache;
                let back = from_native_flags(to_native_flags(attrs));
                assert_eq!(back & PageAttributes::SEMANTIC_MASK, attrs, "{attrs:?}");
            }
        }
    }

    #[test]
    fn global_and_large_survive_translation() {
        let attrs = PageAttributes::RW
            | PageAttributes::GLOBAL
            | PageAttributes::LARGE_TIER
            | PageAttributes::WRITE_BACK;
        let back = from_native_flags(to_native_flags(attrs));
        assert!(back.contains(PageAttributes::GLOBAL));
        assert!(back.contains(PageAttributes::LARGE_TIER));
    }

    #[test]
    fn tier_sizes() {
        assert_eq!(page_size(PageAttributes::RW), 4096);
        assert_eq!(page_size(PageAttributes::LARGE_TIER), 2 * 1024 * 1024);
        assert_eq!(page_size(PageAttributes::HUGE_TIER), 1024 * 1024 * 1024);
    }

    #[test]
    fn invalid_entry_reads_back_empty() {
        assert!(!pte_valid(0));
        assert!(!pte_large(PTE_LARGE));
        assert_eq!(from_native_flags(0) & PageAttributes::READ, PageAttributes::empty());
    }
}
