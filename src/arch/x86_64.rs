//! x86_64 paging backend.
//!
//! Four or five level long-mode tables, selected from the boot protocol.
//! 1 GiB leaves are offered only when CPUID reports PDPE1GB; otherwise the
//! portable layer falls back to runs of 2 MiB leaves.
//!
//! The cache policy is carried in PWT, PCD and software bit 9 rather than
//! the hardware PAT bit. The PAT bit sits at a different position for 4 KiB
//! and large leaves, which would make the flag translation non-invertible
//! without knowing the leaf tier; a software bit keeps every policy
//! recoverable from the raw entry alone.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::mm::address::VirtAddr;
use crate::mm::attributes::PageAttributes;
use crate::mm::fault::{PageFaultInfo, PageFaultReason, TrapContext};
use crate::mm::vmm::BootInfo;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_PWT: u64 = 1 << 3;
const PTE_PCD: u64 = 1 << 4;
const PTE_LARGE: u64 = 1 << 7;
const PTE_GLOBAL: u64 = 1 << 8;
const PTE_SW_CACHE: u64 = 1 << 9;
const PTE_NO_EXEC: u64 = 1 << 63;

static LEVELS: AtomicUsize = AtomicUsize::new(4);
static GIB1_PAGES: AtomicBool = AtomicBool::new(false);

pub fn init(boot: &BootInfo) {
    LEVELS.store(boot.paging_levels, Ordering::Relaxed);

    // SAFETY: cpuid is unprivileged and universally available in long mode.
    let max_extended = unsafe { core::arch::x86_64::__cpuid(0x8000_0000) }.eax;
    if max_extended >= 0x8000_0001 {
        let extended = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
        GIB1_PAGES.store(extended.edx & (1 << 26) != 0, Ordering::Relaxed);
    }
}

pub fn paging_levels() -> usize {
    LEVELS.load(Ordering::Relaxed)
}

pub fn to_native_flags(attrs: PageAttributes) -> u64 {
    let mut flags = PTE_PRESENT;

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

    if attrs.contains(PageAttributes::WRITE_BACK) {
        flags |= PTE_SW_CACHE;
    } else if attrs.contains(PageAttributes::WRITE_THROUGH) {
        flags |= PTE_PWT;
    } else if attrs.contains(PageAttributes::WRITE_COMBINING) {
        flags |= PTE_SW_CACHE | PTE_PCD;
    } else if attrs.contains(PageAttributes::WRITE_PROTECTED) {
        flags |= PTE_SW_CACHE | PTE_PWT;
    } else if attrs.contains(PageAttributes::UNCACHEABLE_STRONG) {
        flags |= PTE_PCD;
    } else if attrs.contains(PageAttributes::UNCACHEABLE) {
        flags |= PTE_PCD | PTE_PWT;
    }

    flags
}

pub fn from_native_flags(flags: u64) -> PageAttributes {
    let mut attrs = PageAttributes::empty();

    if flags & PTE_PRESENT != 0 {
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

    let sw = flags & PTE_SW_CACHE != 0;
    let pcd = flags & PTE_PCD != 0;
    let pwt = flags & PTE_PWT != 0;
    attrs |= match (sw, pcd, pwt) {
        (true, false, false) => PageAttributes::WRITE_BACK,
        (false, false, true) => PageAttributes::WRITE_THROUGH,
        (true, true, false) => PageAttributes::WRITE_COMBINING,
        (true, false, true) => PageAttributes::WRITE_PROTECTED,
        (false, true, false) => PageAttributes::UNCACHEABLE_STRONG,
        (false, true, true) => PageAttributes::UNCACHEABLE,
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
    GIB1_PAGES.load(Ordering::Relaxed)
}

pub fn split_roots() -> bool {
    false
}

pub fn address_mask() -> u64 {
    0x000f_ffff_ffff_f000
}

pub fn traversal_flags() -> u64 {
    PTE_PRESENT | PTE_WRITABLE | PTE_USER
}

pub fn pte_valid(raw: u64) -> bool {
    raw & PTE_PRESENT != 0
}

pub fn pte_large(raw: u64) -> bool {
    raw & PTE_PRESENT != 0 && raw & PTE_LARGE != 0
}

#[cfg(target_os = "none")]
pub fn flush_tlb(virt: VirtAddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
}

#[cfg(not(target_os = "none"))]
pub fn flush_tlb(_virt: VirtAddr) {}

/// Installs `lower` as the active CR3 root. `upper` is ignored; kernel
/// translations live in the shared top half of the same table.
///
/// # Safety
///
/// `lower` must be the physical address of a top-level table whose kernel
/// half covers all code and data live at the switch point.
#[cfg(target_os = "none")]
pub unsafe fn load_root(lower: u64, _upper: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;

    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(lower));
    // SAFETY: caller guarantees the table maps the currently running kernel.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

#[cfg(not(target_os = "none"))]
pub unsafe fn load_root(_lower: u64, _upper: u64) {}

/// Translates the #PF error code pushed by the CPU into portable fault
/// reasons. `address` is the faulting address read from CR2 by the trap stub.
pub fn decode_page_fault(error_code: u64, address: usize, context: TrapContext) -> PageFaultInfo {
    let mut reason = PageFaultReason::empty();

    if error_code & (1 << 0) == 0 {
        reason |= PageFaultReason::NOT_PRESENT;
    }
    if error_code & (1 << 1) != 0 {
        reason |= PageFaultReason::WRITE;
    }
    if error_code & (1 << 2) != 0 {
        reason |= PageFaultReason::USER;
    }
    if error_code & (1 << 3) != 0 {
        reason |= PageFaultReason::RESERVED_WRITE;
    }
    if error_code & (1 << 4) != 0 {
        reason |= PageFaultReason::INSTRUCTION_FETCH;
    }
    if error_code & (1 << 5) != 0 {
        reason |= PageFaultReason::PROTECTION_KEY;
    }
    if error_code & (1 << 6) != 0 {
        reason |= PageFaultReason::SHADOW_STACK;
    }
    if error_code & (1 << 15) != 0 {
        reason |= PageFaultReason::SGX;
    }

    PageFaultInfo {
        address: VirtAddr::new(address),
        reason,
        context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_round_trip() {
        let policies = [
            PageAttributes::empty(),
            PageAttributes::WRITE_BACK,
            PageAttributes::WRITE_THROUGH,
            PageAttributes::WRITE_COMBINING,
            PageAttributes::WRITE_PROTECTED,
            PageAttributes::UNCACHEABLE,
            PageAttributes::UNCACHEABLE_STRONG,
        ];
        let perms = [
            PageAttributes::READ,
            PageAttributes::RW,
            PageAttributes::RWX,
            PageAttributes::RW | PageAttributes::USER,
            PageAttributes::READ | PageAttributes::GLOBAL,
        ];
        for &perm in &perms {
            for &cache in &policies {
                let attrs = perm | cache;
                let back = from_native_flags(to_native_flags(attrs));
                assert_eq!(back & PageAttributes::SEMANTIC_MASK, attrs, "{attrs:?}");
            }
        }
    }

    #[test]
    fn large_leaf_bit_survives() {
        let native = to_native_flags(PageAttributes::RW | PageAttributes::LARGE_TIER);
        assert!(pte_large(native));
        assert!(from_native_flags(native).contains(PageAttributes::LARGE_TIER));
    }

    #[test]
    fn decode_not_present_write_from_user() {
        // P=0, W/R=1, U/S=1
        let info = decode_page_fault(0b110, 0x7fff_dead_b000, TrapContext::default());
        assert!(info.reason.contains(PageFaultReason::NOT_PRESENT));
        assert!(info.reason.contains(PageFaultReason::WRITE));
        assert!(info.reason.contains(PageFaultReason::USER));
        assert!(!info.reason.contains(PageFaultReason::INSTRUCTION_FETCH));
        assert_eq!(info.address.as_usize(), 0x7fff_dead_b000);
    }

    #[test]
    fn decode_protection_violations() {
        let info = decode_page_fault(0b10101, 0x1000, TrapContext::default());
        assert!(!info.reason.contains(PageFaultReason::NOT_PRESENT));
        assert!(info.reason.contains(PageFaultReason::USER));
        assert!(info.reason.contains(PageFaultReason::INSTRUCTION_FETCH));

        let info = decode_page_fault(1 << 15, 0, TrapContext::default());
        assert!(info.reason.contains(PageFaultReason::SGX));
        assert!(info.reason.contains(PageFaultReason::NOT_PRESENT));
    }
}
