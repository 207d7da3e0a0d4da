//! AArch64 paging backend.
//!
//! 4 KiB translation granule with split translation roots: user mappings go
//! through TTBR0 and the kernel half through TTBR1, so each address space
//! carries its own lower root and shares one upper root node. Block
//! descriptors are available at levels 1 and 2, which gives native 1 GiB
//! leaves without a CPUID-style probe.
//!
//! The cache policy is an index into MAIR_EL1, which boot code is expected
//! to program with the layout in [`MAIR_LAYOUT`].

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::address::VirtAddr;
use crate::mm::attributes::PageAttributes;
use crate::mm::fault::{PageFaultInfo, PageFaultReason, TrapContext};
use crate::mm::vmm::BootInfo;

const PTE_VALID: u64 = 1 << 0;
// Clear on a block descriptor, set on table pointers and level-3 pages.
const PTE_TABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 6;
const PTE_READ_ONLY: u64 = 1 << 7;
const PTE_INNER_SHAREABLE: u64 = 0b11 << 8;
const PTE_ACCESSED: u64 = 1 << 10;
const PTE_NOT_GLOBAL: u64 = 1 << 11;
const PTE_NO_EXEC: u64 = 0b11 << 53; // PXN | UXN

const ATTR_INDEX_SHIFT: u64 = 2;
const ATTR_INDEX_MASK: u64 = 0b111 << ATTR_INDEX_SHIFT;

const MAIR_WRITE_BACK: u64 = 0;
const MAIR_DEVICE: u64 = 1;
const MAIR_NON_CACHEABLE: u64 = 2;
const MAIR_WRITE_THROUGH: u64 = 3;
const MAIR_WRITE_COMBINING: u64 = 4;
const MAIR_WRITE_PROTECTED: u64 = 5;

/// Expected MAIR_EL1 value, one attribute byte per index above.
pub const MAIR_LAYOUT: u64 = 0xff  // 0: normal write-back
    | 0x04 << 8                    // 1: device nGnRE
    | 0x44 << 16                   // 2: normal non-cacheable
    | 0xbb << 24                   // 3: normal write-through
    | 0x44 << 32                   // 4: non-cacheable, used as write-combining
    | 0xbb << 40; // 5: write-through read-allocate, used as write-protected

static LEVELS: AtomicUsize = AtomicUsize::new(4);

pub fn init(boot: &BootInfo) {
    LEVELS.store(boot.paging_levels, Ordering::Relaxed);

    let mmfr0: u64;
    // SAFETY: ID register read, no side effects.
    unsafe {
        core::arch::asm!("mrs {}, id_aa64mmfr0_el1", out(reg) mmfr0, options(nomem, nostack));
    }
    // TGran4, 0b1111 means the 4 KiB granule is absent.
    if (mmfr0 >> 28) & 0xf == 0xf {
        panic!("paging: cpu does not implement the 4 KiB translation granule");
    }
}

pub fn paging_levels() -> usize {
    LEVELS.load(Ordering::Relaxed)
}

pub fn to_native_flags(attrs: PageAttributes) -> u64 {
    let mut flags = PTE_VALID | PTE_ACCESSED | PTE_INNER_SHAREABLE;

    if !attrs.contains(PageAttributes::WRITE) {
        flags |= PTE_READ_ONLY;
    }
    if !attrs.contains(PageAttributes::EXECUTABLE) {
        flags |= PTE_NO_EXEC;
    }
    if attrs.contains(PageAttributes::USER) {
        flags |= PTE_USER;
    }
    if !attrs.contains(PageAttributes::GLOBAL) {
        flags |= PTE_NOT_GLOBAL;
    }
    if !attrs.intersects(PageAttributes::LARGE_TIER | PageAttributes::HUGE_TIER) {
        flags |= PTE_TABLE;
    }

    let index = if attrs.contains(PageAttributes::WRITE_THROUGH) {
        MAIR_WRITE_THROUGH
    } else if attrs.contains(PageAttributes::WRITE_COMBINING) {
        MAIR_WRITE_COMBINING
    } else if attrs.contains(PageAttributes::WRITE_PROTECTED) {
        MAIR_WRITE_PROTECTED
    } else if attrs.contains(PageAttributes::UNCACHEABLE_STRONG) {
        MAIR_DEVICE
    } else if attrs.contains(PageAttributes::UNCACHEABLE) {
        MAIR_NON_CACHEABLE
    } else {
        MAIR_WRITE_BACK
    };
    flags |= index << ATTR_INDEX_SHIFT;

    flags
}

pub fn from_native_flags(flags: u64) -> PageAttributes {
    let mut attrs = PageAttributes::empty();

    if flags & PTE_VALID != 0 {
        attrs |= PageAttributes::READ;
    }
    if flags & PTE_READ_ONLY == 0 {
        attrs |= PageAttributes::WRITE;
    }
    if flags & PTE_NO_EXEC == 0 {
        attrs |= PageAttributes::EXECUTABLE;
    }
    if flags & PTE_USER != 0 {
        attrs |= PageAttributes::USER;
    }
    if flags & PTE_NOT_GLOBAL == 0 {
        attrs |= PageAttributes::GLOBAL;
    }
    if flags & PTE_TABLE == 0 {
        attrs |= PageAttributes::LARGE_TIER;
    }

    attrs |= match (flags & ATTR_INDEX_MASK) >> ATTR_INDEX_SHIFT {
        MAIR_WRITE_THROUGH => PageAttributes::WRITE_THROUGH,
        MAIR_WRITE_COMBINING => PageAttributes::WRITE_COMBINING,
        MAIR_WRITE_PROTECTED => PageAttributes::WRITE_PROTECTED,
        MAIR_DEVICE => PageAttributes::UNCACHEABLE_STRONG,
        MAIR_NON_CACHEABLE => PageAttributes::UNCACHEABLE,
        _ => PageAttributes::WRITE_BACK,
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
    true
}

pub fn split_roots() -> bool {
    true
}

pub fn address_mask() -> u64 {
    0x0000_ffff_ffff_f000
}

pub fn traversal_flags() -> u64 {
    PTE_VALID | PTE_TABLE
}

pub fn pte_valid(raw: u64) -> bool {
    raw & PTE_VALID != 0
}

pub fn pte_large(raw: u64) -> bool {
    raw & PTE_VALID != 0 && raw & PTE_TABLE == 0
}

#[cfg(target_os = "none")]
pub fn flush_tlb(virt: VirtAddr) {
    let page = (virt.as_u64() >> 12) & 0xffff_ffff_ffff;
    // SAFETY: invalidates a single translation on this core, no memory access.
    unsafe {
        core::arch::asm!(
            "dsb st",
            "tlbi vale1, {}",
            "dsb sy",
            "isb",
            in(reg) page,
            options(nostack),
        );
    }
}

#[cfg(not(target_os = "none"))]
pub fn flush_tlb(_virt: VirtAddr) {}

/// Installs `lower` into TTBR0_EL1 and `upper` into TTBR1_EL1.
///
/// # Safety
///
/// `upper` must be the physical address of a table mapping all kernel code
/// and data live at the switch point.
#[cfg(target_os = "none")]
pub unsafe fn load_root(lower: u64, upper: u64) {
    // SAFETY: per contract the upper root covers the running kernel.
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {}",
            "msr ttbr1_el1, {}",
            "dsb ish",
            "isb",
            in(reg) lower,
            in(reg) upper,
            options(nomem, nostack),
        );
    }
}

#[cfg(not(target_os = "none"))]
pub unsafe fn load_root(_lower: u64, _upper: u64) {}

/// Translates an EL1 abort syndrome into portable fault reasons. `address`
/// is FAR_EL1 as captured by the vector stub.
pub fn decode_page_fault(esr: u64, address: usize, context: TrapContext) -> PageFaultInfo {
    let mut reason = PageFaultReason::empty();

    let class = (esr >> 26) & 0x3f;
    let instruction = matches!(class, 0x20 | 0x21);
    let lower_el = matches!(class, 0x20 | 0x24);

    if instruction {
        reason |= PageFaultReason::INSTRUCTION_FETCH;
    } else if esr & (1 << 6) != 0 {
        // WnR is only meaningful for data aborts.
        reason |= PageFaultReason::WRITE;
    }
    if lower_el {
        reason |= PageFaultReason::USER;
    }

    // DFSC/IFSC 0b0001xx: translation fault at some level.
    if (esr & 0x3f) >> 2 == 0b0001 {
        reason |= PageFaultReason::NOT_PRESENT;
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
    fn block_descriptors_read_back_large() {
        let native = to_native_flags(PageAttributes::RW | PageAttributes::HUGE_TIER);
        assert!(pte_large(native));
        let native = to_native_flags(PageAttributes::RW);
        assert!(!pte_large(native));
    }

    #[test]
    fn decode_user_data_write_translation_fault() {
        // EC 0x24 (data abort from lower EL), WnR set, DFSC level-3 translation.
        let esr = (0x24u64 << 26) | (1 << 6) | 0b0111;
        let info = decode_page_fault(esr, 0x4000_2000, TrapContext::default());
        assert!(info.reason.contains(PageFaultReason::USER));
        assert!(info.reason.contains(PageFaultReason::WRITE));
        assert!(info.reason.contains(PageFaultReason::NOT_PRESENT));
        assert!(!info.reason.contains(PageFaultReason::INSTRUCTION_FETCH));
    }

    #[test]
    fn decode_kernel_instruction_abort() {
        // EC 0x21 (instruction abort from EL1), DFSC permission fault.
        let esr = (0x21u64 << 26) | 0b1111;
        let info = decode_page_fault(esr, 0xffff_8000_0000_1000, TrapContext::default());
        assert!(info.reason.contains(PageFaultReason::INSTRUCTION_FETCH));
        assert!(!info.reason.contains(PageFaultReason::USER));
        assert!(!info.reason.contains(PageFaultReason::NOT_PRESENT));
    }
}
