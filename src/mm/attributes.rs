//! Portable Page Attributes
//!
//! Architecture-neutral permission/caching descriptors. These never alias
//! native page-table-entry bit positions; each architecture backend
//! translates them with `to_native_flags`/`from_native_flags`.

use bitflags::bitflags;

bitflags! {
    /// Portable permission, tier, and cache-policy bits for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttributes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTABLE = 1 << 2;
        const USER = 1 << 3;
        const GLOBAL = 1 << 4;
        /// Map at the large tier (2 MiB with a 4 KiB granule).
        const LARGE_TIER = 1 << 5;
        /// Map at the huge tier (1 GiB with a 4 KiB granule).
        const HUGE_TIER = 1 << 6;

        const WRITE_BACK = 1 << 8;
        const WRITE_THROUGH = 1 << 9;
        const WRITE_COMBINING = 1 << 10;
        const WRITE_PROTECTED = 1 << 11;
        const UNCACHEABLE = 1 << 12;
        const UNCACHEABLE_STRONG = 1 << 13;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RWX = Self::RW.bits() | Self::EXECUTABLE.bits();
    }
}

impl PageAttributes {
    /// All cache-policy bits.
    pub const CACHE_MASK: Self = Self::WRITE_BACK
        .union(Self::WRITE_THROUGH)
        .union(Self::WRITE_COMBINING)
        .union(Self::WRITE_PROTECTED)
        .union(Self::UNCACHEABLE)
        .union(Self::UNCACHEABLE_STRONG);

    /// Attribute bits that must survive a native-flag round trip.
    pub const SEMANTIC_MASK: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::EXECUTABLE)
        .union(Self::USER)
        .union(Self::GLOBAL)
        .union(Self::CACHE_MASK);
}

bitflags! {
    /// Access mode of a [`Region`](super::region::Region).
    ///
    /// A deliberately smaller vocabulary than [`PageAttributes`]: regions
    /// carry no tier or cache-policy choice, only what the owning process
    /// may do with the range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl AccessMode {
    /// Translate a region access mode into mapping attributes.
    ///
    /// Region-backed memory is always normal write-back memory; only the
    /// permission bits vary.
    pub fn page_attributes(self) -> PageAttributes {
        let mut attrs = PageAttributes::WRITE_BACK;
        if self.contains(Self::READ) {
            attrs |= PageAttributes::READ;
        }
        if self.contains(Self::WRITE) {
            attrs |= PageAttributes::WRITE;
        }
        if self.contains(Self::EXECUTE) {
            attrs |= PageAttributes::EXECUTABLE;
        }
        if self.contains(Self::USER) {
            attrs |= PageAttributes::USER;
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition() {
        assert_eq!(
            PageAttributes::RW,
            PageAttributes::READ | PageAttributes::WRITE
        );
        assert_eq!(
            PageAttributes::RWX,
            PageAttributes::RW | PageAttributes::EXECUTABLE
        );
    }

    #[test]
    fn access_to_attributes() {
        let attrs = (AccessMode::READ_WRITE | AccessMode::USER).page_attributes();
        assert!(attrs.contains(PageAttributes::RW | PageAttributes::USER));
        assert!(attrs.contains(PageAttributes::WRITE_BACK));
        assert!(!attrs.contains(PageAttributes::EXECUTABLE));

        let attrs = AccessMode::READ.page_attributes();
        assert!(attrs.contains(PageAttributes::READ));
        assert!(!attrs.contains(PageAttributes::WRITE));
    }
}
