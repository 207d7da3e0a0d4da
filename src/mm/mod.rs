//! Memory management.
//!
//! Layered bottom-up: typed addresses and attribute sets, the frame
//! allocator seam, portable page tables, region bookkeeping, then the
//! kernel-facing surfaces (bootstrap, heap, fault handling).

pub mod address;
pub mod attributes;
pub mod fault;
pub mod heap;
pub mod pagemap;
pub mod paging;
pub mod pmm;
pub mod region;
pub mod vmm;

pub use address::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use attributes::{AccessMode, PageAttributes};
pub use fault::{
    handle_page_fault, FaultResolution, FaultingTask, PageFaultInfo, PageFaultReason, TrapContext,
};
pub use pagemap::PageMap;
pub use paging::MapError;
pub use region::{AddressSpace, Region};
pub use vmm::{BootInfo, KernelVm, MemoryKind, MemoryMapEntry};
