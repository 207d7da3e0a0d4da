//! Demand-paging page fault handler.
//!
//! Architecture stubs decode their trap frames into a [`PageFaultInfo`] and
//! hand it here together with the faulting task, if any. Faults on a
//! reserved-but-unbacked region whose access mode permits the attempted
//! access are resolved by committing the whole region; everything else is a
//! violation that panics (kernel) or terminates the task (user).

use alloc::format;
use core::fmt;

use bitflags::bitflags;

use crate::mm::address::{VirtAddr, PAGE_SIZE};
use crate::mm::attributes::AccessMode;
use crate::mm::pagemap::PageMap;
use crate::mm::region::{AddressSpace, Region};
use crate::mm::vmm::KernelVm;

bitflags! {
    /// Portable page fault cause bits, assembled by the backend decoders.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFaultReason: u32 {
        /// No translation existed for the address.
        const NOT_PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
        const RESERVED_WRITE = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
        const PROTECTION_KEY = 1 << 5;
        const SHADOW_STACK = 1 << 6;
        const SGX = 1 << 7;
    }
}

impl PageFaultReason {
    /// Causes that can never be satisfied by committing memory.
    const MALFORMED: Self = Self::RESERVED_WRITE
        .union(Self::PROTECTION_KEY)
        .union(Self::SHADOW_STACK)
        .union(Self::SGX);
}

impl fmt::Display for PageFaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(PageFaultReason, &str)] = &[
            (PageFaultReason::NOT_PRESENT, "not-present"),
            (PageFaultReason::WRITE, "write"),
            (PageFaultReason::USER, "user"),
            (PageFaultReason::RESERVED_WRITE, "reserved-write"),
            (PageFaultReason::INSTRUCTION_FETCH, "instruction-fetch"),
            (PageFaultReason::PROTECTION_KEY, "protection-key"),
            (PageFaultReason::SHADOW_STACK, "shadow-stack"),
            (PageFaultReason::SGX, "sgx"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("protection")?;
        }
        Ok(())
    }
}

/// Interrupted execution state, captured by the trap stub.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrapContext {
    pub instruction_pointer: usize,
    pub stack_pointer: usize,
    /// Syscall number if the fault happened while servicing one.
    pub syscall: Option<usize>,
}

#[derive(Clone, Copy, Debug)]
pub struct PageFaultInfo {
    pub address: VirtAddr,
    pub reason: PageFaultReason,
    pub context: TrapContext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The fault was satisfied; re-run the faulting instruction.
    Resumed,
    /// The task was terminated; schedule away from it.
    Terminated,
}

/// What the fault handler needs from the scheduler's notion of the current
/// task.
pub trait FaultingTask {
    fn address_space(&mut self) -> &mut AddressSpace;
    fn page_map(&self) -> &PageMap;
    fn name(&self) -> &str;
    /// Delivers a human-readable crash report to the task's controlling
    /// channel before termination.
    fn write_diagnostic(&mut self, message: &str);
    fn terminate(&mut self, code: i32);
}

fn access_permits(region: &Region, reason: PageFaultReason) -> bool {
    let access = region.access();
    if reason.contains(PageFaultReason::WRITE) && !access.contains(AccessMode::WRITE) {
        return false;
    }
    if reason.contains(PageFaultReason::INSTRUCTION_FETCH)
        && !access.contains(AccessMode::EXECUTE)
    {
        return false;
    }
    if reason.contains(PageFaultReason::USER) && !access.contains(AccessMode::USER) {
        return false;
    }
    true
}

/// Commits the whole region the fault landed in. Frames are zeroed, the
/// mapping is installed first and the bookkeeping updated only once the
/// mapping cannot fail anymore.
fn commit_region(
    vm: &KernelVm,
    task: &mut dyn FaultingTask,
    region: Region,
    info: &PageFaultInfo,
) -> bool {
    let pages = region.size().div_ceil(PAGE_SIZE);
    let Some(phys) = vm.frame_allocator().callocate_pages(pages) else {
        log::error!(
            "fault: out of memory committing {} pages for {} at {}",
            pages,
            task.name(),
            info.address
        );
        return false;
    };

    let mut staged = region;
    staged.commit(phys);
    if let Err(err) = task.page_map().map_region(&staged) {
        log::error!("fault: mapping region at {} failed: {}", info.address, err);
        vm.frame_allocator().free_pages(phys, pages);
        return false;
    }

    task.address_space()
        .find_mut(info.address)
        .expect("region vanished while the fault was being serviced")
        .commit(phys);

    log::trace!(
        "fault: committed {} pages at {} for {}",
        pages,
        region.virtual_base(),
        task.name()
    );
    true
}

/// Entry point for the architecture page fault vectors.
///
/// # Panics
///
/// Panics on any fault the kernel itself caused, and on faults taken before
/// a task exists.
pub fn handle_page_fault(
    vm: &KernelVm,
    task: Option<&mut dyn FaultingTask>,
    info: PageFaultInfo,
) -> FaultResolution {
    let Some(task) = task else {
        panic!(
            "page fault at {} ({}) with no current task, ip {:#x}",
            info.address, info.reason, info.context.instruction_pointer
        );
    };

    if !info.reason.intersects(PageFaultReason::MALFORMED) {
        // Copy the region out so the bookkeeping lock is not held across
        // the frame allocation and mapping.
        let region = task.address_space().find(info.address).copied();
        if let Some(region) = region {
            if access_permits(&region, info.reason)
                && !region.is_committed()
                && commit_region(vm, task, region, &info)
            {
                return FaultResolution::Resumed;
            }
        }
    }

    if !info.reason.contains(PageFaultReason::USER) {
        panic!(
            "kernel page fault at {} ({}) ip {:#x} sp {:#x} syscall {:?}",
            info.address,
            info.reason,
            info.context.instruction_pointer,
            info.context.stack_pointer,
            info.context.syscall
        );
    }

    let message = format!(
        "{}: segmentation fault at {} ({}), ip {:#x}",
        task.name(),
        info.address,
        info.reason,
        info.context.instruction_pointer
    );
    log::error!("{}", message);
    task.write_diagnostic(&message);
    task.terminate(-1);
    FaultResolution::Terminated
}
