//! lynx-mm
//!
//! The virtual memory subsystem of a small monolithic kernel: portable
//! page-table management over per-architecture paging backends, per-process
//! region tracking, demand paging and the kernel's own address space
//! bring-up.
//!
//! The crate is freestanding on real targets and links against `std` only
//! for its own test harness, where a software paging backend stands in for
//! the MMU.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod mm;
pub mod sync;
