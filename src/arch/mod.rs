//! Architecture Backends
//!
//! One backend module per target ISA, all exposing the same free-function
//! contract: attribute translation, page-tier sizes, table depth, TLB
//! invalidation, and page-table-root installation. The portable
//! [`PageMap`](crate::mm::pagemap::PageMap) layer is written once against
//! that contract; the backend is selected at build time.
//!
//! Hosted builds (anything that is not `target_os = "none"`, including the
//! test harness) get the software backend, which models the same radix-tree
//! shape without touching privileged state.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(not(target_os = "none"))]
pub mod emulated;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64 as vmm;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use self::aarch64 as vmm;

#[cfg(not(target_os = "none"))]
pub use self::emulated as vmm;
