//! # Physical Map and Software-Managed TLB for PowerPC 4xx
//!
//! The 4xx MMU performs no hardware page-table walk: every translation miss
//! traps to software, which must find a translation and write it into one of
//! the [`NTLB`](vmparam::NTLB) fully associative TLB entries itself. This
//! crate owns everything that makes that work:
//!
//! - **Page tables** ([`page_table`]): a two-level table per address space,
//!   a segment directory of lazily allocated 256-entry leaf tables.
//! - **Reverse map** ([`pv`]): per physical frame, the list of
//!   (address space, virtual address) pairs mapping it, plus the
//!   referenced/changed attribute byte.
//! - **TLB engine** ([`tlb`]): install/search/invalidate, FIFO-with-reference
//!   victim selection, permanently locked reserved entries for fixed I/O
//!   mappings.
//! - **Context allocator** ([`ctx`]): multiplexes 254 stealable MMU process
//!   IDs over arbitrarily many address spaces.
//!
//! ## The service object
//!
//! All of the above share invariants (a valid TLB entry is always backed by a
//! live PTE in the owning context's pmap; a PV node always corresponds to a
//! live PTE), so the whole state lives in one owned [`Mmu`] service. The
//! kernel holds exactly one; tests construct fresh instances around an
//! emulated CPU.
//!
//! Hardware is reached only through two seams:
//!
//! - [`CpuMmu`](cpu::CpuMmu) — the irreducible MMU instructions (`tlbwe`,
//!   `tlbsx`, PID/ZPR moves, cache maintenance) plus interrupt-priority
//!   sections. [`EmulatedCpu`](cpu::EmulatedCpu) models the TLB as an
//!   associative array for hosted tests.
//! - [`VmBackend`] — the services the VM layer provides downward: wired
//!   zero-filled page-table pages (no-wait), the pre-VM page stealer, the
//!   managed-page predicate and free-list registration.
//!
//! ## Translation entry vs. TLB words
//!
//! ```text
//! TLB-HI:  | EPN (22)            | SIZE(3) |V|E|U0| res(4) |
//! TLB-LO:  | RPN (22)            |EX|WR| ZSEL(4) |W|I|M|G|
//! TTE:     | RPN (size-dep) | SZ(3) |EX|WR| ZSEL(4) |W|I|M|G|
//! ```
//!
//! A TTE's low ten bits are the TLB-LO attribute image, so installing a
//! translation is a mask-and-or, not a decode (see [`tte`]).

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bootstrap;
pub mod cpu;
pub mod ctx;
pub mod page_table;
pub mod pmap;
pub mod pv;
pub mod tlb;
pub mod tte;
pub mod vmparam;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

pub use crate::bootstrap::MemRegion;
pub use crate::cpu::{CpuMmu, EmulatedCpu, SplToken};
pub use crate::page_table::PtPage;
pub use crate::pmap::{Mmu, PmapId};
pub use crate::pv::PageAttr;
pub use crate::tlb::{SlotFlags, TlbCounters, TlbInfo};
pub use crate::tte::{TlbHi, TlbLo, TlbSize, Tte, Zone};

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Access permissions, as handed down by the VM layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prot(u8);

bitflags::bitflags! {
    impl Prot: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Flags accepted by [`Mmu::enter`] and friends.
///
/// The low bits double as the access type that caused the fault (they share
/// values with [`Prot`]); the high bits request mapping properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags(u32);

bitflags::bitflags! {
    impl MapFlags: u32 {
        /// The faulting access was a read.
        const READ = 0x01;
        /// The faulting access was a write.
        const WRITE = 0x02;
        /// The faulting access was an instruction fetch.
        const EXECUTE = 0x04;
        /// Any access bit.
        const ACCESS_ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// The mapping must never be evicted; defers the TLB preload.
        const WIRED = 0x10;
        /// Out of memory may be reported instead of panicking.
        const CANFAIL = 0x20;
        /// I/O mapping: cache-inhibited and guarded.
        const NOCACHE = 0x40;
        /// Write-through storage; incompatible with `NOCACHE`.
        const WRITE_THROUGH = 0x80;
    }
}

impl MapFlags {
    /// The access bits corresponding to a protection.
    #[inline]
    #[must_use]
    pub const fn from_access(prot: Prot) -> Self {
        Self::from_bits_truncate(prot.bits() as u32)
    }
}

/// Errors surfaced by the pmap. Everything else is a contract violation and
/// panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmapError {
    /// A no-wait allocation (leaf table or PV node) failed and the caller
    /// passed [`MapFlags::CANFAIL`].
    #[error("out of memory")]
    OutOfMemory,
}

/// Downward interface: what the VM layer provides to the pmap.
///
/// All allocating methods are **no-wait**: they either succeed immediately or
/// return `None`. Nothing in the pmap fast path may sleep.
pub trait VmBackend {
    /// Bootstrap publishes the machine page size here before anything else
    /// asks the VM layer for pages.
    fn publish_page_size(&mut self, size: u32);

    /// Hand an available physical range `[start, end)` to the VM free lists.
    fn physload(&mut self, start: PhysicalAddress, end: PhysicalAddress);

    /// A wired, zero-filled leaf-table page from kernel memory, or `None`
    /// under memory pressure.
    fn alloc_pt_page(&mut self) -> Option<NonNull<PtPage>>;

    /// Like [`VmBackend::alloc_pt_page`], but usable before the VM system is
    /// up: the page is stolen straight from an available region and accessed
    /// through the direct map.
    fn steal_pt_page(&mut self) -> Option<NonNull<PtPage>>;

    /// Return a leaf-table page.
    ///
    /// # Safety
    /// `page` must have come from [`VmBackend::alloc_pt_page`] on this
    /// backend, must not have been freed already, and no references into it
    /// may be live.
    unsafe fn free_pt_page(&mut self, page: NonNull<PtPage>);

    /// Whether `pa` belongs to a VM-managed frame (and therefore gets
    /// reverse-map and attribute tracking).
    fn page_is_managed(&self, pa: PhysicalAddress) -> bool;

    /// Board-specific storage attributes OR-ed into TLB-LO on every install,
    /// e.g. cache inhibition for untranslated I/O windows.
    fn storage_attributes(&self, va: VirtualAddress, pa: PhysicalAddress) -> TlbLo {
        let _ = (va, pa);
        TlbLo::new()
    }
}

/// [`VmBackend`] over the host heap, for tests and host-side bring-up.
///
/// Records `physload` ranges to answer the managed predicate and supports
/// fault injection for the no-wait allocation paths.
#[derive(Debug, Default)]
pub struct HeapVm {
    /// Page size published by bootstrap.
    pub page_size: Option<u32>,
    /// Ranges registered via `physload`.
    pub loaded: Vec<(PhysicalAddress, PhysicalAddress)>,
    /// Leaf-table pages currently outstanding.
    pub live_tables: usize,
    /// Fail this many upcoming leaf-table allocations.
    pub fail_pt_allocs: u32,
    /// Extra storage attributes applied to every install.
    pub extra_attrs: TlbLo,
}

impl HeapVm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn take_pt_page(&mut self) -> Option<NonNull<PtPage>> {
        if self.fail_pt_allocs > 0 {
            self.fail_pt_allocs -= 1;
            return None;
        }
        self.live_tables += 1;
        Some(NonNull::from(Box::leak(Box::new(PtPage::zeroed()))))
    }
}

impl VmBackend for HeapVm {
    fn publish_page_size(&mut self, size: u32) {
        self.page_size = Some(size);
    }

    fn physload(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        self.loaded.push((start, end));
    }

    fn alloc_pt_page(&mut self) -> Option<NonNull<PtPage>> {
        self.take_pt_page()
    }

    fn steal_pt_page(&mut self) -> Option<NonNull<PtPage>> {
        self.take_pt_page()
    }

    unsafe fn free_pt_page(&mut self, page: NonNull<PtPage>) {
        self.live_tables -= 1;
        drop(unsafe { Box::from_raw(page.as_ptr()) });
    }

    fn page_is_managed(&self, pa: PhysicalAddress) -> bool {
        self.loaded.iter().any(|&(s, e)| pa >= s && pa < e)
    }

    fn storage_attributes(&self, _va: VirtualAddress, _pa: PhysicalAddress) -> TlbLo {
        self.extra_attrs
    }
}
