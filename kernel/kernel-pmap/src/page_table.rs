//! # Two-Level Page Tables
//!
//! Every pmap owns a segment directory of [`STSZ`] entries; each non-null
//! entry points at a leaf table of [`PTSZ`] translations covering
//! [`PTMAP`](crate::vmparam::PTMAP) bytes. Leaf tables are allocated lazily
//! on the first non-empty store and only freed when the whole pmap dies
//! (never for the kernel pmap).
//!
//! The directory holds raw pointers handed out by the
//! [`VmBackend`](crate::VmBackend): user leaf tables come from wired kernel
//! memory, the kernel's own come from stolen physical pages reached through
//! the direct map. Dereferencing is confined to the two accessors below.

use crate::tte::Tte;
use crate::vmparam::{PTSZ, STSZ, ptidx, stidx};
use alloc::boxed::Box;
use core::ptr::NonNull;
use kernel_memory_addresses::VirtualAddress;

/// A leaf page table: [`PTSZ`] translation entries, zero (= unmapped) when
/// fresh.
#[derive(Debug)]
#[repr(C)]
pub struct PtPage {
    entries: [Tte; PTSZ],
}

impl PtPage {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [Tte::EMPTY; PTSZ],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> Tte {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, tte: Tte) {
        self.entries[i] = tte;
    }

    /// Count of live translations, for consistency audits.
    #[must_use]
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|t| !t.is_empty()).count()
    }
}

/// A pmap's segment directory.
pub(crate) struct Segments {
    tables: Box<[Option<NonNull<PtPage>>; STSZ]>,
}

impl Segments {
    pub fn empty() -> Self {
        Self {
            tables: Box::new([None; STSZ]),
        }
    }

    #[inline]
    pub fn has(&self, seg: usize) -> bool {
        self.tables[seg].is_some()
    }

    /// Install a fresh leaf table for `seg`.
    pub fn attach(&mut self, seg: usize, page: NonNull<PtPage>) {
        debug_assert!(self.tables[seg].is_none(), "segment {seg} already mapped");
        self.tables[seg] = Some(page);
    }

    /// Detach the leaf table of `seg`, if any, for the owner to free.
    pub fn detach(&mut self, seg: usize) -> Option<NonNull<PtPage>> {
        self.tables[seg].take()
    }

    #[inline]
    pub fn table(&self, seg: usize) -> Option<&PtPage> {
        // Pointers in the directory are exclusively owned by this pmap and
        // stay valid until detached.
        self.tables[seg].map(|p| unsafe { p.as_ref() })
    }

    #[inline]
    pub fn table_mut(&mut self, seg: usize) -> Option<&mut PtPage> {
        self.tables[seg].map(|mut p| unsafe { p.as_mut() })
    }

    /// The translation of `va`: `None` when no leaf table exists
    /// (`Some(Tte::EMPTY)` when the table exists but the slot is clear).
    #[inline]
    pub fn find(&self, va: VirtualAddress) -> Option<Tte> {
        self.table(stidx(va)).map(|t| t.get(ptidx(va)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tte::TlbSize;
    use kernel_memory_addresses::PhysicalAddress;

    fn leaked() -> NonNull<PtPage> {
        NonNull::from(Box::leak(Box::new(PtPage::zeroed())))
    }

    fn release(p: NonNull<PtPage>) {
        drop(unsafe { Box::from_raw(p.as_ptr()) });
    }

    #[test]
    fn find_distinguishes_missing_table_from_empty_slot() {
        let mut segs = Segments::empty();
        let va = VirtualAddress::new(0x0040_4000);
        assert_eq!(segs.find(va), None);

        segs.attach(stidx(va), leaked());
        assert_eq!(segs.find(va), Some(Tte::EMPTY));

        let tte = Tte::map(PhysicalAddress::new(0x0100_0000), TlbSize::Size16K);
        segs.table_mut(stidx(va)).unwrap().set(ptidx(va), tte);
        assert_eq!(segs.find(va), Some(tte));
        assert_eq!(segs.table(stidx(va)).unwrap().live(), 1);

        release(segs.detach(stidx(va)).unwrap());
        assert_eq!(segs.find(va), None);
    }

    #[test]
    fn adjacent_pages_share_a_leaf() {
        let mut segs = Segments::empty();
        let va0 = VirtualAddress::new(0x0000_0000);
        let va1 = VirtualAddress::new(0x0000_4000);
        assert_eq!(stidx(va0), stidx(va1));
        assert_ne!(ptidx(va0), ptidx(va1));

        segs.attach(stidx(va0), leaked());
        let tte = Tte::map(PhysicalAddress::new(0x0200_0000), TlbSize::Size16K);
        segs.table_mut(stidx(va0)).unwrap().set(ptidx(va1), tte);
        assert_eq!(segs.find(va0), Some(Tte::EMPTY));
        assert_eq!(segs.find(va1), Some(tte));

        release(segs.detach(stidx(va0)).unwrap());
    }
}
