//! # Reverse Map and Page Attributes
//!
//! For every managed physical frame: which (pmap, va) pairs map it, and the
//! accumulated referenced/changed bits. Page-wide operations
//! ([`Mmu::page_protect`](crate::Mmu::page_protect)) walk these chains; the
//! attribute byte backs the VM layer's dirty/reference queries.
//!
//! The header for each frame lives in a flat array sliced across the
//! physical segments; overflow entries come from an index-linked slab with
//! a free list. The wired marker is an explicit flag on the entry, counted
//! into the owning pmap's `wired_count` by the callers.

use crate::PmapError;
use crate::bootstrap::RegionTable;
use crate::pmap::PmapId;
use crate::vmparam::atop;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Referenced/changed attribute bits, one byte per managed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAttr(u8);

bitflags::bitflags! {
    impl PageAttr: u8 {
        /// The frame has been written through some mapping.
        const CHG = 0x01;
        /// The frame has been accessed through some mapping.
        const REF = 0x02;
    }
}

/// One reverse-map entry. A header with `pm == None` means "frame
/// unmapped".
#[derive(Debug, Clone, Copy)]
pub(crate) struct PvEntry {
    pub pm: Option<PmapId>,
    pub va: VirtualAddress,
    pub wired: bool,
    /// Index of the next chain node in the slab.
    pub next: Option<u32>,
}

impl PvEntry {
    const fn unused() -> Self {
        Self {
            pm: None,
            va: VirtualAddress::zero(),
            wired: false,
            next: None,
        }
    }
}

/// Slab of chain nodes: a vector plus an index free list. `get` never
/// waits; it either recycles, grows by one, or reports failure for the
/// caller's `CANFAIL` handling.
struct PvPool {
    nodes: Vec<PvEntry>,
    free: Vec<u32>,
}

impl PvPool {
    const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    fn get(&mut self) -> Option<u32> {
        if let Some(i) = self.free.pop() {
            return Some(i);
        }
        self.nodes.try_reserve(1).ok()?;
        self.free.try_reserve(1).ok()?;
        self.nodes.push(PvEntry::unused());
        Some((self.nodes.len() - 1) as u32)
    }

    fn put(&mut self, i: u32) {
        self.nodes[i as usize] = PvEntry::unused();
        self.free.push(i);
    }
}

/// Maps one physical segment to its slice of the header array.
#[derive(Debug, Clone, Copy)]
struct PvSeg {
    start: PhysicalAddress,
    pages: u32,
    first: u32,
}

pub(crate) struct PvTable {
    headers: Vec<PvEntry>,
    attrs: Vec<u8>,
    pool: PvPool,
    segs: Vec<PvSeg>,
    pub initialized: bool,
}

impl PvTable {
    pub const fn new() -> Self {
        Self {
            headers: Vec::new(),
            attrs: Vec::new(),
            pool: PvPool::new(),
            segs: Vec::new(),
            initialized: false,
        }
    }

    /// Size the header and attribute arrays for the loaded segments and
    /// distribute slices across them.
    pub fn init(&mut self, avail: &RegionTable) {
        debug_assert!(!self.initialized);
        let mut first = 0u32;
        for r in avail.iter() {
            let pages = atop(r.size);
            self.segs.push(PvSeg {
                start: r.start,
                pages,
                first,
            });
            first += pages;
        }
        let npgs = first as usize;
        if self.headers.try_reserve(npgs).is_err() || self.attrs.try_reserve(npgs).is_err() {
            panic!("pmap_init: no memory for pv table");
        }
        self.headers.resize(npgs, PvEntry::unused());
        self.attrs.resize(npgs, 0);
        self.initialized = true;
    }

    /// Header-array index of the frame containing `pa`, `None` for
    /// unmanaged addresses.
    pub fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        for seg in &self.segs {
            let frame = atop(pa.as_u32().wrapping_sub(seg.start.as_u32()));
            if pa >= seg.start && frame < seg.pages {
                return Some((seg.first + frame) as usize);
            }
        }
        None
    }

    pub fn header(&self, idx: usize) -> PvEntry {
        self.headers[idx]
    }

    pub fn node(&self, idx: u32) -> PvEntry {
        self.pool.nodes[idx as usize]
    }

    /// Record that `pm` maps the frame of `pa` at `va`. Returns whether a
    /// wired entry was created (the caller charges the pmap).
    pub fn enter(
        &mut self,
        pm: PmapId,
        va: VirtualAddress,
        pa: PhysicalAddress,
        wired: bool,
        can_fail: bool,
    ) -> Result<bool, PmapError> {
        debug_assert!(self.initialized);
        let Some(h) = self.index_of(pa) else {
            return Ok(false);
        };

        if self.headers[h].pm.is_none() {
            // no entries yet, the header is the first
            self.headers[h] = PvEntry {
                pm: Some(pm),
                va,
                wired,
                next: None,
            };
        } else {
            // at least one other VA maps this frame; chain after the header
            let Some(idx) = self.pool.get() else {
                if !can_fail {
                    panic!("pmap_enter_pv: failed");
                }
                return Err(PmapError::OutOfMemory);
            };
            self.pool.nodes[idx as usize] = PvEntry {
                pm: Some(pm),
                va,
                wired,
                next: self.headers[h].next,
            };
            self.headers[h].next = Some(idx);
        }
        Ok(wired)
    }

    /// Drop the entry for `(pm, va)` on the frame of `pa`. Returns whether
    /// the removed entry was wired. Removing a non-existent entry is a
    /// no-op (unmanaged pages take this path).
    pub fn remove(&mut self, pm: PmapId, va: VirtualAddress, pa: PhysicalAddress) -> bool {
        let Some(h) = self.index_of(pa) else {
            return false;
        };

        let hd = self.headers[h];
        if hd.pm == Some(pm) && hd.va == va {
            // the match is the header itself: pull the first chain node up
            // into it, or clear it
            if let Some(nidx) = hd.next {
                self.headers[h] = self.pool.nodes[nidx as usize];
                self.pool.put(nidx);
            } else {
                self.headers[h] = PvEntry::unused();
            }
            return hd.wired;
        }

        let mut prev: Option<u32> = None;
        let mut cur = hd.next;
        while let Some(i) = cur {
            let n = self.pool.nodes[i as usize];
            if n.pm == Some(pm) && n.va == va {
                match prev {
                    None => self.headers[h].next = n.next,
                    Some(p) => self.pool.nodes[p as usize].next = n.next,
                }
                self.pool.put(i);
                return n.wired;
            }
            prev = Some(i);
            cur = n.next;
        }
        false
    }

    /// Clear the wired marker of `(pm, va)`. Returns whether a marker was
    /// actually cleared.
    pub fn unwire(&mut self, pm: PmapId, va: VirtualAddress, pa: PhysicalAddress) -> bool {
        let Some(h) = self.index_of(pa) else {
            return false;
        };

        let hd = &mut self.headers[h];
        if hd.pm == Some(pm) && hd.va == va {
            let was = hd.wired;
            hd.wired = false;
            return was;
        }
        let mut cur = hd.next;
        while let Some(i) = cur {
            let n = &mut self.pool.nodes[i as usize];
            if n.pm == Some(pm) && n.va == va {
                let was = n.wired;
                n.wired = false;
                return was;
            }
            cur = n.next;
        }
        false
    }

    /// OR attribute bits into the frame's byte.
    pub fn attr_or(&mut self, pa: PhysicalAddress, bits: PageAttr) {
        if let Some(i) = self.index_of(pa) {
            self.attrs[i] |= bits.bits();
        }
    }

    pub fn attr_get(&self, idx: usize) -> u8 {
        self.attrs[idx]
    }

    pub fn attr_clear(&mut self, idx: usize, bits: PageAttr) {
        self.attrs[idx] &= !bits.bits();
    }

    /// Entries mapping the frame at `idx` that belong to `pm`, and how many
    /// of them are wired. Used by the consistency audit.
    pub fn count_for(&self, idx: usize, pm: PmapId) -> (u32, u32) {
        let (mut n, mut wired) = (0, 0);
        let hd = self.headers[idx];
        let mut entry = if hd.pm.is_some() { Some(hd) } else { None };
        let mut hops = 0usize;
        while let Some(e) = entry {
            if e.pm == Some(pm) {
                n += 1;
                if e.wired {
                    wired += 1;
                }
            }
            hops += 1;
            assert!(hops <= self.pool.nodes.len() + 1, "pv chain cycle");
            entry = e.next.map(|i| self.node(i));
        }
        (n, wired)
    }

    pub fn frames(&self) -> usize {
        self.headers.len()
    }
}
