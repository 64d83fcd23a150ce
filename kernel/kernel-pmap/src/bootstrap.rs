//! # Bootstrap and Kernel-Table Growth
//!
//! Runs with translation disabled, before the VM system exists. Board code
//! hands over the physical memory layout; bootstrap carves the kernel image
//! and message buffer out of it, page-aligns and sorts what is left,
//! registers it with the VM free lists and brings up the TLB engine.
//!
//! `growkernel` pre-populates kernel leaf tables up to a watermark so the
//! fault path never has to allocate for kernel VA.

use crate::cpu::CpuMmu;
use crate::vmparam::{
    KERNEL_PID, MAX_MEM_REGIONS, MSGBUF_SIZE, PAGE_SIZE, PTMAP, VM_MAX_KERNEL_ADDRESS,
    VM_MIN_KERNEL_ADDRESS, atop, round_page, stidx, trunc_page,
};
use crate::{Mmu, VmBackend};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// One physical memory region as reported by the board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemRegion {
    pub start: PhysicalAddress,
    pub size: u32,
}

impl MemRegion {
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start.as_u32() + self.size
    }
}

/// Fixed-capacity region list; bootstrap runs before any allocator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionTable {
    regions: [MemRegion; MAX_MEM_REGIONS],
    len: usize,
}

impl RegionTable {
    pub const fn new() -> Self {
        Self {
            regions: [MemRegion {
                start: PhysicalAddress::zero(),
                size: 0,
            }; MAX_MEM_REGIONS],
            len: 0,
        }
    }

    pub fn from_slice(src: &[MemRegion]) -> Self {
        let mut t = Self::new();
        for r in src {
            t.push(*r);
        }
        t
    }

    pub fn push(&mut self, r: MemRegion) {
        assert!(self.len < MAX_MEM_REGIONS, "too many memory regions");
        self.regions[self.len] = r;
        self.len += 1;
    }

    pub fn remove(&mut self, i: usize) {
        self.regions.copy_within(i + 1..self.len, i);
        self.len -= 1;
    }

    pub fn insert(&mut self, i: usize, r: MemRegion) {
        assert!(self.len < MAX_MEM_REGIONS, "too many memory regions");
        self.regions.copy_within(i..self.len, i + 1);
        self.regions[i] = r;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, i: usize) -> MemRegion {
        debug_assert!(i < self.len);
        self.regions[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut MemRegion {
        debug_assert!(i < self.len);
        &mut self.regions[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemRegion> {
        self.regions[..self.len].iter()
    }
}

/// Cut the kernel image `[kstart, kend)` out of the available regions,
/// page-align what remains, drop empties and keep the list sorted by start
/// address. Returns the number of pages left.
pub(crate) fn carve_kernel(avail: &mut RegionTable, kstart: u32, kend: u32) -> u32 {
    let mut npgs = 0u32;
    let mut i = 0;
    while i < avail.len() {
        let r = avail.get(i);
        let mut s = r.start.as_u32();
        let mut e = r.end();

        // the region swallows the whole kernel: split, keep the tail for a
        // later pass
        if s < kstart && e > kend {
            avail.push(MemRegion {
                start: PhysicalAddress::new(kend),
                size: e - kend,
            });
            e = kstart;
        }
        // starts inside the kernel
        if s >= kstart && s < kend {
            if e <= kend {
                avail.remove(i);
                continue;
            }
            s = kend;
        }
        // ends inside the kernel
        if e > kstart && e <= kend {
            if s >= kstart {
                avail.remove(i);
                continue;
            }
            e = kstart;
        }

        s = round_page(s);
        e = trunc_page(e);
        if e < s {
            e = s;
        }
        let sz = e - s;
        if sz == 0 {
            avail.remove(i);
            continue;
        }
        npgs += atop(sz);

        // insertion sort among the already-processed regions
        let mut at = i;
        for j in 0..i {
            if s < avail.get(j).start.as_u32() {
                at = j;
                break;
            }
        }
        avail.remove(i);
        avail.insert(
            at,
            MemRegion {
                start: PhysicalAddress::new(s),
                size: sz,
            },
        );
        i += 1;
    }
    npgs
}

impl<C: CpuMmu, B: VmBackend> Mmu<C, B> {
    /// Bring the pmap core up, with translation still disabled.
    ///
    /// `mem` is every physical RAM region, `avail` the subset not already
    /// claimed by firmware; the kernel image `[kernel_start, kernel_end)`
    /// is carved out of `avail` here. `msgbuf` is the board's fixed message
    /// buffer, if it has one; otherwise pages are reserved from the tail of
    /// the largest region.
    pub fn bootstrap(
        &mut self,
        kernel_start: PhysicalAddress,
        kernel_end: PhysicalAddress,
        mem: &[MemRegion],
        avail: &[MemRegion],
        msgbuf: Option<PhysicalAddress>,
    ) {
        assert!(!self.bootstrap_done, "pmap_bootstrap: twice");

        // reserved slots are skipped by the victim walker forever
        self.tlb.reset_cursor();

        // the flat kernel map shadow sits directly above the image
        self.kernmap = VirtualAddress::new(kernel_end.as_u32());

        // kernel pmap owns the two non-stealable contexts
        let kpm = self.kernel_pmap();
        self.ctxs.seed(0, kpm);
        self.ctxs.seed(1, kpm);

        self.vm.publish_page_size(PAGE_SIZE);

        self.mem = RegionTable::from_slice(mem);
        self.physmem = self.mem.iter().map(|r| atop(r.size)).sum();
        for r in self.mem.iter() {
            log::info!("memory region {} + {:#x}", r.start, r.size);
        }

        self.avail = RegionTable::from_slice(avail);
        let kstart = trunc_page(kernel_start.as_u32());
        let kend = round_page(kernel_end.as_u32());
        self.npgs = carve_kernel(&mut self.avail, kstart, kend);
        for r in self.avail.iter() {
            log::info!("available region {} + {:#x}", r.start, r.size);
        }

        // the message buffer takes the tail of the largest chunk (no
        // stealing yet, translation is off)
        if let Some(fixed) = msgbuf {
            self.msgbuf_paddr = Some(fixed);
        } else {
            let sz = round_page(MSGBUF_SIZE);
            let mut pick = None;
            for (i, r) in self.avail.iter().enumerate() {
                if r.size >= sz && pick.is_none_or(|(_, best)| r.size >= best) {
                    pick = Some((i, r.size));
                }
            }
            let Some((i, _)) = pick else {
                panic!("pmap_bootstrap: not enough memory for msgbuf");
            };
            self.npgs -= atop(sz);
            let r = self.avail.get_mut(i);
            r.size -= sz;
            self.msgbuf_paddr = Some(r.start + r.size);
            if self.avail.get(i).size == 0 {
                self.avail.remove(i);
            }
        }

        for i in 0..self.avail.len() {
            let r = self.avail.get(i);
            self.vm.physload(r.start, PhysicalAddress::new(r.end()));
        }

        {
            let Self { cpu, tlb, .. } = self;
            tlb.init(cpu);
        }

        self.pmaps.get_mut(kpm).ctx = KERNEL_PID;

        self.bootstrap_done = true;
        self.tlb.finish_bootstrap();
    }

    /// Second-stage initialization, once the VM system can hand out wired
    /// memory: build the reverse-map header and attribute arrays and seed
    /// the node slab.
    pub fn init(&mut self) {
        let s = self.cpu.splvm();
        self.pv.init(&self.avail);
        self.vm_ready = true;
        self.cpu.splx(s);
    }

    /// Pre-populate kernel leaf tables up to `maxkva`, one `PTMAP` stride
    /// at a time. Pages are stolen from the available regions until
    /// [`Mmu::init`] has run, allocated normally after. Returns the new
    /// watermark.
    pub fn growkernel(&mut self, maxkva: VirtualAddress) -> VirtualAddress {
        let s = self.cpu.splvm();
        let vm_ready = self.vm_ready;

        let mut kbreak = VirtualAddress::new(self.kbreak.as_u32() & !(PTMAP - 1));
        while kbreak < maxkva {
            let seg = stidx(kbreak);
            let Self { vm, pmaps, .. } = self;
            let kernel = pmaps.get_mut(crate::pmap::PmapId::KERNEL);
            if !kernel.segments.has(seg) {
                let page = if vm_ready {
                    vm.alloc_pt_page()
                } else {
                    vm.steal_pt_page()
                };
                let page = page.unwrap_or_else(|| panic!("pmap_growkernel: no memory"));
                kernel.segments.attach(seg, page);
                log::trace!("growkernel: leaf table for {kbreak}");
            }
            let Some(next) = kbreak.checked_add(PTMAP) else {
                break;
            };
            kbreak = next;
        }
        self.kbreak = kbreak;
        self.cpu.splx(s);
        kbreak
    }

    /// The kernel virtual range this pmap manages.
    #[must_use]
    pub fn virtual_space(&self) -> (VirtualAddress, VirtualAddress) {
        (VM_MIN_KERNEL_ADDRESS, VM_MAX_KERNEL_ADDRESS)
    }

    /// Clamp `[start, start + size)` to the intersection with real memory;
    /// a zero size comes back when nothing overlaps.
    #[must_use]
    pub fn real_memory(&self, start: PhysicalAddress, size: u32) -> (PhysicalAddress, u32) {
        for r in self.mem.iter() {
            let (rs, re) = (r.start.as_u32(), r.end());
            let s = start.as_u32();
            if s + size > rs && s < re {
                let mut cs = s;
                let mut csz = size;
                if cs < rs {
                    csz -= rs - cs;
                    cs = rs;
                }
                if cs + csz > re {
                    csz = re - cs;
                }
                return (PhysicalAddress::new(cs), csz);
            }
        }
        (start, 0)
    }

    /// Where the message buffer ended up.
    #[must_use]
    pub fn msgbuf_paddr(&self) -> Option<PhysicalAddress> {
        self.msgbuf_paddr
    }

    /// Total physical memory, in pages.
    #[must_use]
    pub fn physmem(&self) -> u32 {
        self.physmem
    }

    /// Managed (available) memory, in pages.
    #[must_use]
    pub fn managed_pages(&self) -> u32 {
        self.npgs
    }

    /// Base of the flat kernel-map shadow recorded at bootstrap.
    #[must_use]
    pub fn kernmap(&self) -> VirtualAddress {
        self.kernmap
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn region(start: u32, size: u32) -> MemRegion {
        MemRegion {
            start: PhysicalAddress::new(start),
            size,
        }
    }

    #[test]
    fn carve_splits_around_the_kernel() {
        let mut avail = RegionTable::from_slice(&[region(0x0000_0000, 0x0200_0000)]);
        let npgs = carve_kernel(&mut avail, 0x0010_0000, 0x0030_0000);

        assert_eq!(avail.len(), 2);
        assert_eq!(avail.get(0), region(0x0000_0000, 0x0010_0000));
        assert_eq!(avail.get(1), region(0x0030_0000, 0x01D0_0000));
        assert_eq!(npgs, atop(0x0200_0000 - 0x0020_0000));
    }

    #[test]
    fn carve_drops_regions_swallowed_by_the_kernel() {
        let mut avail = RegionTable::from_slice(&[
            region(0x0010_0000, 0x0008_0000),
            region(0x0100_0000, 0x0100_0000),
        ]);
        let npgs = carve_kernel(&mut avail, 0x0000_0000, 0x0040_0000);

        assert_eq!(avail.len(), 1);
        assert_eq!(avail.get(0), region(0x0100_0000, 0x0100_0000));
        assert_eq!(npgs, atop(0x0100_0000));
    }

    #[test]
    fn carve_trims_overlapping_edges() {
        // one region ends inside the kernel, one starts inside it
        let mut avail = RegionTable::from_slice(&[
            region(0x0000_0000, 0x0018_0000),
            region(0x0018_0000, 0x0028_0000),
        ]);
        let npgs = carve_kernel(&mut avail, 0x0010_0000, 0x0020_0000);

        assert_eq!(avail.len(), 2);
        assert_eq!(avail.get(0), region(0x0000_0000, 0x0010_0000));
        assert_eq!(avail.get(1), region(0x0020_0000, 0x0020_0000));
        assert_eq!(npgs, atop(0x0030_0000));
    }

    #[test]
    fn carve_page_aligns_and_sorts() {
        let mut avail = RegionTable::from_slice(&[
            region(0x0100_1000, 0x0010_0000), // unaligned start
            region(0x0000_0000, 0x0010_0000),
        ]);
        let npgs = carve_kernel(&mut avail, 0x0080_0000, 0x0090_0000);

        assert_eq!(avail.len(), 2);
        assert_eq!(avail.get(0).start.as_u32(), 0x0000_0000);
        // start rounded up to 0x1004000, end truncated accordingly
        assert_eq!(avail.get(1).start.as_u32(), 0x0100_4000);
        assert_eq!(avail.get(1).size, 0x000F_C000);
        assert_eq!(npgs, atop(0x0010_0000) + atop(0x000F_C000));
    }
}
