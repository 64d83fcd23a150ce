//! # The MMU Service
//!
//! One owned object ties the pieces together: pmap arena, two-level page
//! tables, reverse map, TLB engine and context table all live in [`Mmu`],
//! generic over the CPU seam and the VM backend. The kernel holds exactly
//! one instance; tests build theirs around an
//! [`EmulatedCpu`](crate::cpu::EmulatedCpu).
//!
//! Address spaces are handed out as plain [`PmapId`]s. The context table
//! and the reverse map refer to pmaps only through these ids, so no
//! reference cycle forms between pmap, TLB shadow and context table;
//! lifetime is governed by the pmap's external reference count alone.
//!
//! Locking follows the single-CPU spl discipline: every mutating operation
//! raises to spl-VM for the duration of the update, and the three-store TLB
//! install sequence additionally raises to spl-high so no interrupt can see
//! a half-written slot or a borrowed PID.

use crate::cpu::CpuMmu;
use crate::ctx::CtxTable;
use crate::page_table::Segments;
use crate::pv::{PageAttr, PvTable};
use crate::tlb::{SlotFlags, TlbCounters, TlbEngine, TlbInfo};
use crate::tte::{TlbLo, TlbSize, Tte, Zone};
use crate::vmparam::{
    KERNEL_PID, NTLB, PAGE_MASK, PAGE_SIZE, STSZ, VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS,
    ptidx, stidx,
};
use crate::{MapFlags, PmapError, Prot, VmBackend};
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, Size16K, VirtualAddress};

/// Handle to one address space in the service's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PmapId(u32);

/// End of the page containing `va`, saturated at the top of the address
/// space.
#[inline]
fn page_end(va: VirtualAddress) -> VirtualAddress {
    let base = u64::from(va.as_u32() & !PAGE_MASK);
    VirtualAddress::new((base + u64::from(PAGE_SIZE)).min(u64::from(u32::MAX)) as u32)
}

impl PmapId {
    pub(crate) const KERNEL: Self = Self(0);

    #[cfg(test)]
    pub(crate) const fn for_test(v: u32) -> Self {
        Self(v)
    }
}

/// One address space.
pub(crate) struct Pmap {
    pub refs: u32,
    /// MMU context, 0 while not resident.
    pub ctx: u8,
    pub segments: Segments,
    /// Live translations.
    pub resident: u32,
    /// Wired reverse-map entries.
    pub wired: u32,
}

impl Pmap {
    fn fresh() -> Self {
        Self {
            refs: 1,
            ctx: 0,
            segments: Segments::empty(),
            resident: 0,
            wired: 0,
        }
    }
}

/// Arena of pmaps; the kernel pmap is slot 0 and immortal.
pub(crate) struct PmapArena {
    slots: Vec<Option<Pmap>>,
    free: Vec<u32>,
}

impl PmapArena {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.push(Some(Pmap::fresh()));
        Self {
            slots,
            free: Vec::new(),
        }
    }

    pub fn kernel(&self) -> PmapId {
        PmapId::KERNEL
    }

    pub fn get(&self, pm: PmapId) -> &Pmap {
        self.slots[pm.0 as usize]
            .as_ref()
            .expect("stale pmap reference")
    }

    pub fn get_mut(&mut self, pm: PmapId) -> &mut Pmap {
        self.slots[pm.0 as usize]
            .as_mut()
            .expect("stale pmap reference")
    }

    pub fn create(&mut self) -> PmapId {
        if let Some(i) = self.free.pop() {
            self.slots[i as usize] = Some(Pmap::fresh());
            return PmapId(i);
        }
        self.slots.push(Some(Pmap::fresh()));
        PmapId((self.slots.len() - 1) as u32)
    }

    pub fn release(&mut self, pm: PmapId) {
        debug_assert!(pm != PmapId::KERNEL);
        self.slots[pm.0 as usize] = None;
        self.free.push(pm.0);
    }

    pub fn ids(&self) -> impl Iterator<Item = PmapId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| PmapId(i as u32))
    }
}

/// The MMU service. See the [module docs](self).
pub struct Mmu<C: CpuMmu, B: VmBackend> {
    pub(crate) cpu: C,
    pub(crate) vm: B,
    pub(crate) tlb: TlbEngine,
    pub(crate) ctxs: CtxTable,
    pub(crate) pmaps: PmapArena,
    pub(crate) pv: PvTable,
    pub(crate) mem: crate::bootstrap::RegionTable,
    pub(crate) avail: crate::bootstrap::RegionTable,
    pub(crate) physmem: u32,
    pub(crate) npgs: u32,
    pub(crate) kbreak: VirtualAddress,
    pub(crate) kernmap: VirtualAddress,
    pub(crate) msgbuf_paddr: Option<PhysicalAddress>,
    pub(crate) bootstrap_done: bool,
    /// Set by [`Mmu::init`]: the VM system is up, managed pages get
    /// reverse-map tracking and kernel tables come from the page allocator.
    pub(crate) vm_ready: bool,
}

impl<C: CpuMmu, B: VmBackend> Mmu<C, B> {
    /// A fresh service around a CPU and a VM backend. Nothing works until
    /// [`Mmu::bootstrap`] has run.
    pub fn new(cpu: C, vm: B) -> Self {
        Self {
            cpu,
            vm,
            tlb: TlbEngine::new(),
            ctxs: CtxTable::new(),
            pmaps: PmapArena::new(),
            pv: PvTable::new(),
            mem: crate::bootstrap::RegionTable::new(),
            avail: crate::bootstrap::RegionTable::new(),
            physmem: 0,
            npgs: 0,
            kbreak: VM_MIN_KERNEL_ADDRESS,
            kernmap: VirtualAddress::zero(),
            msgbuf_paddr: None,
            bootstrap_done: false,
            vm_ready: false,
        }
    }

    /// The distinguished kernel address space.
    #[inline]
    #[must_use]
    pub fn kernel_pmap(&self) -> PmapId {
        self.pmaps.kernel()
    }

    // ------------------------------------------------------------------
    // Reserved TLB entries (pre-bootstrap fixed mappings)
    // ------------------------------------------------------------------

    /// Pin `[pa, pa + size)` at `va` in a locked TLB entry. Board code
    /// calls this for its I/O windows before [`Mmu::bootstrap`].
    pub fn reserve(&mut self, pa: PhysicalAddress, va: VirtualAddress, size: u32, flags: TlbLo) {
        let Self { cpu, tlb, .. } = self;
        tlb.reserve(cpu, pa, va, size, flags);
    }

    /// Virtual address a reserved entry assigns to `[base, base + len)`,
    /// if any covers it.
    pub fn mapiodev(&mut self, base: PhysicalAddress, len: u32) -> Option<VirtualAddress> {
        let Self { cpu, tlb, .. } = self;
        tlb.mapiodev(cpu, base, len)
    }

    // ------------------------------------------------------------------
    // Pmap lifecycle
    // ------------------------------------------------------------------

    /// Create an empty address space with reference count 1.
    pub fn create(&mut self) -> PmapId {
        self.pmaps.create()
    }

    /// Add a reference.
    pub fn reference(&mut self, pm: PmapId) {
        self.pmaps.get_mut(pm).refs += 1;
    }

    /// Drop a reference; the last one retires the pmap, which must be
    /// empty by then.
    pub fn destroy(&mut self, pm: PmapId) {
        assert!(pm != self.kernel_pmap(), "pmap_destroy: kernel pmap");
        {
            let p = self.pmaps.get_mut(pm);
            p.refs -= 1;
            if p.refs > 0 {
                return;
            }
            assert_eq!(p.resident, 0, "pmap_destroy: live translations remain");
            assert_eq!(p.wired, 0, "pmap_destroy: wired mappings remain");
        }
        let Self { vm, pmaps, .. } = self;
        let p = pmaps.get_mut(pm);
        for seg in 0..STSZ {
            if let Some(page) = p.segments.detach(seg) {
                unsafe { vm.free_pt_page(page) };
            }
        }
        if self.pmaps.get(pm).ctx != 0 {
            self.ctx_free(pm);
        }
        self.pmaps.release(pm);
    }

    // ------------------------------------------------------------------
    // Context management
    // ------------------------------------------------------------------

    /// Make `pm` resident: allocate an MMU context, stealing one if the
    /// table is full. The switch path calls this when it finds `ctx == 0`.
    pub fn ctx_alloc(&mut self, pm: PmapId) -> u8 {
        assert!(pm != self.kernel_pmap(), "ctx_alloc: kernel pmap");
        let s = self.cpu.splvm();
        let Self {
            cpu,
            tlb,
            ctxs,
            pmaps,
            ..
        } = self;
        let ctx = ctxs.alloc(cpu, tlb, pmaps, pm);
        self.cpu.splx(s);
        ctx
    }

    /// Release `pm`'s context (during destruction).
    pub fn ctx_free(&mut self, pm: PmapId) {
        let ctx = self.pmaps.get(pm).ctx;
        let Self {
            cpu, tlb, ctxs, ..
        } = self;
        ctxs.free(cpu, tlb, pm, ctx);
        self.pmaps.get_mut(pm).ctx = 0;
    }

    /// Current MMU context of `pm` (0 = not resident).
    #[must_use]
    pub fn context_of(&self, pm: PmapId) -> u8 {
        self.pmaps.get(pm).ctx
    }

    // ------------------------------------------------------------------
    // Page-table plumbing
    // ------------------------------------------------------------------

    /// Store `tte` for `va`, allocating the leaf table on the first
    /// non-empty store. Storing [`Tte::EMPTY`] into a missing table does
    /// nothing; clearing a non-existent mapping must not allocate.
    fn pte_enter(&mut self, pm: PmapId, va: VirtualAddress, tte: Tte) -> Result<(), PmapError> {
        let Self {
            cpu,
            vm,
            tlb,
            pmaps,
            ..
        } = self;
        let pmap = pmaps.get_mut(pm);
        let seg = stidx(va);

        if !pmap.segments.has(seg) {
            if tte.is_empty() {
                return Ok(());
            }
            let page = vm.alloc_pt_page().ok_or(PmapError::OutOfMemory)?;
            pmap.segments.attach(seg, page);
        }
        let table = pmap
            .segments
            .table_mut(seg)
            .expect("leaf table vanished under spl");
        let old = table.get(ptidx(va));
        table.set(ptidx(va), tte);

        tlb.flush(cpu, va, pmap.ctx);

        if old != tte {
            if tte.is_empty() {
                pmap.resident -= 1;
            } else {
                pmap.resident += 1;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mapping operations
    // ------------------------------------------------------------------

    /// Map `pa` at `va` in `pm`.
    ///
    /// Any existing mapping at `va` is removed first. Managed frames get a
    /// reverse-map entry and their attribute bits seeded from the access
    /// type in `flags`; unmanaged frames (device windows, stolen pages) are
    /// mapped without tracking, and a wired enter of such a frame is not
    /// charged to `wired_count`. Non-wired mappings are preloaded into the
    /// TLB; wired ones wait for the first miss.
    ///
    /// # Errors
    /// [`PmapError::OutOfMemory`] when a leaf table or reverse-map node
    /// cannot be allocated and `flags` carries [`MapFlags::CANFAIL`];
    /// without it the failure panics.
    pub fn enter(
        &mut self,
        pm: PmapId,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Prot,
        flags: MapFlags,
    ) -> Result<(), PmapError> {
        // have to remove any existing mapping first
        self.remove(pm, va, page_end(va));

        let mut flags = flags;
        if flags.contains(MapFlags::WIRED) {
            flags |= MapFlags::from_access(prot);
        }

        let managed = self.vm.page_is_managed(pa);

        let zone = if pm == self.kernel_pmap() {
            Zone::Privileged
        } else {
            Zone::User
        };
        let mut tte = Tte::map(pa, TlbSize::Size16K).with_zone(zone);

        debug_assert!(
            !flags.contains(MapFlags::NOCACHE | MapFlags::WRITE_THROUGH),
            "uncached and writethrough are not compatible"
        );
        if flags.contains(MapFlags::NOCACHE) {
            // must be an I/O mapping
            tte = tte.with_inhibited(true).with_guarded(true);
        } else if flags.contains(MapFlags::WRITE_THROUGH) {
            tte = tte.with_write_through(true);
        }
        if cfg!(feature = "uncached") {
            tte = tte.with_inhibited(true);
        }
        if flags.contains(MapFlags::WRITE) {
            tte = tte.with_writable(true);
        }
        if flags.contains(MapFlags::EXECUTE) {
            tte = tte.with_executable(true);
        }

        // record the mapping for later back-translation
        let mut entered_pv = false;
        if self.vm_ready && managed {
            let wired = self.pv.enter(
                pm,
                va,
                pa,
                flags.contains(MapFlags::WIRED),
                flags.contains(MapFlags::CANFAIL),
            )?;
            if wired {
                self.pmaps.get_mut(pm).wired += 1;
            }
            entered_pv = true;

            let mut attr = PageAttr::empty();
            if flags.intersects(MapFlags::ACCESS_ALL) {
                attr |= PageAttr::REF;
            }
            if flags.contains(MapFlags::WRITE) {
                attr |= PageAttr::CHG;
            }
            self.pv.attr_or(pa, attr);
        }

        let s = self.cpu.splvm();

        if let Err(e) = self.pte_enter(pm, va, tte) {
            if !flags.contains(MapFlags::CANFAIL) {
                panic!("pmap_enter: pte_enter");
            }
            // back out the reverse-map entry; the caller sees clean failure
            if entered_pv && self.pv.remove(pm, va, pa) {
                self.pmaps.get_mut(pm).wired -= 1;
            }
            self.cpu.splx(s);
            return Err(e);
        }

        // a real fault goes straight into the TLB; wired preloads defer
        if !tte.is_empty() && !flags.contains(MapFlags::WIRED) {
            let s2 = self.cpu.splhigh();
            let ctx = self.pmaps.get(pm).ctx;
            let extra = self.vm.storage_attributes(va, pa);
            let Self { cpu, tlb, .. } = self;
            tlb.enter(cpu, ctx, va, tte, extra);
            self.cpu.splx(s2);
        }

        self.cpu.splx(s);

        // flush fresh text out of the data cache
        if prot.contains(Prot::EXECUTE) && !tte.inhibited() {
            self.cpu.sync_icache(pa, PAGE_SIZE);
        }
        Ok(())
    }

    /// Unmap `[va, endva)` in `pm`.
    pub fn remove(&mut self, pm: PmapId, va: VirtualAddress, endva: VirtualAddress) {
        let s = self.cpu.splvm();
        let mut va = va;
        while va < endva {
            let Self {
                cpu,
                tlb,
                pmaps,
                pv,
                ..
            } = self;
            let pmap = pmaps.get_mut(pm);
            let tte = pmap.segments.find(va).unwrap_or(Tte::EMPTY);
            if !tte.is_empty() {
                let pa = tte.pa();
                if pv.remove(pm, va, pa) {
                    pmap.wired -= 1;
                }
                if let Some(table) = pmap.segments.table_mut(stidx(va)) {
                    table.set(ptidx(va), Tte::EMPTY);
                }
                tlb.flush(cpu, va, pmap.ctx);
                pmap.resident -= 1;
            }
            let Some(next) = va.checked_add(PAGE_SIZE) else {
                break;
            };
            va = next;
        }
        self.cpu.splx(s);
    }

    /// Lower the protection on `[sva, eva)`. Dropping read access unmaps;
    /// otherwise the write/execute bits are stripped from every live
    /// translation and its TLB entry flushed.
    pub fn protect(&mut self, pm: PmapId, sva: VirtualAddress, eva: VirtualAddress, prot: Prot) {
        if !prot.contains(Prot::READ) {
            self.remove(pm, sva, eva);
            return;
        }
        let clear_wr = !prot.contains(Prot::WRITE);
        let clear_ex = !prot.contains(Prot::EXECUTE);
        if !clear_wr && !clear_ex {
            return;
        }

        let s = self.cpu.splvm();
        let mut va = sva;
        while va < eva {
            let Self {
                cpu, tlb, pmaps, ..
            } = self;
            let pmap = pmaps.get_mut(pm);
            if let Some(table) = pmap.segments.table_mut(stidx(va)) {
                let mut tte = table.get(ptidx(va));
                if clear_wr {
                    tte = tte.with_writable(false);
                }
                if clear_ex {
                    tte = tte.with_executable(false);
                }
                table.set(ptidx(va), tte);
                tlb.flush(cpu, va, pmap.ctx);
            }
            let Some(next) = va.checked_add(PAGE_SIZE) else {
                break;
            };
            va = next;
        }
        self.cpu.splx(s);
    }

    /// Physical address `va` translates to in `pm`, if mapped.
    pub fn extract(&mut self, pm: PmapId, va: VirtualAddress) -> Option<PhysicalAddress> {
        let s = self.cpu.splvm();
        let tte = self.pmaps.get(pm).segments.find(va).unwrap_or(Tte::EMPTY);
        let pa = if tte.is_empty() {
            None
        } else {
            Some(tte.pa().page::<Size16K>().join(va.offset::<Size16K>()))
        };
        self.cpu.splx(s);
        pa
    }

    /// Clear the wired marker of the mapping at `va`, if there is one.
    pub fn unwire(&mut self, pm: PmapId, va: VirtualAddress) {
        let Some(pa) = self.extract(pm, va) else {
            return;
        };
        let s = self.cpu.splvm();
        if self.pv.unwire(pm, va, pa) {
            self.pmaps.get_mut(pm).wired -= 1;
        }
        self.cpu.splx(s);
    }

    // ------------------------------------------------------------------
    // Kernel-only fast paths
    // ------------------------------------------------------------------

    /// Map `pa` at `va` in the kernel pmap without reverse-map tracking.
    /// Kernel text is not privilege-separated from kernel data here: any
    /// access implies execute.
    pub fn kenter_pa(&mut self, va: VirtualAddress, pa: PhysicalAddress, prot: Prot, flags: MapFlags) {
        let mut tte = Tte::EMPTY;
        if prot.intersects(Prot::ALL) {
            tte = Tte::map(pa, TlbSize::Size16K)
                .with_zone(Zone::Privileged)
                .with_executable(true);

            debug_assert!(
                !flags.contains(MapFlags::NOCACHE | MapFlags::WRITE_THROUGH),
                "uncached and writethrough are not compatible"
            );
            if flags.contains(MapFlags::NOCACHE) {
                tte = tte.with_inhibited(true).with_guarded(true);
            } else if flags.contains(MapFlags::WRITE_THROUGH) {
                tte = tte.with_write_through(true);
            }
            if cfg!(feature = "uncached") {
                tte = tte.with_inhibited(true);
            }
            if prot.contains(Prot::WRITE) {
                tte = tte.with_writable(true);
            }
        }

        let s = self.cpu.splvm();
        let kpm = self.kernel_pmap();
        if self.pte_enter(kpm, va, tte).is_err() {
            panic!("pmap_kenter_pa: pte_enter");
        }
        self.cpu.splx(s);
    }

    /// Unmap `[va, va + len)` from the kernel pmap. Clearing empty slots
    /// never allocates, so this cannot fail.
    pub fn kremove(&mut self, va: VirtualAddress, len: u32) {
        let kpm = self.kernel_pmap();
        let mut va = va;
        let mut len = len;
        while len > 0 {
            let s = self.cpu.splvm();
            let _ = self.pte_enter(kpm, va, Tte::EMPTY);
            self.cpu.splx(s);
            len = len.saturating_sub(PAGE_SIZE);
            let Some(next) = va.checked_add(PAGE_SIZE) else {
                break;
            };
            va = next;
        }
    }

    // ------------------------------------------------------------------
    // Page-wide operations
    // ------------------------------------------------------------------

    /// Apply `protect` to every mapping of the frame at `pa`, walking the
    /// reverse map. Chain nodes are captured before each step since
    /// dropping to no access removes them while we walk; the header goes
    /// last, so node promotion into it cannot bite.
    pub fn page_protect(&mut self, pa: PhysicalAddress, prot: Prot) {
        let Some(h) = self.pv.index_of(pa) else {
            return;
        };

        let mut cur = self.pv.header(h).next;
        while let Some(i) = cur {
            let node = self.pv.node(i);
            cur = node.next;
            if let Some(pm) = node.pm {
                let va = node.va;
                self.protect(pm, va, page_end(va), prot);
            }
        }

        let header = self.pv.header(h);
        if let Some(pm) = header.pm {
            let va = header.va;
            self.protect(pm, va, page_end(va), prot);
        }
    }

    /// Test (and optionally clear) attribute bits of the frame at `pa`.
    ///
    /// Clearing the changed bit lowers every mapping to read-only so the
    /// next write re-dirties; clearing anything else unmaps so the next
    /// access re-references.
    pub fn check_attr(&mut self, pa: PhysicalAddress, mask: PageAttr, clear: bool) -> bool {
        let Some(idx) = self.pv.index_of(pa) else {
            return false;
        };

        let s = self.cpu.splvm();
        let rv = self.pv.attr_get(idx) & mask.bits() != 0;
        if clear {
            self.pv.attr_clear(idx, mask);
            let prot = if mask == PageAttr::CHG {
                Prot::READ
            } else {
                Prot::empty()
            };
            self.page_protect(pa, prot);
        }
        self.cpu.splx(s);
        rv
    }

    /// VM-layer helpers expressed over [`Mmu::check_attr`].
    pub fn clear_modify(&mut self, pa: PhysicalAddress) -> bool {
        self.check_attr(pa, PageAttr::CHG, true)
    }

    pub fn clear_reference(&mut self, pa: PhysicalAddress) -> bool {
        self.check_attr(pa, PageAttr::REF, true)
    }

    pub fn is_modified(&mut self, pa: PhysicalAddress) -> bool {
        self.check_attr(pa, PageAttr::CHG, false)
    }

    pub fn is_referenced(&mut self, pa: PhysicalAddress) -> bool {
        self.check_attr(pa, PageAttr::REF, false)
    }

    // ------------------------------------------------------------------
    // Cache synchronization
    // ------------------------------------------------------------------

    /// Synchronize the instruction cache for `[va, va + len)` of `pm` after
    /// text has been written there.
    ///
    /// For the running process (`current`) the miss handler has our back
    /// and the loop runs through the user context directly. For anyone
    /// else there is no context to fault in, so each page is translated
    /// here and synced by physical address.
    pub fn procwr(&mut self, pm: PmapId, va: VirtualAddress, len: u32, current: bool) {
        if current {
            let ctx = match self.pmaps.get(pm).ctx {
                0 => self.ctx_alloc(pm),
                c => c,
            };
            self.cpu.sync_icache_user(ctx, va, len);
        } else {
            let mut tva = va.as_u32();
            let mut len = len;
            while len > 0 {
                let eva = (u64::from(tva) + u64::from(len))
                    .min(u64::from(page_end(VirtualAddress::new(tva)).as_u32()))
                    as u32;
                let tlen = eva - tva;
                if let Some(pa) = self.extract(pm, VirtualAddress::new(tva)) {
                    self.cpu.sync_icache(pa, tlen);
                }
                tva = eva;
                len -= tlen;
            }
        }
    }

    /// Zero a physical page through the direct map.
    pub fn zero_page(&mut self, pa: PhysicalAddress) {
        self.cpu.zero_page(pa);
    }

    /// Copy a physical page through the direct map.
    pub fn copy_page(&mut self, src: PhysicalAddress, dst: PhysicalAddress) {
        self.cpu.copy_page(src, dst);
    }

    // ------------------------------------------------------------------
    // Advisory hooks
    // ------------------------------------------------------------------

    /// Advisory copy-range hint; this pmap does nothing with it.
    pub fn copy(
        &mut self,
        _dst: PmapId,
        _src: PmapId,
        _dst_addr: VirtualAddress,
        _len: u32,
        _src_addr: VirtualAddress,
    ) {
    }

    /// Deferred-update barrier; all updates here take effect immediately.
    pub fn update(&mut self, _pm: PmapId) {}

    // ------------------------------------------------------------------
    // TLB miss service
    // ------------------------------------------------------------------

    /// Handle a TLB miss for `(va, ctx)` taken by the trap layer, with
    /// translation off and interrupts dead; no spl sections in here.
    ///
    /// Kernel misses below [`VM_MIN_KERNEL_ADDRESS`] hit the physical
    /// window and get a synthesized 16 MiB writable direct mapping.
    /// Everything else is looked up in the owning pmap. Returns whether a
    /// translation was installed; `false` sends the trap to the fault
    /// handler.
    pub fn tlb_miss(&mut self, va: VirtualAddress, ctx: u8) -> bool {
        self.tlb.counters.misses += 1;

        let tte;
        if ctx != KERNEL_PID || (va >= VM_MIN_KERNEL_ADDRESS && va < VM_MAX_KERNEL_ADDRESS) {
            let Some(pm) = self.ctxs.owner(ctx) else {
                return false;
            };
            let Some(found) = self.pmaps.get(pm).segments.find(va) else {
                return false;
            };
            if found.is_empty() {
                return false;
            }
            tte = found;
        } else {
            // unmanaged kernel access: direct-map it, 16 MiB at a time
            let mut direct = Tte::map(PhysicalAddress::new(va.as_u32()), TlbSize::Size16M)
                .with_zone(Zone::Privileged)
                .with_writable(true);
            if cfg!(feature = "uncached") {
                direct = direct.with_inhibited(true);
            }
            tte = direct;
        }

        let extra = self.vm.storage_attributes(va, tte.pa());
        let Self { cpu, tlb, .. } = self;
        tlb.enter(cpu, ctx, va, tte, extra);
        true
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn resident_count(&self, pm: PmapId) -> u32 {
        self.pmaps.get(pm).resident
    }

    #[must_use]
    pub fn wired_count(&self, pm: PmapId) -> u32 {
        self.pmaps.get(pm).wired
    }

    /// Reverse-map entries recorded for the frame at `pa` (debugger aid).
    #[must_use]
    pub fn page_mapping_count(&self, pa: PhysicalAddress) -> usize {
        let Some(h) = self.pv.index_of(pa) else {
            return 0;
        };
        let hd = self.pv.header(h);
        if hd.pm.is_none() {
            return 0;
        }
        let mut n = 1;
        let mut cur = hd.next;
        while let Some(i) = cur {
            n += 1;
            cur = self.pv.node(i).next;
        }
        n
    }

    #[must_use]
    pub fn tlb_counters(&self) -> TlbCounters {
        self.tlb.counters
    }

    #[must_use]
    pub fn tlb_entry(&self, slot: usize) -> TlbInfo {
        self.tlb.entry(slot)
    }

    #[must_use]
    pub fn tlb_reserved(&self) -> usize {
        self.tlb.reserved()
    }

    #[must_use]
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.vm
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.vm
    }

    /// Walk every structure and panic on any violated cross-structure
    /// invariant. Debugger aid; also driven hard by the test suite.
    pub fn verify_invariants(&mut self) {
        // per-pmap counters against the tables and the reverse map
        let ids: Vec<PmapId> = self.pmaps.ids().collect();
        for pm in &ids {
            let p = self.pmaps.get(*pm);
            let mut resident = 0u32;
            for seg in 0..STSZ {
                if let Some(t) = p.segments.table(seg) {
                    resident += t.live() as u32;
                }
            }
            assert_eq!(
                resident,
                p.resident,
                "resident_count out of sync for {pm:?}"
            );

            let mut wired = 0u32;
            for idx in 0..self.pv.frames() {
                wired += self.pv.count_for(idx, *pm).1;
            }
            assert_eq!(wired, p.wired, "wired_count out of sync for {pm:?}");

            // context table coherence
            if p.ctx != 0 {
                assert_eq!(
                    self.ctxs.owner(p.ctx),
                    Some(*pm),
                    "ctxbusy does not own {pm:?}"
                );
            }
        }
        for ctx in 0..=255u8 {
            if let Some(pm) = self.ctxs.owner(ctx)
                && ctx >= 2
            {
                assert_eq!(self.pmaps.get(pm).ctx, ctx, "pmap lost context {ctx}");
            }
        }

        // every used TLB slot is backed by a live translation
        for slot in self.tlb.reserved()..NTLB {
            let info = self.tlb.entry(slot);
            if !info.flags.contains(SlotFlags::USED) {
                continue;
            }
            let pm = self
                .ctxs
                .owner(info.ctx)
                .unwrap_or_else(|| panic!("TLB slot {slot} carries orphan ctx {}", info.ctx));
            let backing = self
                .pmaps
                .get(pm)
                .segments
                .find(info.va)
                .filter(|t| !t.is_empty());
            let (_, lo) = self.cpu.tlb_read(slot);
            if let Some(tte) = backing {
                assert_eq!(
                    lo.rpn().as_u32() & Tte::rpn_mask(tte.size()),
                    tte.pa().as_u32(),
                    "TLB slot {slot} maps the wrong frame"
                );
            } else {
                // only the synthesized kernel direct map is legitimately
                // unbacked; it must be an identity translation
                assert!(
                    info.ctx == KERNEL_PID && info.va < VM_MIN_KERNEL_ADDRESS,
                    "TLB slot {slot} has no backing translation"
                );
                let mask = Tte::rpn_mask(TlbSize::Size16M);
                assert_eq!(
                    lo.rpn().as_u32() & mask,
                    info.va.as_u32() & mask,
                    "TLB slot {slot}: direct map is not identity"
                );
            }
        }
    }
}
