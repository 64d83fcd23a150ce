//! # MMU Context Allocator
//!
//! The hardware tags TLB entries with an 8-bit process ID, so at most
//! [`NUMCTX`] address spaces can be resident at once; everything beyond that
//! steals. `ctxbusy` maps context to owning pmap as a plain index with no
//! ownership; the pmap arena owns, which keeps pmap, TLB shadow and
//! context table from forming a reference cycle.
//!
//! Allocation rotates a cursor through `[MINCTX, NUMCTX)`. When the ring is
//! full, the least recently handed out slot (right after the cursor) is
//! stolen: its owner loses residency (`ctx = 0`) and every TLB entry
//! tagged with the context is invalidated before the context is reused.

use crate::cpu::CpuMmu;
use crate::pmap::{PmapArena, PmapId};
use crate::tlb::TlbEngine;
use crate::vmparam::{MINCTX, NUMCTX};

pub(crate) struct CtxTable {
    busy: [Option<PmapId>; NUMCTX],
    /// Most recently allocated context.
    next: u8,
}

const fn advance(c: u8) -> u8 {
    if c as usize + 1 >= NUMCTX { MINCTX } else { c + 1 }
}

impl CtxTable {
    pub fn new() -> Self {
        Self {
            busy: [None; NUMCTX],
            // first allocation lands on MINCTX
            next: (NUMCTX - 1) as u8,
        }
    }

    pub fn owner(&self, ctx: u8) -> Option<PmapId> {
        self.busy[ctx as usize]
    }

    /// Bootstrap seeds the kernel's contexts directly.
    pub fn seed(&mut self, ctx: u8, pm: PmapId) {
        self.busy[ctx as usize] = Some(pm);
    }

    /// Allocate a context for `pm`, stealing one if the ring is full.
    ///
    /// On return no TLB entry carries the handed-out context.
    pub fn alloc<C: CpuMmu>(
        &mut self,
        cpu: &mut C,
        tlb: &mut TlbEngine,
        pmaps: &mut PmapArena,
        pm: PmapId,
    ) -> u8 {
        let mut cnum = self.next;
        loop {
            cnum = advance(cnum);
            if self.busy[cnum as usize].is_none() {
                break;
            }
            if cnum == self.next {
                // ring is full; the slot after the cursor is the oldest
                cnum = advance(self.next);
                break;
            }
        }

        // clean it out, whether or not it is being stolen
        tlb.flush_ctx(cpu, cnum);

        if let Some(victim) = self.busy[cnum as usize] {
            log::debug!("stealing context {cnum} from {victim:?}");
            pmaps.get_mut(victim).ctx = 0;
        }
        self.busy[cnum as usize] = Some(pm);
        self.next = cnum;
        pmaps.get_mut(pm).ctx = cnum;
        cnum
    }

    /// Give a context back (pmap destruction).
    pub fn free<C: CpuMmu>(&mut self, cpu: &mut C, tlb: &mut TlbEngine, pm: PmapId, ctx: u8) {
        assert!(ctx >= MINCTX, "ctx_free: freeing kernel context");
        assert!(
            self.busy[ctx as usize] == Some(pm),
            "ctx_free: ctxbusy[{ctx}] does not match"
        );
        self.busy[ctx as usize] = None;
        tlb.flush_ctx(cpu, ctx);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cpu::EmulatedCpu;

    fn fixture() -> (EmulatedCpu, TlbEngine, PmapArena) {
        (EmulatedCpu::new(), TlbEngine::new(), PmapArena::new())
    }

    #[test]
    fn first_allocations_walk_up_from_minctx() {
        let (mut cpu, mut tlb, mut pmaps) = fixture();
        let mut ctxs = CtxTable::new();

        let a = pmaps.create();
        let b = pmaps.create();
        assert_eq!(ctxs.alloc(&mut cpu, &mut tlb, &mut pmaps, a), 2);
        assert_eq!(ctxs.alloc(&mut cpu, &mut tlb, &mut pmaps, b), 3);
        assert_eq!(ctxs.owner(2), Some(a));
        assert_eq!(pmaps.get(a).ctx, 2);
    }

    #[test]
    fn full_ring_steals_the_oldest() {
        let (mut cpu, mut tlb, mut pmaps) = fixture();
        let mut ctxs = CtxTable::new();

        let mut ids = alloc::vec::Vec::new();
        for _ in MINCTX as usize..NUMCTX {
            let pm = pmaps.create();
            ctxs.alloc(&mut cpu, &mut tlb, &mut pmaps, pm);
            ids.push(pm);
        }
        assert_eq!(pmaps.get(ids[0]).ctx, 2);

        let late = pmaps.create();
        let got = ctxs.alloc(&mut cpu, &mut tlb, &mut pmaps, late);
        assert_eq!(got, 2);
        assert_eq!(ctxs.owner(2), Some(late));
        // the victim lost residency
        assert_eq!(pmaps.get(ids[0]).ctx, 0);
    }

    #[test]
    fn allocation_scans_forward_past_freed_slots() {
        let (mut cpu, mut tlb, mut pmaps) = fixture();
        let mut ctxs = CtxTable::new();

        let a = pmaps.create();
        let b = pmaps.create();
        let ca = ctxs.alloc(&mut cpu, &mut tlb, &mut pmaps, a);
        ctxs.alloc(&mut cpu, &mut tlb, &mut pmaps, b);

        ctxs.free(&mut cpu, &mut tlb, a, ca);
        assert_eq!(ctxs.owner(ca), None);

        let c = pmaps.create();
        // cursor is at b's context; the freed slot is found on the wrap
        let cc = ctxs.alloc(&mut cpu, &mut tlb, &mut pmaps, c);
        assert_eq!(cc, ca + 2 /* scans 4..=255, wraps to 2 */);
    }

    #[test]
    #[should_panic(expected = "kernel context")]
    fn freeing_the_kernel_context_is_fatal() {
        let (mut cpu, mut tlb, mut pmaps) = fixture();
        let mut ctxs = CtxTable::new();
        let kpm = pmaps.kernel();
        ctxs.seed(1, kpm);
        ctxs.free(&mut cpu, &mut tlb, kpm, 1);
    }
}
