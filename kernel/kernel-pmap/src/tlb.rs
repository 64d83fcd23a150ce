//! # TLB Engine
//!
//! The software half of the TLB: a shadow of every hardware slot, the
//! FIFO-with-reference victim walker, flush paths and the bootstrap-only
//! reserved entries that pin fixed I/O mappings.
//!
//! Replacement is a clock sweep over the non-reserved slots. A referenced
//! entry gets its reference bit stripped and one more round; the entry
//! backing the running kernel stack is never chosen (losing it mid-fault
//! would recurse the miss handler onto an unmapped stack).

use crate::cpu::CpuMmu;
use crate::tte::{TLB_RPN_MASK, TlbHi, TlbLo, TlbSize, Tte};
use crate::vmparam::{KERNEL_PID, NTLB, PAGE_MASK, VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::zpr::{Zpr, ZoneMode};

/// Software state of one TLB slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFlags(u8);

bitflags::bitflags! {
    impl SlotFlags: u8 {
        /// The slot holds a translation.
        const USED = 0x1;
        /// Recently installed or reprieved; survives one sweep.
        const REF = 0x2;
        /// Never a victim (reserved entries).
        const LOCKED = 0x4;
    }
}

/// Shadow of one hardware slot.
#[derive(Debug, Clone, Copy)]
pub struct TlbInfo {
    pub flags: SlotFlags,
    /// Owning context; 0 when free.
    pub ctx: u8,
    /// Effective page number of the installed translation.
    pub va: VirtualAddress,
}

impl TlbInfo {
    const fn free() -> Self {
        Self {
            flags: SlotFlags::empty(),
            ctx: 0,
            va: VirtualAddress::zero(),
        }
    }
}

/// Event counters, matching the trap statistics the platform exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlbCounters {
    pub misses: u64,
    pub flushes: u64,
    pub enters: u64,
}

/// Zone setup: Z0 supervisor-only, Z1/Z2 honor entry permissions, Z3
/// unrestricted.
const BOOT_ZPR: Zpr = Zpr::new()
    .with_zone(1, ZoneMode::PerEntry)
    .with_zone(2, ZoneMode::PerEntryAlt)
    .with_zone(3, ZoneMode::Unrestricted);

pub(crate) struct TlbEngine {
    info: [TlbInfo; NTLB],
    /// Replacement cursor.
    next: usize,
    /// Slots `[0, nreserved)` are locked fixed mappings.
    nreserved: usize,
    bootstrap_done: bool,
    pub counters: TlbCounters,
}

impl TlbEngine {
    pub fn new() -> Self {
        Self {
            info: [TlbInfo::free(); NTLB],
            next: 0,
            nreserved: 0,
            bootstrap_done: false,
            counters: TlbCounters::default(),
        }
    }

    pub fn entry(&self, slot: usize) -> TlbInfo {
        self.info[slot]
    }

    pub fn reserved(&self) -> usize {
        self.nreserved
    }

    pub fn cursor(&self) -> usize {
        self.next
    }

    /// Bootstrap points the cursor past the reserved slots once and for
    /// all; the walker never wraps below it.
    pub fn reset_cursor(&mut self) {
        self.next = self.nreserved;
    }

    pub fn finish_bootstrap(&mut self) {
        self.bootstrap_done = true;
    }

    /// Mark the reserved slots and program the protection zones.
    pub fn init<C: CpuMmu>(&mut self, cpu: &mut C) {
        for i in 0..self.nreserved {
            self.info[i].flags = SlotFlags::LOCKED | SlotFlags::USED;
            self.info[i].ctx = KERNEL_PID;
        }
        cpu.set_zones(BOOT_ZPR);
    }

    /// Pick a slot to evict.
    ///
    /// One full sweep can do nothing but strip reference bits, so the
    /// second sweep must find a candidate; the loop is bounded accordingly.
    fn find_victim<C: CpuMmu>(&mut self, cpu: &C) -> usize {
        for _ in 0..(2 * NTLB + 2) {
            self.next += 1;
            if self.next >= NTLB {
                self.next = self.nreserved;
            }
            let flags = self.info[self.next].flags;
            if !flags.contains(SlotFlags::USED)
                || !flags.intersects(SlotFlags::LOCKED | SlotFlags::REF)
            {
                let stack = cpu.stack_page();
                let entry = &mut self.info[self.next];
                if entry.va.as_u32() & !PAGE_MASK == stack.as_u32() & !PAGE_MASK
                    && entry.ctx == KERNEL_PID
                    && flags.contains(SlotFlags::USED)
                {
                    // the running kernel stack gets a reprieve
                    entry.flags.insert(SlotFlags::REF);
                } else {
                    return self.next;
                }
            } else {
                self.info[self.next].flags.remove(SlotFlags::REF);
            }
        }
        panic!("tlb_find_victim: no evictable entry");
    }

    /// Install `tte` for `(ctx, va)`, evicting as needed.
    pub fn enter<C: CpuMmu>(
        &mut self,
        cpu: &mut C,
        ctx: u8,
        va: VirtualAddress,
        tte: Tte,
        extra: TlbLo,
    ) {
        self.counters.enters += 1;

        let sz = tte.size();
        let pa = tte.pa();
        let hi = TlbHi::for_entry(va, sz);
        let lo =
            TlbLo::from_bits((tte.raw() & !TLB_RPN_MASK) | pa.as_u32() | extra.into_bits());

        let slot = self.find_victim(cpu);
        assert!(
            slot >= self.nreserved && slot < NTLB,
            "tlb_enter: invalid entry {slot}"
        );

        self.info[slot] = TlbInfo {
            flags: SlotFlags::USED | SlotFlags::REF,
            ctx,
            va: VirtualAddress::new(va.as_u32() & TLB_RPN_MASK),
        };
        cpu.tlb_write(slot, ctx, hi, lo);
    }

    /// Drop the translation of `(va, ctx)` if the hardware holds one.
    /// A context of 0 means the address space is not resident: nothing to
    /// do.
    pub fn flush<C: CpuMmu>(&mut self, cpu: &mut C, va: VirtualAddress, ctx: u8) {
        if ctx == 0 {
            return;
        }
        if let Some(slot) = cpu.tlb_search(va, ctx)
            && !self.info[slot].flags.contains(SlotFlags::LOCKED)
        {
            self.invalidate_slot(cpu, slot);
            // reuse the hole before evicting anything else
            self.next = if slot > self.nreserved { slot - 1 } else { NTLB - 1 };
            self.counters.flushes += 1;
        }
    }

    /// Invalidate every non-locked slot.
    pub fn flush_all<C: CpuMmu>(&mut self, cpu: &mut C) {
        for slot in 0..NTLB {
            if !self.info[slot].flags.contains(SlotFlags::LOCKED) {
                self.invalidate_slot(cpu, slot);
            }
        }
    }

    /// Invalidate every slot tagged with `ctx` (context steal or free).
    pub fn flush_ctx<C: CpuMmu>(&mut self, cpu: &mut C, ctx: u8) {
        for slot in self.nreserved..NTLB {
            if self.info[slot].ctx == ctx {
                assert!(
                    !self.info[slot].flags.contains(SlotFlags::LOCKED),
                    "flush_ctx: locked entry {slot} for ctx {ctx}"
                );
                self.invalidate_slot(cpu, slot);
            }
        }
    }

    fn invalidate_slot<C: CpuMmu>(&mut self, cpu: &mut C, slot: usize) {
        if cfg!(debug_assertions) {
            // keep the dead entry readable in the debugger, only drop V
            let (hi, lo) = cpu.tlb_read(slot);
            cpu.tlb_write(slot, self.info[slot].ctx, hi.with_valid(false), lo);
        } else {
            cpu.tlb_write(slot, 0, TlbHi::new(), TlbLo::new());
        }
        self.info[slot].ctx = 0;
        self.info[slot].flags = SlotFlags::empty();
    }

    /// Pin a fixed mapping of `[pa, pa + size)` at `va` into the next
    /// reserved slot. Only legal before bootstrap completes; the size is
    /// rounded up to a supported page size and both addresses down to it.
    pub fn reserve<C: CpuMmu>(
        &mut self,
        cpu: &mut C,
        pa: PhysicalAddress,
        va: VirtualAddress,
        size: u32,
        flags: TlbLo,
    ) {
        assert!(
            va < VM_MIN_KERNEL_ADDRESS || va >= VM_MAX_KERNEL_ADDRESS,
            "tlb_reserve: va {va} inside managed kernel space"
        );
        assert!(!self.bootstrap_done, "tlb_reserve: after bootstrap");
        assert!(self.nreserved < NTLB, "tlb_reserve: out of entries");

        let Some(sz) = TlbSize::for_len(size) else {
            panic!("tlb_reserve: entry {}, {size}B too large", self.nreserved);
        };
        let rmask = sz.bytes() - 1;

        let rpn = pa.as_u32() & !rmask;
        let epn = va.as_u32() & !rmask;

        let mut lo = TlbLo::from_bits(rpn | flags.into_bits()).with_writable(true);
        if cfg!(feature = "uncached") {
            lo = lo.with_inhibited(true);
        }
        let hi = TlbHi::for_entry(VirtualAddress::new(epn), sz);

        log::trace!("tlb_reserve: slot {} {epn:#010x} -> {rpn:#010x}/{sz:?}", self.nreserved);
        cpu.tlb_write(self.nreserved, KERNEL_PID, hi, lo);
        self.nreserved += 1;
    }

    /// Find the virtual address a reserved entry gives to `[base,
    /// base + len)`. The reserved slots themselves are the lookup table;
    /// no side storage needed.
    pub fn mapiodev<C: CpuMmu>(
        &self,
        cpu: &mut C,
        base: PhysicalAddress,
        len: u32,
    ) -> Option<VirtualAddress> {
        for slot in 0..self.nreserved {
            let (hi, lo) = cpu.tlb_read(slot);
            debug_assert!(hi.valid());

            let pa = lo.into_bits() & TLB_RPN_MASK;
            if base.as_u32() < pa {
                continue;
            }
            let sz = TlbSize::from_index(hi.size()).bytes();
            if u64::from(base.as_u32()) + u64::from(len) > u64::from(pa) + u64::from(sz) {
                continue;
            }
            let va = (hi.into_bits() & TLB_RPN_MASK) + (base.as_u32() & (sz - 1));
            return Some(VirtualAddress::new(va));
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cpu::EmulatedCpu;

    fn tte16k(pa: u32) -> Tte {
        Tte::map(PhysicalAddress::new(pa), TlbSize::Size16K)
    }

    fn engine_with_reserved(cpu: &mut EmulatedCpu, n: usize) -> TlbEngine {
        let mut tlb = TlbEngine::new();
        for i in 0..n {
            tlb.reserve(
                cpu,
                PhysicalAddress::new(0xEF60_0000 + (i as u32) * 0x10_0000),
                VirtualAddress::new(0xEF60_0000 + (i as u32) * 0x10_0000),
                0x10_0000,
                TlbLo::new().with_inhibited(true).with_guarded(true),
            );
        }
        tlb.reset_cursor();
        tlb.init(cpu);
        tlb.finish_bootstrap();
        tlb
    }

    #[test]
    fn install_and_search() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = engine_with_reserved(&mut cpu, 4);

        let va = VirtualAddress::new(0x0000_4000);
        tlb.enter(&mut cpu, 2, va, tte16k(0x0100_0000).with_writable(true), TlbLo::new());

        let slot = cpu.tlb_search(va, 2).expect("installed");
        assert!(slot >= 4);
        let info = tlb.entry(slot);
        assert_eq!(info.ctx, 2);
        assert_eq!(info.va, va);
        assert!(info.flags.contains(SlotFlags::USED | SlotFlags::REF));
        assert_eq!(tlb.counters.enters, 1);
    }

    #[test]
    fn flush_clears_and_reuses_slot() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = engine_with_reserved(&mut cpu, 4);

        let va = VirtualAddress::new(0x0000_4000);
        tlb.enter(&mut cpu, 2, va, tte16k(0x0100_0000), TlbLo::new());
        let slot = cpu.tlb_search(va, 2).unwrap();

        tlb.flush(&mut cpu, va, 2);
        assert_eq!(cpu.tlb_search(va, 2), None);
        assert_eq!(tlb.counters.flushes, 1);
        assert!(tlb.entry(slot).flags.is_empty());
        assert_eq!(tlb.cursor(), slot - 1);

        // the hole is the next victim
        tlb.enter(&mut cpu, 3, va, tte16k(0x0140_0000), TlbLo::new());
        assert_eq!(cpu.tlb_search(va, 3), Some(slot));
    }

    #[test]
    fn flush_of_unresident_context_is_noop() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = engine_with_reserved(&mut cpu, 0);
        tlb.flush(&mut cpu, VirtualAddress::new(0x4000), 0);
        assert_eq!(tlb.counters.flushes, 0);
    }

    #[test]
    fn reference_bit_grants_one_more_sweep() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = engine_with_reserved(&mut cpu, 0);

        // fill every slot; all carry REF
        for i in 0..NTLB {
            tlb.enter(
                &mut cpu,
                2,
                VirtualAddress::new((i as u32) << 14),
                tte16k(0x0100_0000 + ((i as u32) << 14)),
                TlbLo::new(),
            );
        }
        assert_eq!(cpu.valid_count(), NTLB);

        // the next install must still find a victim (stripping REF bits on
        // the way) and the engine must not touch reserved slots
        tlb.enter(
            &mut cpu,
            2,
            VirtualAddress::new(0x0100_0000),
            tte16k(0x0200_0000),
            TlbLo::new(),
        );
        assert_eq!(cpu.valid_count(), NTLB);
        assert!(cpu.tlb_search(VirtualAddress::new(0x0100_0000), 2).is_some());
    }

    #[test]
    fn stack_page_is_never_evicted() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = engine_with_reserved(&mut cpu, 0);

        let stack_va = VirtualAddress::new(0xC1FF_C000);
        cpu.stack_page = stack_va;
        tlb.enter(&mut cpu, KERNEL_PID, stack_va, tte16k(0x0100_0000), TlbLo::new());
        let stack_slot = cpu.tlb_search(stack_va, KERNEL_PID).unwrap();

        // churn far more entries than there are slots
        for i in 0..(4 * NTLB as u32) {
            tlb.enter(
                &mut cpu,
                2,
                VirtualAddress::new(i << 14),
                tte16k(0x0200_0000 + (i << 14)),
                TlbLo::new(),
            );
        }
        assert_eq!(cpu.tlb_search(stack_va, KERNEL_PID), Some(stack_slot));
    }

    #[test]
    fn flush_ctx_only_hits_that_context() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = engine_with_reserved(&mut cpu, 2);

        tlb.enter(&mut cpu, 2, VirtualAddress::new(0x4000), tte16k(0x0100_0000), TlbLo::new());
        tlb.enter(&mut cpu, 3, VirtualAddress::new(0x4000), tte16k(0x0140_0000), TlbLo::new());
        tlb.flush_ctx(&mut cpu, 2);

        assert_eq!(cpu.tlb_search(VirtualAddress::new(0x4000), 2), None);
        assert!(cpu.tlb_search(VirtualAddress::new(0x4000), 3).is_some());
        // reserved entries untouched
        assert!(cpu.slot(0).hi.valid());
    }

    #[test]
    fn mapiodev_finds_reserved_ranges() {
        let mut cpu = EmulatedCpu::new();
        let tlb = engine_with_reserved(&mut cpu, 2);

        let va = tlb
            .mapiodev(&mut cpu, PhysicalAddress::new(0xEF60_0100), 256)
            .expect("covered by slot 0");
        assert_eq!(va.as_u32(), 0xEF60_0100);

        let va = tlb
            .mapiodev(&mut cpu, PhysicalAddress::new(0xEF70_8000), 0x1000)
            .expect("covered by slot 1");
        assert_eq!(va.as_u32(), 0xEF70_8000);

        assert!(tlb.mapiodev(&mut cpu, PhysicalAddress::new(0xEF80_0000), 16).is_none());
        // a range straddling the end of a reserved mapping does not match
        assert!(tlb.mapiodev(&mut cpu, PhysicalAddress::new(0xEF6F_FF00), 0x200).is_none());
    }

    #[test]
    #[should_panic(expected = "too large")]
    fn oversized_reservation_panics() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = TlbEngine::new();
        tlb.reserve(
            &mut cpu,
            PhysicalAddress::new(0),
            VirtualAddress::new(0),
            32 * 1024 * 1024,
            TlbLo::new(),
        );
    }

    #[test]
    #[should_panic(expected = "after bootstrap")]
    fn late_reservation_panics() {
        let mut cpu = EmulatedCpu::new();
        let mut tlb = TlbEngine::new();
        tlb.finish_bootstrap();
        tlb.reserve(
            &mut cpu,
            PhysicalAddress::new(0xEF60_0000),
            VirtualAddress::new(0xEF60_0000),
            1024,
            TlbLo::new(),
        );
    }
}
