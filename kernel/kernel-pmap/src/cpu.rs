//! # CPU MMU Primitives
//!
//! The irreducible machine operations behind a small trait: TLB register
//! access, PID-tagged searches, cache maintenance and interrupt-priority
//! sections. Everything above this seam is ordinary, hosted-testable code.
//!
//! Two implementations:
//!
//! - [`Ppc4xxCpu`] issues the real instructions (`tlbwe`, `tlbsx.`, `mtspr`,
//!   cache ops). Only compiled for `powerpc` targets.
//! - [`EmulatedCpu`] models the TLB as an [`NTLB`]-slot associative memory
//!   with a per-slot valid bit and PID tag, and records cache-maintenance
//!   calls for inspection. This is what the test suites drive.

use crate::tte::{TlbHi, TlbLo, TlbSize};
use crate::vmparam::NTLB;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::zpr::Zpr;

/// Saved interrupt-priority state returned by [`CpuMmu::splvm`] and
/// [`CpuMmu::splhigh`]; hand it back to [`CpuMmu::splx`] in LIFO order.
#[derive(Debug, Clone, Copy)]
#[must_use = "dropping an spl token leaves the priority raised"]
pub struct SplToken(u8);

impl SplToken {
    #[inline]
    #[must_use = "construct tokens only to return them from an spl raise"]
    pub const fn new(saved: u8) -> Self {
        Self(saved)
    }

    #[inline]
    #[must_use]
    pub const fn saved(self) -> u8 {
        self.0
    }
}

/// The hardware operations of the software-managed MMU.
///
/// All TLB methods are **interrupt-atomic**: implementations must ensure no
/// interrupt (and no translated access) can observe a half-written entry or
/// a temporarily switched PID.
pub trait CpuMmu {
    /// Rewrite one TLB slot under `ctx`: invalidate the old entry, switch
    /// the PID, write TLB-LO then TLB-HI, restore PID and machine state.
    fn tlb_write(&mut self, slot: usize, ctx: u8, hi: TlbHi, lo: TlbLo);

    /// Read back one slot (`tlbre` pair).
    fn tlb_read(&mut self, slot: usize) -> (TlbHi, TlbLo);

    /// Search for a translation of `va` tagged with `ctx` (`tlbsx.` with a
    /// temporary PID switch); the matching slot index, if any.
    fn tlb_search(&mut self, va: VirtualAddress, ctx: u8) -> Option<usize>;

    /// Program the zone protection register.
    fn set_zones(&mut self, zpr: Zpr);

    /// Write back and invalidate instruction cache for `[pa, pa + len)`,
    /// working through the direct map.
    fn sync_icache(&mut self, pa: PhysicalAddress, len: u32);

    /// The same loop through a user context: instruction translation off,
    /// data translation on, PID set to `ctx` for the duration.
    fn sync_icache_user(&mut self, ctx: u8, va: VirtualAddress, len: u32);

    /// Zero a physical page through the direct map (`dcbz` loop).
    fn zero_page(&mut self, pa: PhysicalAddress);

    /// Copy a physical page and write the destination back to memory.
    fn copy_page(&mut self, src: PhysicalAddress, dst: PhysicalAddress);

    /// Base of the page the current kernel stack lives on. The TLB victim
    /// walker refuses to evict this page's translation.
    fn stack_page(&self) -> VirtualAddress;

    /// Block VM-class interrupts.
    fn splvm(&mut self) -> SplToken;

    /// Block all maskable interrupts.
    fn splhigh(&mut self) -> SplToken;

    /// Restore a saved priority.
    fn splx(&mut self, token: SplToken);
}

/// One entry of the emulated TLB.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmulatedSlot {
    pub hi: TlbHi,
    pub lo: TlbLo,
    pub ctx: u8,
}

/// Software model of the 4xx MMU for hosted tests and bring-up.
#[derive(Debug, Clone)]
pub struct EmulatedCpu {
    slots: [EmulatedSlot; NTLB],
    zpr: Zpr,
    level: u8,
    /// What [`CpuMmu::stack_page`] reports; point it at a mapped kernel page
    /// to exercise the victim walker's stack guard.
    pub stack_page: VirtualAddress,
    /// Recorded [`CpuMmu::sync_icache`] calls.
    pub icache_syncs: Vec<(PhysicalAddress, u32)>,
    /// Recorded [`CpuMmu::sync_icache_user`] calls.
    pub user_icache_syncs: Vec<(u8, VirtualAddress, u32)>,
    /// Recorded [`CpuMmu::zero_page`] calls.
    pub zeroed_pages: Vec<PhysicalAddress>,
    /// Recorded [`CpuMmu::copy_page`] calls.
    pub copied_pages: Vec<(PhysicalAddress, PhysicalAddress)>,
}

impl Default for EmulatedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedCpu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [EmulatedSlot::default(); NTLB],
            zpr: Zpr::new(),
            level: 0,
            // off in the weeds unless a test aims it somewhere real
            stack_page: VirtualAddress::new(0xDFFF_C000),
            icache_syncs: Vec::new(),
            user_icache_syncs: Vec::new(),
            zeroed_pages: Vec::new(),
            copied_pages: Vec::new(),
        }
    }

    #[must_use]
    pub fn slot(&self, i: usize) -> EmulatedSlot {
        self.slots[i]
    }

    /// Number of valid entries.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|s| s.hi.valid()).count()
    }

    /// Valid entries tagged with `ctx`.
    #[must_use]
    pub fn valid_for_ctx(&self, ctx: u8) -> usize {
        self.slots
            .iter()
            .filter(|s| s.hi.valid() && s.ctx == ctx)
            .count()
    }

    /// Current interrupt priority (0 = open, 1 = VM blocked, 2 = all
    /// blocked).
    #[must_use]
    pub fn spl_level(&self) -> u8 {
        self.level
    }

    #[must_use]
    pub fn zones(&self) -> Zpr {
        self.zpr
    }
}

impl CpuMmu for EmulatedCpu {
    fn tlb_write(&mut self, slot: usize, ctx: u8, hi: TlbHi, lo: TlbLo) {
        self.slots[slot] = EmulatedSlot { hi, lo, ctx };
    }

    fn tlb_read(&mut self, slot: usize) -> (TlbHi, TlbLo) {
        (self.slots[slot].hi, self.slots[slot].lo)
    }

    fn tlb_search(&mut self, va: VirtualAddress, ctx: u8) -> Option<usize> {
        self.slots.iter().position(|s| {
            if !s.hi.valid() || s.ctx != ctx {
                return false;
            }
            let mask = !(TlbSize::from_index(s.hi.size()).bytes() - 1);
            va.as_u32() & mask == s.hi.epn().as_u32() & mask
        })
    }

    fn set_zones(&mut self, zpr: Zpr) {
        self.zpr = zpr;
    }

    fn sync_icache(&mut self, pa: PhysicalAddress, len: u32) {
        self.icache_syncs.push((pa, len));
    }

    fn sync_icache_user(&mut self, ctx: u8, va: VirtualAddress, len: u32) {
        self.user_icache_syncs.push((ctx, va, len));
    }

    fn zero_page(&mut self, pa: PhysicalAddress) {
        self.zeroed_pages.push(pa);
    }

    fn copy_page(&mut self, src: PhysicalAddress, dst: PhysicalAddress) {
        self.copied_pages.push((src, dst));
    }

    fn stack_page(&self) -> VirtualAddress {
        self.stack_page
    }

    fn splvm(&mut self) -> SplToken {
        let t = SplToken::new(self.level);
        if self.level < 1 {
            self.level = 1;
        }
        t
    }

    fn splhigh(&mut self) -> SplToken {
        let t = SplToken::new(self.level);
        self.level = 2;
        t
    }

    fn splx(&mut self, token: SplToken) {
        self.level = token.saved();
    }
}

#[cfg(target_arch = "powerpc")]
pub use ppc4xx::Ppc4xxCpu;

#[cfg(target_arch = "powerpc")]
mod ppc4xx {
    use super::{CpuMmu, SplToken};
    use crate::tte::{TlbHi, TlbLo};
    use crate::vmparam::{CACHELINE_SIZE, PAGE_MASK, PAGE_SIZE};
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
    use kernel_registers::zpr::Zpr;
    use kernel_registers::{LoadRegisterUnsafe, Msr, StoreRegisterUnsafe};

    /// The real 4xx MMU. TLB register access runs in real mode with
    /// interrupts masked; a full kernel would route the spl methods to the
    /// interrupt controller's priority mask, here they gate MSR[EE].
    #[derive(Debug, Default)]
    pub struct Ppc4xxCpu;

    impl Ppc4xxCpu {
        #[must_use]
        pub const fn new() -> Self {
            Self
        }
    }

    impl CpuMmu for Ppc4xxCpu {
        fn tlb_write(&mut self, slot: usize, ctx: u8, hi: TlbHi, lo: TlbLo) {
            unsafe {
                core::arch::asm!(
                    "mfmsr {msr}",
                    "li {tmp}, 0",
                    "mtmsr {tmp}",
                    "isync",
                    "tlbwe {tmp}, {slot}, 0", // invalidate the old entry
                    "mfspr {pid}, 945",
                    "mtspr 945, {ctx}",
                    "isync",
                    "tlbwe {lo}, {slot}, 1",
                    "tlbwe {hi}, {slot}, 0",
                    "isync",
                    "mtspr 945, {pid}",
                    "mtmsr {msr}",
                    "isync",
                    msr = out(reg) _,
                    tmp = out(reg) _,
                    pid = out(reg) _,
                    ctx = in(reg) u32::from(ctx),
                    slot = in(reg) slot as u32,
                    lo = in(reg) lo.into_bits(),
                    hi = in(reg) hi.into_bits(),
                    options(nostack, preserves_flags)
                );
            }
        }

        fn tlb_read(&mut self, slot: usize) -> (TlbHi, TlbLo) {
            let (hi, lo): (u32, u32);
            // tlbre of the tag word also loads PID; every caller of this is
            // a reserved entry tagged with the kernel PID, so the side
            // effect is nil.
            unsafe {
                core::arch::asm!(
                    "tlbre {lo}, {slot}, 1",
                    "tlbre {hi}, {slot}, 0",
                    lo = out(reg) lo,
                    hi = out(reg) hi,
                    slot = in(reg) slot as u32,
                    options(nomem, nostack, preserves_flags)
                );
            }
            (TlbHi::from_bits(hi), TlbLo::from_bits(lo))
        }

        fn tlb_search(&mut self, va: VirtualAddress, ctx: u8) -> Option<usize> {
            let (slot, found): (u32, u32);
            unsafe {
                core::arch::asm!(
                    "mfspr {save}, 945",
                    "mfmsr {msr}",
                    "li {slot}, 0",
                    "mtmsr {slot}",
                    "isync",
                    "mtspr 945, {ctx}",
                    "isync",
                    "tlbsx. {slot}, 0, {va}",
                    "isync",
                    "mtspr 945, {save}",
                    "mtmsr {msr}",
                    "isync",
                    "li {found}, 1",
                    "beq 2f",
                    "li {found}, 0",
                    "2:",
                    save = out(reg) _,
                    msr = out(reg) _,
                    slot = out(reg) slot,
                    found = out(reg) found,
                    ctx = in(reg) u32::from(ctx),
                    va = in(reg) va.as_u32(),
                    options(nostack)
                );
            }
            (found != 0).then_some(slot as usize)
        }

        fn set_zones(&mut self, zpr: Zpr) {
            unsafe { zpr.store_unsafe() };
        }

        fn sync_icache(&mut self, pa: PhysicalAddress, len: u32) {
            unsafe {
                core::arch::asm!(
                    "2:",
                    "dcbst 0, {addr}",
                    "icbi 0, {addr}",
                    "add {addr}, {addr}, {line}",
                    "sub. {len}, {len}, {line}",
                    "bgt 2b",
                    "sync",
                    "isync",
                    addr = inout(reg) pa.as_u32() => _,
                    len = inout(reg) len => _,
                    line = in(reg) CACHELINE_SIZE,
                    options(nostack)
                );
            }
        }

        fn sync_icache_user(&mut self, ctx: u8, va: VirtualAddress, len: u32) {
            // icbi goes through the DMMU: instruction translation off, data
            // translation on, PID switched to the target context.
            unsafe {
                core::arch::asm!(
                    "mfmsr {msr}",
                    "li {tmp}, 0x20",
                    "andc {tmp}, {msr}, {tmp}",
                    "ori {tmp}, {tmp}, 0x10",
                    "mtmsr {tmp}",
                    "isync",
                    "mfspr {opid}, 945",
                    "mtspr 945, {ctx}",
                    "isync",
                    "2:",
                    "dcbst 0, {va}",
                    "icbi 0, {va}",
                    "add {va}, {va}, {line}",
                    "sub. {len}, {len}, {line}",
                    "bge 2b",
                    "sync",
                    "mtspr 945, {opid}",
                    "mtmsr {msr}",
                    "isync",
                    msr = out(reg) _,
                    tmp = out(reg) _,
                    opid = out(reg) _,
                    ctx = in(reg) u32::from(ctx),
                    va = inout(reg) va.as_u32() => _,
                    len = inout(reg) len => _,
                    line = in(reg) CACHELINE_SIZE,
                    options(nostack)
                );
            }
        }

        fn zero_page(&mut self, pa: PhysicalAddress) {
            let mut line = pa.as_u32();
            for _ in 0..(PAGE_SIZE / CACHELINE_SIZE) {
                unsafe {
                    core::arch::asm!(
                        "dcbz 0, {0}",
                        in(reg) line,
                        options(nostack, preserves_flags)
                    );
                }
                line += CACHELINE_SIZE;
            }
        }

        fn copy_page(&mut self, src: PhysicalAddress, dst: PhysicalAddress) {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_u32() as usize as *const u8,
                    dst.as_u32() as usize as *mut u8,
                    PAGE_SIZE as usize,
                );
            }
            let mut line = dst.as_u32();
            for _ in 0..(PAGE_SIZE / CACHELINE_SIZE) {
                unsafe {
                    core::arch::asm!(
                        "dcbst 0, {0}",
                        in(reg) line,
                        options(nostack, preserves_flags)
                    );
                }
                line += CACHELINE_SIZE;
            }
            unsafe { core::arch::asm!("sync", options(nomem, nostack, preserves_flags)) };
        }

        fn stack_page(&self) -> VirtualAddress {
            let probe: u32 = 0;
            let addr = core::ptr::addr_of!(probe) as usize as u32;
            VirtualAddress::new(addr & !PAGE_MASK)
        }

        fn splvm(&mut self) -> SplToken {
            let msr = unsafe { Msr::load_unsafe() };
            unsafe { msr.with_ee(false).store_unsafe() };
            SplToken::new(u8::from(msr.ee()))
        }

        fn splhigh(&mut self) -> SplToken {
            self.splvm()
        }

        fn splx(&mut self, token: SplToken) {
            if token.saved() != 0 {
                let msr = unsafe { Msr::load_unsafe() };
                unsafe { msr.with_ee(true).store_unsafe() };
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tte::{TLB_RPN_MASK, Tte};

    fn install(cpu: &mut EmulatedCpu, slot: usize, ctx: u8, va: u32, tte: Tte) {
        let hi = TlbHi::for_entry(VirtualAddress::new(va), tte.size());
        let lo = TlbLo::from_bits((tte.raw() & !TLB_RPN_MASK) | tte.pa().as_u32());
        cpu.tlb_write(slot, ctx, hi, lo);
    }

    #[test]
    fn search_matches_by_context_and_size() {
        let mut cpu = EmulatedCpu::new();
        let tte = Tte::map(PhysicalAddress::new(0x0040_0000), TlbSize::Size16K);
        install(&mut cpu, 7, 2, 0x0000_4000, tte);

        assert_eq!(cpu.tlb_search(VirtualAddress::new(0x0000_4000), 2), Some(7));
        // anywhere inside the 16K page matches
        assert_eq!(cpu.tlb_search(VirtualAddress::new(0x0000_7FFF), 2), Some(7));
        // wrong context or wrong page does not
        assert_eq!(cpu.tlb_search(VirtualAddress::new(0x0000_4000), 3), None);
        assert_eq!(cpu.tlb_search(VirtualAddress::new(0x0000_8000), 2), None);
    }

    #[test]
    fn spl_nesting_restores() {
        let mut cpu = EmulatedCpu::new();
        let a = cpu.splvm();
        assert_eq!(cpu.spl_level(), 1);
        let b = cpu.splhigh();
        assert_eq!(cpu.spl_level(), 2);
        cpu.splx(b);
        assert_eq!(cpu.spl_level(), 1);
        cpu.splx(a);
        assert_eq!(cpu.spl_level(), 0);
    }
}
