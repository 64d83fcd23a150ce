#[cfg(all(feature = "asm", target_arch = "powerpc"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// MSR — Machine State Register (PPC 4xx subset).
///
/// Controls, among other things, external-interrupt enable and address
/// translation. The MMU code cares about three things:
///
/// - `EE` (bit 15): external interrupts. Cleared across TLB writes so no
///   handler can observe a half-written entry.
/// - `IR`/`DR` (bits 5/4): instruction/data relocate. Both cleared means
///   "real mode"; TLB registers may only be rewritten in real mode, and the
///   user-context icache sync runs with `IR` off and `DR` on.
/// - `PR` (bit 14): problem state; never set by this code.
#[bitfield(u32)]
pub struct Msr {
    /// Bits 0–3 — Reserved.
    #[bits(4)]
    pub reserved0: u8,

    /// Bit 4 — DR: Data address translation enable.
    pub dr: bool,

    /// Bit 5 — IR: Instruction address translation enable.
    pub ir: bool,

    /// Bits 6–7 — Reserved.
    #[bits(2)]
    pub reserved1: u8,

    /// Bit 8 — FE1: Floating-point exception mode 1.
    pub fe1: bool,

    /// Bit 9 — DE: Debug interrupt enable.
    pub de: bool,

    /// Bit 10 — Reserved.
    pub reserved2: bool,

    /// Bit 11 — FE0: Floating-point exception mode 0.
    pub fe0: bool,

    /// Bit 12 — ME: Machine check enable.
    pub me: bool,

    /// Bit 13 — FP: Floating-point available.
    pub fp: bool,

    /// Bit 14 — PR: Problem state (user mode when set).
    pub pr: bool,

    /// Bit 15 — EE: External interrupt enable.
    pub ee: bool,

    /// Bit 16 — Reserved.
    pub reserved3: bool,

    /// Bit 17 — CE: Critical interrupt enable.
    pub ce: bool,

    /// Bit 18 — WE: Wait state enable.
    pub we: bool,

    /// Bits 19–31 — Reserved.
    #[bits(13)]
    pub reserved4: u16,
}

impl Msr {
    /// Real mode with all maskable interrupts off; the state TLB writes
    /// require.
    #[must_use]
    pub const fn real_mode() -> Self {
        Self::new()
    }

    /// This value with translation and external interrupts stripped.
    #[must_use]
    pub const fn without_translation(self) -> Self {
        self.with_ir(false).with_dr(false).with_ee(false)
    }
}

#[cfg(all(feature = "asm", target_arch = "powerpc"))]
impl LoadRegisterUnsafe for Msr {
    unsafe fn load_unsafe() -> Self {
        let msr: u32;
        unsafe {
            core::arch::asm!("mfmsr {0}", out(reg) msr, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(msr)
    }
}

#[cfg(all(feature = "asm", target_arch = "powerpc"))]
impl StoreRegisterUnsafe for Msr {
    unsafe fn store_unsafe(self) {
        let msr = self.into_bits();
        unsafe {
            core::arch::asm!(
                "mtmsr {0}",
                "isync",
                in(reg) msr,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}
