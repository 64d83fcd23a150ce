#[cfg(all(feature = "asm", target_arch = "powerpc"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// SPR number of the process ID register.
pub const SPR_PID: u32 = 945;

/// PID — Process ID register (SPR 945).
///
/// The 8-bit MMU context tag. TLB entries are matched against this value on
/// every translated access; the kernel owns PID 1, user address spaces are
/// multiplexed over 2..=255, and PID 0 means "no context".
#[bitfield(u32)]
pub struct Pid {
    /// Bits 0–7 — The translation context.
    pub pid: u8,

    /// Bits 8–31 — Reserved.
    #[bits(24)]
    pub reserved0: u32,
}

impl Pid {
    #[inline]
    #[must_use]
    pub const fn from_ctx(ctx: u8) -> Self {
        Self::new().with_pid(ctx)
    }
}

#[cfg(all(feature = "asm", target_arch = "powerpc"))]
impl LoadRegisterUnsafe for Pid {
    unsafe fn load_unsafe() -> Self {
        let pid: u32;
        unsafe {
            core::arch::asm!(
                "mfspr {0}, 945",
                out(reg) pid,
                options(nomem, nostack, preserves_flags)
            );
        }
        Self::from_bits(pid)
    }
}

#[cfg(all(feature = "asm", target_arch = "powerpc"))]
impl StoreRegisterUnsafe for Pid {
    unsafe fn store_unsafe(self) {
        let pid = self.into_bits();
        unsafe {
            core::arch::asm!(
                "mtspr 945, {0}",
                "isync",
                in(reg) pid,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}
