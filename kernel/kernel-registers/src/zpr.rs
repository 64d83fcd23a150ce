#[cfg(all(feature = "asm", target_arch = "powerpc"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// SPR number of the zone protection register.
pub const SPR_ZPR: u32 = 944;

/// Access mode of one protection zone (2 bits each).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneMode {
    /// No access in problem state; TLB entry permissions apply in
    /// supervisor state.
    Supervisor = 0b00,
    /// TLB entry permissions apply in both states.
    PerEntry = 0b01,
    /// Same as [`ZoneMode::PerEntry`] on the 405 core.
    PerEntryAlt = 0b10,
    /// Full access regardless of TLB entry permissions.
    Unrestricted = 0b11,
}

impl ZoneMode {
    const fn from_bits(v: u32) -> Self {
        match v & 0b11 {
            0b00 => Self::Supervisor,
            0b01 => Self::PerEntry,
            0b10 => Self::PerEntryAlt,
            _ => Self::Unrestricted,
        }
    }
}

/// ZPR — Zone Protection Register (SPR 944).
///
/// Sixteen 2-bit fields, Z0 in the two most significant bits. Each TLB entry
/// selects one zone through its `ZSEL` field; the zone mode decides whether
/// the entry's EX/WR permissions are honored, tightened to supervisor-only,
/// or bypassed entirely.
///
/// A `#[bitfield]` is deliberately not used here: zones are accessed by
/// runtime index, not by name.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Zpr(u32);

impl Zpr {
    /// All zones supervisor-only.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u32 {
        self.0
    }

    const fn shift(zone: u32) -> u32 {
        debug_assert!(zone < 16);
        30 - 2 * zone
    }

    #[inline]
    #[must_use]
    pub const fn zone(self, zone: u32) -> ZoneMode {
        ZoneMode::from_bits(self.0 >> Self::shift(zone))
    }

    #[inline]
    #[must_use]
    pub const fn with_zone(self, zone: u32, mode: ZoneMode) -> Self {
        let shift = Self::shift(zone);
        Self(self.0 & !(0b11 << shift) | ((mode as u32) << shift))
    }
}

impl core::fmt::Debug for Zpr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Zpr(0x{:08X})", self.0)
    }
}

#[cfg(all(feature = "asm", target_arch = "powerpc"))]
impl LoadRegisterUnsafe for Zpr {
    unsafe fn load_unsafe() -> Self {
        let zpr: u32;
        unsafe {
            core::arch::asm!(
                "mfspr {0}, 944",
                out(reg) zpr,
                options(nomem, nostack, preserves_flags)
            );
        }
        Self::from_bits(zpr)
    }
}

#[cfg(all(feature = "asm", target_arch = "powerpc"))]
impl StoreRegisterUnsafe for Zpr {
    unsafe fn store_unsafe(self) {
        let zpr = self.into_bits();
        unsafe {
            core::arch::asm!(
                "mtspr 944, {0}",
                "isync",
                in(reg) zpr,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zone_zero_is_most_significant() {
        let z = Zpr::new().with_zone(0, ZoneMode::Unrestricted);
        assert_eq!(z.into_bits(), 0xC000_0000);
        assert_eq!(z.zone(0), ZoneMode::Unrestricted);
        assert_eq!(z.zone(1), ZoneMode::Supervisor);
    }

    #[test]
    fn pmap_boot_value() {
        // Z0 supervisor, Z1/Z2 per-entry, Z3 unrestricted.
        let z = Zpr::new()
            .with_zone(1, ZoneMode::PerEntry)
            .with_zone(2, ZoneMode::PerEntryAlt)
            .with_zone(3, ZoneMode::Unrestricted);
        assert_eq!(z.into_bits(), 0x1B00_0000);
    }
}
