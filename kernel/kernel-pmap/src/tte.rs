//! # Translation Entries and TLB Words
//!
//! The TTE stored in page tables is laid out so that its low ten bits are
//! exactly the TLB-LO attribute bits. Installing a translation therefore
//! never decodes: the attribute image is masked out of the TTE, the physical
//! base OR-ed on top and the pair written to the entry registers.
//!
//! ```text
//! bit      31              10 9  8  7    4 3 2 1 0
//! TLB-LO:  | RPN             |EX|WR| ZSEL |W|I|M|G|
//! TLB-HI:  | EPN             | SIZE |V|E|U0| res  |   (SIZE at 9..=7, V at 6)
//! ```
//!
//! The TTE has no room of its own for a size field below bit 10, so the size
//! index sits at bits 12..=10, inside what would be RPN space for sub-16K
//! pages. That is fine: page tables only ever hold 16 KiB translations, and
//! the synthesized kernel direct map uses 16 MiB; both leave those bits free.
//! Sub-16K sizes exist solely in reserved TLB entries, which are built from
//! raw words and never pass through a TTE.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// RPN/EPN field mask shared by both TLB words (1 KiB granularity).
pub const TLB_RPN_MASK: u32 = 0xFFFF_FC00;

/// The eight page sizes of the 4xx TLB, in hardware SIZE-field encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TlbSize {
    Size1K = 0,
    Size4K = 1,
    Size16K = 2,
    Size64K = 3,
    Size256K = 4,
    Size1M = 5,
    Size4M = 6,
    Size16M = 7,
}

impl TlbSize {
    /// Page size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u32 {
        1024 << (2 * self.index())
    }

    /// The hardware SIZE-field value.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self as u32
    }

    #[inline]
    #[must_use]
    pub const fn from_index(i: u32) -> Self {
        match i & 0x7 {
            0 => Self::Size1K,
            1 => Self::Size4K,
            2 => Self::Size16K,
            3 => Self::Size64K,
            4 => Self::Size256K,
            5 => Self::Size1M,
            6 => Self::Size4M,
            _ => Self::Size16M,
        }
    }

    /// Smallest supported page size that covers `len` bytes, or `None` when
    /// `len` exceeds 16 MiB.
    #[must_use]
    pub fn for_len(len: u32) -> Option<Self> {
        (0u32..8).map(Self::from_index).find(|sz| len <= sz.bytes())
    }
}

/// Protection zone selected by a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Zone {
    /// Zone 0: no user access, supervisor per entry permissions.
    Privileged = 0,
    /// Zone 1: entry permissions apply in both states.
    User = 1,
}

/// TLB-HI — the tag word of one TLB entry.
#[bitfield(u32)]
pub struct TlbHi {
    /// Bits 0–3 — Reserved.
    #[bits(4)]
    pub reserved0: u8,

    /// Bit 4 — U0: user-defined storage attribute.
    pub u0: bool,

    /// Bit 5 — E: little-endian storage.
    pub endian: bool,

    /// Bit 6 — V: entry valid.
    pub valid: bool,

    /// Bits 7–9 — SIZE: page size index (see [`TlbSize`]).
    #[bits(3)]
    pub size: u32,

    /// Bits 10–31 — EPN: effective page number.
    #[bits(22)]
    epn_10_31: u32,
}

impl TlbHi {
    /// The tag word installing `va` at size `sz`.
    #[inline]
    #[must_use]
    pub const fn for_entry(va: VirtualAddress, sz: TlbSize) -> Self {
        Self::new()
            .with_valid(true)
            .with_size(sz.index())
            .with_epn_10_31(va.as_u32() >> 10)
    }

    /// The effective page number as an address.
    #[inline]
    #[must_use]
    pub const fn epn(self) -> VirtualAddress {
        VirtualAddress::new(self.epn_10_31() << 10)
    }
}

/// TLB-LO — the data word of one TLB entry.
#[bitfield(u32)]
pub struct TlbLo {
    /// Bit 0 — G: guarded (no speculative access).
    pub guarded: bool,

    /// Bit 1 — M: memory coherent (unused on this core).
    pub coherent: bool,

    /// Bit 2 — I: cache inhibited.
    pub inhibited: bool,

    /// Bit 3 — W: write-through.
    pub write_through: bool,

    /// Bits 4–7 — ZSEL: protection zone select.
    #[bits(4)]
    pub zsel: u8,

    /// Bit 8 — WR: writable.
    pub writable: bool,

    /// Bit 9 — EX: executable.
    pub executable: bool,

    /// Bits 10–31 — RPN: real page number.
    #[bits(22)]
    rpn_10_31: u32,
}

impl TlbLo {
    /// The real page number as an address.
    #[inline]
    #[must_use]
    pub const fn rpn(self) -> PhysicalAddress {
        PhysicalAddress::new(self.rpn_10_31() << 10)
    }
}

/// Translation table entry: one word per mapping, 0 meaning "no mapping".
///
/// Not a `#[bitfield]`: the RPN width depends on the size field, which a
/// static layout cannot express.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Tte(u32);

impl Tte {
    /// No mapping.
    pub const EMPTY: Self = Self(0);

    const G: u32 = 0x0000_0001;
    const I: u32 = 0x0000_0004;
    const W: u32 = 0x0000_0008;
    const ZSEL_SHIFT: u32 = 4;
    const ZSEL_MASK: u32 = 0x0000_00F0;
    const WR: u32 = 0x0000_0100;
    const EX: u32 = 0x0000_0200;
    const SZ_SHIFT: u32 = 10;
    const SZ_MASK: u32 = 0x0000_1C00;

    /// RPN mask for a given page size: sizes grow by factors of four, each
    /// step freeing two more low RPN bits.
    #[inline]
    #[must_use]
    pub const fn rpn_mask(sz: TlbSize) -> u32 {
        !((1u32 << (10 + 2 * sz.index())) - 1)
    }

    /// A fresh entry translating to `pa` at size `sz`, no permissions.
    #[inline]
    #[must_use]
    pub const fn map(pa: PhysicalAddress, sz: TlbSize) -> Self {
        Self((pa.as_u32() & Self::rpn_mask(sz)) | (sz.index() << Self::SZ_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> TlbSize {
        TlbSize::from_index((self.0 & Self::SZ_MASK) >> Self::SZ_SHIFT)
    }

    /// The translated physical base (masked by this entry's size).
    #[inline]
    #[must_use]
    pub const fn pa(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & Self::rpn_mask(self.size()))
    }

    /// The TLB-LO attribute image (everything below the RPN field).
    #[inline]
    #[must_use]
    pub const fn attr_bits(self) -> u32 {
        self.0 & !TLB_RPN_MASK
    }

    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        self.0 & Self::WR != 0
    }

    #[inline]
    #[must_use]
    pub const fn executable(self) -> bool {
        self.0 & Self::EX != 0
    }

    #[inline]
    #[must_use]
    pub const fn inhibited(self) -> bool {
        self.0 & Self::I != 0
    }

    #[inline]
    #[must_use]
    pub const fn guarded(self) -> bool {
        self.0 & Self::G != 0
    }

    #[inline]
    #[must_use]
    pub const fn write_through(self) -> bool {
        self.0 & Self::W != 0
    }

    #[inline]
    #[must_use]
    pub const fn zone_sel(self) -> u8 {
        ((self.0 & Self::ZSEL_MASK) >> Self::ZSEL_SHIFT) as u8
    }

    #[inline]
    #[must_use]
    pub const fn with_writable(self, on: bool) -> Self {
        self.with_bit(Self::WR, on)
    }

    #[inline]
    #[must_use]
    pub const fn with_executable(self, on: bool) -> Self {
        self.with_bit(Self::EX, on)
    }

    #[inline]
    #[must_use]
    pub const fn with_inhibited(self, on: bool) -> Self {
        self.with_bit(Self::I, on)
    }

    #[inline]
    #[must_use]
    pub const fn with_guarded(self, on: bool) -> Self {
        self.with_bit(Self::G, on)
    }

    #[inline]
    #[must_use]
    pub const fn with_write_through(self, on: bool) -> Self {
        self.with_bit(Self::W, on)
    }

    #[inline]
    #[must_use]
    pub const fn with_zone(self, zone: Zone) -> Self {
        Self(self.0 & !Self::ZSEL_MASK | ((zone as u32) << Self::ZSEL_SHIFT))
    }

    const fn with_bit(self, bit: u32, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }
}

impl core::fmt::Debug for Tte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            return f.write_str("Tte(empty)");
        }
        write!(
            f,
            "Tte({:?}/{:?}{}{}{}{}{} z{})",
            self.pa(),
            self.size(),
            if self.writable() { " WR" } else { "" },
            if self.executable() { " EX" } else { "" },
            if self.inhibited() { " I" } else { "" },
            if self.guarded() { " G" } else { "" },
            if self.write_through() { " W" } else { "" },
            self.zone_sel(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_table() {
        let expected = [
            1024, 4096, 16384, 65536, 262_144, 1_048_576, 4_194_304, 16_777_216,
        ];
        for (i, want) in expected.into_iter().enumerate() {
            assert_eq!(TlbSize::from_index(i as u32).bytes(), want);
        }
    }

    #[test]
    fn for_len_rounds_up() {
        assert_eq!(TlbSize::for_len(1), Some(TlbSize::Size1K));
        assert_eq!(TlbSize::for_len(1024), Some(TlbSize::Size1K));
        assert_eq!(TlbSize::for_len(1025), Some(TlbSize::Size4K));
        assert_eq!(TlbSize::for_len(1024 * 1024), Some(TlbSize::Size1M));
        assert_eq!(TlbSize::for_len(16 * 1024 * 1024), Some(TlbSize::Size16M));
        assert_eq!(TlbSize::for_len(16 * 1024 * 1024 + 1), None);
    }

    #[test]
    fn tte_roundtrip_16k() {
        let tte = Tte::map(PhysicalAddress::new(0x0123_4567), TlbSize::Size16K)
            .with_zone(Zone::User)
            .with_writable(true);
        assert_eq!(tte.pa().as_u32(), 0x0123_4000);
        assert_eq!(tte.size(), TlbSize::Size16K);
        assert!(tte.writable());
        assert!(!tte.executable());
        assert_eq!(tte.zone_sel(), 1);
    }

    #[test]
    fn tte_roundtrip_16m() {
        let tte = Tte::map(PhysicalAddress::new(0x0123_4567), TlbSize::Size16M);
        assert_eq!(tte.pa().as_u32(), 0x0100_0000);
        assert_eq!(tte.size(), TlbSize::Size16M);
    }

    #[test]
    fn attr_image_matches_tlb_lo() {
        let tte = Tte::map(PhysicalAddress::new(0x0040_0000), TlbSize::Size16K)
            .with_zone(Zone::Privileged)
            .with_writable(true)
            .with_executable(true)
            .with_write_through(true);
        let lo = TlbLo::from_bits((tte.raw() & !TLB_RPN_MASK) | tte.pa().as_u32());
        assert!(lo.writable());
        assert!(lo.executable());
        assert!(lo.write_through());
        assert!(!lo.inhibited());
        assert_eq!(lo.zsel(), 0);
        assert_eq!(lo.rpn().as_u32(), 0x0040_0000);
    }

    #[test]
    fn hi_word_layout() {
        let hi = TlbHi::for_entry(VirtualAddress::new(0xC000_4000), TlbSize::Size16K);
        assert!(hi.valid());
        assert_eq!(hi.size(), TlbSize::Size16K.index());
        assert_eq!(hi.epn().as_u32(), 0xC000_4000);
        // V = bit 6, SIZE at bits 7..=9
        assert_eq!(hi.into_bits() & 0x7F0, 0x40 | (2 << 7));
    }
}
