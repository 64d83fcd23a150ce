use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u32;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 16 KiB page (16384 bytes), the VM page granularity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size16K;
impl sealed::Sealed for Size16K {}
impl PageSize for Size16K {
    const SIZE: u32 = 16 * 1024;
    const SHIFT: u32 = 14;

    fn as_str() -> &'static str {
        "16K"
    }
}

/// 16 MiB page (`16_777_216` bytes), used for the kernel direct map.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size16M;
impl sealed::Sealed for Size16M {}
impl PageSize for Size16M {
    const SIZE: u32 = 16 * 1024 * 1024;
    const SHIFT: u32 = 24;

    fn as_str() -> &'static str {
        "16M"
    }
}

impl fmt::Display for Size16K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Display for Size16M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size16K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

impl fmt::Debug for Size16M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}
