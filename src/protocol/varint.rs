use std::fmt;
use std::io::{self, prelude::*};

use super::Error as ProtocolError;


/// A length which is encoded in either 1 or 4 bytes on the wire.
///
/// Values up to 127 use a single byte. Larger values use 4 big-endian bytes
/// with the high bit of the first byte set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VarInt(u32);

impl VarInt {
    /// The bit indicating whether the 4-byte encoding is used.
    const LONG_BIT: u8 = 1 << 7;
    /// The largest value using the 1-byte encoding.
    pub const SHORT_MAX: Self = VarInt(127);
    /// The maximum value a [`VarInt`] can encode.
    pub const MAX: Self = VarInt((1 << 31) - 1);

    /// Returns the number of bytes an encoding starting with `first` takes.
    #[inline]
    #[must_use]
    pub fn len_from_first(first: u8) -> usize {
        if first & Self::LONG_BIT == 0 { 1 } else { 4 }
    }

    /// Returns the number of bytes this [`VarInt`] is encoded in.
    #[inline]
    #[must_use]
    pub fn encoded_len(self) -> usize {
        if self <= Self::SHORT_MAX { 1 } else { 4 }
    }

    /// Decodes a [`VarInt`] from the start of `data`, if it is complete.
    ///
    /// Returns the value and the number of bytes it occupied.
    #[must_use]
    pub fn from_prefix(data: &[u8]) -> Option<(Self, usize)> {
        let len = Self::len_from_first(*data.first()?);
        let mut buf = [0u8; 4];
        buf[4 - len..].copy_from_slice(data.get(..len)?);
        if len == 4 {
            buf[0] &= !Self::LONG_BIT;
        }
        Some((Self(u32::from_be_bytes(buf)), len))
    }

    /// Decodes a [`VarInt`] from the reader's input.
    ///
    /// # Errors
    /// Any errors from [`Read::read_exact`] are forwarded to the caller.
    pub fn read(mut r: impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf[..1])?;
        if Self::len_from_first(buf[0]) == 1 {
            return Ok(buf[0].into());
        }

        r.read_exact(&mut buf[1..])?;
        Ok(Self::from_prefix(&buf).map_or_else(Self::default, |(v, _)| v))
    }

    /// Encodes the [`VarInt`] into the writer's output.
    ///
    /// # Errors
    /// Any errors from [`Write::write_all`] are forwarded to the caller.
    pub fn write(self, mut w: impl Write) -> io::Result<usize> {
        let mut buf = [0; 4];
        let e = self.encode(&mut buf);
        w.write_all(e).and(Ok(e.len()))
    }

    /// Encodes the [`VarInt`] into `buf` and returns the used part of it.
    #[inline]
    pub fn encode(self, buf: &mut [u8; 4]) -> &[u8] {
        *buf = u32::to_be_bytes(self.0);
        let len = self.encoded_len();
        if len == 4 {
            buf[0] |= Self::LONG_BIT;
        }
        &buf[4 - len..]
    }

    /// Converts the [`VarInt`] into a [`usize`], saturating at [`usize::MAX`].
    ///
    /// On lower-end platforms, [`usize`] may be smaller than [`u32`]. Saturating
    /// in these cases is useful for indexing, which is bounded by [`usize::MAX`]
    /// because of addressing limitations anyway.
    #[inline]
    #[must_use]
    pub fn to_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl From<VarInt> for u32 {
    /// Extracts the contained [`u32`].
    #[inline]
    fn from(v: VarInt) -> Self {
        v.0
    }
}

impl From<u8> for VarInt {
    #[inline]
    fn from(v: u8) -> Self {
        Self(v.into())
    }
}

impl From<u16> for VarInt {
    #[inline]
    fn from(v: u16) -> Self {
        Self(v.into())
    }
}

impl TryFrom<u32> for VarInt {
    type Error = ProtocolError;

    /// Converts a [`u32`] into a [`VarInt`], unless the [`u32`] is too large.
    ///
    /// # Errors
    /// Returns an error if the [`u32`] exceeds [`VarInt::MAX`].
    #[inline]
    fn try_from(v: u32) -> Result<Self, Self::Error> {
        if v > Self::MAX.into() {
            Err(ProtocolError::InvalidVarInt)
        } else {
            Ok(VarInt(v))
        }
    }
}

impl TryFrom<usize> for VarInt {
    type Error = ProtocolError;

    /// Converts a [`usize`] into a [`VarInt`], unless the [`usize`] is too large.
    ///
    /// # Errors
    /// Returns an error if the [`usize`] exceeds [`VarInt::MAX`].
    #[inline]
    fn try_from(v: usize) -> Result<Self, Self::Error> {
        match u32::try_from(v) {
            Ok(v) => VarInt::try_from(v),
            Err(_) => Err(ProtocolError::InvalidVarInt),
        }
    }
}


impl fmt::Display for VarInt {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
