//! Bluetooth UUIDs.

use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU128;
use std::str::FromStr;

const SHIFT: u32 = u128::BITS - u32::BITS;
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const MASK_32: u128 = !((u32::MAX as u128) << SHIFT);

/// 16-, 32-, or 128-bit UUID stored in canonical 128-bit form.
///
/// Short SIG-assigned forms are expanded over the Bluetooth Base UUID
/// `0000xxxx-0000-1000-8000-00805f9b34fb`. [`Display`] always renders the
/// canonical lowercase dashed form, so parsing a displayed UUID is the
/// identity.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid(NonZeroU128);

impl Uuid {
    /// Creates a UUID from a `u128`.
    #[inline]
    #[must_use]
    pub const fn new(v: u128) -> Option<Self> {
        match NonZeroU128::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Creates a UUID from a 16-bit SIG-assigned alias.
    #[inline]
    #[must_use]
    pub const fn from_u16(v: u16) -> Self {
        Self::from_u32(v as u32)
    }

    /// Creates a UUID from a 32-bit SIG-assigned alias.
    #[inline]
    #[must_use]
    pub const fn from_u32(v: u32) -> Self {
        // SAFETY: BASE makes the value non-zero for any v
        unsafe { Self(NonZeroU128::new_unchecked((v as u128) << SHIFT | BASE)) }
    }

    /// Converts an assigned 16-bit SIG UUID to `u16`. This is mutually
    /// exclusive with `as_u128`.
    #[inline]
    #[must_use]
    pub fn as_u16(self) -> Option<u16> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u32;
        (self.0.get() & MASK_32 == BASE && v != 0 && v <= u32::from(u16::MAX)).then_some(v as u16)
    }

    /// Returns the canonical 128-bit value.
    #[inline]
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.get()
    }
}

impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn hex(s: &str) -> Result<u128, ParseUuidError> {
            u128::from_str_radix(s, 16).map_err(|_| ParseUuidError::InvalidDigit)
        }
        let v = match s.len() {
            // Short SIG forms ("2A29", "0000B001")
            4 | 8 => {
                #[allow(clippy::cast_possible_truncation)]
                return Ok(Self::from_u32(hex(s)? as u32));
            }
            36 => {
                let mut v: u128 = 0;
                for (i, part) in s.split('-').enumerate() {
                    let bits = match (i, part.len()) {
                        (0, 8) => 32,
                        (1..=3, 4) => 16,
                        (4, 12) => 48,
                        _ => return Err(ParseUuidError::InvalidFormat),
                    };
                    v = v << bits | hex(part)?;
                }
                v
            }
            _ => return Err(ParseUuidError::InvalidFormat),
        };
        Self::new(v).ok_or(ParseUuidError::Nil)
    }
}

impl Debug for Uuid {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Uuid {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let v = self.0.get();
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            (v & ((1 << 48) - 1)) as u64
        )
    }
}

impl From<Uuid> for u128 {
    #[inline]
    fn from(u: Uuid) -> Self {
        u.0.get()
    }
}

/// Error returned when parsing a malformed UUID.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ParseUuidError {
    #[error("invalid UUID format")]
    InvalidFormat,
    #[error("invalid hex digit")]
    InvalidDigit,
    #[error("nil UUID")]
    Nil,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_expansion() {
        let u: Uuid = "2A19".parse().unwrap();
        assert_eq!(u.to_string(), "00002a19-0000-1000-8000-00805f9b34fb");
        assert_eq!(u.as_u16(), Some(0x2A19));
        assert_eq!(u, Uuid::from_u16(0x2A19));

        let u: Uuid = "0000B001".parse().unwrap();
        assert_eq!(u.to_string(), "0000b001-0000-1000-8000-00805f9b34fb");
        assert_eq!(u.as_u16(), None);
    }

    #[test]
    fn normalization_is_idempotent() {
        for s in ["180A", "0000B003", "00000002-1E3C-FAD4-74E2-97A033F1BFAA"] {
            let once: Uuid = s.parse().unwrap();
            let twice: Uuid = once.to_string().parse().unwrap();
            assert_eq!(once, twice);
            assert_eq!(once.to_string(), twice.to_string());
        }
    }

    #[test]
    fn full_form() {
        let u: Uuid = "00000001-1E3C-FAD4-74E2-97A033F1BFAA".parse().unwrap();
        assert_eq!(u.to_string(), "00000001-1e3c-fad4-74e2-97a033f1bfaa");
        assert_eq!(u.as_u16(), None);
        assert_eq!(u128::from(u), 0x00000001_1E3C_FAD4_74E2_97A033F1BFAA);
    }

    #[test]
    fn rejects_malformed() {
        for s in ["", "2A1", "2A199", "xyz4", "00000001-1E3C-FAD4-74E2", "00000001_1E3C_FAD4_74E2_97A033F1BFAA"] {
            assert!(s.parse::<Uuid>().is_err(), "{s:?}");
        }
        assert!("00000000-0000-0000-0000-000000000000".parse::<Uuid>().is_err());
    }
}
