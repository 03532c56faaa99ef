//! Variant-typed property values.

use zbus::zvariant::{self, OwnedValue};

/// A typed property value.
///
/// Everything marshalled onto the bus as a property value passes through
/// this type, which covers the subset of D-Bus types that GATT attributes
/// actually use. Arrays are typed so that empty arrays keep a well-defined
/// wire signature.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Value {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    U32(u32),
    Str(String),
    Bytes(Vec<u8>),
    ObjectPath(String),
    Strings(Vec<String>),
    ObjectPaths(Vec<String>),
}

impl Value {
    /// Converts the value into its D-Bus representation.
    ///
    /// # Panics
    ///
    /// Panics if an object path is not a valid D-Bus object path. The tree
    /// builder validates paths before any value reaches the bus.
    #[must_use]
    pub fn to_owned_value(&self) -> OwnedValue {
        fn path(p: &str) -> zvariant::ObjectPath<'static> {
            zvariant::ObjectPath::try_from(p.to_owned()).expect("invalid object path")
        }
        let v: zvariant::Value = match *self {
            Self::Bool(v) => v.into(),
            Self::U8(v) => v.into(),
            Self::I16(v) => v.into(),
            Self::U16(v) => v.into(),
            Self::U32(v) => v.into(),
            Self::Str(ref v) => zvariant::Str::from(v.as_str()).into(),
            Self::Bytes(ref v) => v.clone().into(),
            Self::ObjectPath(ref v) => path(v).into(),
            Self::Strings(ref v) => v.clone().into(),
            Self::ObjectPaths(ref v) => {
                v.iter().map(|p| path(p)).collect::<Vec<_>>().into()
            }
        };
        v.try_into().expect("property values never carry fds")
    }

    /// Returns the contained byte array, converting strings to their UTF-8
    /// bytes and single octets to one-byte arrays.
    #[must_use]
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(v) => Some(v),
            Self::Str(v) => Some(v.into_bytes()),
            Self::U8(v) => Some(vec![v]),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    #[inline]
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    #[inline]
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<u8> for Value {
    #[inline]
    fn from(v: u8) -> Self {
        Self::U8(v)
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_bytes() {
        assert_eq!(Value::from("Hi").into_bytes(), Some(vec![0x48, 0x69]));
        assert_eq!(Value::U8(0x4D).into_bytes(), Some(vec![0x4D]));
        assert_eq!(Value::Bytes(vec![1, 2]).into_bytes(), Some(vec![1, 2]));
        assert_eq!(Value::Bool(true).into_bytes(), None);
    }

    #[test]
    fn owned_round_trip() {
        let v = Value::Str("Acme Inc.".into()).to_owned_value();
        assert_eq!(String::try_from(v).unwrap(), "Acme Inc.");
        let v = Value::U8(78).to_owned_value();
        assert_eq!(u8::try_from(v).unwrap(), 78);
        let v = Value::Bool(true).to_owned_value();
        assert_eq!(bool::try_from(v).unwrap(), true);
    }

    #[test]
    fn empty_arrays_convert() {
        // Empty typed arrays must still produce a valid variant.
        let _ = Value::Strings(Vec::new()).to_owned_value();
        let _ = Value::ObjectPaths(Vec::new()).to_owned_value();
        let _ = Value::Bytes(Vec::new()).to_owned_value();
    }
}
