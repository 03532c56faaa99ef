//! GATT object tree published to BlueZ.

use std::fmt::{Display, Formatter};

use bitflags::bitflags;

pub use {io::*, model::*};

pub(crate) mod io;
mod model;
pub(crate) mod object;

/// Error type returned by tree construction and validation.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid UUID {uuid:?} for object {name:?}: {source}")]
    InvalidUuid {
        name: String,
        uuid: String,
        source: crate::uuid::ParseUuidError,
    },
    #[error("invalid object name {0:?}")]
    InvalidName(String),
    #[error("invalid include path {0:?}")]
    InvalidIncludePath(String),
    #[error("duplicate object path {0}")]
    DuplicatePath(String),
    #[error("{path}: flags [{flags}] require {what}")]
    MissingHandler {
        path: String,
        flags: Flags,
        what: &'static str,
    },
    #[error("service tree is empty")]
    EmptyTree,
}

/// Common GATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error response sent to a remote request against a published attribute.
///
/// Variants map onto the `org.bluez.Error` namespace that BlueZ relays to
/// the central as ATT protocol errors.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluez.Error")]
#[non_exhaustive]
pub enum Reject {
    #[zbus(error)]
    ZBus(zbus::Error),
    Failed(String),
    InProgress,
    NotPermitted,
    NotAuthorized,
    NotSupported,
    InvalidValueLength,
    InvalidOffset,
}

impl Reject {
    /// Creates a `org.bluez.Error.Failed` rejection with a reason.
    #[inline]
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Result of a remote request against a published attribute.
pub type ReqResult<T> = std::result::Result<T, Reject>;

bitflags! {
    /// Characteristic and descriptor access flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Flags: u16 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const WRITE = 1 << 3;
        const NOTIFY = 1 << 4;
        const INDICATE = 1 << 5;
        const AUTHENTICATED_SIGNED_WRITES = 1 << 6;
        const RELIABLE_WRITE = 1 << 7;
        const WRITABLE_AUXILIARIES = 1 << 8;
        const ENCRYPT_READ = 1 << 9;
        const ENCRYPT_WRITE = 1 << 10;
        const ENCRYPT_AUTHENTICATED_READ = 1 << 11;
        const ENCRYPT_AUTHENTICATED_WRITE = 1 << 12;
        const SECURE_READ = 1 << 13;
        const SECURE_WRITE = 1 << 14;
    }
}

/// Flag bits in wire order paired with their BlueZ string names.
const FLAG_NAMES: [(Flags, &str); 15] = [
    (Flags::BROADCAST, "broadcast"),
    (Flags::READ, "read"),
    (Flags::WRITE_WITHOUT_RESPONSE, "write-without-response"),
    (Flags::WRITE, "write"),
    (Flags::NOTIFY, "notify"),
    (Flags::INDICATE, "indicate"),
    (Flags::AUTHENTICATED_SIGNED_WRITES, "authenticated-signed-writes"),
    (Flags::RELIABLE_WRITE, "reliable-write"),
    (Flags::WRITABLE_AUXILIARIES, "writable-auxiliaries"),
    (Flags::ENCRYPT_READ, "encrypt-read"),
    (Flags::ENCRYPT_WRITE, "encrypt-write"),
    (Flags::ENCRYPT_AUTHENTICATED_READ, "encrypt-authenticated-read"),
    (Flags::ENCRYPT_AUTHENTICATED_WRITE, "encrypt-authenticated-write"),
    (Flags::SECURE_READ, "secure-read"),
    (Flags::SECURE_WRITE, "secure-write"),
];

impl Flags {
    /// Returns the BlueZ string representation of the flag set.
    #[must_use]
    pub fn to_strings(self) -> Vec<String> {
        FLAG_NAMES
            .iter()
            .filter(|&&(f, _)| self.contains(f))
            .map(|&(_, s)| s.to_owned())
            .collect()
    }

    /// Returns whether a write against this flag set requires a method
    /// return. Failing to reply to such a write surfaces to the central as
    /// ATT error 0x0E (unlikely).
    #[inline]
    #[must_use]
    pub const fn write_needs_reply(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_strings().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_names() {
        let f = Flags::READ | Flags::WRITE | Flags::NOTIFY;
        assert_eq!(f.to_strings(), ["read", "write", "notify"]);
        assert_eq!(f.to_string(), "read,write,notify");
        assert_eq!(Flags::empty().to_strings(), Vec::<String>::new());
    }

    #[test]
    fn every_flag_has_a_name() {
        let all = FLAG_NAMES
            .iter()
            .fold(Flags::empty(), |acc, &(f, _)| acc | f);
        assert_eq!(all, Flags::all());
        assert_eq!(Flags::all().to_strings().len(), FLAG_NAMES.len());
    }
}
