#![allow(clippy::use_self)]

use bitflags::bitflags;

/// Management command opcodes (mgmt-api.txt, Section "Commands").
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    num_enum::FromPrimitive,
    num_enum::IntoPrimitive,
    strum::Display,
)]
#[non_exhaustive]
#[repr(u16)]
pub enum Opcode {
    #[default]
    None = 0x0000,
    ReadVersion = 0x0001,
    ReadCommands = 0x0002,
    ReadIndexList = 0x0003,
    ReadControllerInfo = 0x0004,
    SetPowered = 0x0005,
    SetDiscoverable = 0x0006,
    SetConnectable = 0x0007,
    SetFastConnectable = 0x0008,
    SetBondable = 0x0009,
    SetLinkSecurity = 0x000A,
    SetSecureSimplePairing = 0x000B,
    SetHighSpeed = 0x000C,
    SetLowEnergy = 0x000D,
    SetDeviceClass = 0x000E,
    SetLocalName = 0x000F,
    SetAdvertising = 0x0029,
    SetBrEdr = 0x002A,
    SetStaticAddress = 0x002B,
}

/// Management event codes (mgmt-api.txt, Section "Events").
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::TryFromPrimitive, strum::Display)]
#[non_exhaustive]
#[repr(u16)]
pub enum EventCode {
    CommandComplete = 0x0001,
    CommandStatus = 0x0002,
    ControllerError = 0x0003,
    IndexAdded = 0x0004,
    IndexRemoved = 0x0005,
    NewSettings = 0x0006,
    ClassOfDeviceChanged = 0x0007,
    LocalNameChanged = 0x0008,
    NewLinkKey = 0x0009,
    NewLongTermKey = 0x000A,
    DeviceConnected = 0x000B,
    DeviceDisconnected = 0x000C,
    ConnectFailed = 0x000D,
    PinCodeRequest = 0x000E,
    UserConfirmationRequest = 0x000F,
    UserPasskeyRequest = 0x0010,
    AuthenticationFailed = 0x0011,
    DeviceFound = 0x0012,
    Discovering = 0x0013,
    DeviceBlocked = 0x0014,
    DeviceUnblocked = 0x0015,
    DeviceUnpaired = 0x0016,
    PasskeyNotify = 0x0017,
}

/// Management command status codes (mgmt-api.txt).
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::FromPrimitive,
    num_enum::IntoPrimitive,
    strum::Display,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    UnknownCommand = 0x01,
    NotConnected = 0x02,
    Failed = 0x03,
    ConnectFailed = 0x04,
    AuthenticationFailed = 0x05,
    NotPaired = 0x06,
    NoResources = 0x07,
    Timeout = 0x08,
    AlreadyConnected = 0x09,
    Busy = 0x0A,
    Rejected = 0x0B,
    NotSupported = 0x0C,
    InvalidParameters = 0x0D,
    Disconnected = 0x0E,
    NotPowered = 0x0F,
    Cancelled = 0x10,
    InvalidIndex = 0x11,
    RfKilled = 0x12,
    AlreadyPaired = 0x13,
    PermissionDenied = 0x14,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Default for Status {
    #[inline]
    fn default() -> Self {
        Self::Success
    }
}

impl Status {
    /// Returns whether the status indicates success.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Discoverable mode for `SetDiscoverable`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Discoverable {
    Off = 0x00,
    General = 0x01,
    Limited = 0x02,
}

/// Advertising mode for `SetAdvertising`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Advertising {
    Off = 0x00,
    On = 0x01,
    Connectable = 0x02,
}

bitflags! {
    /// Controller settings bitfield carried by `ReadControllerInfo` replies
    /// and `NewSettings` events.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Settings: u32 {
        const POWERED = 1 << 0;
        const CONNECTABLE = 1 << 1;
        const FAST_CONNECTABLE = 1 << 2;
        const DISCOVERABLE = 1 << 3;
        const BONDABLE = 1 << 4;
        const LINK_SECURITY = 1 << 5;
        const SSP = 1 << 6;
        const BREDR = 1 << 7;
        const HS = 1 << 8;
        const LE = 1 << 9;
        const ADVERTISING = 1 << 10;
        const SECURE_CONNECTIONS = 1 << 11;
        const DEBUG_KEYS = 1 << 12;
        const PRIVACY = 1 << 13;
        const CONFIGURATION = 1 << 14;
        const STATIC_ADDRESS = 1 << 15;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        assert_eq!(u16::from(Opcode::SetPowered), 0x0005);
        assert_eq!(Opcode::from(0x0029_u16), Opcode::SetAdvertising);
        assert_eq!(Opcode::from(0xFFFE_u16), Opcode::None);
    }

    #[test]
    fn status_catch_all() {
        assert!(Status::from(0x00_u8).is_ok());
        assert_eq!(Status::from(0x08_u8), Status::Timeout);
        assert_eq!(Status::from(0x77_u8), Status::Unknown(0x77));
    }

    #[test]
    fn settings_bits() {
        let s = Settings::from_bits_truncate(0b0110_0000_0001);
        assert_eq!(s, Settings::POWERED | Settings::LE | Settings::ADVERTISING);
    }
}
