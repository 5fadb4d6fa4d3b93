//! Emergency (EMCY) message decoding
//!
//! An emergency frame carries a 16-bit error code, the node's error register (object 0x1001) and
//! five manufacturer specific bytes. Error codes are grouped by their upper byte into classes; the
//! named codes below are the ones defined by CiA-301.

use crate::messages::{CanId, CanMessage, MessageKind, EMCY_BASE};

/// Named CiA-301 emergency error codes
pub mod codes {
    /// Error reset, or no error
    pub const NO_ERROR: u16 = 0x0000;
    /// Generic error
    pub const GENERIC: u16 = 0x1000;
    /// CAN overrun (objects lost)
    pub const CAN_OVERRUN: u16 = 0x8110;
    /// CAN in error passive mode
    pub const CAN_ERROR_PASSIVE: u16 = 0x8120;
    /// Life guard or heartbeat error
    pub const HEARTBEAT_OR_GUARDING: u16 = 0x8130;
    /// Recovered from bus off
    pub const RECOVERED_FROM_BUS_OFF: u16 = 0x8140;
    /// CAN-ID collision
    pub const CAN_ID_COLLISION: u16 = 0x8150;
    /// PDO not processed due to length error
    pub const PDO_LENGTH_ERROR: u16 = 0x8210;
    /// PDO length exceeded
    pub const PDO_LENGTH_EXCEEDED: u16 = 0x8220;
    /// DAM MPDO not processed, destination object not available
    pub const DAM_MPDO_NOT_PROCESSED: u16 = 0x8230;
    /// Unexpected SYNC data length
    pub const UNEXPECTED_SYNC_LENGTH: u16 = 0x8240;
    /// RPDO timeout
    pub const RPDO_TIMEOUT: u16 = 0x8250;
}

/// Get a description of an emergency error code
///
/// Codes without a specific name are described by their class.
pub fn describe(code: u16) -> &'static str {
    use codes::*;
    match code {
        NO_ERROR => "No error",
        CAN_OVERRUN => "CAN overrun",
        CAN_ERROR_PASSIVE => "CAN in error passive mode",
        HEARTBEAT_OR_GUARDING => "Heartbeat or guarding error",
        RECOVERED_FROM_BUS_OFF => "Recovered from bus off",
        CAN_ID_COLLISION => "CAN ID collision",
        PDO_LENGTH_ERROR => "PDO not processed due to length error",
        PDO_LENGTH_EXCEEDED => "PDO length exceeded",
        DAM_MPDO_NOT_PROCESSED => "DAM MPDO not processed",
        UNEXPECTED_SYNC_LENGTH => "Unexpected SYNC data length",
        RPDO_TIMEOUT => "RPDO timeout",
        _ => match code >> 8 {
            0x21 => "Current error, device input side",
            0x22 => "Current error inside the device",
            0x23 => "Current error, device output side",
            0x31 => "Mains voltage error",
            0x32 => "Voltage error inside the device",
            0x33 => "Output voltage error",
            0x41 => "Ambient temperature error",
            0x42 => "Device temperature error",
            0x61 => "Internal software error",
            0x62 => "User software error",
            0x63 => "Data set error",
            0x81 => "Communication error",
            0x82 => "Protocol error",
            0xFF => "Device specific error",
            _ => match code >> 12 {
                0x1 => "Generic error",
                0x2 => "Current error",
                0x3 => "Voltage error",
                0x4 => "Temperature error",
                0x5 => "Device hardware error",
                0x6 => "Device software error",
                0x7 => "Additional modules error",
                0x8 => "Monitoring error",
                0x9 => "External error",
                0xF => "Additional functions error",
                _ => "Unknown error",
            },
        },
    }
}

/// A decoded emergency message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EmergencyEvent {
    /// The node which produced the emergency
    pub node: u8,
    /// The emergency error code
    pub code: u16,
    /// The error register (object 0x1001) at the time of the emergency
    pub register: u8,
    /// Manufacturer specific error data
    pub data: [u8; 5],
}

impl EmergencyEvent {
    /// True if this event signals that all errors have been cleared
    pub fn is_reset(&self) -> bool {
        self.code == codes::NO_ERROR
    }

    /// A description of the error code
    pub fn description(&self) -> &'static str {
        describe(self.code)
    }

    /// Build the frame for this event
    pub fn to_message(&self) -> CanMessage {
        let code = self.code.to_le_bytes();
        let mut data = [0; 8];
        data[0] = code[0];
        data[1] = code[1];
        data[2] = self.register;
        data[3..8].copy_from_slice(&self.data);
        CanMessage::new(CanId::std(EMCY_BASE + self.node as u16), &data)
    }
}

impl core::fmt::Display for EmergencyEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "node {} EMCY 0x{:04X} ({}), register 0x{:02X}",
            self.node,
            self.code,
            self.description(),
            self.register
        )
    }
}

/// Error returned when a frame cannot be decoded as an emergency
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmcyDecodeError {
    /// The identifier is not in the emergency range
    NotEmcy,
    /// The frame carries fewer than 8 bytes
    TooShort,
}

impl core::fmt::Display for EmcyDecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EmcyDecodeError::NotEmcy => write!(f, "Frame is not an emergency message"),
            EmcyDecodeError::TooShort => write!(f, "Emergency frame shorter than 8 bytes"),
        }
    }
}

impl core::error::Error for EmcyDecodeError {}

impl TryFrom<CanMessage> for EmergencyEvent {
    type Error = EmcyDecodeError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let MessageKind::Emcy { node } = MessageKind::classify(&msg) else {
            return Err(EmcyDecodeError::NotEmcy);
        };
        if msg.rtr || msg.dlc < 8 {
            return Err(EmcyDecodeError::TooShort);
        }
        let mut data = [0; 5];
        data.copy_from_slice(&msg.data[3..8]);
        Ok(EmergencyEvent {
            node,
            code: u16::from_le_bytes([msg.data[0], msg.data[1]]),
            register: msg.data[2],
            data,
        })
    }
}
