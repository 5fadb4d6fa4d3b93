//! CAN frame types, and the CANopen messages which can be decoded from them
//!
//! Frames are routed by their identifier. In the predefined connection set, the upper four bits of
//! an 11-bit identifier carry the function code and the lower seven bits carry the node ID, so
//! most traffic can be classified from the identifier alone. PDO identifiers are configurable, so
//! [`MessageKind::Pdo`] is only a hint.

pub use crate::nmt::{NmtCommandSpecifier, NmtState};

/// The COB ID used for NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The COB ID used for the SYNC message
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// The COB ID used for the TIME message
pub const TIME_ID: CanId = CanId::Std(0x100);
/// Base of the emergency COB IDs (plus node ID)
pub const EMCY_BASE: u16 = 0x80;
/// Base of the SDO server response COB IDs (plus node ID)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Base of the SDO server request COB IDs (plus node ID)
pub const SDO_REQ_BASE: u16 = 0x600;
/// Base of the heartbeat / node guarding COB IDs (plus node ID)
pub const HEARTBEAT_BASE: u16 = 0x700;

/// A CAN identifier, either an 11-bit standard ID or a 29-bit extended ID
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A standard 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id & 0x1FFF_FFFF)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id & 0x7FF)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

impl core::fmt::Display for CanId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CanId::Extended(id) => write!(f, "0x{id:08X}x"),
            CanId::Std(id) => write!(f, "0x{id:03X}"),
        }
    }
}

/// A single CAN frame with up to 8 data bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanMessage {
    /// The data payload. Only the first `dlc` bytes are valid
    pub data: [u8; 8],
    /// The number of valid data bytes
    pub dlc: u8,
    /// Remote transmission request flag
    pub rtr: bool,
    /// The frame identifier
    pub id: CanId,
}

impl CanMessage {
    /// Create a new data frame
    ///
    /// Any bytes beyond the eighth are dropped; CAN 2.0 frames cannot carry more.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            data: buf,
            dlc: dlc as u8,
            rtr: false,
            id,
        }
    }

    /// Create a new remote transmission request frame
    pub fn new_rtr(id: CanId, dlc: u8) -> Self {
        Self {
            data: [0; 8],
            dlc: dlc.min(8),
            rtr: true,
            id,
        }
    }

    /// Get the valid portion of the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Get the identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Returns true if this is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// An error reported by a CAN controller in place of a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanError {
    /// The controller reported a bus-off condition
    BusOff,
    /// Any other controller error, with the raw error class bits
    Other(u8),
}

impl CanError {
    /// Create a CanError from the error class bits of a controller error frame
    pub fn from_raw(raw: u8) -> Self {
        const BUS_OFF: u8 = 0x40;
        if raw & BUS_OFF != 0 {
            CanError::BusOff
        } else {
            CanError::Other(raw)
        }
    }
}

impl core::fmt::Display for CanError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CanError::BusOff => write!(f, "CAN controller is bus-off"),
            CanError::Other(raw) => write!(f, "CAN controller error 0x{raw:02X}"),
        }
    }
}

impl core::error::Error for CanError {}

/// The protocol role of a frame, as implied by its identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// NMT command from the master
    NmtCommand,
    /// SYNC message
    Sync,
    /// Emergency message from the given node
    Emcy {
        /// Originating node
        node: u8,
    },
    /// TIME stamp message
    Time,
    /// Possibly a PDO in the predefined connection set
    Pdo,
    /// SDO response from the server of the given node
    SdoResponse {
        /// Responding node
        node: u8,
    },
    /// SDO request for the server of the given node
    SdoRequest {
        /// Addressed node
        node: u8,
    },
    /// Heartbeat, bootup, or node guarding response from the given node
    Heartbeat {
        /// Originating node
        node: u8,
    },
    /// Node guarding remote request addressed to the given node
    GuardRequest {
        /// Addressed node
        node: u8,
    },
    /// Not part of the predefined connection set
    Unknown,
}

impl MessageKind {
    /// Classify a frame by its identifier
    pub fn classify(msg: &CanMessage) -> Self {
        let id = match msg.id {
            CanId::Std(id) => id,
            CanId::Extended(_) => return MessageKind::Unknown,
        };
        let function = id & 0x780;
        let node = (id & 0x7F) as u8;
        match (function, node) {
            (0x000, 0) => MessageKind::NmtCommand,
            (0x080, 0) => MessageKind::Sync,
            (0x080, node) => MessageKind::Emcy { node },
            (0x100, 0) => MessageKind::Time,
            (0x180..=0x500, 1..) => MessageKind::Pdo,
            (SDO_RESP_BASE, 1..) => MessageKind::SdoResponse { node },
            (SDO_REQ_BASE, 1..) => MessageKind::SdoRequest { node },
            (HEARTBEAT_BASE, 1..) if msg.rtr => MessageKind::GuardRequest { node },
            (HEARTBEAT_BASE, 1..) => MessageKind::Heartbeat { node },
            _ => MessageKind::Unknown,
        }
    }
}

/// An NMT command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NmtCommand {
    /// The command to execute
    pub cs: NmtCommandSpecifier,
    /// The addressed node, or 0 for all nodes
    pub node: u8,
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cs as u8, cmd.node])
    }
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageDecodeError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id != NMT_CMD_ID || msg.dlc != 2 || msg.rtr {
            return Err(MessageDecodeError);
        }
        let cs = NmtCommandSpecifier::try_from(msg.data[0]).map_err(|_| MessageDecodeError)?;
        Ok(NmtCommand {
            cs,
            node: msg.data[1],
        })
    }
}

/// A heartbeat, bootup, or node guarding response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Heartbeat {
    /// The node producing the heartbeat
    pub node: u8,
    /// The toggle bit. Only meaningful in node guarding responses
    pub toggle: bool,
    /// The NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(hb: Heartbeat) -> Self {
        let mut byte = hb.state as u8;
        if hb.toggle {
            byte |= 0x80;
        }
        CanMessage::new(CanId::Std(HEARTBEAT_BASE + hb.node as u16), &[byte])
    }
}

impl TryFrom<CanMessage> for Heartbeat {
    type Error = MessageDecodeError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let MessageKind::Heartbeat { node } = MessageKind::classify(&msg) else {
            return Err(MessageDecodeError);
        };
        if msg.dlc != 1 {
            return Err(MessageDecodeError);
        }
        let state = NmtState::try_from(msg.data[0]).map_err(|_| MessageDecodeError)?;
        Ok(Heartbeat {
            node,
            toggle: msg.data[0] & 0x80 != 0,
            state,
        })
    }
}

/// Error returned when a frame does not decode as the requested message type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageDecodeError;

impl core::fmt::Display for MessageDecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame does not decode as the expected message")
    }
}

impl core::error::Error for MessageDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_predefined_connection_set() {
        let kind = |id: u16| MessageKind::classify(&CanMessage::new(CanId::Std(id), &[]));
        assert_eq!(MessageKind::NmtCommand, kind(0));
        assert_eq!(MessageKind::Sync, kind(0x80));
        assert_eq!(MessageKind::Emcy { node: 5 }, kind(0x85));
        assert_eq!(MessageKind::Time, kind(0x100));
        assert_eq!(MessageKind::Pdo, kind(0x185));
        assert_eq!(MessageKind::Pdo, kind(0x505));
        assert_eq!(MessageKind::SdoResponse { node: 5 }, kind(0x585));
        assert_eq!(MessageKind::SdoRequest { node: 5 }, kind(0x605));
        assert_eq!(MessageKind::Heartbeat { node: 5 }, kind(0x705));
        assert_eq!(
            MessageKind::GuardRequest { node: 5 },
            MessageKind::classify(&CanMessage::new_rtr(CanId::Std(0x705), 1))
        );
        assert_eq!(MessageKind::Unknown, kind(0x7E5));
    }

    #[test]
    fn heartbeat_frames() {
        let hb = Heartbeat {
            node: 3,
            toggle: true,
            state: NmtState::Operational,
        };
        let msg: CanMessage = hb.into();
        assert_eq!(CanId::Std(0x703), msg.id);
        assert_eq!(&[0x85], msg.data());
        assert_eq!(Ok(hb), Heartbeat::try_from(msg));
    }

    #[test]
    fn oversized_payload_is_truncated() {
        let msg = CanMessage::new(CanId::std(0x181), &[0; 12]);
        assert_eq!(8, msg.data().len());
    }
}
