//! Definitions for the NMT protocol

/// Possible NMT states for a node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// Bootup (initializing)
    ///
    /// A node never remains in this state, as all nodes should transition automatically into
    /// PreOperational. The bootup message carries this value.
    Bootup = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operational state
    Operational = 5,
    /// Node is awaiting command to enter operation
    PreOperational = 127,
}

impl NmtState {
    /// True if a node in this state serves SDO requests
    pub fn accepts_sdo(&self) -> bool {
        matches!(self, NmtState::PreOperational | NmtState::Operational)
    }

    /// True if a node in this state produces and consumes PDOs
    pub fn accepts_pdo(&self) -> bool {
        matches!(self, NmtState::Operational)
    }

    /// The command which moves a node into this state, if one exists
    pub fn command(&self) -> Option<NmtCommandSpecifier> {
        match self {
            NmtState::Bootup => None,
            NmtState::Stopped => Some(NmtCommandSpecifier::Stop),
            NmtState::Operational => Some(NmtCommandSpecifier::Start),
            NmtState::PreOperational => Some(NmtCommandSpecifier::EnterPreOp),
        }
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Bootup => write!(f, "Bootup"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// An error for [`NmtState::try_from()`]
pub struct InvalidNmtStateError(pub u8);

impl core::fmt::Display for InvalidNmtStateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid NMT state value {}", self.0)
    }
}

impl core::error::Error for InvalidNmtStateError {}

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    /// Attempt to convert a u8 to an NmtState enum
    ///
    /// The top bit is the node guarding toggle bit and is ignored. Fails with
    /// InvalidNmtStateError if the remaining value is not a valid state
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value & 0x7F {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// The NMT commands which can be sent by an NMT master
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Enter Operational
    Start = 1,
    /// Enter Stopped
    Stop = 2,
    /// Enter PreOperational
    EnterPreOp = 0x80,
    /// Reset the application
    ResetApp = 0x81,
    /// Reset communication parameters
    ResetComm = 0x82,
}

impl TryFrom<u8> for NmtCommandSpecifier {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            0x80 => Ok(Self::EnterPreOp),
            0x81 => Ok(Self::ResetApp),
            0x82 => Ok(Self::ResetComm),
            other => Err(other),
        }
    }
}

impl NmtCommandSpecifier {
    /// The state a node reports after executing this command
    ///
    /// Reset commands return [`NmtState::Bootup`], since the node reboots and announces itself
    /// with a bootup message before reaching PreOperational.
    pub fn resulting_state(&self) -> NmtState {
        match self {
            Self::Start => NmtState::Operational,
            Self::Stop => NmtState::Stopped,
            Self::EnterPreOp => NmtState::PreOperational,
            Self::ResetApp | Self::ResetComm => NmtState::Bootup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_bit_is_ignored_when_parsing_state() {
        assert_eq!(Ok(NmtState::Operational), NmtState::try_from(0x85));
        assert_eq!(Ok(NmtState::PreOperational), NmtState::try_from(0x7F));
        assert_eq!(Err(InvalidNmtStateError(3)), NmtState::try_from(3));
    }

    #[test]
    fn traffic_acceptance() {
        assert!(!NmtState::Stopped.accepts_sdo());
        assert!(NmtState::PreOperational.accepts_sdo());
        assert!(!NmtState::PreOperational.accepts_pdo());
        assert!(NmtState::Operational.accepts_pdo());
    }
}
