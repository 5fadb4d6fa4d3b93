//! Drive state machine model: status word decoding, control word commands and transition planning

use std::collections::VecDeque;

/// States of the CiA-402 power drive state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriveState {
    /// Drive is initializing; leaves on its own
    NotReadyToSwitchOn,
    /// Initialized, high voltage may be applied
    SwitchOnDisabled,
    /// Waiting to be switched on
    ReadyToSwitchOn,
    /// Power stage on, drive function disabled
    SwitchedOn,
    /// Drive function enabled
    OperationEnabled,
    /// Quick stop function is executing or complete
    QuickStopActive,
    /// A fault occurred and the fault reaction is running; leaves on its own
    FaultReactionActive,
    /// Drive is in fault
    Fault,
}

impl DriveState {
    const ALL: [DriveState; 8] = [
        DriveState::NotReadyToSwitchOn,
        DriveState::SwitchOnDisabled,
        DriveState::ReadyToSwitchOn,
        DriveState::SwitchedOn,
        DriveState::OperationEnabled,
        DriveState::QuickStopActive,
        DriveState::FaultReactionActive,
        DriveState::Fault,
    ];

    /// Decode the state from a status word (0x6041)
    ///
    /// Returns None for bit patterns which match no state.
    pub fn from_statusword(sw: u16) -> Option<Self> {
        match (sw & 0x4F, sw & 0x6F) {
            (0x00, _) => Some(DriveState::NotReadyToSwitchOn),
            (0x40, _) => Some(DriveState::SwitchOnDisabled),
            (_, 0x21) => Some(DriveState::ReadyToSwitchOn),
            (_, 0x23) => Some(DriveState::SwitchedOn),
            (_, 0x27) => Some(DriveState::OperationEnabled),
            (_, 0x07) => Some(DriveState::QuickStopActive),
            (0x0F, _) => Some(DriveState::FaultReactionActive),
            (0x08, _) => Some(DriveState::Fault),
            _ => None,
        }
    }

    /// The status word bits which identify the state, as a device reports them
    pub fn statusword_bits(&self) -> u16 {
        match self {
            DriveState::NotReadyToSwitchOn => 0x00,
            DriveState::SwitchOnDisabled => 0x40,
            DriveState::ReadyToSwitchOn => 0x21,
            DriveState::SwitchedOn => 0x23,
            DriveState::OperationEnabled => 0x27,
            DriveState::QuickStopActive => 0x07,
            DriveState::FaultReactionActive => 0x0F,
            DriveState::Fault => 0x08,
        }
    }

    /// True for states the drive leaves without a command
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriveState::NotReadyToSwitchOn | DriveState::FaultReactionActive
        )
    }

    /// True for the fault states
    pub fn is_fault(&self) -> bool {
        matches!(self, DriveState::Fault | DriveState::FaultReactionActive)
    }

    /// States which can be requested with a command sequence
    pub fn is_commandable(&self) -> bool {
        !self.is_transient() && *self != DriveState::Fault
    }
}

impl core::fmt::Display for DriveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            DriveState::NotReadyToSwitchOn => "Not ready to switch on",
            DriveState::SwitchOnDisabled => "Switch on disabled",
            DriveState::ReadyToSwitchOn => "Ready to switch on",
            DriveState::SwitchedOn => "Switched on",
            DriveState::OperationEnabled => "Operation enabled",
            DriveState::QuickStopActive => "Quick stop active",
            DriveState::FaultReactionActive => "Fault reaction active",
            DriveState::Fault => "Fault",
        };
        write!(f, "{s}")
    }
}

/// Device control commands, written to the control word (0x6040)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Transitions 2, 6, 8
    Shutdown,
    /// Transition 3
    SwitchOn,
    /// Transitions 7, 9, 10, 12
    DisableVoltage,
    /// Transitions 7, 10, 11
    QuickStop,
    /// Transition 5
    DisableOperation,
    /// Transitions 4, 16
    EnableOperation,
    /// Transition 15, on the rising edge of bit 7
    FaultReset,
}

impl Command {
    /// The control word value for the command
    pub fn controlword(&self) -> u16 {
        match self {
            Command::Shutdown => 0x06,
            Command::SwitchOn => 0x07,
            Command::DisableVoltage => 0x00,
            Command::QuickStop => 0x02,
            Command::DisableOperation => 0x07,
            Command::EnableOperation => 0x0F,
            Command::FaultReset => 0x80,
        }
    }

    /// The state the command leads to from `from`, if it is valid there
    pub fn apply(&self, from: DriveState) -> Option<DriveState> {
        use DriveState::*;
        match (self, from) {
            (Command::Shutdown, SwitchOnDisabled | SwitchedOn | OperationEnabled) => {
                Some(ReadyToSwitchOn)
            }
            (Command::SwitchOn, ReadyToSwitchOn) => Some(SwitchedOn),
            (Command::EnableOperation, SwitchedOn | QuickStopActive) => Some(OperationEnabled),
            (Command::DisableOperation, OperationEnabled) => Some(SwitchedOn),
            (
                Command::DisableVoltage,
                ReadyToSwitchOn | SwitchedOn | OperationEnabled | QuickStopActive,
            ) => Some(SwitchOnDisabled),
            (Command::QuickStop, ReadyToSwitchOn | SwitchedOn) => Some(SwitchOnDisabled),
            (Command::QuickStop, OperationEnabled) => Some(QuickStopActive),
            (Command::FaultReset, Fault) => Some(SwitchOnDisabled),
            _ => None,
        }
    }
}

const PLANNED_COMMANDS: [Command; 6] = [
    Command::Shutdown,
    Command::SwitchOn,
    Command::EnableOperation,
    Command::DisableOperation,
    Command::DisableVoltage,
    Command::QuickStop,
];

/// Find the shortest command sequence from `from` to `to`
///
/// Each step is the command and the state it leads to. Returns an empty plan if the states are
/// equal, and None if `to` cannot be reached with commands from `from`. Fault reset is never
/// planned; it must be requested explicitly.
pub fn plan(from: DriveState, to: DriveState) -> Option<Vec<(Command, DriveState)>> {
    if from == to {
        return Some(Vec::new());
    }
    if !to.is_commandable() {
        return None;
    }
    let index = |s: DriveState| DriveState::ALL.iter().position(|x| *x == s).unwrap_or(0);
    let mut previous: [Option<(DriveState, Command)>; 8] = [None; 8];
    let mut queue = VecDeque::from([from]);
    let mut visited = [false; 8];
    visited[index(from)] = true;
    while let Some(state) = queue.pop_front() {
        for cmd in PLANNED_COMMANDS {
            let Some(next) = cmd.apply(state) else {
                continue;
            };
            if visited[index(next)] {
                continue;
            }
            visited[index(next)] = true;
            previous[index(next)] = Some((state, cmd));
            if next == to {
                let mut steps = vec![(cmd, next)];
                let mut cur = state;
                while let Some((prev, cmd)) = previous[index(cur)] {
                    steps.push((cmd, cur));
                    cur = prev;
                }
                steps.reverse();
                return Some(steps);
            }
            queue.push_back(next);
        }
    }
    None
}

/// Modes of operation (0x6060 / 0x6061)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationMode {
    /// Profile position
    ProfiledPosition,
    /// Velocity
    Velocity,
    /// Profile velocity
    ProfiledVelocity,
    /// Profile torque
    ProfiledTorque,
    /// Homing
    Homing,
    /// Interpolated position
    InterpolatedPosition,
    /// Cyclic synchronous position
    CyclicSyncPosition,
    /// Cyclic synchronous velocity
    CyclicSyncVelocity,
    /// Cyclic synchronous torque
    CyclicSyncTorque,
}

impl OperationMode {
    /// The value written to 0x6060
    pub fn code(&self) -> i8 {
        match self {
            OperationMode::ProfiledPosition => 1,
            OperationMode::Velocity => 2,
            OperationMode::ProfiledVelocity => 3,
            OperationMode::ProfiledTorque => 4,
            OperationMode::Homing => 6,
            OperationMode::InterpolatedPosition => 7,
            OperationMode::CyclicSyncPosition => 8,
            OperationMode::CyclicSyncVelocity => 9,
            OperationMode::CyclicSyncTorque => 10,
        }
    }

    /// Decode a 0x6061 value; manufacturer specific (negative) and reserved codes give None
    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            1 => OperationMode::ProfiledPosition,
            2 => OperationMode::Velocity,
            3 => OperationMode::ProfiledVelocity,
            4 => OperationMode::ProfiledTorque,
            6 => OperationMode::Homing,
            7 => OperationMode::InterpolatedPosition,
            8 => OperationMode::CyclicSyncPosition,
            9 => OperationMode::CyclicSyncVelocity,
            10 => OperationMode::CyclicSyncTorque,
            _ => return None,
        })
    }

    /// The bit advertising this mode in the supported drive modes bitmap (0x6502)
    pub fn supported_bit(&self) -> u32 {
        let bit = match self {
            OperationMode::ProfiledPosition => 0,
            OperationMode::Velocity => 1,
            OperationMode::ProfiledVelocity => 2,
            OperationMode::ProfiledTorque => 3,
            OperationMode::Homing => 5,
            OperationMode::InterpolatedPosition => 6,
            OperationMode::CyclicSyncPosition => 7,
            OperationMode::CyclicSyncVelocity => 8,
            OperationMode::CyclicSyncTorque => 9,
        };
        1 << bit
    }

    /// True if the bitmap advertises this mode
    pub fn is_supported_by(&self, bitmap: u32) -> bool {
        bitmap & self.supported_bit() != 0
    }
}

impl core::str::FromStr for OperationMode {
    type Err = ();

    /// Parse a mode name such as "PROFILED_VELOCITY" or an abbreviation such as "PV"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Ok(match normalized.as_str() {
            "PROFILED_POSITION" | "PROFILE_POSITION" | "PP" => OperationMode::ProfiledPosition,
            "VELOCITY" | "VL" => OperationMode::Velocity,
            "PROFILED_VELOCITY" | "PROFILE_VELOCITY" | "PV" => OperationMode::ProfiledVelocity,
            "PROFILED_TORQUE" | "PROFILE_TORQUE" | "TQ" | "PT" => OperationMode::ProfiledTorque,
            "HOMING" | "HM" => OperationMode::Homing,
            "INTERPOLATED_POSITION" | "IP" => OperationMode::InterpolatedPosition,
            "CYCLIC_SYNCHRONOUS_POSITION" | "CYCLIC_SYNC_POSITION" | "CSP" => {
                OperationMode::CyclicSyncPosition
            }
            "CYCLIC_SYNCHRONOUS_VELOCITY" | "CYCLIC_SYNC_VELOCITY" | "CSV" => {
                OperationMode::CyclicSyncVelocity
            }
            "CYCLIC_SYNCHRONOUS_TORQUE" | "CYCLIC_SYNC_TORQUE" | "CST" => {
                OperationMode::CyclicSyncTorque
            }
            _ => return Err(()),
        })
    }
}

impl core::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DriveState::*;

    #[test]
    fn statusword_decoding() {
        assert_eq!(Some(NotReadyToSwitchOn), DriveState::from_statusword(0x0000));
        assert_eq!(Some(SwitchOnDisabled), DriveState::from_statusword(0x0250));
        assert_eq!(Some(ReadyToSwitchOn), DriveState::from_statusword(0x0231));
        assert_eq!(Some(SwitchedOn), DriveState::from_statusword(0x0233));
        assert_eq!(Some(OperationEnabled), DriveState::from_statusword(0x1637));
        assert_eq!(Some(QuickStopActive), DriveState::from_statusword(0x0217));
        assert_eq!(Some(FaultReactionActive), DriveState::from_statusword(0x021F));
        assert_eq!(Some(Fault), DriveState::from_statusword(0x0218));
        assert_eq!(None, DriveState::from_statusword(0x0001));
        for s in DriveState::ALL {
            assert_eq!(Some(s), DriveState::from_statusword(s.statusword_bits()));
        }
    }

    #[test]
    fn enable_from_switch_on_disabled_takes_three_steps() {
        assert_eq!(
            Some(vec![
                (Command::Shutdown, ReadyToSwitchOn),
                (Command::SwitchOn, SwitchedOn),
                (Command::EnableOperation, OperationEnabled),
            ]),
            plan(SwitchOnDisabled, OperationEnabled)
        );
    }

    #[test]
    fn plans_downward_and_through_quick_stop() {
        assert_eq!(
            Some(vec![(Command::DisableVoltage, SwitchOnDisabled)]),
            plan(OperationEnabled, SwitchOnDisabled)
        );
        assert_eq!(
            Some(vec![(Command::DisableOperation, SwitchedOn)]),
            plan(OperationEnabled, SwitchedOn)
        );
        let steps = plan(ReadyToSwitchOn, QuickStopActive).unwrap();
        assert_eq!(Some(&(Command::QuickStop, QuickStopActive)), steps.last());
        assert_eq!(3, steps.len());
        assert_eq!(Some(vec![]), plan(SwitchedOn, SwitchedOn));
    }

    #[test]
    fn fault_and_transient_states_are_never_targets() {
        assert_eq!(None, plan(OperationEnabled, Fault));
        assert_eq!(None, plan(SwitchOnDisabled, FaultReactionActive));
        assert_eq!(None, plan(SwitchOnDisabled, NotReadyToSwitchOn));
        // Leaving fault needs an explicit reset
        assert_eq!(None, plan(Fault, SwitchOnDisabled));
    }

    #[test]
    fn mode_bits_and_names() {
        let bitmap = (1 << 0) | (1 << 5) | (1 << 7);
        assert!(OperationMode::ProfiledPosition.is_supported_by(bitmap));
        assert!(OperationMode::Homing.is_supported_by(bitmap));
        assert!(OperationMode::CyclicSyncPosition.is_supported_by(bitmap));
        assert!(!OperationMode::ProfiledVelocity.is_supported_by(bitmap));
        assert_eq!(Ok(OperationMode::ProfiledVelocity), "PROFILED_VELOCITY".parse());
        assert_eq!(Ok(OperationMode::CyclicSyncTorque), "cst".parse());
        assert_eq!(Err(()), "warp".parse::<OperationMode>());
        assert_eq!(Some(OperationMode::Homing), OperationMode::from_code(6));
        assert_eq!(None, OperationMode::from_code(-1));
    }
}
