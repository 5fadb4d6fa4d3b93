//! CiA-402 drive profile
//!
//! A [`Drive`] moves a remote drive through the power state machine by writing control word
//! commands and confirming each step from the status word. The words travel over a
//! [`ParameterChannel`], either SDO or a pair of PDOs, so the state machine logic does not care
//! which is used.
//!
//! ```ignore
//! let drive = node.drive(SdoChannel::new(node.sdo().clone()));
//! drive.set_operation_mode(OperationMode::ProfiledPosition, timeout).await?;
//! drive.request_state(DriveState::OperationEnabled, timeout).await?;
//! ```

mod channel;
mod factors;
mod state;

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use canmaster_common::{constants::object_ids, objects::Value};
use snafu::{ResultExt, Snafu};
use tokio::time::Instant;

use crate::{pdo::PdoError, sdo_client::SdoClient, sdo_client::SdoClientError};

pub use channel::{AnyChannel, ParameterChannel, PdoChannel, SdoChannel};
pub use factors::{Factors, Polarity, ScalingFactor};
pub use state::{plan, Command, DriveState, OperationMode};

/// Default interval between status word polls while waiting for a state
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors returned by [`Drive`] operations
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Cia402Error {
    /// The status word did not reach the expected state in time
    #[snafu(display("Timed out waiting for {expected}"))]
    Timeout {
        /// The awaited state
        expected: DriveState,
    },
    /// The drive reported a fault while a state was being requested
    #[snafu(display("Drive entered {state}"))]
    DriveFault {
        /// The fault state reported
        state: DriveState,
    },
    /// The state cannot be requested
    #[snafu(display("{state} cannot be requested"))]
    InvalidTarget {
        /// The rejected target
        state: DriveState,
    },
    /// No command sequence leads to the target
    #[snafu(display("No transition from {from} to {to}"))]
    NoPath {
        /// The current state
        from: DriveState,
        /// The requested state
        to: DriveState,
    },
    /// The status word matches no state
    #[snafu(display("Status word 0x{value:04X} matches no drive state"))]
    InvalidStatusword {
        /// The status word
        value: u16,
    },
    /// The drive does not advertise the mode in 0x6502
    #[snafu(display("Operation mode {mode} is not supported by the drive"))]
    UnsupportedMode {
        /// The requested mode
        mode: OperationMode,
    },
    /// The mode display did not confirm the requested mode in time
    #[snafu(display("Drive did not confirm mode {mode}"))]
    ModeNotConfirmed {
        /// The requested mode
        mode: OperationMode,
    },
    /// A PDO channel needs the object mapped
    #[snafu(display("Object 0x{index:04X} is not mapped in the PDO"))]
    NotMapped {
        /// The missing object
        index: u16,
    },
    /// A factor object holds a zero numerator or divisor
    #[snafu(display("Factor 0x{index:04X} has a zero numerator or divisor"))]
    InvalidFactor {
        /// The factor object
        index: u16,
    },
    /// A value of the wrong type was found in the dictionary
    #[snafu(display("Object 0x{index:04X} holds unexpected value {value}"))]
    UnexpectedType {
        /// The object
        index: u16,
        /// The value found
        value: String,
    },
    /// SDO access failed
    #[snafu(display("{source}"))]
    Sdo {
        /// The SDO error
        source: SdoClientError,
    },
    /// PDO access failed
    #[snafu(display("{source}"))]
    Pdo {
        /// The PDO error
        source: PdoError,
    },
}

/// Result alias for drive operations
pub type Result<T> = std::result::Result<T, Cia402Error>;

/// A CiA-402 drive on a remote node
///
/// Every [`Drive`] created from the same node shares one request lock, so concurrent state
/// requests are executed one after another.
#[derive(Clone, Debug)]
pub struct Drive<C: ParameterChannel = AnyChannel> {
    channel: C,
    sdo: SdoClient,
    lock: Arc<tokio::sync::Mutex<()>>,
    supported_modes: Arc<Mutex<Option<u32>>>,
    factors: Arc<Mutex<Factors>>,
    poll_interval: Duration,
}

impl<C: ParameterChannel> Drive<C> {
    pub(crate) fn new(channel: C, sdo: SdoClient, lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        Self {
            channel,
            sdo,
            lock,
            supported_modes: Arc::new(Mutex::new(None)),
            factors: Arc::new(Mutex::new(Factors::default())),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the status word polling interval used while waiting for states
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// The channel carrying the control and status words
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Read the status word and decode the drive state
    pub async fn state(&self) -> Result<DriveState> {
        let sw = self.channel.read_statusword().await?;
        DriveState::from_statusword(sw).ok_or(Cia402Error::InvalidStatusword { value: sw })
    }

    /// Write a single command without waiting for its effect
    pub async fn send_command(&self, command: Command) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.channel.write_controlword(command.controlword()).await
    }

    /// Move the drive to `target`, confirming each intermediate state
    ///
    /// The control word of each step is written only after the previous step is confirmed by the
    /// status word. If the drive reports a fault at any point the request fails with
    /// [`Cia402Error::DriveFault`] and no further commands are sent. `timeout` applies to the
    /// whole sequence.
    pub async fn request_state(&self, target: DriveState, timeout: Duration) -> Result<()> {
        if !target.is_commandable() {
            return InvalidTargetSnafu { state: target }.fail();
        }
        let _guard = self.lock.lock().await;
        let deadline = Instant::now() + timeout;

        let mut current = self.settle(deadline, target).await?;
        while current != target {
            let steps = state::plan(current, target).ok_or(Cia402Error::NoPath {
                from: current,
                to: target,
            })?;
            let Some(&(command, next)) = steps.first() else {
                break;
            };
            log::debug!("Drive {current} -> {next} with {command:?}");
            self.channel
                .write_controlword(command.controlword())
                .await?;
            current = self.wait_for(next, deadline).await?;
        }
        Ok(())
    }

    /// Read the state, waiting out transient states, and fail on faults
    async fn settle(&self, deadline: Instant, target: DriveState) -> Result<DriveState> {
        loop {
            let state = self.state().await?;
            if state.is_fault() {
                return DriveFaultSnafu { state }.fail();
            }
            if !state.is_transient() {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return TimeoutSnafu { expected: target }.fail();
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until the drive reports `expected`
    async fn wait_for(&self, expected: DriveState, deadline: Instant) -> Result<DriveState> {
        loop {
            let state = self.state().await?;
            if state == expected {
                return Ok(state);
            }
            if state.is_fault() {
                return DriveFaultSnafu { state }.fail();
            }
            if Instant::now() >= deadline {
                return TimeoutSnafu { expected }.fail();
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Clear a fault with a rising edge on the fault reset bit
    ///
    /// Waits for the drive to leave the fault state, then clears the control word.
    pub async fn fault_reset(&self, timeout: Duration) -> Result<()> {
        let _guard = self.lock.lock().await;
        let deadline = Instant::now() + timeout;
        self.channel
            .write_controlword(Command::DisableVoltage.controlword())
            .await?;
        self.channel
            .write_controlword(Command::FaultReset.controlword())
            .await?;
        loop {
            let state = self.state().await?;
            if !state.is_fault() {
                break;
            }
            if Instant::now() >= deadline {
                return TimeoutSnafu {
                    expected: DriveState::SwitchOnDisabled,
                }
                .fail();
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        self.channel
            .write_controlword(Command::DisableVoltage.controlword())
            .await
    }

    /// Read the supported drive modes bitmap (0x6502) and cache it
    pub async fn read_supported_modes(&self) -> Result<u32> {
        let bitmap = self
            .sdo
            .read_u32(object_ids::SUPPORTED_DRIVE_MODES, 0)
            .await
            .context(SdoSnafu)?;
        *self
            .supported_modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(bitmap);
        Ok(bitmap)
    }

    /// The cached bitmap, or the one advertised in the node's dictionary
    fn known_modes(&self) -> Option<u32> {
        let mut cached = self
            .supported_modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if cached.is_none() {
            if let Some(Value::U32(bitmap)) =
                self.sdo.last_known(object_ids::SUPPORTED_DRIVE_MODES, 0)
            {
                *cached = Some(bitmap);
            }
        }
        *cached
    }

    /// Check a mode against the supported modes bitmap
    ///
    /// The bitmap comes from the node's dictionary. It is read from the drive only when the
    /// dictionary does not describe 0x6502.
    pub async fn is_mode_supported(&self, mode: OperationMode) -> Result<bool> {
        let bitmap = match self.known_modes() {
            Some(b) => b,
            None => self.read_supported_modes().await?,
        };
        Ok(mode.is_supported_by(bitmap))
    }

    /// Select a mode of operation and wait for the drive to display it
    ///
    /// A mode the drive does not advertise is rejected before anything is written. When the
    /// node's dictionary describes 0x6502 the check sends no frame at all.
    pub async fn set_operation_mode(&self, mode: OperationMode, timeout: Duration) -> Result<()> {
        if !self.is_mode_supported(mode).await? {
            return UnsupportedModeSnafu { mode }.fail();
        }
        let _guard = self.lock.lock().await;
        self.sdo
            .write_i8(object_ids::MODES_OF_OPERATION, 0, mode.code())
            .await
            .context(SdoSnafu)?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.operation_mode().await? == Some(mode) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return ModeNotConfirmedSnafu { mode }.fail();
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// The factor group last read from or written to the drive; unity until then
    pub fn factors(&self) -> Factors {
        *self.factors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the factor group (0x607E, 0x608F to 0x6097) from the drive
    pub async fn read_factors(&self) -> Result<Factors> {
        let factors = Factors::read(&self.sdo).await?;
        log::debug!("Drive factors: {factors:?}");
        *self.factors.lock().unwrap_or_else(PoisonError::into_inner) = factors;
        Ok(factors)
    }

    /// Write a factor group to the drive
    pub async fn write_factors(&self, factors: Factors) -> Result<()> {
        factors.write(&self.sdo).await?;
        *self.factors.lock().unwrap_or_else(PoisonError::into_inner) = factors;
        Ok(())
    }

    /// Read the mode of operation display (0x6061)
    ///
    /// Returns None for manufacturer specific or reserved modes.
    pub async fn operation_mode(&self) -> Result<Option<OperationMode>> {
        let code = self
            .sdo
            .read_i8(object_ids::MODES_OF_OPERATION_DISPLAY, 0)
            .await
            .context(SdoSnafu)?;
        Ok(OperationMode::from_code(code))
    }
}
