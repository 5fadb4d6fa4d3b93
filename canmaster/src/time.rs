//! TIME producer

use canmaster_common::{
    messages::{CanMessage, TIME_ID},
    TimeOfDay,
};
use snafu::{ResultExt, Snafu};

use crate::bus::{BusError, BusHandle};

/// Errors sending a TIME message
#[derive(Debug, Snafu)]
pub enum TimeError {
    /// The system clock is before the CANopen epoch
    #[snafu(display("System time cannot be represented as a TIME_OF_DAY"))]
    Clock,
    /// Sending failed
    #[snafu(display("{source}"))]
    Bus {
        /// The underlying bus error
        source: BusError,
    },
}

/// Produces TIME messages on COB-ID 0x100
#[derive(Clone, Debug)]
pub struct TimeProducer {
    bus: BusHandle,
}

impl TimeProducer {
    pub(crate) fn new(bus: BusHandle) -> Self {
        Self { bus }
    }

    /// Send a TIME message carrying `time`, or the current system time if None
    pub async fn transmit(&self, time: Option<TimeOfDay>) -> Result<(), TimeError> {
        let time = match time {
            Some(t) => t,
            None => TimeOfDay::from_system_time(std::time::SystemTime::now())
                .map_err(|_| TimeError::Clock)?,
        };
        self.bus
            .send(CanMessage::new(TIME_ID, &time.to_le_bytes()))
            .await
            .context(BusSnafu)
    }
}
