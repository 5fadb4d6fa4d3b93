//! Access paths for the control word and status word

use canmaster_common::{constants::object_ids, objects::Value};
use snafu::ResultExt;

use crate::{
    pdo::{Pdo, PdoDirection},
    sdo_client::SdoClient,
};

use super::{Cia402Error, NotMappedSnafu, PdoSnafu, Result, SdoSnafu};

/// Reads the status word and writes the control word of a drive
pub trait ParameterChannel: Send + Sync {
    /// Write the control word (0x6040)
    fn write_controlword(&self, value: u16) -> impl core::future::Future<Output = Result<()>> + Send;

    /// Get the status word (0x6041)
    fn read_statusword(&self) -> impl core::future::Future<Output = Result<u16>> + Send;
}

/// Control and status word over SDO
#[derive(Clone, Debug)]
pub struct SdoChannel {
    sdo: SdoClient,
}

impl SdoChannel {
    /// Create a channel using a node's SDO client
    pub fn new(sdo: SdoClient) -> Self {
        Self { sdo }
    }
}

impl ParameterChannel for SdoChannel {
    async fn write_controlword(&self, value: u16) -> Result<()> {
        self.sdo
            .write_u16(object_ids::CONTROLWORD, 0, value)
            .await
            .context(SdoSnafu)
    }

    async fn read_statusword(&self) -> Result<u16> {
        self.sdo
            .read_u16(object_ids::STATUSWORD, 0)
            .await
            .context(SdoSnafu)
    }
}

/// Control word through an RPDO, status word from a TPDO
///
/// The status word is the last value received on the TPDO, so the node must be operational and
/// transmitting it for state changes to be observed.
#[derive(Clone, Debug)]
pub struct PdoChannel {
    rpdo: Pdo,
    tpdo: Pdo,
}

impl PdoChannel {
    /// Create a channel from an RPDO mapping the control word and a TPDO mapping the status word
    pub fn new(rpdo: Pdo, tpdo: Pdo) -> Result<Self> {
        let maps = |pdo: &Pdo, direction: PdoDirection, index: u16| {
            pdo.direction() == direction
                && pdo.variables().iter().any(|v| v.index == index && v.sub == 0)
        };
        if !maps(&rpdo, PdoDirection::Rpdo, object_ids::CONTROLWORD) {
            return NotMappedSnafu {
                index: object_ids::CONTROLWORD,
            }
            .fail();
        }
        if !maps(&tpdo, PdoDirection::Tpdo, object_ids::STATUSWORD) {
            return NotMappedSnafu {
                index: object_ids::STATUSWORD,
            }
            .fail();
        }
        Ok(Self { rpdo, tpdo })
    }
}

impl ParameterChannel for PdoChannel {
    async fn write_controlword(&self, value: u16) -> Result<()> {
        self.rpdo
            .set_key(object_ids::CONTROLWORD, 0, value)
            .context(PdoSnafu)?;
        self.rpdo.transmit().await.context(PdoSnafu)
    }

    async fn read_statusword(&self) -> Result<u16> {
        match self
            .tpdo
            .get_key(object_ids::STATUSWORD, 0)
            .context(PdoSnafu)?
        {
            Value::U16(sw) => Ok(sw),
            other => Err(Cia402Error::UnexpectedType {
                index: object_ids::STATUSWORD,
                value: other.to_string(),
            }),
        }
    }
}

/// Either channel, chosen at runtime
#[derive(Clone, Debug)]
pub enum AnyChannel {
    /// See [`SdoChannel`]
    Sdo(SdoChannel),
    /// See [`PdoChannel`]
    Pdo(PdoChannel),
}

impl From<SdoChannel> for AnyChannel {
    fn from(c: SdoChannel) -> Self {
        AnyChannel::Sdo(c)
    }
}

impl From<PdoChannel> for AnyChannel {
    fn from(c: PdoChannel) -> Self {
        AnyChannel::Pdo(c)
    }
}

impl ParameterChannel for AnyChannel {
    async fn write_controlword(&self, value: u16) -> Result<()> {
        match self {
            AnyChannel::Sdo(c) => c.write_controlword(value).await,
            AnyChannel::Pdo(c) => c.write_controlword(value).await,
        }
    }

    async fn read_statusword(&self) -> Result<u16> {
        match self {
            AnyChannel::Sdo(c) => c.read_statusword().await,
            AnyChannel::Pdo(c) => c.read_statusword().await,
        }
    }
}
