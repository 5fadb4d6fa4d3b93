pub mod sim_bus;
pub mod utils;

pub mod prelude {
    pub use super::sim_bus::{SimBus, SimBusReceiver, SimBusSender};
    pub use super::utils::{
        device_od, drive_od, frames_of, init_logging, wait_until, within, Bench, BusLogger,
        SimDrive, SIM_DRIVE_MODES, TIMEOUT,
    };
    pub use canmaster::{
        Liveness, LocalNode, Network, NetworkConfig, RawAbortCode, RemoteNode, SdoClientError,
        Supervision,
    };
    pub use canmaster_common::{
        messages::{CanId, CanMessage, MessageKind},
        nmt::{NmtCommandSpecifier, NmtState},
        objects::Value,
        sdo::AbortCode,
        NodeId,
    };
}
