//! An async CANopen master
//!
//! Canmaster manages a CANopen network from a host computer. It provides:
//!
//! * *SDO* client access to remote object dictionaries, with expedited, segmented and block
//!   transfers, and typed read/write helpers.
//! * *NMT* control of remote nodes, with state tracking from heartbeats and bootup messages.
//! * Liveness supervision of nodes by heartbeat consumption or node guarding.
//! * Transmit and receive *PDOs*, with mapping configuration written to nodes over SDO and
//!   synchronous or event driven scheduling.
//! * *EMCY* consumption with per-node history and callbacks.
//! * *SYNC* and *TIME* producers.
//! * Local nodes served by the master itself, for simulation and testing.
//! * CiA-402 drive state machine control.
//!
//! # Getting Started
//!
//! A [`Network`] owns the connection to the bus. Nodes are added with an [`ObjectDictionary`]
//! describing them, which provides data types for SDO and PDO access and holds the last known
//! value of each entry.
//!
//! ```ignore
//! let config = NetworkConfig::load_from_file("network.toml")?;
//! let network = Network::new(config);
//! let od = ObjectDictionary::communication_profile(5, 0x0002_0192, "drive");
//! let node = network.add_node(NodeId::new(5)?, od)?;
//!
//! let (tx, rx) = canmaster::common::open_socketcan("can0")?;
//! network.connect(tx, rx).await;
//!
//! node.nmt().request_state(NmtState::Operational).await?;
//! let value = node.sdo().read_u32(0x1000, 0).await?;
//! ```
//!
//! [`ObjectDictionary`]: common::objects::ObjectDictionary
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bus;
pub mod cia402;
pub mod config;
mod emcy;
mod heartbeat;
mod local_node;
mod network;
mod nmt;
mod node;
pub mod pdo;
pub mod sdo_client;
mod sdo_server;
mod sync;
mod time;

pub use canmaster_common as common;

pub use bus::{BusError, BusHandle};
pub use config::{ConfigError, NetworkConfig, NodeConfig};
pub use emcy::EmcyConsumer;
pub use heartbeat::{Liveness, Supervision};
pub use local_node::LocalNode;
pub use network::{Network, NetworkError};
pub use nmt::{NmtError, NmtMaster, NmtStatus};
pub use node::RemoteNode;
pub use pdo::{Pdo, PdoError, PdoMaps};
pub use sdo_client::{RawAbortCode, SdoClient, SdoClientError};
pub use sync::{SyncProducer, SyncSettings};
pub use time::{TimeError, TimeProducer};
