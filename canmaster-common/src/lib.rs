//! Common protocol definitions shared by the canmaster crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `canmaster`. It contains the wire-level vocabulary of CANopen: frame and identifier types, the
//! SDO codec, NMT states and commands, PDO mapping words, emergency message decoding and the typed
//! object dictionary used to interpret parameter values.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod constants;
pub mod emcy;
pub mod messages;
pub mod nmt;
pub mod node_id;
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod objects;
pub mod pdo;
pub mod sdo;
mod time_types;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender};

pub use messages::{CanError, CanId, CanMessage};
pub use node_id::NodeId;
pub use time_types::{TimeDifference, TimeOfDay};
