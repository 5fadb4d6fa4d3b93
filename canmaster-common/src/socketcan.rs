use std::sync::Arc;

use crate::{
    messages::{CanError, CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};
use defmt_or_log::warn;
use snafu::{ResultExt, Snafu};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, ShouldRetry, Socket};
use tokio::io::{unix::AsyncFd, Interest};

fn from_socketcan_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn to_socketcan_id(id: CanId) -> Option<socketcan::CanId> {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id).map(Into::into),
        CanId::Std(id) => socketcan::StandardId::new(id).map(Into::into),
    }
}

fn from_socketcan_frame(frame: socketcan::CanFrame) -> Result<CanMessage, CanError> {
    let id = from_socketcan_id(frame.can_id());

    match frame {
        CanFrame::Data(frame) => Ok(CanMessage::new(id, frame.data())),
        CanFrame::Remote(frame) => Ok(CanMessage::new_rtr(id, frame.dlc() as u8)),
        CanFrame::Error(frame) => Err(CanError::from_raw(frame.error_bits() as u8)),
    }
}

fn to_socketcan_frame(msg: CanMessage) -> Option<socketcan::CanFrame> {
    let id = to_socketcan_id(msg.id())?;
    if msg.is_rtr() {
        socketcan::CanFrame::new_remote(id, msg.dlc as usize)
    } else {
        socketcan::CanFrame::new(id, msg.data())
    }
}

/// Receiving half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<AsyncCanSocket>,
}

/// Error receiving from a socketcan interface
#[derive(Debug, Snafu)]
pub enum ReceiveError {
    /// The socket failed
    Io {
        /// Underlying error
        source: socketcan::IoError,
    },
    /// The controller reported an error frame
    Can {
        /// Decoded controller error
        source: CanError,
    },
}

/// Error sending to a socketcan interface
#[derive(Debug)]
pub struct SendError {
    msg: CanMessage,
    reason: String,
}

impl CanSendError for SendError {
    fn into_can_message(self) -> CanMessage {
        self.msg
    }

    fn message(&self) -> String {
        self.reason.clone()
    }
}

/// Async wrapper around a non-blocking CanSocket
#[derive(Debug)]
struct AsyncCanSocket(AsyncFd<CanSocket>);

impl AsyncCanSocket {
    fn open(ifname: &str) -> Result<Self, std::io::Error> {
        let socket = CanSocket::open(ifname)?;
        socket.set_nonblocking(true)?;
        Ok(Self(AsyncFd::new(socket)?))
    }

    /// Read a frame without blocking, failing with WouldBlock if none is available
    fn try_read_frame(&self) -> Result<CanFrame, std::io::Error> {
        self.0.get_ref().read_frame()
    }

    async fn read_frame(&self) -> Result<CanFrame, std::io::Error> {
        self.0
            .async_io(Interest::READABLE, |inner| inner.read_frame())
            .await
    }

    async fn write_frame(&self, frame: &CanFrame) -> Result<(), std::io::Error> {
        self.0
            .async_io(Interest::WRITABLE, |inner| inner.write_frame(frame))
            .await
    }
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    fn try_recv(&mut self) -> Option<CanMessage> {
        loop {
            match self.socket.try_read_frame() {
                Ok(frame) => match from_socketcan_frame(frame) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        warn!("Dropping CAN error frame: {}", e);
                        continue;
                    }
                },
                Err(_) => return None,
            }
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => return from_socketcan_frame(frame).context(CanSnafu),
                Err(e) => {
                    if !e.should_retry() {
                        return Err(ReceiveError::Io { source: e });
                    }
                }
            }
        }
    }
}

/// Sending half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<AsyncCanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    type Error = SendError;

    async fn send(&mut self, msg: CanMessage) -> Result<(), SendError> {
        let Some(frame) = to_socketcan_frame(msg) else {
            return Err(SendError {
                msg,
                reason: format!("identifier {} cannot be sent", msg.id),
            });
        };
        self.socket
            .write_frame(&frame)
            .await
            .map_err(|e| SendError {
                msg,
                reason: e.to_string(),
            })
    }
}

/// Open a socketcan device and split it into a sender and receiver
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
///
/// Sender and receiver share one socket, so the receiver does not see frames sent by the sender.
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), socketcan::IoError> {
    let socket = Arc::new(AsyncCanSocket::open(device.as_ref())?);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
