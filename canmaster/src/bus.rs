//! Outbound frame path shared by every component of a [`Network`](crate::Network)
//!
//! A single writer task owns the transport's sender. Everything else holds a cloneable
//! [`BusHandle`] and submits frames to the writer over a channel, so components never contend for
//! the sender and frames leave in submission order.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use canmaster_common::{
    traits::{AsyncCanSender, CanSendError as _},
    CanMessage,
};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Errors sending on the bus
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum BusError {
    /// The network is not connected, or was disconnected while the operation was pending
    Disconnected,
    /// The transport refused the frame
    #[snafu(display("Failed to send CAN message: {message}"))]
    SendFailed {
        /// A string describing the error reason
        message: String,
    },
}

struct Outgoing {
    msg: CanMessage,
    ack: Option<oneshot::Sender<Result<(), BusError>>>,
}

struct Session {
    tx: mpsc::UnboundedSender<Outgoing>,
    token: CancellationToken,
}

/// A cloneable handle for sending frames
#[derive(Clone, Default)]
pub struct BusHandle {
    session: Arc<Mutex<Option<Session>>>,
}

impl core::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl BusHandle {
    fn current(&self) -> Result<(mpsc::UnboundedSender<Outgoing>, CancellationToken), BusError> {
        let session = self.session.lock().map_err(|_| BusError::Disconnected)?;
        match session.as_ref() {
            Some(s) if !s.token.is_cancelled() => Ok((s.tx.clone(), s.token.clone())),
            _ => DisconnectedSnafu.fail(),
        }
    }

    /// Returns true while a transport is attached
    pub fn is_connected(&self) -> bool {
        self.current().is_ok()
    }

    /// Get the token which is cancelled when the current connection ends
    ///
    /// Long waits select on this so that a disconnect fails them promptly.
    pub fn session_token(&self) -> Result<CancellationToken, BusError> {
        Ok(self.current()?.1)
    }

    /// Send a frame and wait until the transport has accepted it
    pub async fn send(&self, msg: CanMessage) -> Result<(), BusError> {
        let (tx, token) = self.current()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Outgoing {
            msg,
            ack: Some(ack_tx),
        })
        .map_err(|_| BusError::Disconnected)?;
        tokio::select! {
            result = ack_rx => result.unwrap_or(Err(BusError::Disconnected)),
            _ = token.cancelled() => DisconnectedSnafu.fail(),
        }
    }

    /// Queue a frame without waiting for the transport
    ///
    /// Usable outside of async contexts, e.g. from `Drop` implementations.
    pub fn queue(&self, msg: CanMessage) -> Result<(), BusError> {
        let (tx, _) = self.current()?;
        tx.send(Outgoing { msg, ack: None })
            .map_err(|_| BusError::Disconnected)
    }

    /// Attach a sender and spawn the writer task
    pub(crate) fn attach<S: AsyncCanSender>(
        &self,
        sender: S,
        retries: usize,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut session) = self.session.lock() {
            *session = Some(Session {
                tx,
                token: token.clone(),
            });
        }
        tokio::spawn(writer_task(sender, rx, retries, token))
    }

    /// Drop the current session. Pending sends fail with [`BusError::Disconnected`]
    pub(crate) fn detach(&self) {
        if let Ok(mut session) = self.session.lock() {
            if let Some(s) = session.take() {
                s.token.cancel();
            }
        }
    }
}

async fn send_with_retry<S: AsyncCanSender>(
    sender: &mut S,
    msg: CanMessage,
    retries: usize,
) -> Result<(), BusError> {
    let mut tries = retries.max(1);
    loop {
        match sender.send(msg).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tries -= 1;
                if tries == 0 {
                    return SendFailedSnafu {
                        message: e.message(),
                    }
                    .fail();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }
}

async fn writer_task<S: AsyncCanSender>(
    mut sender: S,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    retries: usize,
    token: CancellationToken,
) {
    loop {
        let outgoing = tokio::select! {
            _ = token.cancelled() => break,
            outgoing = rx.recv() => match outgoing {
                Some(o) => o,
                None => break,
            },
        };
        let result = send_with_retry(&mut sender, outgoing.msg, retries).await;
        if let Err(e) = &result {
            log::error!("Error sending {:?}: {e}", outgoing.msg.id);
        }
        if let Some(ack) = outgoing.ack {
            // Nobody waiting is fine
            let _ = ack.send(result);
        }
    }
    // Fail anything still queued
    rx.close();
    while let Ok(outgoing) = rx.try_recv() {
        if let Some(ack) = outgoing.ack {
            let _ = ack.send(DisconnectedSnafu.fail());
        }
    }
    log::debug!("Bus writer stopped");
}
