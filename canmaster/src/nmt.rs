//! NMT master for a single remote node
//!
//! The cached state of a node only changes in response to frames from the node: bootup messages,
//! heartbeats and node guarding responses. Sending a command does not update it, with the
//! exception of reset commands, after which the state is unknown until the node boots again.

use std::time::Duration;

use canmaster_common::{
    messages::{CanMessage, Heartbeat, NmtCommand},
    nmt::{NmtCommandSpecifier, NmtState},
    NodeId,
};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;

use crate::bus::{BusError, BusHandle};

/// Errors returned by [`NmtMaster`] operations
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum NmtError {
    /// The awaited frame did not arrive in time
    Timeout,
    /// No command moves a node into the requested state
    #[snafu(display("No NMT command enters state {state}"))]
    InvalidTarget {
        /// The requested state
        state: NmtState,
    },
    /// Sending the command failed
    #[snafu(display("{source}"))]
    Bus {
        /// The underlying bus error
        source: BusError,
    },
}

type Result<T> = std::result::Result<T, NmtError>;

/// Snapshot of what is known about a node's NMT state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NmtStatus {
    /// The last reported state, None if unknown
    pub state: Option<NmtState>,
    /// Number of bootup messages received
    pub bootups: u64,
    /// Number of heartbeat or guarding responses received, bootups excluded
    pub heartbeats: u64,
    /// Toggle bit of the last heartbeat or guarding response
    pub toggle: bool,
    /// Bootup count when the last reset command was sent, while its bootup is outstanding
    pending_reset: Option<u64>,
}

/// Receiver side of the per-node NMT status, updated by the dispatch task
#[derive(Debug)]
pub(crate) struct NmtTracker {
    status: watch::Sender<NmtStatus>,
}

impl NmtTracker {
    pub fn new() -> Self {
        Self {
            status: watch::Sender::new(NmtStatus::default()),
        }
    }

    /// Record a heartbeat, guarding response or bootup frame from the node
    pub fn on_heartbeat(&self, hb: Heartbeat) {
        self.status.send_modify(|s| {
            if hb.state == NmtState::Bootup {
                // Nodes move to PreOperational on their own after announcing bootup
                s.state = Some(NmtState::PreOperational);
                s.bootups += 1;
                s.toggle = false;
            } else {
                s.state = Some(hb.state);
                s.heartbeats += 1;
                s.toggle = hb.toggle;
            }
        });
    }

    /// Forget the cached state
    pub fn mark_unknown(&self) {
        self.status.send_modify(|s| s.state = None);
    }

    pub fn subscribe(&self) -> watch::Receiver<NmtStatus> {
        self.status.subscribe()
    }

    pub fn current(&self) -> NmtStatus {
        *self.status.borrow()
    }

    /// Forget the cached state until the node's next bootup
    pub fn mark_reset(&self) {
        self.status.send_modify(|s| {
            s.state = None;
            s.pending_reset = Some(s.bootups);
        });
    }

    fn clear_pending_reset(&self, bootups: u64) {
        self.status.send_if_modified(|s| match s.pending_reset {
            Some(b) if b < bootups => {
                s.pending_reset = None;
                true
            }
            _ => false,
        });
    }
}

/// NMT master operations for one node
#[derive(Clone, Debug)]
pub struct NmtMaster {
    node_id: NodeId,
    bus: BusHandle,
    tracker: std::sync::Arc<NmtTracker>,
}

impl NmtMaster {
    pub(crate) fn new(node_id: NodeId, bus: BusHandle, tracker: std::sync::Arc<NmtTracker>) -> Self {
        Self {
            node_id,
            bus,
            tracker,
        }
    }

    /// The cached NMT state, or None if it is unknown
    pub fn state(&self) -> Option<NmtState> {
        self.tracker.current().state
    }

    /// The full cached status
    pub fn status(&self) -> NmtStatus {
        self.tracker.current()
    }

    /// Subscribe to status updates
    pub fn subscribe(&self) -> watch::Receiver<NmtStatus> {
        self.tracker.subscribe()
    }

    /// Send an NMT command to the node
    ///
    /// Reset commands mark the cached state unknown until the node's bootup message arrives.
    pub async fn send_command(&self, cs: NmtCommandSpecifier) -> Result<()> {
        if matches!(
            cs,
            NmtCommandSpecifier::ResetApp | NmtCommandSpecifier::ResetComm
        ) {
            self.tracker.mark_reset();
        }
        let msg: CanMessage = NmtCommand {
            cs,
            node: self.node_id.raw(),
        }
        .into();
        self.bus.send(msg).await.context(BusSnafu)
    }

    /// Send the command which moves the node into `target`
    ///
    /// Does not wait for the node to confirm; use [`Self::wait_for_state`] or watch
    /// [`Self::state`].
    pub async fn request_state(&self, target: NmtState) -> Result<()> {
        let cs = target
            .command()
            .ok_or(NmtError::InvalidTarget { state: target })?;
        self.send_command(cs).await
    }

    /// Wait for the node to announce bootup
    ///
    /// If a reset command was sent and its bootup has not yet been awaited, a bootup received
    /// since that command satisfies the wait. Otherwise waits for the next bootup.
    pub async fn wait_for_bootup(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tracker.subscribe();
        let target = {
            let s = rx.borrow_and_update();
            s.pending_reset.unwrap_or(s.bootups) + 1
        };
        let status = wait_for(&self.bus, &mut rx, timeout, |s| s.bootups >= target).await?;
        self.tracker.clear_pending_reset(status.bootups);
        Ok(())
    }

    /// Wait for the next heartbeat or guarding response, and return the reported state
    pub async fn wait_for_heartbeat(&self, timeout: Duration) -> Result<NmtState> {
        let mut rx = self.tracker.subscribe();
        let count = rx.borrow_and_update().heartbeats;
        let status = wait_for(&self.bus, &mut rx, timeout, |s| s.heartbeats > count).await?;
        status.state.ok_or(NmtError::Timeout)
    }

    /// Wait until the cached state equals `state`
    pub async fn wait_for_state(&self, state: NmtState, timeout: Duration) -> Result<()> {
        let mut rx = self.tracker.subscribe();
        wait_for(&self.bus, &mut rx, timeout, |s| s.state == Some(state)).await?;
        Ok(())
    }
}

async fn wait_for(
    bus: &BusHandle,
    rx: &mut watch::Receiver<NmtStatus>,
    timeout: Duration,
    mut f: impl FnMut(&NmtStatus) -> bool,
) -> Result<NmtStatus> {
    let token = bus.session_token().context(BusSnafu)?;
    tokio::select! {
        result = tokio::time::timeout(timeout, rx.wait_for(&mut f)) => match result {
            Ok(Ok(status)) => Ok(*status),
            // The sender lives as long as the node
            Ok(Err(_)) => Err(NmtError::Bus { source: BusError::Disconnected }),
            Err(_) => TimeoutSnafu.fail(),
        },
        _ = token.cancelled() => Err(NmtError::Bus { source: BusError::Disconnected }),
    }
}
