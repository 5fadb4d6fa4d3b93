//! Heartbeat consumption and node guarding
//!
//! A node is supervised by at most one mechanism at a time, chosen with [`Supervision`]. The
//! monitors are plain state machines driven by explicit instants; a supervisor task per node feeds
//! them from the node's NMT status and a periodic tick, and publishes the resulting [`Liveness`].

use std::{sync::Arc, time::Duration};

use canmaster_common::{
    messages::{CanId, CanMessage, HEARTBEAT_BASE},
    NodeId,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{bus::BusHandle, nmt::NmtStatus};

/// How a node's liveness is supervised
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Supervision {
    /// Not supervised
    #[default]
    Off,
    /// Consume the node's heartbeat, expected every `period`
    Heartbeat {
        /// The node's heartbeat producer time
        period: Duration,
    },
    /// Poll the node with guarding remote requests every `guard_time`
    Guarding {
        /// Poll interval
        guard_time: Duration,
        /// Consecutive unanswered polls before the node is considered lost, 0 to use the network
        /// default
        life_time_factor: u8,
    },
}

/// Supervision result for a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Liveness {
    /// Not supervised, or nothing heard yet
    #[default]
    Unknown,
    /// Heartbeats or guarding responses are arriving in time
    Alive,
    /// No heartbeat within the tolerated time
    Missed,
    /// Guarding responses missing or with a wrong toggle bit
    GuardFailed,
}

/// Heartbeat consumer for one node
#[derive(Clone, Copy, Debug)]
pub(crate) struct HeartbeatMonitor {
    timeout: Duration,
    last_seen: Instant,
    missed: bool,
}

impl HeartbeatMonitor {
    /// Create a monitor which flags the node after `period * grace_factor` of silence
    pub fn new(period: Duration, grace_factor: f64, now: Instant) -> Self {
        Self {
            timeout: period.mul_f64(grace_factor.max(1.0)),
            last_seen: now,
            missed: false,
        }
    }

    /// Record a heartbeat
    pub fn on_heartbeat(&mut self, now: Instant) -> Liveness {
        self.last_seen = now;
        self.missed = false;
        Liveness::Alive
    }

    /// Check for a timeout; returns [`Liveness::Missed`] once per silent period
    pub fn poll(&mut self, now: Instant) -> Option<Liveness> {
        if !self.missed && now.duration_since(self.last_seen) > self.timeout {
            self.missed = true;
            Some(Liveness::Missed)
        } else {
            None
        }
    }
}

/// What the guarding supervisor should do after a poll
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct GuardPoll {
    /// Send a guarding remote request
    pub send_request: bool,
    /// New liveness to publish
    pub event: Option<Liveness>,
}

/// Node guarding master for one node
#[derive(Clone, Copy, Debug)]
pub(crate) struct GuardMonitor {
    guard_time: Duration,
    miss_limit: u8,
    next_poll: Instant,
    awaiting: bool,
    expected_toggle: Option<bool>,
    misses: u8,
    failed: bool,
}

impl GuardMonitor {
    pub fn new(guard_time: Duration, miss_limit: u8, now: Instant) -> Self {
        Self {
            guard_time,
            miss_limit: miss_limit.max(1),
            next_poll: now,
            awaiting: false,
            expected_toggle: None,
            misses: 0,
            failed: false,
        }
    }

    fn miss(&mut self) -> Option<Liveness> {
        self.misses = self.misses.saturating_add(1);
        if self.misses >= self.miss_limit && !self.failed {
            self.failed = true;
            Some(Liveness::GuardFailed)
        } else {
            None
        }
    }

    /// Advance time; a request is due every guard time
    pub fn poll(&mut self, now: Instant) -> GuardPoll {
        if now < self.next_poll {
            return GuardPoll::default();
        }
        let event = if self.awaiting { self.miss() } else { None };
        self.awaiting = true;
        self.next_poll = now + self.guard_time;
        GuardPoll {
            send_request: true,
            event,
        }
    }

    /// Record a guarding response
    pub fn on_response(&mut self, toggle: bool) -> Option<Liveness> {
        if !self.awaiting {
            // Unsolicited, e.g. a heartbeat from a node also producing one
            return None;
        }
        self.awaiting = false;
        if self.expected_toggle.is_some_and(|t| t != toggle) {
            return self.miss();
        }
        self.expected_toggle = Some(!toggle);
        self.misses = 0;
        self.failed = false;
        Some(Liveness::Alive)
    }

    /// The node rebooted, so its toggle starts over
    pub fn on_bootup(&mut self) {
        self.expected_toggle = None;
    }
}

/// Parameters for a node's supervisor task
pub(crate) struct SupervisorParams {
    pub node_id: NodeId,
    pub supervision: Supervision,
    pub tick: Duration,
    pub grace_factor: f64,
    pub guard_miss_limit: u8,
    pub bus: BusHandle,
    pub status: watch::Receiver<NmtStatus>,
    pub liveness: Arc<watch::Sender<Liveness>>,
}

enum Monitor {
    Heartbeat(HeartbeatMonitor),
    Guard(GuardMonitor),
}

/// Spawn the supervisor task for a node
///
/// The task stops when `token` is cancelled.
pub(crate) fn spawn_supervisor(params: SupervisorParams, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(supervise(params, token))
}

async fn supervise(params: SupervisorParams, token: CancellationToken) {
    let SupervisorParams {
        node_id,
        supervision,
        tick,
        grace_factor,
        guard_miss_limit,
        bus,
        mut status,
        liveness,
    } = params;
    let now = Instant::now();
    let mut monitor = match supervision {
        Supervision::Off => return,
        Supervision::Heartbeat { period } => {
            Monitor::Heartbeat(HeartbeatMonitor::new(period, grace_factor, now))
        }
        Supervision::Guarding {
            guard_time,
            life_time_factor,
        } => {
            let limit = if life_time_factor > 0 {
                life_time_factor
            } else {
                guard_miss_limit
            };
            Monitor::Guard(GuardMonitor::new(guard_time, limit, now))
        }
    };
    liveness.send_replace(Liveness::Unknown);

    let guard_request = CanMessage::new_rtr(CanId::std(HEARTBEAT_BASE + node_id.raw() as u16), 1);
    let mut seen = *status.borrow_and_update();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                let booted = current.bootups > seen.bootups;
                let responded = current.heartbeats > seen.heartbeats;
                seen = current;
                let now = Instant::now();
                match &mut monitor {
                    Monitor::Heartbeat(m) if booted || responded => Some(m.on_heartbeat(now)),
                    Monitor::Guard(m) => {
                        if booted {
                            m.on_bootup();
                        }
                        if responded { m.on_response(current.toggle) } else { None }
                    }
                    _ => None,
                }
            }
            _ = interval.tick() => {
                let now = Instant::now();
                match &mut monitor {
                    Monitor::Heartbeat(m) => m.poll(now),
                    Monitor::Guard(m) => {
                        let poll = m.poll(now);
                        if poll.send_request {
                            if let Err(e) = bus.send(guard_request).await {
                                log::warn!("Node {node_id}: cannot send guarding request: {e}");
                            }
                        }
                        poll.event
                    }
                }
            }
        };
        if let Some(event) = event {
            if matches!(event, Liveness::Missed | Liveness::GuardFailed) {
                log::warn!("Node {node_id} liveness: {event:?}");
            }
            liveness.send_if_modified(|l| {
                let modified = *l != event;
                *l = event;
                modified
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn heartbeat_missed_reported_once() {
        let t0 = Instant::now();
        let mut m = HeartbeatMonitor::new(100 * MS, 2.0, t0);
        assert_eq!(Liveness::Alive, m.on_heartbeat(t0));
        assert_eq!(None, m.poll(t0 + 150 * MS));
        assert_eq!(Some(Liveness::Missed), m.poll(t0 + 201 * MS));
        assert_eq!(None, m.poll(t0 + 300 * MS));
        assert_eq!(None, m.poll(t0 + 1000 * MS));

        m.on_heartbeat(t0 + 1000 * MS);
        assert_eq!(None, m.poll(t0 + 1100 * MS));
        assert_eq!(Some(Liveness::Missed), m.poll(t0 + 1201 * MS));
    }

    #[test]
    fn guarding_fails_after_miss_limit() {
        let t0 = Instant::now();
        let mut m = GuardMonitor::new(100 * MS, 2, t0);
        assert_eq!(
            GuardPoll {
                send_request: true,
                event: None
            },
            m.poll(t0)
        );
        assert!(!m.poll(t0 + 50 * MS).send_request);
        assert_eq!(Some(Liveness::Alive), m.on_response(false));

        // First unanswered poll is tolerated, the second fails
        assert_eq!(None, m.poll(t0 + 100 * MS).event);
        assert_eq!(None, m.poll(t0 + 200 * MS).event);
        assert_eq!(Some(Liveness::GuardFailed), m.poll(t0 + 300 * MS).event);
        assert_eq!(None, m.poll(t0 + 400 * MS).event);

        // Recovery needs the toggle to keep alternating
        assert_eq!(Some(Liveness::Alive), m.on_response(true));
    }

    #[test]
    fn guarding_checks_toggle() {
        let t0 = Instant::now();
        let mut m = GuardMonitor::new(100 * MS, 1, t0);
        m.poll(t0);
        assert_eq!(Some(Liveness::Alive), m.on_response(false));
        m.poll(t0 + 100 * MS);
        assert_eq!(Some(Liveness::GuardFailed), m.on_response(false));

        // After a reboot the toggle starts at 0 again
        m.on_bootup();
        m.poll(t0 + 200 * MS);
        assert_eq!(Some(Liveness::Alive), m.on_response(false));
    }
}
