//! SYNC producer
//!
//! Every SYNC seen by a [`Network`](crate::Network), whether produced here or received from
//! another producer on the bus, is broadcast to the PDO schedulers as a tick. The time of the
//! last SYNC opens the synchronous window (0x1007) in which synchronous PDOs may be sent.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use canmaster_common::messages::{CanMessage, SYNC_ID};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::bus::{BusError, BusHandle};

/// SYNC counter and window settings
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSettings {
    /// Synchronous counter overflow value (0x1019); 0 sends SYNC without a counter byte
    pub counter_overflow: u8,
    /// Synchronous window length (0x1007); None leaves synchronous PDOs ungated
    pub window: Option<Duration>,
}

#[derive(Debug, Default)]
struct SyncState {
    last_sync: Option<Instant>,
    counter: Option<u8>,
}

struct Shared {
    bus: BusHandle,
    settings: SyncSettings,
    ticks: broadcast::Sender<u64>,
    count: AtomicU64,
    state: Mutex<SyncState>,
    task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

/// Produces SYNC messages on COB-ID 0x80
#[derive(Clone)]
pub struct SyncProducer {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for SyncProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProducer")
            .field("running", &self.is_running())
            .field("count", &self.count())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

/// The counter value following `last`, running from 1 to `overflow`
fn next_counter(last: Option<u8>, overflow: u8) -> u8 {
    match last {
        Some(c) if c < overflow => c + 1,
        _ => 1,
    }
}

impl SyncProducer {
    pub(crate) fn new(bus: BusHandle, settings: SyncSettings) -> Self {
        Self {
            inner: Arc::new(Shared {
                bus,
                settings,
                ticks: broadcast::Sender::new(16),
                count: AtomicU64::new(0),
                state: Mutex::new(SyncState::default()),
                task: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to SYNC ticks
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.inner.ticks.subscribe()
    }

    /// Record a SYNC seen on the bus and notify the PDO schedulers
    pub(crate) fn on_frame(&self, msg: &CanMessage) {
        let counter = msg.data().first().copied();
        self.tick(counter);
    }

    fn tick(&self, counter: Option<u8>) {
        {
            let mut state = self.state();
            state.last_sync = Some(Instant::now());
            state.counter = counter;
        }
        let n = self.inner.count.fetch_add(1, Ordering::Relaxed) + 1;
        // No schedulers running is fine
        let _ = self.inner.ticks.send(n);
    }

    /// The settings the producer was created with
    pub fn settings(&self) -> SyncSettings {
        self.inner.settings
    }

    /// Number of SYNCs produced or received since the network was created
    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// The counter carried by the last SYNC, None if it had no counter byte
    pub fn sync_counter(&self) -> Option<u8> {
        self.state().counter
    }

    /// True while the synchronous window opened by the last SYNC is open
    ///
    /// Always true when no window is configured. False before the first SYNC.
    pub fn is_in_sync_window(&self) -> bool {
        let Some(window) = self.inner.settings.window else {
            return true;
        };
        self.state()
            .last_sync
            .is_some_and(|t| t.elapsed() < window)
    }

    /// Send a single SYNC message
    ///
    /// With a counter overflow configured the frame carries the counter byte.
    pub async fn transmit(&self) -> Result<(), BusError> {
        let overflow = self.inner.settings.counter_overflow;
        let counter = (overflow != 0).then(|| next_counter(self.state().counter, overflow));
        let msg = match counter {
            Some(c) => CanMessage::new(SYNC_ID, &[c]),
            None => CanMessage::new(SYNC_ID, &[]),
        };
        self.inner.bus.send(msg).await?;
        self.tick(counter);
        Ok(())
    }

    /// Start sending SYNC every `period`, replacing any running producer
    ///
    /// The producer stops on [`Self::stop`] or when the network disconnects.
    pub fn start(&self, period: Duration) -> Result<(), BusError> {
        self.stop();
        let token = self.inner.bus.session_token()?.child_token();
        let producer = self.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = producer.transmit().await {
                            log::error!("Failed to send SYNC: {e}");
                        }
                    }
                }
            }
            log::debug!("SYNC producer stopped");
        });
        log::info!("Starting SYNC with period {period:?}");
        *self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((handle, token));
        Ok(())
    }

    /// Stop the periodic producer
    pub fn stop(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((handle, token)) = task {
            token.cancel();
            handle.abort();
        }
    }

    /// True while the periodic producer runs
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_wraps_at_overflow() {
        let mut last = None;
        let seq: Vec<u8> = (0..7)
            .map(|_| {
                let c = next_counter(last, 3);
                last = Some(c);
                c
            })
            .collect();
        assert_eq!(vec![1, 2, 3, 1, 2, 3, 1], seq);
        // A received counter above the overflow restarts the sequence
        assert_eq!(1, next_counter(Some(200), 3));
    }

    #[tokio::test]
    async fn window_follows_last_sync() {
        let sync = SyncProducer::new(
            BusHandle::default(),
            SyncSettings {
                counter_overflow: 0,
                window: Some(Duration::from_millis(20)),
            },
        );
        assert!(!sync.is_in_sync_window());
        sync.on_frame(&CanMessage::new(SYNC_ID, &[5]));
        assert!(sync.is_in_sync_window());
        assert_eq!(Some(5), sync.sync_counter());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!sync.is_in_sync_window());

        let ungated = SyncProducer::new(BusHandle::default(), SyncSettings::default());
        assert!(ungated.is_in_sync_window());
    }
}
