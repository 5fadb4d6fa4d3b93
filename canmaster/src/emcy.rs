//! Emergency message consumer for a remote node
//!
//! The dispatch task hands every EMCY frame of a node to its [`EmcyConsumer`], which records it
//! and queues it for the node's callback worker. Callbacks run on that worker, never on the
//! dispatch task, so a slow or panicking callback cannot hold up other traffic.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use canmaster_common::{emcy::EmergencyEvent, NodeId};
use tokio::sync::{broadcast, mpsc};

/// Number of events kept by [`EmcyConsumer::log`]
pub const LOG_CAPACITY: usize = 256;

type Callback = Arc<dyn Fn(&EmergencyEvent) + Send + Sync>;

struct Shared {
    node_id: NodeId,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    log: Mutex<VecDeque<EmergencyEvent>>,
    active: Mutex<Vec<EmergencyEvent>>,
    events: broadcast::Sender<EmergencyEvent>,
    worker: Mutex<Option<mpsc::UnboundedSender<EmergencyEvent>>>,
}

/// Receives emergency messages from one node
#[derive(Clone)]
pub struct EmcyConsumer {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for EmcyConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmcyConsumer")
            .field("node_id", &self.inner.node_id)
            .field("active", &self.active())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EmcyConsumer {
    pub(crate) fn new(node_id: NodeId) -> Self {
        Self {
            inner: Arc::new(Shared {
                node_id,
                callbacks: Arc::new(Mutex::new(Vec::new())),
                log: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
                active: Mutex::new(Vec::new()),
                events: broadcast::Sender::new(64),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Register a callback for every emergency from the node
    ///
    /// Callbacks run in registration order. A panicking callback is logged and does not affect
    /// the others.
    pub fn add_callback(&self, f: impl Fn(&EmergencyEvent) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).push(Arc::new(f));
    }

    /// Received emergencies, oldest first, up to [`LOG_CAPACITY`]
    pub fn log(&self) -> Vec<EmergencyEvent> {
        lock(&self.inner.log).iter().copied().collect()
    }

    /// Emergencies reported since the last error reset, one per error code
    pub fn active(&self) -> Vec<EmergencyEvent> {
        lock(&self.inner.active).clone()
    }

    /// Clear the log and the active list
    pub fn reset(&self) {
        lock(&self.inner.log).clear();
        lock(&self.inner.active).clear();
    }

    /// Wait for the next emergency, optionally with a specific error code
    ///
    /// Returns None on timeout.
    pub async fn wait(&self, code: Option<u16>, timeout: Duration) -> Option<EmergencyEvent> {
        let mut rx = self.inner.events.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if code.is_none_or(|c| c == event.code) => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Record an emergency and queue it for the callbacks
    ///
    /// Must be called from within the runtime, as the callback worker is spawned on first use.
    pub(crate) fn dispatch(&self, event: EmergencyEvent) {
        log::info!("{event}");
        {
            let mut log = lock(&self.inner.log);
            if log.len() == LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(event);
        }
        {
            let mut active = lock(&self.inner.active);
            if event.is_reset() {
                active.clear();
            } else {
                active.retain(|e| e.code != event.code);
                active.push(event);
            }
        }
        // No receivers is fine
        let _ = self.inner.events.send(event);

        let mut worker = lock(&self.inner.worker);
        let event = match worker.as_ref().map(|tx| tx.send(event)) {
            Some(Ok(())) => return,
            Some(Err(mpsc::error::SendError(event))) => event,
            None => event,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail, the receiver is alive
        let _ = tx.send(event);
        tokio::spawn(run_callbacks(
            self.inner.node_id,
            self.inner.callbacks.clone(),
            rx,
        ));
        *worker = Some(tx);
    }
}

async fn run_callbacks(
    node_id: NodeId,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    mut rx: mpsc::UnboundedReceiver<EmergencyEvent>,
) {
    while let Some(event) = rx.recv().await {
        let snapshot: Vec<Callback> = lock(&callbacks).clone();
        for (i, cb) in snapshot.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                log::error!("EMCY callback {i} of node {node_id} panicked on {event}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(code: u16) -> EmergencyEvent {
        EmergencyEvent {
            node: 3,
            code,
            register: if code == 0 { 0 } else { 1 },
            data: [0; 5],
        }
    }

    #[tokio::test]
    async fn active_list_cleared_by_reset() {
        let emcy = EmcyConsumer::new(NodeId::new(3).unwrap());
        emcy.dispatch(event(0x2310));
        emcy.dispatch(event(0x4210));
        emcy.dispatch(event(0x2310));
        assert_eq!(3, emcy.log().len());
        assert_eq!(
            vec![0x4210, 0x2310],
            emcy.active().iter().map(|e| e.code).collect::<Vec<_>>()
        );
        emcy.dispatch(event(0));
        assert!(emcy.active().is_empty());
        assert_eq!(4, emcy.log().len());
    }

    #[tokio::test]
    async fn callbacks_run_in_order_despite_panics() {
        let emcy = EmcyConsumer::new(NodeId::new(3).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx1 = tx.clone();
        emcy.add_callback(move |e| {
            let _ = tx1.send((1, e.code));
        });
        emcy.add_callback(|_| panic!("bad callback"));
        emcy.add_callback(move |e| {
            let _ = tx.send((3, e.code));
        });

        emcy.dispatch(event(0x1000));
        emcy.dispatch(event(0x1000));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            vec![(1, 0x1000), (3, 0x1000), (1, 0x1000), (3, 0x1000)],
            seen
        );
    }

    #[tokio::test]
    async fn wait_filters_by_code() {
        let emcy = EmcyConsumer::new(NodeId::new(3).unwrap());
        let waiter = {
            let emcy = emcy.clone();
            tokio::spawn(async move { emcy.wait(Some(0x5000), Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        emcy.dispatch(event(0x1000));
        emcy.dispatch(event(0x5000));
        assert_eq!(Some(0x5000), waiter.await.unwrap().map(|e| e.code));
        assert_eq!(None, emcy.wait(None, Duration::from_millis(10)).await);
    }
}
