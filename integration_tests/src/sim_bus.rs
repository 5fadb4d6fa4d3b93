use std::sync::{Arc, Mutex};

use canmaster_common::messages::CanMessage;
use canmaster_common::traits::{AsyncCanReceiver, AsyncCanSender};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Decides the fate of each frame on the bus: `None` drops it, `Some` delivers the returned frame
type Filter = Arc<dyn Fn(&CanMessage) -> Option<CanMessage> + Send + Sync>;

#[derive(Default)]
struct BusState {
    next_endpoint: usize,
    endpoints: Vec<(usize, UnboundedSender<CanMessage>)>,
    filter: Option<Filter>,
}

/// An in-memory CAN bus
///
/// Every frame sent by an endpoint is delivered to all other endpoints, but not back to the sender,
/// as on a real bus.
#[derive(Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node (or a master) to the bus
    pub fn new_endpoint(&self) -> (SimBusSender, SimBusReceiver) {
        let mut state = self.state.lock().unwrap();
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        let (tx, rx) = unbounded_channel();
        state.endpoints.push((id, tx));
        (
            SimBusSender {
                id,
                state: self.state.clone(),
            },
            SimBusReceiver { channel_rx: rx },
        )
    }

    /// Create a listener which sees every frame on the bus
    pub fn new_receiver(&self) -> SimBusReceiver {
        self.new_endpoint().1
    }

    /// Install a frame filter, e.g. to drop or corrupt frames
    pub fn set_filter(&self, f: impl Fn(&CanMessage) -> Option<CanMessage> + Send + Sync + 'static) {
        self.state.lock().unwrap().filter = Some(Arc::new(f));
    }

    /// Remove the frame filter
    pub fn clear_filter(&self) {
        self.state.lock().unwrap().filter = None;
    }
}

pub struct SimBusSender {
    id: usize,
    state: Arc<Mutex<BusState>>,
}

impl AsyncCanSender for SimBusSender {
    type Error = CanMessage;

    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        let mut state = self.state.lock().unwrap();
        let msg = match &state.filter {
            Some(filter) => match filter(&msg) {
                Some(msg) => msg,
                // Dropped frames are lost silently, as with a disturbed bus
                None => return Ok(()),
            },
            None => msg,
        };
        // Endpoints whose receiver was dropped are detached
        state.endpoints.retain(|(_, tx)| !tx.is_closed());
        for (id, tx) in state.endpoints.iter() {
            if *id != self.id {
                tx.send(msg).ok();
            }
        }
        Ok(())
    }
}

pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl SimBusReceiver {
    /// Take every frame received so far
    pub fn drain(&mut self) -> Vec<CanMessage> {
        let mut frames = Vec::new();
        while let Ok(msg) = self.channel_rx.try_recv() {
            frames.push(msg);
        }
        frames
    }
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = ();

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.channel_rx.recv().await.ok_or(())
    }

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }

    fn flush(&mut self) {
        while self.channel_rx.try_recv().is_ok() {}
    }
}
