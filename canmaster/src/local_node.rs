//! A node implemented by the master itself
//!
//! A [`LocalNode`] serves an [`ObjectDictionary`] on the bus: it runs an NMT slave, an SDO server,
//! heartbeat production, node guarding responses and the PDOs configured in its communication
//! parameters. It is useful for simulating devices and for masters which must also appear as a
//! regular node.
//!
//! The node only sees frames received from the bus, so remote node handles in the same
//! [`Network`](crate::Network) cannot talk to it; put it on its own network instead.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use canmaster_common::{
    constants::object_ids,
    emcy::EmergencyEvent,
    messages::{CanId, CanMessage, Heartbeat, MessageKind, NmtCommand, SDO_RESP_BASE},
    nmt::{NmtCommandSpecifier, NmtState},
    objects::{ObjectDictionary, ObjectDictionaryError, Value},
    pdo::{pack, unpack, PdoCobId, PdoMapping, TransmissionType, MAX_MAPPINGS},
    NodeId,
};
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{BusError, BusHandle},
    pdo::{TxSchedule, PDO_COUNT},
    sdo_server::SdoServer,
};

type WriteCallback = Arc<dyn Fn(u16, u8) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    id: NodeId,
    od: Arc<Mutex<ObjectDictionary>>,
    bus: BusHandle,
    inbox: Mutex<Option<mpsc::UnboundedSender<CanMessage>>>,
    state: watch::Sender<NmtState>,
    changed: Notify,
    pending_changes: Mutex<Vec<(u16, u8)>>,
    callbacks: Mutex<Vec<WriteCallback>>,
    task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

/// A node served by this process
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("id", &self.inner.id)
            .field("state", &self.nmt_state())
            .finish()
    }
}

impl LocalNode {
    pub(crate) fn new(id: NodeId, od: ObjectDictionary, bus: BusHandle) -> Self {
        Self {
            inner: Arc::new(Shared {
                id,
                od: Arc::new(Mutex::new(od)),
                bus,
                inbox: Mutex::new(None),
                state: watch::Sender::new(NmtState::Bootup),
                changed: Notify::new(),
                pending_changes: Mutex::new(Vec::new()),
                callbacks: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            }),
        }
    }

    /// The node ID
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The current NMT state
    pub fn nmt_state(&self) -> NmtState {
        *self.inner.state.borrow()
    }

    /// Subscribe to NMT state changes
    pub fn subscribe_state(&self) -> watch::Receiver<NmtState> {
        self.inner.state.subscribe()
    }

    /// Lock the node's object dictionary
    ///
    /// Values changed through the guard do not trigger event driven TPDOs; use
    /// [`Self::set_value`] for that.
    pub fn od(&self) -> std::sync::MutexGuard<'_, ObjectDictionary> {
        lock(&self.inner.od)
    }

    /// Get the current value of an entry
    pub fn value(&self, index: u16, sub: u8) -> Result<Value, ObjectDictionaryError> {
        self.od().value(index, sub).cloned()
    }

    /// Store a value as the application, checking type and limits
    ///
    /// Event driven TPDOs mapping the entry are sent.
    pub fn set_value(
        &self,
        index: u16,
        sub: u8,
        value: impl Into<Value>,
    ) -> Result<(), ObjectDictionaryError> {
        self.od().set_value(index, sub, value.into())?;
        lock(&self.inner.pending_changes).push((index, sub));
        self.inner.changed.notify_one();
        Ok(())
    }

    /// Register a callback run after an entry is written over SDO or by an RPDO
    ///
    /// Callbacks run on the node's task and should return quickly.
    pub fn add_write_callback(&self, f: impl Fn(u16, u8) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).push(Arc::new(f));
    }

    /// Send an emergency message from this node
    ///
    /// The error register (0x1001) is updated when present.
    pub async fn send_emcy(&self, code: u16, register: u8, data: [u8; 5]) -> Result<(), BusError> {
        {
            let mut od = self.od();
            if od.get(object_ids::ERROR_REGISTER, 0).is_ok() {
                // Only fails for a type mismatch, which leaves the register as it was
                let _ = od.update_value(object_ids::ERROR_REGISTER, 0, Value::U8(register));
            }
        }
        let event = EmergencyEvent {
            node: self.inner.id.raw(),
            code,
            register,
            data,
        };
        self.inner.bus.send(event.to_message()).await
    }

    /// Hand a received frame to the node's task
    pub(crate) fn handle_frame(&self, msg: &CanMessage) {
        if let Some(tx) = lock(&self.inner.inbox).as_ref() {
            // Closed only while the node is stopping
            let _ = tx.send(*msg);
        }
    }

    /// Start the node's task; it announces bootup immediately
    pub(crate) fn start(&self) {
        self.stop();
        let Ok(token) = self.inner.bus.session_token() else {
            return;
        };
        let token = token.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.inbox) = Some(tx);
        let engine = Engine::new(self.inner.clone());
        let handle = tokio::spawn(engine.run(rx, token.clone()));
        *lock(&self.inner.task) = Some((handle, token));
    }

    /// Stop the node's task
    pub(crate) fn stop(&self) -> Option<JoinHandle<()>> {
        lock(&self.inner.inbox).take();
        let (handle, token) = lock(&self.inner.task).take()?;
        token.cancel();
        Some(handle)
    }
}

/// A TPDO as currently configured in the dictionary
struct TxPdo {
    cob: PdoCobId,
    mappings: Vec<PdoMapping>,
    schedule: TxSchedule,
    event_period: Option<Duration>,
    next_event: Option<Instant>,
}

/// An RPDO as currently configured in the dictionary
struct RxPdo {
    cob: PdoCobId,
    mappings: Vec<PdoMapping>,
}

fn read_u32(od: &ObjectDictionary, index: u16, sub: u8) -> Option<u32> {
    match od.value(index, sub).ok()? {
        Value::U32(v) => Some(*v),
        _ => None,
    }
}

fn read_u16(od: &ObjectDictionary, index: u16, sub: u8) -> Option<u16> {
    match od.value(index, sub).ok()? {
        Value::U16(v) => Some(*v),
        _ => None,
    }
}

fn read_u8(od: &ObjectDictionary, index: u16, sub: u8) -> Option<u8> {
    match od.value(index, sub).ok()? {
        Value::U8(v) => Some(*v),
        _ => None,
    }
}

/// Read a PDO's valid COB-ID and mapping from its parameters
fn read_pdo(od: &ObjectDictionary, comm: u16, map: u16) -> Option<(PdoCobId, Vec<PdoMapping>)> {
    let cob = PdoCobId::from_object_value(read_u32(od, comm, 1)?);
    if !cob.valid {
        return None;
    }
    let count = read_u8(od, map, 0)?.min(MAX_MAPPINGS as u8);
    let mappings = (1..=count)
        .map(|sub| read_u32(od, map, sub).map(PdoMapping::from_object_value))
        .collect::<Option<Vec<_>>>()?;
    Some((cob, mappings))
}

struct Engine {
    shared: Arc<Shared>,
    state: NmtState,
    sdo_server: SdoServer,
    guard_toggle: bool,
    heartbeat_period: Option<Duration>,
    next_heartbeat: Option<Instant>,
    tpdos: Vec<TxPdo>,
    rpdos: Vec<RxPdo>,
}

impl Engine {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            state: NmtState::Bootup,
            sdo_server: SdoServer::new(),
            guard_toggle: false,
            heartbeat_period: None,
            next_heartbeat: None,
            tpdos: Vec::new(),
            rpdos: Vec::new(),
        }
    }

    fn od(&self) -> std::sync::MutexGuard<'_, ObjectDictionary> {
        lock(&self.shared.od)
    }

    fn send(&self, msg: CanMessage) {
        if let Err(e) = self.shared.bus.queue(msg) {
            log::warn!("Node {}: cannot send: {e}", self.shared.id);
        }
    }

    fn set_state(&mut self, state: NmtState) {
        if state != self.state {
            log::debug!(
                "Node {} NMT state {} -> {}",
                self.shared.id,
                self.state,
                state
            );
        }
        self.state = state;
        if !state.accepts_sdo() {
            self.sdo_server.reset();
        }
        self.shared.state.send_replace(state);
    }

    fn boot(&mut self) {
        self.guard_toggle = false;
        self.sdo_server.reset();
        self.set_state(NmtState::Bootup);
        self.send(
            Heartbeat {
                node: self.shared.id.raw(),
                toggle: false,
                state: NmtState::Bootup,
            }
            .into(),
        );
        self.set_state(NmtState::PreOperational);
        self.reload_heartbeat();
        self.reload_pdos();
    }

    fn reload_heartbeat(&mut self) {
        let ms = read_u16(&self.od(), object_ids::HEARTBEAT_PRODUCER_TIME, 0).unwrap_or(0);
        self.heartbeat_period = (ms > 0).then(|| Duration::from_millis(ms as u64));
        self.next_heartbeat = self.heartbeat_period.map(|p| Instant::now() + p);
    }

    fn reload_pdos(&mut self) {
        let now = Instant::now();
        let od = lock(&self.shared.od);
        let mut tpdos = Vec::new();
        let mut rpdos = Vec::new();
        for n in 0..PDO_COUNT as u16 {
            let comm = object_ids::TPDO_COMM_BASE + n;
            if let Some((cob, mappings)) = read_pdo(&od, comm, object_ids::TPDO_MAP_BASE + n) {
                let tt = read_u8(&od, comm, 2)
                    .and_then(|t| TransmissionType::try_from(t).ok())
                    .unwrap_or(TransmissionType::EventProfile);
                let timer = read_u16(&od, comm, 5).unwrap_or(0);
                let event_period = (timer > 0 && tt.is_event_driven())
                    .then(|| Duration::from_millis(timer as u64));
                let inhibit = read_u16(&od, comm, 3).unwrap_or(0);
                tpdos.push(TxPdo {
                    cob,
                    mappings,
                    schedule: TxSchedule::new(tt)
                        .with_inhibit_time(Duration::from_micros(inhibit as u64 * 100)),
                    event_period,
                    next_event: event_period.map(|p| now + p),
                });
            }
            if let Some((cob, mappings)) = read_pdo(
                &od,
                object_ids::RPDO_COMM_BASE + n,
                object_ids::RPDO_MAP_BASE + n,
            ) {
                rpdos.push(RxPdo { cob, mappings });
            }
        }
        drop(od);
        self.tpdos = tpdos;
        self.rpdos = rpdos;
    }

    fn build_tpdo(&self, pdo: &TxPdo) -> Option<CanMessage> {
        let values: Vec<u64> = {
            let od = self.od();
            pdo.mappings
                .iter()
                .map(|m| {
                    od.value(m.index, m.sub)
                        .ok()
                        .and_then(Value::to_bits)
                        .unwrap_or(0)
                })
                .collect()
        };
        let (data, len) = pack(&pdo.mappings, &values)?;
        Some(CanMessage::new(pdo.cob.id, &data[..len]))
    }

    fn send_tpdo(&self, i: usize) {
        if let Some(msg) = self.tpdos.get(i).and_then(|p| self.build_tpdo(p)) {
            self.send(msg);
        }
    }

    fn notify_written(&self, index: u16, sub: u8) {
        let callbacks: Vec<WriteCallback> = lock(&self.shared.callbacks).clone();
        for cb in callbacks {
            cb(index, sub);
        }
    }

    fn handle_nmt(&mut self, cs: NmtCommandSpecifier) {
        match cs {
            NmtCommandSpecifier::Start => {
                // Pick up any PDO configuration written while pre-operational
                self.reload_pdos();
                self.set_state(NmtState::Operational);
            }
            NmtCommandSpecifier::Stop => self.set_state(NmtState::Stopped),
            NmtCommandSpecifier::EnterPreOp => self.set_state(NmtState::PreOperational),
            NmtCommandSpecifier::ResetApp => {
                self.od().reset_defaults();
                self.boot();
            }
            NmtCommandSpecifier::ResetComm => {
                self.od().reset_communication();
                self.boot();
            }
        }
    }

    fn handle_sdo(&mut self, msg: &CanMessage) {
        if !self.state.accepts_sdo() {
            return;
        }
        let output = {
            let mut od = lock(&self.shared.od);
            self.sdo_server.handle(msg.data(), &mut od)
        };
        let resp_id = CanId::std(SDO_RESP_BASE + self.shared.id.raw() as u16);
        for data in output.responses {
            self.send(CanMessage::new(resp_id, &data));
        }
        if let Some((index, sub)) = output.written {
            if index == object_ids::HEARTBEAT_PRODUCER_TIME {
                self.reload_heartbeat();
            }
            if object_ids::is_pdo_parameter(index) {
                self.reload_pdos();
            }
            self.notify_written(index, sub);
        }
    }

    fn handle_guard_request(&mut self) {
        self.send(
            Heartbeat {
                node: self.shared.id.raw(),
                toggle: self.guard_toggle,
                state: self.state,
            }
            .into(),
        );
        self.guard_toggle = !self.guard_toggle;
    }

    fn handle_sync(&mut self) {
        let due: Vec<usize> = self
            .tpdos
            .iter_mut()
            .enumerate()
            .filter_map(|(i, p)| p.schedule.on_sync().then_some(i))
            .collect();
        for i in due {
            self.send_tpdo(i);
        }
    }

    fn handle_pdo(&mut self, msg: &CanMessage) {
        if msg.is_rtr() {
            let matching = self
                .tpdos
                .iter()
                .position(|p| p.cob.id == msg.id() && p.cob.rtr_allowed);
            if let Some(i) = matching {
                self.send_tpdo(i);
            }
            return;
        }
        let Some(rpdo) = self.rpdos.iter().find(|p| p.cob.id == msg.id()) else {
            return;
        };
        let Some(raw) = unpack(&rpdo.mappings, msg.data()) else {
            log::warn!(
                "Node {}: RPDO {:?} with {} bytes is too short",
                self.shared.id,
                msg.id(),
                msg.data().len()
            );
            return;
        };
        let mut written = Vec::with_capacity(rpdo.mappings.len());
        {
            let mut od = lock(&self.shared.od);
            for (m, bits) in rpdo.mappings.iter().zip(raw.iter()) {
                let Ok(entry) = od.get(m.index, m.sub) else {
                    continue;
                };
                let data_type = entry.data_type;
                if let Some(value) = Value::from_bits(data_type, *bits) {
                    if od.update_value(m.index, m.sub, value).is_ok() {
                        written.push((m.index, m.sub));
                    }
                }
            }
        }
        for (index, sub) in written {
            self.notify_written(index, sub);
        }
    }

    fn handle_frame(&mut self, msg: CanMessage) {
        let id = self.shared.id.raw();
        match MessageKind::classify(&msg) {
            MessageKind::NmtCommand => {
                if let Ok(cmd) = NmtCommand::try_from(msg) {
                    if cmd.node == 0 || cmd.node == id {
                        self.handle_nmt(cmd.cs);
                    }
                }
            }
            MessageKind::SdoRequest { node } if node == id => self.handle_sdo(&msg),
            MessageKind::GuardRequest { node } if node == id => self.handle_guard_request(),
            MessageKind::Sync if self.state.accepts_pdo() => self.handle_sync(),
            _ if self.state.accepts_pdo() => self.handle_pdo(&msg),
            _ => (),
        }
    }

    fn handle_changes(&mut self) {
        let changes = std::mem::take(&mut *lock(&self.shared.pending_changes));
        if !self.state.accepts_pdo() {
            return;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        for (i, pdo) in self.tpdos.iter_mut().enumerate() {
            let maps_change = pdo
                .mappings
                .iter()
                .any(|m| changes.contains(&(m.index, m.sub)));
            if maps_change && pdo.schedule.on_change(now) {
                pdo.next_event = pdo.event_period.map(|p| now + p);
                due.push(i);
            }
        }
        for i in due {
            self.send_tpdo(i);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let events = self
            .tpdos
            .iter()
            .flat_map(|p| [p.next_event, p.schedule.held_until()])
            .flatten();
        let pdo_deadline = if self.state.accepts_pdo() {
            events.min()
        } else {
            None
        };
        match (self.next_heartbeat, pdo_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();
        if let (Some(next), Some(period)) = (self.next_heartbeat, self.heartbeat_period) {
            if now >= next {
                self.send(
                    Heartbeat {
                        node: self.shared.id.raw(),
                        toggle: false,
                        state: self.state,
                    }
                    .into(),
                );
                // Skip missed beats rather than bursting them
                self.next_heartbeat = Some((next + period).max(now));
            }
        }
        if !self.state.accepts_pdo() {
            return;
        }
        let mut due = Vec::new();
        for (i, pdo) in self.tpdos.iter_mut().enumerate() {
            if pdo.schedule.held_until().is_some_and(|t| now >= t)
                && pdo.schedule.on_inhibit_elapsed(now)
            {
                pdo.next_event = pdo.event_period.map(|p| now + p);
                due.push(i);
                continue;
            }
            if let (Some(next), Some(period)) = (pdo.next_event, pdo.event_period) {
                if now >= next {
                    pdo.next_event = Some(now + period);
                    if pdo.schedule.on_timer(now) {
                        due.push(i);
                    }
                }
            }
        }
        for i in due {
            self.send_tpdo(i);
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<CanMessage>, token: CancellationToken) {
        self.boot();
        let shared = self.shared.clone();
        loop {
            let deadline = self.next_deadline();
            let timer = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle_frame(msg),
                    None => break,
                },
                _ = shared.changed.notified() => self.handle_changes(),
                _ = timer => self.handle_timers(),
            }
        }
        log::debug!("Local node {} stopped", self.shared.id);
    }
}
