//! PDO configuration, reception and production for remote nodes
//!
//! Each [`RemoteNode`](crate::RemoteNode) has two [`PdoMaps`]:
//!
//! - `tpdo`: PDOs transmitted by the node and received by the master. Incoming frames on an
//!   enabled TPDO's COB-ID are unpacked into the node's object dictionary.
//! - `rpdo`: PDOs received by the node, which the master produces with [`Pdo::transmit`] or the
//!   scheduler started by [`Pdo::start`].
//!
//! Configuration is local until [`Pdo::save`] writes it to the device.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use canmaster_common::{
    constants::object_ids,
    messages::CanId,
    objects::{DataType, ObjectDictionary, ObjectDictionaryError, Value},
    pdo::{
        default_rpdo_cob_id, default_tpdo_cob_id, mapped_bits, pack, unpack, PdoCobId,
        PdoMapping, TransmissionType, MAX_MAPPINGS, MAX_PDO_BITS,
    },
    sdo::AbortCode,
    CanMessage, NodeId,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{
    sync::{broadcast, watch, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{BusError, BusHandle},
    sdo_client::{MappingGuard, RawAbortCode, SdoClient, SdoClientError},
    sync::SyncProducer,
};

/// Number of PDOs of each direction tracked per node
pub const PDO_COUNT: usize = 8;

/// Errors returned by [`Pdo`] operations
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum PdoError {
    /// The mapping cannot change while the PDO is enabled
    PdoEnabled,
    /// The mapped variables need more than 64 bits
    #[snafu(display("Mapping needs {bits} bits, at most 64 fit in a PDO"))]
    MappingTooLarge {
        /// Total bits requested
        bits: u32,
    },
    /// A mapping entry has a size of zero bits
    #[snafu(display("0x{index:04X}sub{sub} is mapped with zero bits"))]
    EmptyMapping {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// The transmission type is reserved
    #[snafu(display("Transmission type {value} is reserved"))]
    InvalidTransmissionType {
        /// The rejected value
        value: u8,
    },
    /// The entry is not PDO mappable, or has no fixed size
    #[snafu(display("0x{index:04X}sub{sub} cannot be mapped"))]
    NotMappable {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// The PDO has no COB-ID
    NoCobId,
    /// The operation does not apply to a PDO of this direction
    WrongDirection,
    /// Variable lookup or value check failed
    #[snafu(display("{source}"))]
    Dictionary {
        /// The dictionary error
        source: ObjectDictionaryError,
    },
    /// Writing or reading the configuration failed
    #[snafu(display("{source}"))]
    Sdo {
        /// The SDO error
        source: SdoClientError,
    },
    /// Sending failed
    #[snafu(display("{source}"))]
    Bus {
        /// The bus error
        source: BusError,
    },
}

type Result<T> = std::result::Result<T, PdoError>;

/// Which side produces a PDO
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PdoDirection {
    /// Transmitted by the node, received by the master
    Tpdo,
    /// Received by the node, produced by the master
    Rpdo,
}

impl PdoDirection {
    fn comm_base(&self) -> u16 {
        match self {
            PdoDirection::Tpdo => object_ids::TPDO_COMM_BASE,
            PdoDirection::Rpdo => object_ids::RPDO_COMM_BASE,
        }
    }

    fn map_base(&self) -> u16 {
        match self {
            PdoDirection::Tpdo => object_ids::TPDO_MAP_BASE,
            PdoDirection::Rpdo => object_ids::RPDO_MAP_BASE,
        }
    }
}

/// A reference to an object dictionary entry, by name or by key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VariableRef {
    /// "Object" or "Object.Sub"
    Name(String),
    /// (index, sub)
    Key(u16, u8),
}

impl From<&str> for VariableRef {
    fn from(value: &str) -> Self {
        VariableRef::Name(value.into())
    }
}

impl From<String> for VariableRef {
    fn from(value: String) -> Self {
        VariableRef::Name(value)
    }
}

impl From<(u16, u8)> for VariableRef {
    fn from(value: (u16, u8)) -> Self {
        VariableRef::Key(value.0, value.1)
    }
}

/// A variable mapped into a PDO, resolved against the object dictionary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PdoVariable {
    /// Entry name
    pub name: String,
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
    /// Mapped size in bits
    pub bits: u8,
    /// Entry type
    pub data_type: DataType,
}

impl PdoVariable {
    /// The mapping word for this variable
    pub fn mapping(&self) -> PdoMapping {
        PdoMapping {
            index: self.index,
            sub: self.sub,
            size: self.bits,
        }
    }
}

/// Local configuration of a PDO
#[derive(Clone, Debug, PartialEq)]
pub struct PdoConfig {
    /// Frame identifier, None if the PDO has none assigned
    pub cob_id: Option<CanId>,
    /// Whether the PDO is active
    pub enabled: bool,
    /// Whether remote requests are allowed
    pub rtr_allowed: bool,
    /// When the PDO is sent
    pub transmission_type: TransmissionType,
    /// Event timer in milliseconds, 0 to disable
    pub event_timer: u16,
    /// Minimum time between event driven transmissions, in units of 100 µs
    pub inhibit_time: u16,
    /// Mapped variables in payload order
    pub variables: Vec<PdoVariable>,
}

impl PdoConfig {
    fn mappings(&self) -> Vec<PdoMapping> {
        self.variables.iter().map(PdoVariable::mapping).collect()
    }

    /// The inhibit time as a duration
    pub fn inhibit(&self) -> Duration {
        Duration::from_micros(self.inhibit_time as u64 * 100)
    }

    fn event_period(&self) -> Option<Duration> {
        (self.event_timer > 0 && self.transmission_type.is_event_driven())
            .then(|| Duration::from_millis(self.event_timer as u64))
    }
}

/// A received PDO frame, unpacked
#[derive(Clone, Debug, PartialEq)]
pub struct Reception {
    /// When the dispatch task received the frame
    pub timestamp: Instant,
    /// Raw payload
    pub data: Vec<u8>,
    /// One value per mapped variable, in mapping order
    pub values: Vec<Value>,
}

/// Decides when a produced PDO is sent
///
/// Shared by the master's PDO scheduler and [`LocalNode`](crate::LocalNode) TPDOs. Event driven
/// sends inside the inhibit time of the previous one are held back until it has passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TxSchedule {
    transmission_type: TransmissionType,
    sync_count: u8,
    dirty: bool,
    inhibit: Duration,
    last_event: Option<Instant>,
    held: bool,
}

impl TxSchedule {
    pub fn new(transmission_type: TransmissionType) -> Self {
        Self {
            transmission_type,
            sync_count: 0,
            dirty: false,
            inhibit: Duration::ZERO,
            last_event: None,
            held: false,
        }
    }

    /// Set the minimum time between event driven sends
    pub fn with_inhibit_time(mut self, inhibit: Duration) -> Self {
        self.inhibit = inhibit;
        self
    }

    /// A SYNC was received; returns true if the PDO should be sent now
    pub fn on_sync(&mut self) -> bool {
        match self.transmission_type {
            TransmissionType::SyncCyclic(n) => {
                self.sync_count += 1;
                if self.sync_count >= n {
                    self.sync_count = 0;
                    true
                } else {
                    false
                }
            }
            TransmissionType::SyncAcyclic => std::mem::take(&mut self.dirty),
            _ => false,
        }
    }

    /// A mapped value changed; returns true if the PDO should be sent now
    pub fn on_change(&mut self, now: Instant) -> bool {
        match self.transmission_type {
            TransmissionType::SyncAcyclic => {
                self.dirty = true;
                false
            }
            t if t.is_event_driven() => self.event(now),
            _ => false,
        }
    }

    /// The event timer expired; returns true if the PDO should be sent now
    pub fn on_timer(&mut self, now: Instant) -> bool {
        self.transmission_type.is_event_driven() && self.event(now)
    }

    /// When a held back event may be sent
    pub fn held_until(&self) -> Option<Instant> {
        if !self.held {
            return None;
        }
        self.last_event.map(|t| t + self.inhibit)
    }

    /// The inhibit time of a held back event passed; returns true if the PDO should be sent now
    pub fn on_inhibit_elapsed(&mut self, now: Instant) -> bool {
        self.held && self.event(now)
    }

    fn event(&mut self, now: Instant) -> bool {
        if self.last_event.is_some_and(|t| now < t + self.inhibit) {
            self.held = true;
            return false;
        }
        self.last_event = Some(now);
        self.held = false;
        true
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

pub(crate) fn resolve_variable(
    od: &ObjectDictionary,
    var: &VariableRef,
) -> Result<PdoVariable> {
    let (index, sub) = match var {
        VariableRef::Name(name) => od.key_of(name).context(DictionarySnafu)?,
        VariableRef::Key(index, sub) => (*index, *sub),
    };
    let entry = od.get(index, sub).context(DictionarySnafu)?;
    if !entry.pdo_mappable {
        return NotMappableSnafu { index, sub }.fail();
    }
    let bits = entry.pdo_bits().context(NotMappableSnafu { index, sub })?;
    Ok(PdoVariable {
        name: entry.name.clone(),
        index,
        sub,
        bits,
        data_type: entry.data_type,
    })
}

fn check_size(variables: &[PdoVariable]) -> Result<()> {
    if let Some(v) = variables.iter().find(|v| v.bits == 0) {
        return EmptyMappingSnafu {
            index: v.index,
            sub: v.sub,
        }
        .fail();
    }
    let bits: u32 = variables.iter().map(|v| v.bits as u32).sum();
    if bits > MAX_PDO_BITS || variables.len() > MAX_MAPPINGS {
        return MappingTooLargeSnafu { bits }.fail();
    }
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a PDO needs from its node and network
#[derive(Clone)]
pub(crate) struct PdoContext {
    pub node_id: NodeId,
    pub od: Arc<Mutex<ObjectDictionary>>,
    pub sdo: SdoClient,
    pub bus: BusHandle,
    pub sync: SyncProducer,
}

struct PdoShared {
    num: usize,
    direction: PdoDirection,
    config: Mutex<PdoConfig>,
    /// Bumped on every configuration change, so a running scheduler picks it up
    revision: watch::Sender<u64>,
    ctx: PdoContext,
    reception: watch::Sender<Option<Reception>>,
    changed: Notify,
    scheduler: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

/// A single PDO of a remote node
#[derive(Clone)]
pub struct Pdo {
    inner: Arc<PdoShared>,
}

impl std::fmt::Debug for Pdo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pdo")
            .field("num", &self.inner.num)
            .field("direction", &self.inner.direction)
            .field("config", &self.config())
            .finish()
    }
}

impl Pdo {
    fn new(num: usize, direction: PdoDirection, ctx: PdoContext) -> Self {
        let node = ctx.node_id.raw();
        let cob_id = match direction {
            PdoDirection::Tpdo => default_tpdo_cob_id(num, node),
            PdoDirection::Rpdo => default_rpdo_cob_id(num, node),
        };
        Self {
            inner: Arc::new(PdoShared {
                num,
                direction,
                config: Mutex::new(PdoConfig {
                    cob_id,
                    enabled: false,
                    rtr_allowed: true,
                    transmission_type: TransmissionType::EventProfile,
                    event_timer: 0,
                    inhibit_time: 0,
                    variables: Vec::new(),
                }),
                revision: watch::Sender::new(0),
                ctx,
                reception: watch::Sender::new(None),
                changed: Notify::new(),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// PDO number, starting at 1
    pub fn number(&self) -> usize {
        self.inner.num
    }

    /// Which side produces this PDO
    pub fn direction(&self) -> PdoDirection {
        self.inner.direction
    }

    /// Index of the communication parameter record
    pub fn comm_index(&self) -> u16 {
        self.inner.direction.comm_base() + (self.inner.num as u16 - 1)
    }

    /// Index of the mapping parameter record
    pub fn mapping_index(&self) -> u16 {
        self.inner.direction.map_base() + (self.inner.num as u16 - 1)
    }

    /// A copy of the current configuration
    pub fn config(&self) -> PdoConfig {
        lock(&self.inner.config).clone()
    }

    /// The mapped variables
    pub fn variables(&self) -> Vec<PdoVariable> {
        lock(&self.inner.config).variables.clone()
    }

    /// The frame identifier
    pub fn cob_id(&self) -> Option<CanId> {
        lock(&self.inner.config).cob_id
    }

    /// Whether the PDO is enabled
    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.config).enabled
    }

    /// Modify the configuration, which is only allowed while disabled
    fn modify<T>(&self, f: impl FnOnce(&mut PdoConfig) -> Result<T>) -> Result<T> {
        let mut config = lock(&self.inner.config);
        if config.enabled {
            return PdoEnabledSnafu.fail();
        }
        let result = f(&mut config)?;
        drop(config);
        self.reconfigured();
        Ok(result)
    }

    fn reconfigured(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }

    /// Replace the mapping and transmission settings
    ///
    /// Fails with [`PdoError::PdoEnabled`] if the PDO is enabled. Nothing is sent; use
    /// [`Self::save`] to write the configuration to the device.
    pub fn configure<V: Into<VariableRef>>(
        &self,
        variables: impl IntoIterator<Item = V>,
        transmission_type: u8,
        event_timer: u16,
        enabled: bool,
    ) -> Result<()> {
        let transmission_type = TransmissionType::try_from(transmission_type).map_err(|e| {
            PdoError::InvalidTransmissionType { value: e.0 }
        })?;
        let variables = {
            let od = lock(&self.inner.ctx.od);
            variables
                .into_iter()
                .map(|v| resolve_variable(&od, &v.into()))
                .collect::<Result<Vec<_>>>()?
        };
        check_size(&variables)?;
        self.modify(|config| {
            config.variables = variables;
            config.transmission_type = transmission_type;
            config.event_timer = event_timer;
            config.enabled = enabled;
            Ok(())
        })
    }

    /// Append a variable to the mapping
    pub fn add_variable(&self, var: impl Into<VariableRef>) -> Result<()> {
        let var = resolve_variable(&lock(&self.inner.ctx.od), &var.into())?;
        self.modify(|config| {
            let mut variables = config.variables.clone();
            variables.push(var);
            check_size(&variables)?;
            config.variables = variables;
            Ok(())
        })
    }

    /// Remove all variables from the mapping
    pub fn clear(&self) -> Result<()> {
        self.modify(|config| {
            config.variables.clear();
            Ok(())
        })
    }

    /// Set the frame identifier
    pub fn set_cob_id(&self, cob_id: Option<CanId>) -> Result<()> {
        self.modify(|config| {
            config.cob_id = cob_id;
            Ok(())
        })
    }

    /// Set the inhibit time, in units of 100 µs
    ///
    /// Event driven transmissions are spaced at least this far apart.
    pub fn set_inhibit_time(&self, inhibit_time: u16) -> Result<()> {
        self.modify(|config| {
            config.inhibit_time = inhibit_time;
            Ok(())
        })
    }

    /// Set whether remote requests are allowed
    pub fn set_rtr_allowed(&self, allowed: bool) -> Result<()> {
        self.modify(|config| {
            config.rtr_allowed = allowed;
            Ok(())
        })
    }

    /// Enable the PDO
    pub fn enable(&self) {
        lock(&self.inner.config).enabled = true;
    }

    /// Disable the PDO
    ///
    /// A disabled TPDO ignores incoming frames, and a disabled RPDO is not produced.
    pub fn disable(&self) {
        lock(&self.inner.config).enabled = false;
    }

    /// Get the last known value of a mapped variable, by name
    pub fn get(&self, name: &str) -> Result<Value> {
        let key = self.find(name)?;
        self.get_key(key.0, key.1)
    }

    /// Get the last known value of a mapped variable, by key
    pub fn get_key(&self, index: u16, sub: u8) -> Result<Value> {
        lock(&self.inner.ctx.od)
            .value(index, sub)
            .cloned()
            .context(DictionarySnafu)
    }

    /// Set a variable's value, by name
    ///
    /// For produced PDOs this marks the data changed, which triggers event driven transmission.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let key = self.find(name)?;
        self.set_key(key.0, key.1, value)
    }

    /// Set a variable's value, by key
    pub fn set_key(&self, index: u16, sub: u8, value: impl Into<Value>) -> Result<()> {
        lock(&self.inner.ctx.od)
            .set_value(index, sub, value.into())
            .context(DictionarySnafu)?;
        self.inner.changed.notify_one();
        Ok(())
    }

    fn find(&self, name: &str) -> Result<(u16, u8)> {
        let config = lock(&self.inner.config);
        if let Some(v) = config.variables.iter().find(|v| v.name == name) {
            return Ok((v.index, v.sub));
        }
        drop(config);
        lock(&self.inner.ctx.od)
            .key_of(name)
            .context(DictionarySnafu)
    }

    /// Wait for the next frame of this PDO
    ///
    /// Returns None if nothing arrives within `timeout`.
    pub async fn wait_for_reception(&self, timeout: Duration) -> Option<Reception> {
        let mut rx = self.inner.reception.subscribe();
        rx.borrow_and_update();
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => rx.borrow().clone(),
            _ => None,
        }
    }

    /// The most recent reception, if any
    pub fn last_reception(&self) -> Option<Reception> {
        self.inner.reception.borrow().clone()
    }

    /// Handle a frame from the dispatch task; returns true if the frame belongs to this PDO
    pub(crate) fn handle_frame(&self, msg: &CanMessage) -> bool {
        if self.inner.direction != PdoDirection::Tpdo || msg.is_rtr() {
            return false;
        }
        let config = lock(&self.inner.config);
        if !config.enabled || config.cob_id != Some(msg.id()) {
            return false;
        }
        let mappings = config.mappings();
        let Some(raw) = unpack(&mappings, msg.data()) else {
            log::warn!(
                "TPDO{} of node {}: {} byte frame is too short for its mapping",
                self.inner.num,
                self.inner.ctx.node_id,
                msg.data().len()
            );
            return true;
        };
        let mut od = lock(&self.inner.ctx.od);
        let mut values = Vec::with_capacity(config.variables.len());
        for (var, bits) in config.variables.iter().zip(raw.iter()) {
            let value = Value::from_bits(var.data_type, *bits)
                .unwrap_or_else(|| Value::zero(var.data_type));
            if let Err(e) = od.update_value(var.index, var.sub, value.clone()) {
                log::warn!("Cannot store PDO value: {e}");
            }
            values.push(value);
        }
        drop(od);
        drop(config);
        self.inner.reception.send_replace(Some(Reception {
            timestamp: Instant::now(),
            data: msg.data().to_vec(),
            values,
        }));
        true
    }

    fn build_frame(&self) -> Result<CanMessage> {
        let config = self.config();
        let id = config.cob_id.context(NoCobIdSnafu)?;
        let values: Vec<u64> = {
            let od = lock(&self.inner.ctx.od);
            config
                .variables
                .iter()
                .map(|v| {
                    od.value(v.index, v.sub)
                        .ok()
                        .and_then(Value::to_bits)
                        .unwrap_or(0)
                })
                .collect()
        };
        let mappings = config.mappings();
        let (data, len) = pack(&mappings, &values).context(MappingTooLargeSnafu {
            bits: mapped_bits(&mappings),
        })?;
        Ok(CanMessage::new(id, &data[..len]))
    }

    /// Send the PDO once with the current variable values
    ///
    /// Only valid for RPDOs, which the master produces.
    pub async fn transmit(&self) -> Result<()> {
        if self.inner.direction != PdoDirection::Rpdo {
            return WrongDirectionSnafu.fail();
        }
        let msg = self.build_frame()?;
        self.inner.ctx.bus.send(msg).await.context(BusSnafu)
    }

    /// Ask the node to send this TPDO with a remote request frame
    pub async fn remote_request(&self) -> Result<()> {
        if self.inner.direction != PdoDirection::Tpdo {
            return WrongDirectionSnafu.fail();
        }
        let config = self.config();
        let id = config.cob_id.context(NoCobIdSnafu)?;
        let dlc = mapped_bits(&config.mappings()).div_ceil(8) as u8;
        self.inner
            .ctx
            .bus
            .send(CanMessage::new_rtr(id, dlc))
            .await
            .context(BusSnafu)
    }

    /// Start producing this RPDO in the background
    ///
    /// With a `period`, the PDO is sent at that fixed rate. Without one, it follows its
    /// transmission type: every N SYNCs for cyclic types, on the first SYNC after a change for
    /// type 0, and on change or event timer expiry for types 254 and 255, no more often than the
    /// inhibit time allows. Synchronous PDOs are only sent inside the network's synchronous window.
    /// A disabled PDO is not sent, but the scheduler keeps running, and configuration changes take
    /// effect without a restart.
    pub fn start(&self, period: Option<Duration>) -> Result<()> {
        if self.inner.direction != PdoDirection::Rpdo {
            return WrongDirectionSnafu.fail();
        }
        self.stop();
        let token = self
            .inner
            .ctx
            .bus
            .session_token()
            .context(BusSnafu)?
            .child_token();
        let pdo = self.clone();
        let handle = tokio::spawn(pdo.schedule(period, token.clone()));
        *lock(&self.inner.scheduler) = Some((handle, token));
        Ok(())
    }

    /// Stop the background scheduler
    pub fn stop(&self) {
        if let Some((handle, token)) = lock(&self.inner.scheduler).take() {
            token.cancel();
            handle.abort();
        }
    }

    async fn send_scheduled(&self, synchronous: bool) {
        if !self.is_enabled() {
            return;
        }
        if synchronous && !self.inner.ctx.sync.is_in_sync_window() {
            log::debug!(
                "RPDO{} of node {} outside the synchronous window, not sent",
                self.inner.num,
                self.inner.ctx.node_id
            );
            return;
        }
        let result = match self.build_frame() {
            Ok(msg) => self.inner.ctx.bus.send(msg).await.context(BusSnafu),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::error!(
                "Failed to send RPDO{} of node {}: {e}",
                self.inner.num,
                self.inner.ctx.node_id
            );
        }
    }

    async fn schedule(self, period: Option<Duration>, token: CancellationToken) {
        if let Some(period) = period {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => self.send_scheduled(false).await,
                }
            }
        }

        let mut revision = self.inner.revision.subscribe();
        let mut sync_rx = self.inner.ctx.sync.subscribe();
        loop {
            revision.borrow_and_update();
            let config = self.config();
            let synchronous = config.transmission_type.is_synchronous();
            let mut schedule =
                TxSchedule::new(config.transmission_type).with_inhibit_time(config.inhibit());
            let event_period = config.event_period();
            let mut deadline = event_period.map(|p| Instant::now() + p);

            loop {
                let timer = sleep_until(deadline);
                let inhibit = sleep_until(schedule.held_until());
                tokio::select! {
                    _ = token.cancelled() => return,
                    changed = revision.changed() => match changed {
                        Ok(()) => break,
                        Err(_) => return,
                    },
                    tick = sync_rx.recv() => match tick {
                        Ok(_) => {
                            if schedule.on_sync() {
                                self.send_scheduled(synchronous).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("PDO scheduler missed {n} SYNCs");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = self.inner.changed.notified() => {
                        if schedule.on_change(Instant::now()) {
                            self.send_scheduled(synchronous).await;
                            deadline = event_period.map(|p| Instant::now() + p);
                        }
                    }
                    _ = timer => {
                        if schedule.on_timer(Instant::now()) {
                            self.send_scheduled(synchronous).await;
                        }
                        deadline = event_period.map(|p| Instant::now() + p);
                    }
                    _ = inhibit => {
                        if schedule.on_inhibit_elapsed(Instant::now()) {
                            self.send_scheduled(synchronous).await;
                            deadline = event_period.map(|p| Instant::now() + p);
                        }
                    }
                }
            }
            log::debug!(
                "RPDO{} of node {} reconfigured",
                self.inner.num,
                self.inner.ctx.node_id
            );
        }
    }

    /// Write the configuration to the device
    ///
    /// The sequence is: invalidate the COB-ID, set the mapping count to 0, write each mapping,
    /// write the mapping count, write the transmission type, inhibit time and event timer, and
    /// finally restore a valid COB-ID if the PDO is enabled. Other SDO accesses to the node's PDO
    /// parameters wait until the sequence is complete.
    pub async fn save(&self) -> Result<()> {
        let guard = self.inner.ctx.sdo.lock_mapping().await;
        let config = self.config();
        let id = config.cob_id.context(NoCobIdSnafu)?;
        let comm = self.comm_index();
        let map = self.mapping_index();
        let cob = |valid| PdoCobId {
            id,
            valid,
            rtr_allowed: config.rtr_allowed,
        };

        self.download(&guard, comm, 1, Value::U32(cob(false).to_object_value()))
            .await?;
        self.download(&guard, map, 0, Value::U8(0)).await?;
        for (i, var) in config.variables.iter().enumerate() {
            self.download(
                &guard,
                map,
                (i + 1) as u8,
                Value::U32(var.mapping().to_object_value()),
            )
            .await?;
        }
        self.download(&guard, map, 0, Value::U8(config.variables.len() as u8))
            .await?;
        self.download(
            &guard,
            comm,
            2,
            Value::U8(config.transmission_type.into()),
        )
        .await?;
        self.download_optional(&guard, comm, 3, config.inhibit_time)
            .await?;
        self.download_optional(&guard, comm, 5, config.event_timer)
            .await?;
        if config.enabled {
            self.download(&guard, comm, 1, Value::U32(cob(true).to_object_value()))
                .await?;
        }
        Ok(())
    }

    /// Write an optional u16 parameter
    ///
    /// Devices without the entry are fine as long as the value is 0.
    async fn download_optional(
        &self,
        guard: &MappingGuard,
        index: u16,
        sub: u8,
        value: u16,
    ) -> Result<()> {
        match self.download(guard, index, sub, Value::U16(value)).await {
            Err(PdoError::Sdo {
                source:
                    SdoClientError::ServerAbort {
                        abort_code: RawAbortCode::Valid(AbortCode::NoSuchSubIndex),
                        ..
                    },
            }) if value == 0 => Ok(()),
            result => result,
        }
    }

    async fn download(
        &self,
        guard: &MappingGuard,
        index: u16,
        sub: u8,
        value: Value,
    ) -> Result<()> {
        self.inner
            .ctx
            .sdo
            .download_locked(guard, index, sub, &value.to_bytes())
            .await
            .context(SdoSnafu)?;
        // Keep the local copy in step with the device, where the dictionary has the entry
        let _ = lock(&self.inner.ctx.od).update_value(index, sub, value);
        Ok(())
    }

    /// Read the configuration from the device
    ///
    /// Mapped entries must exist in the node's object dictionary, and the mapping must fit in a
    /// PDO. The local configuration is left unchanged when either check fails.
    pub async fn read(&self) -> Result<()> {
        let sdo = &self.inner.ctx.sdo;
        let comm = self.comm_index();
        let map = self.mapping_index();
        let cob = PdoCobId::from_object_value(sdo.read_u32(comm, 1).await.context(SdoSnafu)?);
        let raw_type = sdo.read_u8(comm, 2).await.context(SdoSnafu)?;
        let transmission_type = TransmissionType::try_from(raw_type)
            .map_err(|e| PdoError::InvalidTransmissionType { value: e.0 })?;
        let inhibit_time = read_optional(sdo, comm, 3).await?;
        let event_timer = read_optional(sdo, comm, 5).await?;
        let count = sdo.read_u8(map, 0).await.context(SdoSnafu)?;
        let mut mappings = Vec::with_capacity(count as usize);
        for i in 0..count {
            let raw = sdo.read_u32(map, i + 1).await.context(SdoSnafu)?;
            mappings.push(PdoMapping::from_object_value(raw));
        }

        let variables = {
            let od = lock(&self.inner.ctx.od);
            mappings
                .iter()
                .map(|m| {
                    let entry = od.get(m.index, m.sub).context(DictionarySnafu)?;
                    Ok(PdoVariable {
                        name: entry.name.clone(),
                        index: m.index,
                        sub: m.sub,
                        bits: m.size,
                        data_type: entry.data_type,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        check_size(&variables)?;
        *lock(&self.inner.config) = PdoConfig {
            cob_id: Some(cob.id),
            enabled: cob.valid,
            rtr_allowed: cob.rtr_allowed,
            transmission_type,
            event_timer,
            inhibit_time,
            variables,
        };
        self.reconfigured();
        Ok(())
    }
}

/// Read an optional u16 parameter, 0 when the device does not have it
async fn read_optional(sdo: &SdoClient, index: u16, sub: u8) -> Result<u16> {
    match sdo.read_u16(index, sub).await {
        Ok(v) => Ok(v),
        Err(SdoClientError::ServerAbort {
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchSubIndex),
            ..
        }) => Ok(0),
        Err(e) => Err(e).context(SdoSnafu),
    }
}

/// The TPDOs or RPDOs of a node, numbered from 1
#[derive(Clone, Debug)]
pub struct PdoMaps {
    pdos: Vec<Pdo>,
}

impl PdoMaps {
    pub(crate) fn new(direction: PdoDirection, ctx: PdoContext) -> Self {
        Self {
            pdos: (1..=PDO_COUNT)
                .map(|n| Pdo::new(n, direction, ctx.clone()))
                .collect(),
        }
    }

    /// Get PDO `n`, starting at 1
    pub fn get(&self, n: usize) -> Option<&Pdo> {
        n.checked_sub(1).and_then(|i| self.pdos.get(i))
    }

    /// Iterate over all PDOs in number order
    pub fn iter(&self) -> impl Iterator<Item = &Pdo> {
        self.pdos.iter()
    }

    /// Read every PDO's configuration from the device
    pub async fn read(&self) -> Result<()> {
        for pdo in &self.pdos {
            pdo.read().await?;
        }
        Ok(())
    }

    /// Save every PDO's configuration to the device
    pub async fn save(&self) -> Result<()> {
        for pdo in &self.pdos {
            if pdo.cob_id().is_some() {
                pdo.save().await?;
            }
        }
        Ok(())
    }

    /// Stop all schedulers
    pub fn stop(&self) {
        for pdo in &self.pdos {
            pdo.stop();
        }
    }

    /// Offer a frame to every PDO; returns true if one accepted it
    pub(crate) fn handle_frame(&self, msg: &CanMessage) -> bool {
        self.pdos
            .iter()
            .fold(false, |handled, pdo| pdo.handle_frame(msg) || handled)
    }
}
