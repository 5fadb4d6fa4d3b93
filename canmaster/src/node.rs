//! Handle for a remote node on a [`Network`](crate::Network)

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use canmaster_common::{
    emcy::EmergencyEvent,
    messages::{CanId, CanMessage, Heartbeat},
    objects::ObjectDictionary,
    NodeId,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::BusHandle,
    cia402::{Drive, ParameterChannel},
    config::{NodeConfig, PdoTableConfig},
    emcy::EmcyConsumer,
    heartbeat::{spawn_supervisor, Liveness, Supervision, SupervisorParams},
    nmt::{NmtMaster, NmtTracker},
    pdo::{Pdo, PdoContext, PdoDirection, PdoError, PdoMaps},
    sdo_client::{SdoClient, SdoSettings},
    sync::SyncProducer,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Network wide settings a node needs
#[derive(Clone, Copy, Debug)]
pub(crate) struct NodeSettings {
    pub sdo: SdoSettings,
    pub supervision_tick: Duration,
    pub grace_factor: f64,
    pub guard_miss_limit: u8,
}

struct Shared {
    id: NodeId,
    od: Arc<Mutex<ObjectDictionary>>,
    bus: BusHandle,
    settings: NodeSettings,
    sdo: SdoClient,
    sdo_responses: mpsc::UnboundedSender<CanMessage>,
    tracker: Arc<NmtTracker>,
    nmt: NmtMaster,
    tpdo: PdoMaps,
    rpdo: PdoMaps,
    emcy: EmcyConsumer,
    liveness: Arc<watch::Sender<Liveness>>,
    supervision: Mutex<Supervision>,
    supervisor: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    drive_lock: Arc<tokio::sync::Mutex<()>>,
}

/// A remote node
///
/// Cloning is cheap; all clones refer to the same node.
#[derive(Clone)]
pub struct RemoteNode {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("id", &self.inner.id)
            .field("nmt", &self.inner.nmt.state())
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl RemoteNode {
    pub(crate) fn new(
        id: NodeId,
        od: ObjectDictionary,
        bus: BusHandle,
        sync: SyncProducer,
        settings: NodeSettings,
    ) -> Self {
        let od = Arc::new(Mutex::new(od));
        let tracker = Arc::new(NmtTracker::new());
        let (sdo_responses, rx) = mpsc::unbounded_channel();
        let sdo = SdoClient::new(
            id,
            bus.clone(),
            rx,
            tracker.clone(),
            od.clone(),
            settings.sdo,
        );
        let ctx = PdoContext {
            node_id: id,
            od: od.clone(),
            sdo: sdo.clone(),
            bus: bus.clone(),
            sync,
        };
        Self {
            inner: Arc::new(Shared {
                id,
                nmt: NmtMaster::new(id, bus.clone(), tracker.clone()),
                tpdo: PdoMaps::new(PdoDirection::Tpdo, ctx.clone()),
                rpdo: PdoMaps::new(PdoDirection::Rpdo, ctx),
                od,
                bus,
                settings,
                sdo,
                sdo_responses,
                tracker,
                emcy: EmcyConsumer::new(id),
                liveness: Arc::new(watch::Sender::new(Liveness::Unknown)),
                supervision: Mutex::new(Supervision::Off),
                supervisor: Mutex::new(None),
                drive_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// The node ID
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Lock the node's object dictionary, which holds the last known value of each entry
    pub fn od(&self) -> std::sync::MutexGuard<'_, ObjectDictionary> {
        lock(&self.inner.od)
    }

    /// The node's SDO client
    pub fn sdo(&self) -> &SdoClient {
        &self.inner.sdo
    }

    /// NMT operations for the node
    pub fn nmt(&self) -> &NmtMaster {
        &self.inner.nmt
    }

    /// PDOs transmitted by the node
    pub fn tpdo(&self) -> &PdoMaps {
        &self.inner.tpdo
    }

    /// PDOs received by the node
    pub fn rpdo(&self) -> &PdoMaps {
        &self.inner.rpdo
    }

    /// Emergency messages from the node
    pub fn emcy(&self) -> &EmcyConsumer {
        &self.inner.emcy
    }

    /// Current liveness
    pub fn liveness(&self) -> Liveness {
        *self.inner.liveness.borrow()
    }

    /// Subscribe to liveness changes
    pub fn subscribe_liveness(&self) -> watch::Receiver<Liveness> {
        self.inner.liveness.subscribe()
    }

    /// The configured supervision
    pub fn supervision(&self) -> Supervision {
        *lock(&self.inner.supervision)
    }

    /// Select how the node's liveness is supervised
    ///
    /// Replaces any running supervision, so heartbeat consumption and node guarding never run at
    /// the same time. Takes effect immediately when connected, otherwise on connect.
    pub fn set_supervision(&self, supervision: Supervision) {
        *lock(&self.inner.supervision) = supervision;
        if self.inner.bus.is_connected() {
            self.start_supervisor();
        }
    }

    /// Apply a node configuration to the local PDO maps and the supervision
    ///
    /// The PDOs are disabled, reconfigured and then enabled as configured. Nothing is sent to the
    /// node; use [`PdoMaps::save`] to write the PDO configuration.
    pub fn apply_config(&self, config: &NodeConfig) -> Result<(), PdoError> {
        for (n, table) in &config.tpdo {
            self.apply_pdo(self.inner.tpdo.get(*n), table)?;
        }
        for (n, table) in &config.rpdo {
            self.apply_pdo(self.inner.rpdo.get(*n), table)?;
        }
        self.set_supervision(config.supervision());
        Ok(())
    }

    fn apply_pdo(&self, pdo: Option<&Pdo>, table: &PdoTableConfig) -> Result<(), PdoError> {
        let Some(pdo) = pdo else {
            return Ok(());
        };
        pdo.disable();
        if let Some(raw) = table.cob_id {
            let id = if raw > 0x7FF {
                CanId::extended(raw)
            } else {
                CanId::std(raw as u16)
            };
            pdo.set_cob_id(Some(id))?;
        }
        pdo.set_inhibit_time(table.inhibit_time)?;
        for m in &table.mappings {
            let entry_bits = self
                .od()
                .get(m.index, m.sub)
                .map_err(|source| PdoError::Dictionary { source })?
                .pdo_bits();
            if entry_bits != Some(m.size) {
                return Err(PdoError::NotMappable {
                    index: m.index,
                    sub: m.sub,
                });
            }
        }
        pdo.configure(
            table.mappings.iter().map(|m| (m.index, m.sub)),
            table.transmission_type,
            table.event_timer,
            table.enabled,
        )
    }

    /// Create a CiA-402 drive handle using `channel` for the control and status words
    pub fn drive<C: ParameterChannel>(&self, channel: C) -> Drive<C> {
        Drive::new(
            channel,
            self.inner.sdo.clone(),
            self.inner.drive_lock.clone(),
        )
    }

    pub(crate) fn tracker(&self) -> &NmtTracker {
        &self.inner.tracker
    }

    /// (Re)start liveness supervision on the current connection
    pub(crate) fn start_supervisor(&self) {
        self.stop_supervisor();
        let supervision = self.supervision();
        if supervision == Supervision::Off {
            self.inner.liveness.send_replace(Liveness::Unknown);
            return;
        }
        let Ok(token) = self.inner.bus.session_token() else {
            return;
        };
        let token = token.child_token();
        let settings = self.inner.settings;
        let handle = spawn_supervisor(
            SupervisorParams {
                node_id: self.inner.id,
                supervision,
                tick: settings.supervision_tick,
                grace_factor: settings.grace_factor,
                guard_miss_limit: settings.guard_miss_limit,
                bus: self.inner.bus.clone(),
                status: self.inner.tracker.subscribe(),
                liveness: self.inner.liveness.clone(),
            },
            token.clone(),
        );
        *lock(&self.inner.supervisor) = Some((handle, token));
    }

    /// Stop supervision, returning the task so the caller can wait for it
    pub(crate) fn stop_supervisor(&self) -> Option<JoinHandle<()>> {
        let (handle, token) = lock(&self.inner.supervisor).take()?;
        token.cancel();
        Some(handle)
    }

    /// Stop every background task of the node
    pub(crate) fn shutdown(&self) -> Option<JoinHandle<()>> {
        self.inner.tpdo.stop();
        self.inner.rpdo.stop();
        self.stop_supervisor()
    }

    pub(crate) fn on_sdo_response(&self, msg: CanMessage) {
        // The receiver lives as long as the client
        let _ = self.inner.sdo_responses.send(msg);
    }

    pub(crate) fn on_heartbeat(&self, hb: Heartbeat) {
        self.inner.tracker.on_heartbeat(hb);
    }

    pub(crate) fn on_emcy(&self, event: EmergencyEvent) {
        self.inner.emcy.dispatch(event);
    }

    pub(crate) fn on_pdo(&self, msg: &CanMessage) -> bool {
        self.inner.tpdo.handle_frame(msg)
    }
}
