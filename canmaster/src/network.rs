//! The network: transport ownership, frame dispatch and node registry
//!
//! One dispatch task reads the transport and routes each frame by identifier: SDO responses to
//! the addressed node's client, heartbeats to its NMT tracker, emergencies to its consumer, and
//! anything matching a configured TPDO to that PDO. No handler blocks the task; slow work such as
//! EMCY callbacks runs elsewhere.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use canmaster_common::{
    emcy::EmergencyEvent,
    messages::{CanMessage, Heartbeat, MessageKind, NmtCommand},
    nmt::NmtCommandSpecifier,
    objects::ObjectDictionary,
    traits::{AsyncCanReceiver, AsyncCanSender},
    NodeId,
};
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{BusError, BusHandle},
    config::NetworkConfig,
    local_node::LocalNode,
    node::{NodeSettings, RemoteNode},
    pdo::PdoError,
    sdo_client::SdoSettings,
    sync::SyncProducer,
    time::TimeProducer,
};

/// Errors from [`Network`] operations
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum NetworkError {
    /// A node with the ID is already on the network
    #[snafu(display("Node {id} already exists"))]
    DuplicateNode {
        /// The node ID
        id: NodeId,
    },
    /// Applying the node's configuration failed
    #[snafu(display("Invalid configuration for node {id}: {source}"))]
    NodeConfig {
        /// The node ID
        id: NodeId,
        /// What failed
        source: PdoError,
    },
    /// Sending failed
    #[snafu(display("{source}"))]
    Bus {
        /// The bus error
        source: BusError,
    },
}

type Result<T> = std::result::Result<T, NetworkError>;

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    config: NetworkConfig,
    bus: BusHandle,
    sync: SyncProducer,
    time: TimeProducer,
    nodes: RwLock<BTreeMap<u8, RemoteNode>>,
    local_nodes: RwLock<BTreeMap<u8, LocalNode>>,
    malformed: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A CANopen network, as seen from the master
///
/// Cloning is cheap; all clones share the same connection and nodes.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("connected", &self.is_connected())
            .field("nodes", &read(&self.inner.nodes).keys().collect::<Vec<_>>())
            .field(
                "local_nodes",
                &read(&self.inner.local_nodes).keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}

impl Network {
    /// Create a disconnected network
    pub fn new(config: NetworkConfig) -> Self {
        let bus = BusHandle::default();
        Self {
            inner: Arc::new(Shared {
                sync: SyncProducer::new(bus.clone(), config.sync_settings()),
                time: TimeProducer::new(bus.clone()),
                bus,
                config,
                nodes: RwLock::new(BTreeMap::new()),
                local_nodes: RwLock::new(BTreeMap::new()),
                malformed: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The network configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    fn node_settings(&self) -> NodeSettings {
        let config = &self.inner.config;
        NodeSettings {
            sdo: SdoSettings {
                timeout: config.sdo_timeout(),
                block_transfer: config.block_transfer,
                block_threshold: config.block_threshold,
            },
            supervision_tick: config.supervision_tick(),
            grace_factor: config.heartbeat_grace_factor,
            guard_miss_limit: config.guard_miss_limit,
        }
    }

    /// Add a remote node described by `od`
    ///
    /// Settings for the node in the network configuration are applied. When connected,
    /// supervision starts immediately.
    pub fn add_node(&self, id: NodeId, od: ObjectDictionary) -> Result<RemoteNode> {
        let mut nodes = write(&self.inner.nodes);
        if nodes.contains_key(&id.raw()) {
            return DuplicateNodeSnafu { id }.fail();
        }
        let node = RemoteNode::new(
            id,
            od,
            self.inner.bus.clone(),
            self.inner.sync.clone(),
            self.node_settings(),
        );
        if let Some(config) = self.inner.config.nodes.get(&id.raw()) {
            node.apply_config(config).context(NodeConfigSnafu { id })?;
        }
        nodes.insert(id.raw(), node.clone());
        drop(nodes);
        log::info!("Added node {id}");
        Ok(node)
    }

    /// Add a node served by this process
    ///
    /// When connected, the node boots immediately.
    pub fn add_local_node(&self, id: NodeId, od: ObjectDictionary) -> Result<LocalNode> {
        let mut nodes = write(&self.inner.local_nodes);
        if nodes.contains_key(&id.raw()) {
            return DuplicateNodeSnafu { id }.fail();
        }
        let node = LocalNode::new(id, od, self.inner.bus.clone());
        nodes.insert(id.raw(), node.clone());
        drop(nodes);
        if self.is_connected() {
            node.start();
        }
        Ok(node)
    }

    /// Remove a remote or local node, stopping its background tasks
    pub fn remove_node(&self, id: NodeId) -> bool {
        let remote = write(&self.inner.nodes).remove(&id.raw());
        let local = write(&self.inner.local_nodes).remove(&id.raw());
        if let Some(node) = &remote {
            node.shutdown();
        }
        if let Some(node) = &local {
            node.stop();
        }
        remote.is_some() || local.is_some()
    }

    /// Get a remote node
    pub fn node(&self, id: u8) -> Option<RemoteNode> {
        read(&self.inner.nodes).get(&id).cloned()
    }

    /// All remote nodes, by ID
    pub fn nodes(&self) -> Vec<RemoteNode> {
        read(&self.inner.nodes).values().cloned().collect()
    }

    /// Get a local node
    pub fn local_node(&self, id: u8) -> Option<LocalNode> {
        read(&self.inner.local_nodes).get(&id).cloned()
    }

    /// The SYNC producer
    pub fn sync(&self) -> &SyncProducer {
        &self.inner.sync
    }

    /// The TIME producer
    pub fn time(&self) -> &TimeProducer {
        &self.inner.time
    }

    /// True while a transport is attached
    pub fn is_connected(&self) -> bool {
        self.inner.bus.is_connected()
    }

    /// Number of received frames which could not be decoded
    pub fn malformed_frame_count(&self) -> u64 {
        self.inner.malformed.load(Ordering::Relaxed)
    }

    /// Attach a transport and start the background tasks
    ///
    /// An existing connection is closed first. Starts the dispatch task, liveness supervision of
    /// every node, local nodes, and SYNC production if a period is configured.
    pub async fn connect<S: AsyncCanSender, R: AsyncCanReceiver>(&self, sender: S, receiver: R) {
        if self.is_connected() {
            self.disconnect().await;
        }
        let token = CancellationToken::new();
        let writer = self
            .inner
            .bus
            .attach(sender, self.inner.config.sdo_send_retries, token.clone());
        let dispatcher = tokio::spawn(dispatch_task(
            Arc::downgrade(&self.inner),
            receiver,
            token,
        ));
        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.push(writer);
            tasks.push(dispatcher);
        }
        log::info!("Network connected");

        for node in self.nodes() {
            node.start_supervisor();
        }
        let locals: Vec<LocalNode> = read(&self.inner.local_nodes).values().cloned().collect();
        for node in locals {
            node.start();
        }
        if let Some(period) = self.inner.config.sync_period() {
            if let Err(e) = self.inner.sync.start(period) {
                log::error!("Cannot start SYNC: {e}");
            }
        }
    }

    /// Close the connection
    ///
    /// Every background task is stopped and awaited. Operations waiting on the bus fail with
    /// [`BusError::Disconnected`].
    pub async fn disconnect(&self) {
        self.inner.sync.stop();
        self.inner.bus.detach();
        let mut handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for node in self.nodes() {
            handles.extend(node.shutdown());
        }
        let locals: Vec<LocalNode> = read(&self.inner.local_nodes).values().cloned().collect();
        for node in locals {
            handles.extend(node.stop());
        }
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                if e.is_panic() {
                    log::error!("Background task panicked: {e}");
                }
            }
        }
        log::info!("Network disconnected");
    }

    /// Send a raw frame
    pub async fn send_message(&self, msg: CanMessage) -> Result<()> {
        self.inner.bus.send(msg).await.context(BusSnafu)
    }

    /// Send an NMT command to all nodes
    ///
    /// Which nodes act on a broadcast is not confirmed, so the cached state of every remote node
    /// becomes unknown until its next heartbeat or bootup.
    pub async fn nmt_broadcast(&self, cs: NmtCommandSpecifier) -> Result<()> {
        for node in self.nodes() {
            match cs {
                NmtCommandSpecifier::ResetApp | NmtCommandSpecifier::ResetComm => {
                    node.tracker().mark_reset()
                }
                _ => node.tracker().mark_unknown(),
            }
        }
        let msg: CanMessage = NmtCommand { cs, node: 0 }.into();
        self.send_message(msg).await
    }

    /// Wait until every remote node has reported a state, or `timeout` elapses
    ///
    /// Returns the IDs of the nodes still unknown.
    pub async fn wait_for_nodes(&self, timeout: Duration) -> Vec<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        for node in self.nodes() {
            let mut rx = node.nmt().subscribe();
            // Timing out leaves the node in the returned list
            let _ = tokio::time::timeout_at(deadline, rx.wait_for(|s| s.state.is_some())).await;
        }
        self.nodes()
            .into_iter()
            .filter(|n| n.nmt().state().is_none())
            .map(|n| n.id())
            .collect()
    }
}

impl Shared {
    fn count_malformed(&self, msg: &CanMessage, what: &str) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        log::warn!("Malformed {what} frame: {msg:?}");
    }

    fn dispatch(&self, msg: CanMessage) {
        let kind = MessageKind::classify(&msg);

        let locals: Vec<LocalNode> = read(&self.local_nodes).values().cloned().collect();
        for node in &locals {
            node.handle_frame(&msg);
        }

        let nodes = read(&self.nodes);
        // PDO COB-IDs are configurable, so every frame is offered to the TPDOs
        let pdo_handled = nodes
            .values()
            .fold(false, |handled, node| node.on_pdo(&msg) || handled);

        match kind {
            MessageKind::Sync => self.sync.on_frame(&msg),
            MessageKind::SdoResponse { node } => {
                if let Some(n) = nodes.get(&node) {
                    n.on_sdo_response(msg);
                }
            }
            MessageKind::Heartbeat { node } => {
                if let Some(n) = nodes.get(&node) {
                    match Heartbeat::try_from(msg) {
                        Ok(hb) => n.on_heartbeat(hb),
                        Err(_) => self.count_malformed(&msg, "heartbeat"),
                    }
                }
            }
            MessageKind::Emcy { node } if !pdo_handled => {
                if let Some(n) = nodes.get(&node) {
                    match EmergencyEvent::try_from(msg) {
                        Ok(event) => n.on_emcy(event),
                        Err(_) => self.count_malformed(&msg, "EMCY"),
                    }
                }
            }
            MessageKind::NmtCommand => {
                if NmtCommand::try_from(msg).is_err() {
                    self.count_malformed(&msg, "NMT");
                }
            }
            _ => (),
        }
    }
}

async fn dispatch_task<R: AsyncCanReceiver>(
    shared: std::sync::Weak<Shared>,
    mut receiver: R,
    token: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = receiver.recv() => result,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match result {
            Ok(msg) => shared.dispatch(msg),
            Err(e) => {
                log::error!("Error receiving frame: {e:?}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    log::debug!("Dispatch task stopped");
}
