#![allow(dead_code)]
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use canmaster::{
    cia402::{DriveState, OperationMode},
    LocalNode, Network, NetworkConfig, RemoteNode,
};
use canmaster_common::{
    constants::object_ids,
    messages::{CanMessage, MessageKind},
    nmt::NmtState,
    objects::{AccessType, ObjectDictionary, ObjectEntry, Value},
    traits::AsyncCanReceiver,
    NodeId,
};

use crate::sim_bus::{SimBus, SimBusReceiver};

/// Generous timeout for anything that should happen promptly
pub const TIMEOUT: Duration = Duration::from_millis(500);

/// Modes advertised by the simulated drive: profiled position and cyclic sync position
pub const SIM_DRIVE_MODES: u32 = 0x0000_0081;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Dictionary of the simulated device, used on both ends of the bus
pub fn device_od(node_id: u8) -> ObjectDictionary {
    let mut od = ObjectDictionary::communication_profile(node_id, 0x0000_0191, "Sim device");
    od.insert(ObjectEntry::new(0x2000, 0, "Counter", 0u32).mappable());
    od.insert(ObjectEntry::new(0x2001, 0, "Setpoint", 0i16).mappable());
    od.insert(ObjectEntry::new(0x2002, 0, "Flags", 0u8).mappable());
    od.insert(ObjectEntry::new(0x2003, 0, "Label", "sim"));
    od.insert(ObjectEntry::new(0x2004, 0, "Blob", Value::Domain(Vec::new())));
    od.insert(ObjectEntry::new(0x2005, 0, "Limited", 10u16).limits(0u16, 100u16));
    od.insert(ObjectEntry::new(0x2006, 0, "Firmware", "1.0.0").access(AccessType::Ro));
    od
}

/// Dictionary of the simulated CiA-402 drive
pub fn drive_od(node_id: u8) -> ObjectDictionary {
    let mut od = device_od(node_id);
    od.insert(ObjectEntry::new(object_ids::CONTROLWORD, 0, "Controlword", 0u16).mappable());
    od.insert(
        ObjectEntry::new(
            object_ids::STATUSWORD,
            0,
            "Statusword",
            DriveState::SwitchOnDisabled.statusword_bits(),
        )
        .access(AccessType::Ro)
        .mappable(),
    );
    od.insert(ObjectEntry::new(object_ids::MODES_OF_OPERATION, 0, "Modes of operation", 0i8));
    od.insert(
        ObjectEntry::new(
            object_ids::MODES_OF_OPERATION_DISPLAY,
            0,
            "Modes of operation display",
            0i8,
        )
        .access(AccessType::Ro),
    );
    od.insert(
        ObjectEntry::new(
            object_ids::SUPPORTED_DRIVE_MODES,
            0,
            "Supported drive modes",
            SIM_DRIVE_MODES,
        )
        .access(AccessType::Ro),
    );
    od.insert(ObjectEntry::new(object_ids::POLARITY, 0, "Polarity", 0u8));
    od.insert_record(
        object_ids::POSITION_FACTOR,
        "Position factor",
        vec![
            ObjectEntry::new(object_ids::POSITION_FACTOR, 0, "Highest sub-index supported", 2u8)
                .access(AccessType::Ro),
            ObjectEntry::new(object_ids::POSITION_FACTOR, 1, "Numerator", 1u32),
            ObjectEntry::new(object_ids::POSITION_FACTOR, 2, "Divisor", 1u32),
        ],
    );
    od
}

/// A master network and a simulated device network sharing one bus
pub struct Bench {
    pub bus: SimBus,
    pub master: Network,
    pub node: RemoteNode,
    pub device_net: Network,
    pub device: LocalNode,
}

impl Bench {
    pub async fn new(node_id: u8) -> Self {
        Self::with(node_id, NetworkConfig::default(), device_od(node_id)).await
    }

    /// Connect the master, then the device, and wait for the device's bootup
    pub async fn with(node_id: u8, config: NetworkConfig, od: ObjectDictionary) -> Self {
        init_logging();
        let id = NodeId::new(node_id).unwrap();
        let bus = SimBus::new();

        let master = Network::new(config);
        let node = master.add_node(id, od.clone()).unwrap();
        let device_net = Network::default();
        let device = device_net.add_local_node(id, od).unwrap();

        let (tx, rx) = bus.new_endpoint();
        master.connect(tx, rx).await;
        let (tx, rx) = bus.new_endpoint();
        device_net.connect(tx, rx).await;

        node.nmt()
            .wait_for_state(NmtState::PreOperational, TIMEOUT)
            .await
            .unwrap();
        Self {
            bus,
            master,
            node,
            device_net,
            device,
        }
    }

    pub async fn shutdown(self) {
        self.master.disconnect().await;
        self.device_net.disconnect().await;
    }
}

/// Poll `f` until it returns true; returns false on timeout
pub async fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Run `fut`, failing the test if it takes longer than `timeout`
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("operation did not complete in time")
}

fn u16_value(node: &LocalNode, index: u16) -> u16 {
    match node.value(index, 0) {
        Ok(Value::U16(v)) => v,
        other => panic!("unexpected value at 0x{index:04X}: {other:?}"),
    }
}

/// State change a CiA-402 device makes for a control word
fn drive_transition(state: DriveState, cw: u16) -> DriveState {
    use DriveState::*;
    if state == Fault {
        return if cw & 0x80 != 0 { SwitchOnDisabled } else { Fault };
    }
    if cw & 0x02 == 0 {
        // Disable voltage
        return match state {
            ReadyToSwitchOn | SwitchedOn | OperationEnabled | QuickStopActive => SwitchOnDisabled,
            s => s,
        };
    }
    if cw & 0x04 == 0 {
        // Quick stop
        return match state {
            ReadyToSwitchOn | SwitchedOn => SwitchOnDisabled,
            OperationEnabled => QuickStopActive,
            s => s,
        };
    }
    match (state, cw & 0x0F) {
        (SwitchOnDisabled | SwitchedOn | OperationEnabled, 0x06) => ReadyToSwitchOn,
        (ReadyToSwitchOn | OperationEnabled, 0x07) => SwitchedOn,
        (SwitchedOn | QuickStopActive, 0x0F) => OperationEnabled,
        (s, _) => s,
    }
}

/// Drive behaviour on top of a [`LocalNode`] holding [`drive_od`]
///
/// Control word writes update the status word, and mode writes are reflected in the mode display
/// when the mode is advertised.
#[derive(Clone)]
pub struct SimDrive {
    fault_on_enable: Arc<AtomicBool>,
}

impl SimDrive {
    pub fn attach(device: &LocalNode) -> Self {
        let fault_on_enable = Arc::new(AtomicBool::new(false));
        let node = device.clone();
        let fault = fault_on_enable.clone();
        device.add_write_callback(move |index, _sub| match index {
            object_ids::CONTROLWORD => {
                let cw = u16_value(&node, object_ids::CONTROLWORD);
                let sw = u16_value(&node, object_ids::STATUSWORD);
                let state = DriveState::from_statusword(sw).unwrap();
                let mut next = drive_transition(state, cw);
                if next == DriveState::OperationEnabled
                    && state != DriveState::OperationEnabled
                    && fault.load(Ordering::Relaxed)
                {
                    next = DriveState::Fault;
                }
                node.set_value(object_ids::STATUSWORD, 0, next.statusword_bits())
                    .unwrap();
            }
            object_ids::MODES_OF_OPERATION => {
                let Ok(Value::I8(code)) = node.value(object_ids::MODES_OF_OPERATION, 0) else {
                    return;
                };
                let supported = OperationMode::from_code(code)
                    .is_some_and(|m| m.is_supported_by(SIM_DRIVE_MODES));
                if supported {
                    node.set_value(object_ids::MODES_OF_OPERATION_DISPLAY, 0, code)
                        .unwrap();
                }
            }
            _ => (),
        });
        Self { fault_on_enable }
    }

    /// Make the drive fault instead of enabling operation
    pub fn fault_on_enable(&self, fault: bool) {
        self.fault_on_enable.store(fault, Ordering::Relaxed);
    }
}

/// Collects frames seen on the bus and prints them on drop, for debugging failed tests
pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        while let Some(msg) = self.rx.try_recv() {
            println!("{:?} {:?}", MessageKind::classify(&msg), msg);
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}

/// Frames of a given kind
pub fn frames_of(frames: &[CanMessage], kind: MessageKind) -> Vec<CanMessage> {
    frames
        .iter()
        .filter(|f| MessageKind::classify(f) == kind)
        .copied()
        .collect()
}
