use std::time::Duration;

use assertables::{assert_ge, assert_in_range};
use canmaster::{config::NodeConfig, PdoError};
use canmaster_common::pdo::{PdoMapping, TransmissionType};
use integration_tests::prelude::*;

const NODE_ID: u8 = 3;

/// (index, sub) of every SDO download initiated by the master, in order
fn downloads(frames: &[CanMessage]) -> Vec<(u16, u8)> {
    frames
        .iter()
        .filter(|f| f.id() == CanId::std(0x600 + NODE_ID as u16) && f.data()[0] >> 5 == 1)
        .map(|f| (u16::from_le_bytes([f.data()[1], f.data()[2]]), f.data()[3]))
        .collect()
}

fn frames_with_id(frames: &[CanMessage], id: u16) -> usize {
    frames.iter().filter(|f| f.id() == CanId::std(id)).count()
}

async fn start_node(bench: &Bench) {
    bench
        .node
        .nmt()
        .request_state(NmtState::Operational)
        .await
        .unwrap();
    assert!(
        wait_until(TIMEOUT, || bench.device.nmt_state() == NmtState::Operational).await,
        "device did not start"
    );
}

#[tokio::test]
async fn test_save_sequence() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let tpdo = bench.node.tpdo().get(1).unwrap();

    tpdo.set_inhibit_time(50).unwrap();
    tpdo.configure([(0x2000, 0), (0x2001, 0)], 255, 100, true)
        .unwrap();
    tpdo.save().await.unwrap();

    assert_eq!(
        vec![
            (0x1800, 1),
            (0x1A00, 0),
            (0x1A00, 1),
            (0x1A00, 2),
            (0x1A00, 0),
            (0x1800, 2),
            (0x1800, 3),
            (0x1800, 5),
            (0x1800, 1),
        ],
        downloads(&sniffer.drain())
    );

    let device = &bench.device;
    assert_eq!(Ok(Value::U8(2)), device.value(0x1A00, 0));
    assert_eq!(Ok(Value::U32(0x2000_0020)), device.value(0x1A00, 1));
    assert_eq!(Ok(Value::U32(0x2001_0010)), device.value(0x1A00, 2));
    assert_eq!(Ok(Value::U16(100)), device.value(0x1800, 5));
    assert_eq!(Ok(Value::U16(50)), device.value(0x1800, 3));
    // Valid, RTR allowed, default COB-ID
    assert_eq!(Ok(Value::U32(0x183)), device.value(0x1800, 1));

    // Reading it back gives the same configuration
    tpdo.disable();
    tpdo.clear().unwrap();
    tpdo.read().await.unwrap();
    assert!(tpdo.is_enabled());
    assert_eq!(TransmissionType::EventProfile, tpdo.config().transmission_type);
    assert_eq!(50, tpdo.config().inhibit_time);
    assert_eq!(Duration::from_millis(5), tpdo.config().inhibit());
    let mapped: Vec<(u16, u8)> = tpdo.variables().iter().map(|v| (v.index, v.sub)).collect();
    assert_eq!(vec![(0x2000, 0), (0x2001, 0)], mapped);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_disabled_pdo_saved_invalid() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let rpdo = bench.node.rpdo().get(2).unwrap();

    rpdo.configure(["Setpoint"], 1, 0, false).unwrap();
    rpdo.save().await.unwrap();

    // The COB-ID is never made valid
    let writes = downloads(&sniffer.drain());
    assert_eq!(Some(&(0x1401, 5)), writes.last());
    let cob = bench.device.value(0x1401, 1).unwrap();
    assert_eq!(Value::U32(0x8000_0000 | 0x303), cob);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_reconfiguring_enabled_pdo_is_refused() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let tpdo = bench.node.tpdo().get(1).unwrap();
    tpdo.configure([(0x2000, 0)], 255, 0, true).unwrap();
    sniffer.drain();

    assert_eq!(
        Err(PdoError::PdoEnabled),
        tpdo.configure([(0x2001, 0)], 255, 0, true)
    );
    assert_eq!(Err(PdoError::PdoEnabled), tpdo.add_variable((0x2002, 0)));
    assert_eq!(Err(PdoError::PdoEnabled), tpdo.set_cob_id(None));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sniffer.drain().is_empty());

    // The mapping is unchanged
    assert_eq!(1, tpdo.variables().len());
    assert_eq!(0x2000, tpdo.variables()[0].index);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_mapping_checks() {
    let bench = Bench::new(NODE_ID).await;
    let tpdo = bench.node.tpdo().get(1).unwrap();

    // Not mappable
    assert_eq!(
        Err(PdoError::NotMappable {
            index: 0x2003,
            sub: 0
        }),
        tpdo.configure([(0x2003, 0)], 255, 0, false)
    );
    // 3 * 32 bits
    assert_eq!(
        Err(PdoError::MappingTooLarge { bits: 96 }),
        tpdo.configure([(0x2000, 0), (0x2000, 0), (0x2000, 0)], 255, 0, false)
    );
    assert_eq!(
        Err(PdoError::InvalidTransmissionType { value: 241 }),
        tpdo.configure([(0x2000, 0)], 241, 0, false)
    );
    assert_eq!(
        Err(PdoError::WrongDirection),
        tpdo.transmit().await
    );

    bench.shutdown().await;
}

#[tokio::test]
async fn test_read_rejects_bad_mapping() {
    let bench = Bench::new(NODE_ID).await;
    let tpdo = bench.node.tpdo().get(1).unwrap();
    let device = &bench.device;

    // A zero size entry after a full 64 bit payload
    device.set_value(0x1A00, 0, 0u8).unwrap();
    device.set_value(0x1A00, 1, 0x2000_0020u32).unwrap();
    device.set_value(0x1A00, 2, 0x2000_0020u32).unwrap();
    device.set_value(0x1A00, 3, 0x2001_0000u32).unwrap();
    device.set_value(0x1A00, 0, 3u8).unwrap();
    assert_eq!(
        Err(PdoError::EmptyMapping {
            index: 0x2001,
            sub: 0
        }),
        tpdo.read().await
    );
    assert!(tpdo.variables().is_empty());

    device.set_value(0x1A00, 3, 0x2000_0020u32).unwrap();
    assert_eq!(
        Err(PdoError::MappingTooLarge { bits: 96 }),
        tpdo.read().await
    );
    assert!(tpdo.variables().is_empty());

    device.set_value(0x1A00, 0, 2u8).unwrap();
    tpdo.read().await.unwrap();
    let bits: u32 = tpdo.variables().iter().map(|v| v.bits as u32).sum();
    assert_eq!(64, bits);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_rpdo_inhibit_time() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let rpdo = bench.node.rpdo().get(1).unwrap();
    // 20ms
    rpdo.set_inhibit_time(200).unwrap();
    rpdo.configure(["Setpoint"], 255, 0, true).unwrap();
    rpdo.save().await.unwrap();
    start_node(&bench).await;
    rpdo.start(None).unwrap();
    sniffer.drain();

    for v in 1..=5i16 {
        rpdo.set("Setpoint", v).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The first change goes out at once, the rest are merged into one send after the window
    let frames = sniffer.drain();
    assert_eq!(2, frames_with_id(&frames, 0x203));
    assert_eq!(Ok(Value::I16(5)), bench.device.value(0x2001, 0));

    rpdo.stop();
    bench.shutdown().await;
}

#[tokio::test]
async fn test_tpdo_inhibit_time() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let tpdo = bench.node.tpdo().get(1).unwrap();
    tpdo.set_inhibit_time(300).unwrap();
    tpdo.configure([(0x2000, 0)], 254, 5, true).unwrap();
    tpdo.save().await.unwrap();
    start_node(&bench).await;
    sniffer.drain();

    // Without the inhibit time the 5ms event timer would send about 20 frames
    tokio::time::sleep(Duration::from_millis(100)).await;
    let count = frames_with_id(&sniffer.drain(), 0x183);
    assert_in_range!(count, 2..=5);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_follows_reconfiguration() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let rpdo = bench.node.rpdo().get(1).unwrap();
    rpdo.configure(["Setpoint"], 255, 0, true).unwrap();
    rpdo.save().await.unwrap();
    start_node(&bench).await;
    rpdo.start(None).unwrap();
    sniffer.drain();

    rpdo.set("Setpoint", 1i16).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(1, frames_with_id(&sniffer.drain(), 0x203));

    // Switch the running scheduler to synchronous transmission
    rpdo.disable();
    rpdo.configure(["Setpoint"], 1, 0, true).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    rpdo.set("Setpoint", 2i16).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(0, frames_with_id(&sniffer.drain(), 0x203));

    bench.master.sync().transmit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(1, frames_with_id(&sniffer.drain(), 0x203));

    rpdo.stop();
    bench.shutdown().await;
}

#[tokio::test]
async fn test_tpdo_reception() {
    let bench = Bench::new(NODE_ID).await;
    let tpdo = bench.node.tpdo().get(1).unwrap();
    tpdo.configure(["Counter", "Setpoint"], 255, 0, true).unwrap();
    tpdo.save().await.unwrap();
    start_node(&bench).await;

    let (reception, _) = tokio::join!(tpdo.wait_for_reception(TIMEOUT), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        bench.device.set_value(0x2001, 0, -300i16).unwrap();
    });
    let reception = reception.expect("no TPDO received");
    assert_eq!(vec![Value::U32(0), Value::I16(-300)], reception.values);
    assert_eq!(6, reception.data.len());

    // Values land in the node's dictionary
    assert_eq!(Ok(Value::I16(-300)), tpdo.get("Setpoint"));
    assert_eq!(
        Value::I16(-300),
        bench.node.od().value(0x2001, 0).unwrap().clone()
    );

    bench.shutdown().await;
}

#[tokio::test]
async fn test_tpdo_remote_request() {
    let bench = Bench::new(NODE_ID).await;
    let tpdo = bench.node.tpdo().get(2).unwrap();
    tpdo.configure([(0x2002, 0)], 253, 0, true).unwrap();
    tpdo.save().await.unwrap();
    start_node(&bench).await;
    bench.device.set_value(0x2002, 0, 0x5Au8).unwrap();

    let (reception, _) = tokio::join!(tpdo.wait_for_reception(TIMEOUT), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        tpdo.remote_request().await.unwrap();
    });
    assert_eq!(vec![Value::U8(0x5A)], reception.unwrap().values);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_tpdo_event_timer() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let tpdo = bench.node.tpdo().get(1).unwrap();
    tpdo.configure([(0x2000, 0)], 254, 20, true).unwrap();
    tpdo.save().await.unwrap();
    start_node(&bench).await;
    sniffer.drain();

    tokio::time::sleep(Duration::from_millis(110)).await;
    let count = frames_with_id(&sniffer.drain(), 0x183);
    assert_in_range!(count, 3..=6);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_sync_driven_pdos() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();

    // Device sends its TPDO on every second SYNC
    let tpdo = bench.node.tpdo().get(1).unwrap();
    tpdo.configure([(0x2000, 0)], 2, 0, true).unwrap();
    tpdo.save().await.unwrap();
    // Master sends its RPDO on every SYNC
    let rpdo = bench.node.rpdo().get(1).unwrap();
    rpdo.configure([(0x2001, 0)], 1, 0, true).unwrap();
    rpdo.save().await.unwrap();
    start_node(&bench).await;
    rpdo.start(None).unwrap();
    rpdo.set("Setpoint", 1200i16).unwrap();
    sniffer.drain();

    for _ in 0..4 {
        bench.master.sync().transmit().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let frames = sniffer.drain();
    assert_eq!(4, frames_with_id(&frames, 0x080));
    assert_eq!(4, frames_with_id(&frames, 0x203));
    assert_eq!(2, frames_with_id(&frames, 0x183));
    assert_eq!(4, bench.master.sync().count());
    assert_eq!(Ok(Value::I16(1200)), bench.device.value(0x2001, 0));

    rpdo.stop();
    bench.shutdown().await;
}

#[tokio::test]
async fn test_rpdo_transmit_and_periodic() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let rpdo = bench.node.rpdo().get(1).unwrap();
    rpdo.configure([(0x2000, 0), (0x2002, 0)], 255, 0, true)
        .unwrap();
    rpdo.save().await.unwrap();
    start_node(&bench).await;

    rpdo.set_key(0x2000, 0, 99u32).unwrap();
    rpdo.set_key(0x2002, 0, 3u8).unwrap();
    rpdo.transmit().await.unwrap();
    assert!(
        wait_until(TIMEOUT, || bench.device.value(0x2000, 0) == Ok(Value::U32(99))).await
    );
    assert_eq!(Ok(Value::U8(3)), bench.device.value(0x2002, 0));

    sniffer.drain();
    rpdo.start(Some(Duration::from_millis(10))).unwrap();
    tokio::time::sleep(Duration::from_millis(55)).await;
    rpdo.stop();
    let count = frames_with_id(&sniffer.drain(), 0x203);
    assert_ge!(count, 3);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_node_config_applied() {
    let mut config = NetworkConfig::default();
    let node_config: NodeConfig = toml_node_config();
    config.nodes.insert(NODE_ID, node_config);
    let bench = Bench::with(NODE_ID, config, device_od(NODE_ID)).await;

    let tpdo = bench.node.tpdo().get(3).unwrap();
    assert!(tpdo.is_enabled());
    assert_eq!(Some(CanId::std(0x1F0)), tpdo.cob_id());
    assert_eq!(TransmissionType::SyncCyclic(4), tpdo.config().transmission_type);
    assert_eq!(
        vec![PdoMapping {
            index: 0x2001,
            sub: 0,
            size: 16
        }],
        tpdo.variables()
            .iter()
            .map(|v| v.mapping())
            .collect::<Vec<_>>()
    );
    assert_eq!(
        Supervision::Heartbeat {
            period: Duration::from_millis(100)
        },
        bench.node.supervision()
    );

    bench.shutdown().await;
}

fn toml_node_config() -> NodeConfig {
    let config = NetworkConfig::load_from_str(
        r#"
        [nodes.3]
        heartbeat_ms = 100

        [nodes.3.tpdo.3]
        cob_id = 0x1F0
        enabled = true
        transmission_type = 4
        mappings = [{ index = 0x2001, sub = 0, size = 16 }]
        "#,
    )
    .unwrap();
    config.nodes[&3].clone()
}

#[tokio::test]
async fn test_node_config_mapping_size_mismatch() {
    let mut config = NetworkConfig::default();
    let mut node_config = toml_node_config();
    node_config.tpdo.get_mut(&3).unwrap().mappings[0].size = 32;
    config.nodes.insert(NODE_ID, node_config);

    let master = Network::new(config);
    let result = master.add_node(NodeId::new(NODE_ID).unwrap(), device_od(NODE_ID));
    assert!(matches!(
        result,
        Err(canmaster::NetworkError::NodeConfig {
            source: PdoError::NotMappable {
                index: 0x2001,
                sub: 0
            },
            ..
        })
    ));
}
