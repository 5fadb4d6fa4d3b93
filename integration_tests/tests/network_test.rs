use std::time::Duration;

use assertables::{assert_ge, assert_in_range};
use canmaster::{BusError, NetworkError};
use canmaster_common::TimeOfDay;
use integration_tests::prelude::*;

const NODE_ID: u8 = 12;

fn sync_frames(frames: &[CanMessage]) -> usize {
    frames_of(frames, MessageKind::Sync).len()
}

#[tokio::test]
async fn test_periodic_sync() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let sync = bench.master.sync();

    sync.start(Duration::from_millis(10)).unwrap();
    assert!(sync.is_running());
    tokio::time::sleep(Duration::from_millis(55)).await;
    sync.stop();
    assert!(!sync.is_running());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sent = sync_frames(&sniffer.drain());
    assert_in_range!(sent, 4..=7);
    assert_ge!(sync.count(), 4);
    // The device network counts the SYNCs it receives
    assert!(wait_until(TIMEOUT, || bench.device_net.sync().count() == sent as u64).await);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(0, sync_frames(&sniffer.drain()));

    bench.shutdown().await;
}

#[tokio::test]
async fn test_sync_counter() {
    let config = NetworkConfig::load_from_str("sync_counter_overflow = 3").unwrap();
    let bench = Bench::with(NODE_ID, config, device_od(NODE_ID)).await;
    let mut sniffer = bench.bus.new_receiver();
    let sync = bench.master.sync();
    assert_eq!(None, sync.sync_counter());

    for _ in 0..4 {
        sync.transmit().await.unwrap();
    }
    let payloads: Vec<Vec<u8>> = frames_of(&sniffer.drain(), MessageKind::Sync)
        .iter()
        .map(|f| f.data().to_vec())
        .collect();
    assert_eq!(vec![vec![1], vec![2], vec![3], vec![1]], payloads);
    assert_eq!(Some(1), sync.sync_counter());
    // Receivers pick the counter up from the frame
    assert!(wait_until(TIMEOUT, || bench.device_net.sync().sync_counter() == Some(1)).await);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_sync_window() {
    let config = NetworkConfig::load_from_str("sync_window_us = 5000").unwrap();
    let bench = Bench::with(NODE_ID, config, device_od(NODE_ID)).await;
    let sync = bench.master.sync();
    assert_eq!(Some(Duration::from_millis(5)), sync.settings().window);

    assert!(!sync.is_in_sync_window());
    sync.transmit().await.unwrap();
    assert!(sync.is_in_sync_window());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!sync.is_in_sync_window());

    // Synchronous RPDOs still go out right after each SYNC
    let mut sniffer = bench.bus.new_receiver();
    let rpdo = bench.node.rpdo().get(1).unwrap();
    rpdo.configure(["Setpoint"], 1, 0, true).unwrap();
    rpdo.start(None).unwrap();
    sync.transmit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let frames = sniffer.drain();
    assert_eq!(
        1,
        frames.iter().filter(|f| f.id() == CanId::std(0x200 + NODE_ID as u16)).count()
    );

    rpdo.stop();
    bench.shutdown().await;
}

#[tokio::test]
async fn test_sync_from_config_stops_on_disconnect() {
    let config = NetworkConfig {
        sync_period_ms: Some(10),
        ..Default::default()
    };
    let bench = Bench::with(NODE_ID, config, device_od(NODE_ID)).await;
    let mut sniffer = bench.bus.new_receiver();
    assert!(bench.master.sync().is_running());

    bench.master.disconnect().await;
    assert!(!bench.master.sync().is_running());
    assert!(!bench.master.is_connected());
    sniffer.drain();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(0, sync_frames(&sniffer.drain()));

    bench.device_net.disconnect().await;
}

#[tokio::test]
async fn test_time_message() {
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let time = TimeOfDay::from_ymd_hms_ms(2024, 3, 1, 12, 30, 15, 250).unwrap();

    bench.master.time().transmit(Some(time)).await.unwrap();
    bench.master.time().transmit(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let frames = frames_of(&sniffer.drain(), MessageKind::Time);
    assert_eq!(2, frames.len());
    assert_eq!(CanId::std(0x100), frames[0].id());
    assert_eq!(&time.to_le_bytes()[..], frames[0].data());
    assert_eq!(6, frames[1].data().len());
    let now = TimeOfDay::from_le_bytes(frames[1].data().try_into().unwrap());
    assert!(now > time);

    bench.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_are_counted() {
    let bench = Bench::new(NODE_ID).await;
    let device_net = &bench.device_net;
    assert_eq!(0, bench.master.malformed_frame_count());

    // Heartbeat with two bytes, truncated EMCY, unknown NMT command
    let frames = [
        CanMessage::new(CanId::std(0x700 + NODE_ID as u16), &[5, 0]),
        CanMessage::new(CanId::std(0x80 + NODE_ID as u16), &[0x10, 0x00, 1]),
        CanMessage::new(CanId::std(0), &[0x07, 0]),
    ];
    for msg in frames {
        device_net.send_message(msg).await.unwrap();
    }
    assert!(
        wait_until(TIMEOUT, || bench.master.malformed_frame_count() == 3).await,
        "counted {}",
        bench.master.malformed_frame_count()
    );

    // None of them touched the node
    assert_eq!(Some(NmtState::PreOperational), bench.node.nmt().state());
    assert!(bench.node.emcy().log().is_empty());
    assert_eq!(NmtState::PreOperational, bench.device.nmt_state());

    bench.shutdown().await;
}

#[tokio::test]
async fn test_node_registry() {
    let bench = Bench::new(NODE_ID).await;
    let master = &bench.master;
    let id = bench.node.id();

    assert_eq!(
        Err(NetworkError::DuplicateNode { id }),
        master.add_node(id, device_od(NODE_ID)).map(|_| ())
    );
    assert!(master.node(NODE_ID).is_some());
    assert_eq!(1, master.nodes().len());

    assert!(master.remove_node(id));
    assert!(master.node(NODE_ID).is_none());
    assert!(!master.remove_node(id));

    // A new handle for the same ID starts from scratch
    let node = master.add_node(id, device_od(NODE_ID)).unwrap();
    assert_eq!(None, node.nmt().state());
    assert_eq!(0, node.sdo().read_u32(0x2000, 0).await.unwrap());

    bench.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_and_reconnect() {
    let bench = Bench::new(NODE_ID).await;
    let master = &bench.master;
    master.disconnect().await;

    assert_eq!(
        Err(NetworkError::Bus {
            source: BusError::Disconnected
        }),
        master.send_message(CanMessage::new(CanId::std(0x123), &[1])).await
    );
    assert!(matches!(
        bench.node.sdo().read_u32(0x2000, 0).await,
        Err(SdoClientError::Bus { .. })
    ));
    assert_eq!(
        Err(BusError::Disconnected),
        master.sync().start(Duration::from_millis(10))
    );

    let (tx, rx) = bench.bus.new_endpoint();
    master.connect(tx, rx).await;
    assert!(master.is_connected());
    assert_eq!(0, bench.node.sdo().read_u32(0x2000, 0).await.unwrap());

    bench.shutdown().await;
}

#[tokio::test]
async fn test_local_node_added_while_connected_boots() {
    let bench = Bench::new(NODE_ID).await;
    let other_id = NodeId::new(NODE_ID + 1).unwrap();
    let other = bench
        .master
        .add_node(other_id, device_od(NODE_ID + 1))
        .unwrap();

    let local = bench
        .device_net
        .add_local_node(other_id, device_od(NODE_ID + 1))
        .unwrap();
    other
        .nmt()
        .wait_for_state(NmtState::PreOperational, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(NmtState::PreOperational, local.nmt_state());
    assert!(matches!(
        bench
            .device_net
            .add_local_node(other_id, device_od(NODE_ID + 1)),
        Err(NetworkError::DuplicateNode { .. })
    ));

    bench.shutdown().await;
}
