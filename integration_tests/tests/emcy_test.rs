use std::time::Duration;

use canmaster_common::emcy::{codes, EmergencyEvent};
use integration_tests::prelude::*;
use tokio::sync::mpsc;

const NODE_ID: u8 = 7;

#[tokio::test]
async fn test_emcy_received() {
    let bench = Bench::new(NODE_ID).await;
    let emcy = bench.node.emcy();

    let (event, _) = tokio::join!(emcy.wait(Some(0x2310), TIMEOUT), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        bench
            .device
            .send_emcy(0x2310, 0x03, [1, 2, 3, 4, 5])
            .await
            .unwrap();
    });
    assert_eq!(
        Some(EmergencyEvent {
            node: NODE_ID,
            code: 0x2310,
            register: 0x03,
            data: [1, 2, 3, 4, 5],
        }),
        event
    );
    assert_eq!("Current error, device output side", event.unwrap().description());
    // The device's error register follows
    assert_eq!(Ok(Value::U8(0x03)), bench.device.value(0x1001, 0));

    bench.shutdown().await;
}

#[tokio::test]
async fn test_active_errors_and_reset() {
    let bench = Bench::new(NODE_ID).await;
    let emcy = bench.node.emcy();
    let device = &bench.device;

    device.send_emcy(0x3210, 0x05, [0; 5]).await.unwrap();
    device.send_emcy(codes::CAN_OVERRUN, 0x11, [0; 5]).await.unwrap();
    device.send_emcy(0x3210, 0x05, [9; 5]).await.unwrap();
    assert!(wait_until(TIMEOUT, || emcy.log().len() == 3).await);

    // One active entry per code, the latest one
    let active = emcy.active();
    assert_eq!(
        vec![codes::CAN_OVERRUN, 0x3210],
        active.iter().map(|e| e.code).collect::<Vec<_>>()
    );
    assert_eq!([9; 5], active[1].data);

    // An error reset from the device clears the active list but is logged
    device.send_emcy(codes::NO_ERROR, 0, [0; 5]).await.unwrap();
    assert!(wait_until(TIMEOUT, || emcy.log().len() == 4).await);
    assert!(emcy.active().is_empty());

    emcy.reset();
    assert!(emcy.log().is_empty());

    bench.shutdown().await;
}

#[tokio::test]
async fn test_callbacks_survive_panics() {
    let bench = Bench::new(NODE_ID).await;
    let emcy = bench.node.emcy();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = tx.clone();
    emcy.add_callback(move |e| {
        first.send(("first", e.code)).unwrap();
    });
    emcy.add_callback(|e| {
        if e.code == 0x5000 {
            panic!("callback failure");
        }
    });
    emcy.add_callback(move |e| {
        tx.send(("last", e.code)).unwrap();
    });

    for code in [0x5000, 0x6000] {
        bench.device.send_emcy(code, 1, [0; 5]).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(within(TIMEOUT, rx.recv()).await.unwrap());
    }
    assert_eq!(
        vec![
            ("first", 0x5000),
            ("last", 0x5000),
            ("first", 0x6000),
            ("last", 0x6000)
        ],
        seen
    );

    bench.shutdown().await;
}

#[tokio::test]
async fn test_emcy_from_unknown_node_is_ignored() {
    let bench = Bench::new(NODE_ID).await;
    let other = CanMessage::new(CanId::std(0x80 + 20), &[0x10, 0x00, 1, 0, 0, 0, 0, 0]);
    bench.device_net.send_message(other).await.unwrap();

    assert_eq!(None, bench.node.emcy().wait(None, Duration::from_millis(30)).await);
    assert!(bench.node.emcy().log().is_empty());
    assert_eq!(0, bench.master.malformed_frame_count());

    bench.shutdown().await;
}
