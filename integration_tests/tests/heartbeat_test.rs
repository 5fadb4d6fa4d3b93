use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use canmaster::config::NodeConfig;
use integration_tests::prelude::*;

const NODE_ID: u8 = 6;
const PERIOD: Duration = Duration::from_millis(20);

fn is_heartbeat(msg: &CanMessage) -> bool {
    msg.id() == CanId::std(0x700 + NODE_ID as u16) && !msg.is_rtr()
}

async fn beating_bench(config: NetworkConfig) -> Bench {
    let mut od = device_od(NODE_ID);
    od.set_value(0x1017, 0, Value::U16(PERIOD.as_millis() as u16))
        .unwrap();
    Bench::with(NODE_ID, config, od).await
}

/// Count transitions into `state`
fn count_liveness(node: &RemoteNode, state: Liveness) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let mut rx = node.subscribe_liveness();
    let counter = count.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if *rx.borrow_and_update() == state {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    });
    count
}

#[tokio::test]
async fn test_unsupervised_node_is_unknown() {
    let bench = beating_bench(NetworkConfig::default()).await;
    tokio::time::sleep(PERIOD * 3).await;
    assert_eq!(Supervision::Off, bench.node.supervision());
    assert_eq!(Liveness::Unknown, bench.node.liveness());
    bench.shutdown().await;
}

#[tokio::test]
async fn test_missed_heartbeat() {
    let bench = beating_bench(NetworkConfig::default()).await;
    let node = &bench.node;
    node.set_supervision(Supervision::Heartbeat { period: PERIOD });
    assert!(
        wait_until(TIMEOUT, || node.liveness() == Liveness::Alive).await,
        "heartbeat not seen"
    );

    let missed = count_liveness(node, Liveness::Missed);
    bench.bus.set_filter(|msg| (!is_heartbeat(msg)).then_some(*msg));
    assert!(
        wait_until(TIMEOUT, || node.liveness() == Liveness::Missed).await,
        "missing heartbeat not detected"
    );
    // Reported once, however long the silence lasts
    tokio::time::sleep(PERIOD * 10).await;
    assert_eq!(Liveness::Missed, node.liveness());
    assert_eq!(1, missed.load(Ordering::Relaxed));

    bench.bus.clear_filter();
    assert!(
        wait_until(TIMEOUT, || node.liveness() == Liveness::Alive).await,
        "node did not recover"
    );

    bench.shutdown().await;
}

#[tokio::test]
async fn test_supervision_from_config() {
    let node_config = NodeConfig {
        heartbeat_ms: Some(PERIOD.as_millis() as u64),
        ..Default::default()
    };
    let config = NetworkConfig {
        nodes: HashMap::from([(NODE_ID, node_config)]),
        ..Default::default()
    };
    let bench = beating_bench(config).await;

    assert_eq!(
        Supervision::Heartbeat { period: PERIOD },
        bench.node.supervision()
    );
    assert!(
        wait_until(TIMEOUT, || bench.node.liveness() == Liveness::Alive).await,
        "heartbeat not seen"
    );

    bench.shutdown().await;
}

#[tokio::test]
async fn test_node_guarding() {
    // No heartbeat, the device only answers guarding requests
    let bench = Bench::new(NODE_ID).await;
    let mut sniffer = bench.bus.new_receiver();
    let node = &bench.node;
    node.set_supervision(Supervision::Guarding {
        guard_time: PERIOD,
        life_time_factor: 2,
    });
    assert!(
        wait_until(TIMEOUT, || node.liveness() == Liveness::Alive).await,
        "no guarding response"
    );

    // Requests are remote frames, answered with an alternating toggle bit
    tokio::time::sleep(PERIOD * 4).await;
    let frames = sniffer.drain();
    let requests = frames_of(&frames, MessageKind::GuardRequest { node: NODE_ID }).len();
    assert!(requests >= 2, "only {requests} guarding requests");
    let toggles: Vec<bool> = frames
        .iter()
        .filter(|f| is_heartbeat(f))
        .map(|f| f.data()[0] & 0x80 != 0)
        .collect();
    assert!(toggles.len() >= 2);
    for pair in toggles.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }

    // Unanswered requests fail the node
    bench.bus.set_filter(|msg| (!is_heartbeat(msg)).then_some(*msg));
    assert!(
        wait_until(TIMEOUT, || node.liveness() == Liveness::GuardFailed).await,
        "guarding failure not detected"
    );

    bench.bus.clear_filter();
    assert!(
        wait_until(TIMEOUT, || node.liveness() == Liveness::Alive).await,
        "node did not recover"
    );

    bench.shutdown().await;
}

#[tokio::test]
async fn test_switching_supervision() {
    let bench = beating_bench(NetworkConfig::default()).await;
    let node = &bench.node;
    node.set_supervision(Supervision::Heartbeat { period: PERIOD });
    assert!(wait_until(TIMEOUT, || node.liveness() == Liveness::Alive).await);

    node.set_supervision(Supervision::Off);
    assert_eq!(Liveness::Unknown, node.liveness());

    // No guarding requests are sent once supervision is off
    let mut sniffer = bench.bus.new_receiver();
    tokio::time::sleep(PERIOD * 3).await;
    assert!(frames_of(&sniffer.drain(), MessageKind::GuardRequest { node: NODE_ID }).is_empty());

    bench.shutdown().await;
}
