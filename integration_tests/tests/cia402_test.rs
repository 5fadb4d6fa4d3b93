use std::time::Duration;

use canmaster::cia402::{
    Cia402Error, DriveState, Factors, OperationMode, PdoChannel, ScalingFactor, SdoChannel,
};
use canmaster_common::constants::object_ids;
use integration_tests::prelude::*;

const NODE_ID: u8 = 9;

async fn drive_bench() -> (Bench, SimDrive) {
    let bench = Bench::with(NODE_ID, NetworkConfig::default(), drive_od(NODE_ID)).await;
    let sim = SimDrive::attach(&bench.device);
    (bench, sim)
}

fn controlwords(frames: &[CanMessage]) -> Vec<u16> {
    frames
        .iter()
        .filter(|f| {
            f.id() == CanId::std(0x600 + NODE_ID as u16)
                && f.data()[0] >> 5 == 1
                && u16::from_le_bytes([f.data()[1], f.data()[2]]) == object_ids::CONTROLWORD
        })
        .map(|f| u16::from_le_bytes([f.data()[4], f.data()[5]]))
        .collect()
}

#[tokio::test]
async fn test_enable_and_disable() {
    let (bench, _sim) = drive_bench().await;
    let mut sniffer = bench.bus.new_receiver();
    let drive = bench.node.drive(SdoChannel::new(bench.node.sdo().clone()));
    assert_eq!(DriveState::SwitchOnDisabled, drive.state().await.unwrap());

    drive
        .request_state(DriveState::OperationEnabled, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(DriveState::OperationEnabled, drive.state().await.unwrap());
    // Shutdown, switch on, enable operation
    assert_eq!(vec![0x06, 0x07, 0x0F], controlwords(&sniffer.drain()));

    drive
        .request_state(DriveState::SwitchedOn, TIMEOUT)
        .await
        .unwrap();
    drive
        .request_state(DriveState::SwitchOnDisabled, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(vec![0x07, 0x00], controlwords(&sniffer.drain()));

    // Already there, nothing is written
    drive
        .request_state(DriveState::SwitchOnDisabled, TIMEOUT)
        .await
        .unwrap();
    assert!(controlwords(&sniffer.drain()).is_empty());

    bench.shutdown().await;
}

#[tokio::test]
async fn test_quick_stop() {
    let (bench, _sim) = drive_bench().await;
    let drive = bench.node.drive(SdoChannel::new(bench.node.sdo().clone()));
    drive
        .request_state(DriveState::OperationEnabled, TIMEOUT)
        .await
        .unwrap();

    drive
        .request_state(DriveState::QuickStopActive, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(DriveState::QuickStopActive, drive.state().await.unwrap());

    // Operation can be resumed from quick stop
    drive
        .request_state(DriveState::OperationEnabled, TIMEOUT)
        .await
        .unwrap();

    bench.shutdown().await;
}

#[tokio::test]
async fn test_invalid_targets() {
    let (bench, _sim) = drive_bench().await;
    let drive = bench.node.drive(SdoChannel::new(bench.node.sdo().clone()));
    assert_eq!(
        Err(Cia402Error::InvalidTarget {
            state: DriveState::Fault
        }),
        drive.request_state(DriveState::Fault, TIMEOUT).await
    );
    assert_eq!(
        Err(Cia402Error::InvalidTarget {
            state: DriveState::NotReadyToSwitchOn
        }),
        drive
            .request_state(DriveState::NotReadyToSwitchOn, TIMEOUT)
            .await
    );
    bench.shutdown().await;
}

#[tokio::test]
async fn test_fault_and_reset() {
    let (bench, sim) = drive_bench().await;
    let mut sniffer = bench.bus.new_receiver();
    let drive = bench.node.drive(SdoChannel::new(bench.node.sdo().clone()));
    sim.fault_on_enable(true);

    assert_eq!(
        Err(Cia402Error::DriveFault {
            state: DriveState::Fault
        }),
        drive
            .request_state(DriveState::OperationEnabled, TIMEOUT)
            .await
    );
    // Nothing is written after the fault is seen
    assert_eq!(vec![0x06, 0x07, 0x0F], controlwords(&sniffer.drain()));

    // Requests fail until the fault is cleared
    assert_eq!(
        Err(Cia402Error::DriveFault {
            state: DriveState::Fault
        }),
        drive
            .request_state(DriveState::SwitchOnDisabled, TIMEOUT)
            .await
    );

    sim.fault_on_enable(false);
    drive.fault_reset(TIMEOUT).await.unwrap();
    assert_eq!(DriveState::SwitchOnDisabled, drive.state().await.unwrap());
    drive
        .request_state(DriveState::OperationEnabled, TIMEOUT)
        .await
        .unwrap();

    bench.shutdown().await;
}

#[tokio::test]
async fn test_operation_modes() {
    let (bench, _sim) = drive_bench().await;
    let mut sniffer = bench.bus.new_receiver();
    let drive = bench.node.drive(SdoChannel::new(bench.node.sdo().clone()));

    drive
        .set_operation_mode(OperationMode::ProfiledPosition, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(
        Some(OperationMode::ProfiledPosition),
        drive.operation_mode().await.unwrap()
    );
    assert_eq!(SIM_DRIVE_MODES, drive.read_supported_modes().await.unwrap());
    assert!(drive
        .is_mode_supported(OperationMode::CyclicSyncPosition)
        .await
        .unwrap());

    // Rejected from the cached bitmap, without touching the bus
    sniffer.drain();
    assert_eq!(
        Err(Cia402Error::UnsupportedMode {
            mode: OperationMode::ProfiledTorque
        }),
        drive
            .set_operation_mode(OperationMode::ProfiledTorque, TIMEOUT)
            .await
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sniffer.drain().is_empty());
    assert_eq!(Ok(Value::I8(1)), bench.device.value(0x6061, 0));

    bench.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_mode_on_fresh_drive() {
    let (bench, _sim) = drive_bench().await;
    let mut sniffer = bench.bus.new_receiver();
    let drive = bench.node.drive(SdoChannel::new(bench.node.sdo().clone()));

    // The bitmap advertised in the dictionary is enough to reject the mode
    assert_eq!(
        Err(Cia402Error::UnsupportedMode {
            mode: OperationMode::ProfiledVelocity
        }),
        drive
            .set_operation_mode(OperationMode::ProfiledVelocity, TIMEOUT)
            .await
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sniffer.drain().is_empty());

    bench.shutdown().await;
}

#[tokio::test]
async fn test_supported_modes_read_when_not_in_dictionary() {
    let (bench, _sim) = drive_bench().await;
    let id = bench.node.id();
    assert!(bench.master.remove_node(id));
    // This handle's dictionary does not describe 0x6502
    let node = bench.master.add_node(id, device_od(NODE_ID)).unwrap();
    let mut sniffer = bench.bus.new_receiver();
    let drive = node.drive(SdoChannel::new(node.sdo().clone()));

    assert!(!drive
        .is_mode_supported(OperationMode::ProfiledVelocity)
        .await
        .unwrap());
    let requests: Vec<_> = sniffer
        .drain()
        .into_iter()
        .filter(|f| f.id() == CanId::std(0x600 + NODE_ID as u16))
        .collect();
    assert_eq!(1, requests.len());
    assert_eq!(&[0x40, 0x02, 0x65, 0x00], &requests[0].data()[..4]);

    // Cached afterwards
    assert!(drive
        .is_mode_supported(OperationMode::ProfiledPosition)
        .await
        .unwrap());
    assert!(sniffer.drain().is_empty());

    bench.shutdown().await;
}

#[tokio::test]
async fn test_factors() {
    let (bench, _sim) = drive_bench().await;
    let drive = bench.node.drive(SdoChannel::new(bench.node.sdo().clone()));
    assert_eq!(Factors::default(), drive.factors());

    bench.device.set_value(object_ids::POSITION_FACTOR, 1, 4096u32).unwrap();
    bench.device.set_value(object_ids::POSITION_FACTOR, 2, 360u32).unwrap();
    bench.device.set_value(object_ids::POLARITY, 0, 0x80u8).unwrap();
    let factors = drive.read_factors().await.unwrap();
    assert_eq!(ScalingFactor::new(4096, 360), factors.position);
    // Not implemented by the drive
    assert_eq!(ScalingFactor::UNITY, factors.velocity_encoder);
    assert!(factors.polarity.position_inverted);
    assert!(!factors.polarity.velocity_inverted);
    assert_eq!(factors, drive.factors());
    assert_eq!(-1024, factors.position_to_internal(90.0));
    assert_eq!(-90.0, factors.position_to_user(1024));

    let update = Factors {
        position: ScalingFactor::new(1000, 1),
        ..Default::default()
    };
    drive.write_factors(update).await.unwrap();
    assert_eq!(Ok(Value::U32(1000)), bench.device.value(object_ids::POSITION_FACTOR, 1));
    assert_eq!(Ok(Value::U32(1)), bench.device.value(object_ids::POSITION_FACTOR, 2));
    assert_eq!(Ok(Value::U8(0)), bench.device.value(object_ids::POLARITY, 0));
    assert_eq!(update, drive.factors());

    // A factor the drive cannot hold is refused
    let unsupported = Factors {
        velocity_encoder: ScalingFactor::new(2, 1),
        ..Default::default()
    };
    assert!(matches!(
        drive.write_factors(unsupported).await,
        Err(Cia402Error::Sdo { .. })
    ));
    assert_eq!(update, drive.factors());

    bench.device.set_value(object_ids::POSITION_FACTOR, 2, 0u32).unwrap();
    assert_eq!(
        Err(Cia402Error::InvalidFactor {
            index: object_ids::POSITION_FACTOR
        }),
        drive.read_factors().await
    );

    bench.shutdown().await;
}

#[tokio::test]
async fn test_pdo_channel() {
    let (bench, _sim) = drive_bench().await;
    let node = &bench.node;
    let rpdo = node.rpdo().get(1).unwrap();
    rpdo.configure(["Controlword"], 255, 0, true).unwrap();
    rpdo.save().await.unwrap();
    let tpdo = node.tpdo().get(1).unwrap();
    tpdo.configure(["Statusword"], 255, 0, true).unwrap();
    tpdo.save().await.unwrap();
    node.nmt()
        .request_state(NmtState::Operational)
        .await
        .unwrap();
    assert!(wait_until(TIMEOUT, || bench.device.nmt_state() == NmtState::Operational).await);

    // A PDO channel needs both words mapped
    assert!(matches!(
        PdoChannel::new(tpdo.clone(), rpdo.clone()),
        Err(Cia402Error::NotMapped { .. })
    ));

    let channel = PdoChannel::new(rpdo.clone(), tpdo.clone()).unwrap();
    let drive = node.drive(channel);
    drive
        .request_state(DriveState::OperationEnabled, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(
        Ok(Value::U16(DriveState::OperationEnabled.statusword_bits())),
        bench.device.value(0x6041, 0)
    );
    assert!(tpdo.last_reception().is_some());

    bench.shutdown().await;
}
