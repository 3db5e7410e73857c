//! End-to-end behaviour of the peripheral against a recording link layer.

use std::collections::HashMap;
use std::sync::Arc;

use envsense::advertising::{AdvertisingConfig, AdvertisingError, DeviceAddress};
use envsense::attribute::{encode, CharacteristicId};
use envsense::connection::{AdvertisingState, LinkState};
use envsense::gatt_access::{AccessError, AccessOp, AccessResponse};
use envsense::link::{
    AdvertisingParams, AttrHandle, ConnHandle, ConnectionDescriptor, ConnectionParams, Gap,
    GapEvent, IndicationSink, LinkError, LinkResult, SubscribeEvent, TxStatus,
};
use envsense::subscription::DisconnectPolicy;
use envsense::{Peripheral, PeripheralError, SensorCache, SensorReading};

const TEMP_HANDLE: AttrHandle = 0x2A;
const HUMIDITY_HANDLE: AttrHandle = 0x2D;
const BATTERY_HANDLE: AttrHandle = 0x34;

#[derive(Debug, Clone, PartialEq)]
enum GapCall {
    AdvData(Vec<u8>),
    ScanRsp(Vec<u8>),
    StartAdvertising(AdvertisingParams),
    UpdateParams(ConnHandle, ConnectionParams),
}

#[derive(Default)]
struct MockGap {
    calls: Vec<GapCall>,
    connections: HashMap<ConnHandle, ConnectionDescriptor>,
    fail_start: Option<LinkError>,
}

impl MockGap {
    fn add_connection(&mut self, handle: ConnHandle) {
        self.connections.insert(
            handle,
            ConnectionDescriptor {
                handle,
                peer_address: [0xC0, 0xFF, 0xEE, 0x00, 0x00, handle as u8],
                interval: 40,
                latency: 0,
                supervision_timeout: 500,
            },
        );
    }

    fn advertising_starts(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, GapCall::StartAdvertising(_)))
            .count()
    }
}

impl Gap for MockGap {
    fn set_advertising_data(&mut self, data: &[u8]) -> LinkResult<()> {
        self.calls.push(GapCall::AdvData(data.to_vec()));
        Ok(())
    }

    fn set_scan_response_data(&mut self, data: &[u8]) -> LinkResult<()> {
        self.calls.push(GapCall::ScanRsp(data.to_vec()));
        Ok(())
    }

    fn start_advertising(&mut self, params: &AdvertisingParams) -> LinkResult<()> {
        if let Some(e) = self.fail_start {
            return Err(e);
        }
        self.calls.push(GapCall::StartAdvertising(*params));
        Ok(())
    }

    fn connection_descriptor(&self, handle: ConnHandle) -> LinkResult<ConnectionDescriptor> {
        self.connections
            .get(&handle)
            .copied()
            .ok_or(LinkError::UnknownConnection(handle))
    }

    fn update_connection_params(
        &mut self,
        handle: ConnHandle,
        params: &ConnectionParams,
    ) -> LinkResult<()> {
        self.calls.push(GapCall::UpdateParams(handle, *params));
        Ok(())
    }
}

#[derive(Default)]
struct MockSink {
    sent: Vec<(ConnHandle, AttrHandle, Vec<u8>)>,
    // Connections the stack no longer knows about
    dead: Vec<ConnHandle>,
}

impl IndicationSink for MockSink {
    fn indicate(&mut self, conn: ConnHandle, attr: AttrHandle, value: &[u8]) -> LinkResult<()> {
        if self.dead.contains(&conn) {
            return Err(LinkError::UnknownConnection(conn));
        }
        self.sent.push((conn, attr, value.to_vec()));
        Ok(())
    }
}

fn peripheral(policy: DisconnectPolicy) -> (Peripheral, Arc<SensorCache>) {
    let cache = Arc::new(SensorCache::new());
    let address = DeviceAddress::public([0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]);
    let config = AdvertisingConfig::new(address);
    let mut p = Peripheral::new(cache.clone(), config, policy);
    p.register_attribute(CharacteristicId::Temperature, TEMP_HANDLE);
    p.register_attribute(CharacteristicId::Humidity, HUMIDITY_HANDLE);
    p.register_attribute(CharacteristicId::BatteryPercentage, BATTERY_HANDLE);
    (p, cache)
}

fn subscribe(conn: ConnHandle, attr: AttrHandle, indicate: bool) -> GapEvent {
    GapEvent::Subscribe(SubscribeEvent {
        conn,
        attr,
        prev_notify: false,
        cur_notify: false,
        prev_indicate: !indicate,
        cur_indicate: indicate,
    })
}

#[test]
fn full_lifecycle_rebroadcasts_after_disconnect() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    assert_eq!(p.link_state(), LinkState::Idle);

    p.start(&mut gap).unwrap();
    assert_eq!(p.connection().advertising_state(), AdvertisingState::Advertising);
    assert!(matches!(gap.calls[0], GapCall::AdvData(ref d) if d.len() <= 31));
    assert!(matches!(gap.calls[1], GapCall::ScanRsp(ref d) if d.len() <= 31));
    assert_eq!(
        gap.calls[2],
        GapCall::StartAdvertising(AdvertisingParams {
            interval_min: 800,
            interval_max: 816,
        })
    );

    gap.add_connection(1);
    p.handle_event(GapEvent::Connected { handle: 1 }, &mut gap).unwrap();
    let slot = p.connection().active_connection().unwrap();
    assert_eq!(slot.handle, 1);
    assert_eq!(slot.descriptor.unwrap().supervision_timeout, 500);
    assert_eq!(
        gap.calls.last(),
        Some(&GapCall::UpdateParams(
            1,
            ConnectionParams {
                interval_min: 40,
                interval_max: 40,
                latency: 3,
                supervision_timeout: 500,
            }
        ))
    );

    p.handle_event(GapEvent::Disconnected { handle: 1, reason: 0x13 }, &mut gap)
        .unwrap();
    assert_eq!(p.link_state(), LinkState::Advertising);
    assert_eq!(gap.advertising_starts(), 2);
}

#[test]
fn reconnect_needs_no_explicit_restart() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();

    gap.add_connection(1);
    p.handle_event(GapEvent::Connected { handle: 1 }, &mut gap).unwrap();
    p.handle_event(GapEvent::Disconnected { handle: 1, reason: 0x08 }, &mut gap)
        .unwrap();

    gap.add_connection(2);
    p.handle_event(GapEvent::Connected { handle: 2 }, &mut gap).unwrap();
    assert_eq!(p.connection().active_connection().map(|s| s.handle), Some(2));
}

#[test]
fn connect_after_unseen_disconnect_takes_over_slot() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();

    gap.add_connection(1);
    p.handle_event(GapEvent::Connected { handle: 1 }, &mut gap).unwrap();
    // Disconnected { handle: 1 } never arrives
    gap.add_connection(2);
    p.handle_event(GapEvent::Connected { handle: 2 }, &mut gap).unwrap();

    assert_eq!(p.connection().active_connection().map(|s| s.handle), Some(2));
    assert!(matches!(gap.calls.last(), Some(GapCall::UpdateParams(2, _))));
    assert_eq!(gap.advertising_starts(), 1);
}

#[test]
fn late_disconnect_leaves_live_connection() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();

    gap.add_connection(1);
    p.handle_event(GapEvent::Connected { handle: 1 }, &mut gap).unwrap();
    gap.add_connection(2);
    p.handle_event(GapEvent::Connected { handle: 2 }, &mut gap).unwrap();
    p.handle_event(subscribe(2, TEMP_HANDLE, true), &mut gap).unwrap();

    p.handle_event(GapEvent::Disconnected { handle: 1, reason: 0x08 }, &mut gap)
        .unwrap();
    assert_eq!(p.connection().active_connection().map(|s| s.handle), Some(2));
    assert_eq!(gap.advertising_starts(), 1);
    assert_eq!(
        p.registry().target_connection(CharacteristicId::Temperature),
        Some(2)
    );

    p.handle_event(GapEvent::Disconnected { handle: 2, reason: 0x13 }, &mut gap)
        .unwrap();
    assert_eq!(p.link_state(), LinkState::Advertising);
    assert_eq!(gap.advertising_starts(), 2);
}

#[test]
fn connect_failure_and_advertising_complete_restart() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();

    p.handle_event(GapEvent::ConnectFailed { status: 0x3E }, &mut gap)
        .unwrap();
    p.handle_event(GapEvent::AdvertisingComplete { reason: 0 }, &mut gap)
        .unwrap();
    assert_eq!(gap.advertising_starts(), 3);
    assert_eq!(p.link_state(), LinkState::Advertising);
}

#[test]
fn failed_restart_is_reported_for_retry() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();
    gap.add_connection(5);
    p.handle_event(GapEvent::Connected { handle: 5 }, &mut gap).unwrap();

    gap.fail_start = Some(LinkError::NoResources);
    let err = p
        .handle_event(GapEvent::Disconnected { handle: 5, reason: 0x13 }, &mut gap)
        .unwrap_err();
    assert_eq!(
        err,
        PeripheralError::Advertising(AdvertisingError::Start(LinkError::NoResources))
    );
    assert!(err.needs_advertising_retry());
    assert_eq!(p.link_state(), LinkState::Idle);

    gap.fail_start = None;
    p.start(&mut gap).unwrap();
    assert_eq!(p.link_state(), LinkState::Advertising);
}

#[test]
fn subscribe_and_unsubscribe() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();

    p.handle_event(subscribe(3, TEMP_HANDLE, true), &mut gap).unwrap();
    assert!(p.registry().is_subscribed(CharacteristicId::Temperature));
    assert_eq!(p.registry().target_connection(CharacteristicId::Temperature), Some(3));

    p.handle_event(subscribe(3, TEMP_HANDLE, false), &mut gap).unwrap();
    assert!(!p.registry().is_subscribed(CharacteristicId::Temperature));

    // Unknown attribute handles are ignored
    p.handle_event(subscribe(3, 0x99, true), &mut gap).unwrap();
    for c in CharacteristicId::ALL {
        assert!(!p.registry().is_subscribed(c));
    }
}

#[test]
fn pump_sends_nothing_without_subscribers() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut sink = MockSink::default();
    let report = p.send_indications(&mut sink);
    assert_eq!(report.sent, 0);
    assert!(sink.sent.is_empty());
}

#[test]
fn pump_sends_once_per_subscribed_characteristic() {
    let (mut p, cache) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    for attr in [TEMP_HANDLE, HUMIDITY_HANDLE, BATTERY_HANDLE] {
        p.handle_event(subscribe(1, attr, true), &mut gap).unwrap();
    }
    let reading = SensorReading {
        temperature: 21.37,
        humidity: 48.5,
        battery_voltage: 3.92,
        battery_percentage: 72.4,
    };
    cache.update(reading);

    let mut sink = MockSink::default();
    let report = p.send_indications(&mut sink);
    assert_eq!(report.sent, 3);
    assert_eq!(sink.sent.len(), 3);
    for (characteristic, attr) in [
        (CharacteristicId::Temperature, TEMP_HANDLE),
        (CharacteristicId::Humidity, HUMIDITY_HANDLE),
        (CharacteristicId::BatteryPercentage, BATTERY_HANDLE),
    ] {
        let expected = encode(characteristic, &reading).unwrap();
        assert_eq!(
            sink.sent.iter().filter(|(_, a, _)| *a == attr).count(),
            1,
            "{} sent more than once",
            characteristic
        );
        assert!(sink
            .sent
            .contains(&(1, attr, expected.as_bytes().to_vec())));
    }
}

#[test]
fn read_ignores_subscription_state() {
    let (mut p, cache) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    cache.update_environment(-12.34, 33.0);
    let expected = encode(CharacteristicId::Temperature, &cache.snapshot()).unwrap();

    let before = p.on_access(1, TEMP_HANDLE, AccessOp::ReadCharacteristic).unwrap();
    p.handle_event(subscribe(1, TEMP_HANDLE, true), &mut gap).unwrap();
    let after = p.on_access(1, TEMP_HANDLE, AccessOp::ReadCharacteristic).unwrap();

    assert_eq!(before, AccessResponse::Value(expected));
    assert_eq!(after, before);
}

#[test]
fn access_errors_and_unknown_handles() {
    let (p, _) = peripheral(DisconnectPolicy::ClearMatching);
    assert_eq!(
        p.on_access(1, BATTERY_HANDLE, AccessOp::WriteCharacteristic),
        Err(AccessError::Unlikely)
    );
    assert_eq!(
        p.on_access(1, 0x77, AccessOp::ReadCharacteristic),
        Ok(AccessResponse::NoContent)
    );
}

#[test]
fn clear_policy_stops_indications_to_dead_connection() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();
    gap.add_connection(1);
    p.handle_event(GapEvent::Connected { handle: 1 }, &mut gap).unwrap();
    p.handle_event(subscribe(1, HUMIDITY_HANDLE, true), &mut gap).unwrap();
    p.handle_event(GapEvent::Disconnected { handle: 1, reason: 0x13 }, &mut gap)
        .unwrap();

    let mut sink = MockSink {
        dead: vec![1],
        ..Default::default()
    };
    let report = p.send_indications(&mut sink);
    assert_eq!(report.attempted(), 0);
    assert!(!p.registry().is_subscribed(CharacteristicId::Humidity));
}

#[test]
fn retain_policy_tolerates_stale_handle() {
    let (mut p, _) = peripheral(DisconnectPolicy::RetainStale);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();
    gap.add_connection(1);
    p.handle_event(GapEvent::Connected { handle: 1 }, &mut gap).unwrap();
    p.handle_event(subscribe(1, HUMIDITY_HANDLE, true), &mut gap).unwrap();
    p.handle_event(GapEvent::Disconnected { handle: 1, reason: 0x13 }, &mut gap)
        .unwrap();

    let mut sink = MockSink {
        dead: vec![1],
        ..Default::default()
    };
    let report = p.send_indications(&mut sink);
    assert_eq!(report.sent, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].error, LinkError::UnknownConnection(1));
    // Registry untouched, the next tick tries again
    assert!(p.registry().is_subscribed(CharacteristicId::Humidity));
    assert_eq!(p.send_indications(&mut sink).failures.len(), 1);
}

#[test]
fn connection_update_refreshes_descriptor() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();
    gap.add_connection(4);
    p.handle_event(GapEvent::Connected { handle: 4 }, &mut gap).unwrap();

    if let Some(d) = gap.connections.get_mut(&4) {
        d.latency = 3;
    }
    p.handle_event(GapEvent::ConnectionUpdated { handle: 4, status: 0 }, &mut gap)
        .unwrap();
    let descriptor = p.connection().active_connection().unwrap().descriptor.unwrap();
    assert_eq!(descriptor.latency, 3);
}

#[test]
fn informational_events_leave_state_alone() {
    let (mut p, _) = peripheral(DisconnectPolicy::ClearMatching);
    let mut gap = MockGap::default();
    p.start(&mut gap).unwrap();
    gap.add_connection(1);
    p.handle_event(GapEvent::Connected { handle: 1 }, &mut gap).unwrap();
    let before = p.link_state();

    p.handle_event(
        GapEvent::MtuChanged {
            handle: 1,
            channel_id: 4,
            mtu: 247,
        },
        &mut gap,
    )
    .unwrap();
    p.handle_event(
        GapEvent::IndicationTx {
            handle: 1,
            attr: TEMP_HANDLE,
            status: TxStatus::Failed(0x85),
        },
        &mut gap,
    )
    .unwrap();
    // Controller stopping advertising after a connection is expected
    p.handle_event(GapEvent::AdvertisingComplete { reason: 0 }, &mut gap)
        .unwrap();

    assert_eq!(p.link_state(), before);
    assert_eq!(gap.advertising_starts(), 1);
}
