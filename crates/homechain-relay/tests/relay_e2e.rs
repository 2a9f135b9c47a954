//! End-to-end relay runs against the in-process ledger and bus doubles.

use std::sync::Arc;
use std::time::Duration;

use homechain_relay::testkit::{FakeLedger, RecordingBus};
use homechain_relay::{RelayConfig, RelayError, RelaySummary, RetryPolicy, Relay};
use homechain_store::{CursorStore, MemCursorStore};
use homechain_types::{
    ApplianceConfig, ApplianceKey, Cursor, DeviceMessage, IdempotencyKey, Multistate, Position,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EMITTER: &str = "0xHome";
const WAIT: Duration = Duration::from_secs(5);

fn config(workers: usize) -> RelayConfig {
    let fast = RetryPolicy::bounded(3, Duration::from_millis(1), Duration::from_millis(5));
    RelayConfig {
        emitter: EMITTER.to_lowercase(),
        workers,
        page_size: 4,
        shutdown_grace: Duration::from_secs(2),
        reconnect: RetryPolicy::unbounded(Duration::from_millis(1), Duration::from_millis(10)),
        reconcile_retry: fast.clone(),
        publish_retry: fast,
        ..RelayConfig::default()
    }
}

fn binary(pin: u8) -> ApplianceConfig {
    ApplianceConfig {
        primary_pin: pin,
        ..ApplianceConfig::default()
    }
}

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<Result<RelaySummary, RelayError>>,
}

impl Running {
    async fn stop(self) -> RelaySummary {
        let _ = self.shutdown.send(());
        self.handle
            .await
            .expect("relay task")
            .expect("relay run")
    }
}

fn start(
    config: RelayConfig,
    ledger: &Arc<FakeLedger>,
    bus: &Arc<RecordingBus>,
    store: &MemCursorStore,
) -> Running {
    let (shutdown, rx) = broadcast::channel(1);
    let relay = Relay::new(config, ledger.clone(), bus.clone(), Arc::new(store.clone()));
    Running {
        shutdown,
        handle: tokio::spawn(relay.run(rx)),
    }
}

fn key_for(position: Position, key: ApplianceKey) -> String {
    IdempotencyKey::derive(EMITTER, position, key).to_string()
}

#[tokio::test]
async fn binary_change_publishes_retained_command_to_room_topic() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let key = ApplianceKey::new(0, 2);
    ledger.set_config(key, binary(14));
    let position = ledger.record_switch(key, true);

    let relay = start(config(2), &ledger, &bus, &store);
    let sent = bus.wait_for(1, WAIT).await;
    let summary = relay.stop().await;

    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "home/room/0");
    assert!(sent[0].retain);
    assert_eq!(sent[0].qos, 1);
    let message: DeviceMessage = serde_json::from_str(&sent[0].payload).unwrap();
    assert_eq!(message.pin, 14);
    assert_eq!(message.mode, 1);
    assert!(!message.is_multistate);
    assert_eq!(message.multistate, Multistate::Scalar(0));
    assert_eq!((message.room_id, message.appliance_id), (0, 2));
    assert_eq!(message.idempotency_key, key_for(position, key));

    assert_eq!(summary.committed, Some(position));
    assert_eq!(store.load().unwrap(), Some(Cursor::from(position)));
}

#[tokio::test]
async fn multi_value_change_carries_every_declared_pin() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let key = ApplianceKey::new(0, 1);
    ledger.set_config(
        key,
        ApplianceConfig {
            primary_pin: 15,
            is_multi_value: true,
            multi_value_pins: vec![15, 16, 17],
        },
    );
    ledger.record_multi(key, vec![75, 200, 50]);

    let relay = start(config(2), &ledger, &bus, &store);
    bus.wait_for(1, WAIT).await;
    relay.stop().await;

    let commands = bus.commands();
    assert_eq!(commands.len(), 1);
    let message = &commands[0];
    assert!(message.is_multistate);
    assert_eq!(message.pin, 15);
    assert_eq!(message.mode, 1);
    assert_eq!(message.multistate, Multistate::Values(vec![75, 200, 50]));
    assert_eq!(message.multistate_pins, vec![15, 16, 17]);
}

#[tokio::test]
async fn commands_for_one_appliance_follow_ledger_order() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    bus.set_publish_delay(Duration::from_millis(2));
    let store = MemCursorStore::new();
    let keys: Vec<_> = (0..3).map(|i| ApplianceKey::new(i, 1)).collect();
    for key in &keys {
        ledger.set_config(*key, binary(4));
    }

    let mut expected = Vec::new();
    for round in 0..8 {
        for key in &keys {
            let position = ledger.record_switch(*key, round % 2 == 0);
            expected.push((*key, key_for(position, *key)));
        }
    }

    let relay = start(config(4), &ledger, &bus, &store);
    bus.wait_for(expected.len(), WAIT).await;
    relay.stop().await;

    let commands = bus.commands();
    assert_eq!(commands.len(), expected.len());
    for key in &keys {
        let want: Vec<_> = expected
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, id)| id.clone())
            .collect();
        let got: Vec<_> = commands
            .iter()
            .filter(|m| m.room_id == key.room_id && m.appliance_id == key.appliance_id)
            .map(|m| m.idempotency_key.clone())
            .collect();
        assert_eq!(got, want, "out of order for {key}");
    }
}

#[tokio::test]
async fn restart_resumes_after_committed_cursor() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let store = MemCursorStore::new();
    let key = ApplianceKey::new(1, 1);
    ledger.set_config(key, binary(2));
    ledger.record_switch(key, true);
    ledger.record_switch(key, false);

    let first_bus = Arc::new(RecordingBus::new());
    let relay = start(config(2), &ledger, &first_bus, &store);
    first_bus.wait_for(2, WAIT).await;
    let first = relay.stop().await;
    assert_eq!(first_bus.messages().len(), 2);

    let latest = ledger.record_switch(key, true);
    let second_bus = Arc::new(RecordingBus::new());
    let relay = start(config(2), &ledger, &second_bus, &store);
    second_bus.wait_for(1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = relay.stop().await;

    let replayed = second_bus.commands();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].idempotency_key, key_for(latest, key));
    assert!(first.committed < second.committed);
}

#[tokio::test]
async fn uncommitted_event_is_redelivered_with_same_idempotency_key() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let key = ApplianceKey::new(0, 2);
    ledger.set_config(key, binary(14));
    let acked = ledger.record_switch(key, true);
    let lost = ledger.record_switch(key, false);

    // The process stopped after publishing `lost` but before its cursor write.
    let before_crash = Arc::new(RecordingBus::new());
    let store = MemCursorStore::with_cursor(Cursor::from(acked));
    let relay = start(config(1), &ledger, &before_crash, &store);
    before_crash.wait_for(1, WAIT).await;
    relay.stop().await;

    let after_crash = Arc::new(RecordingBus::new());
    let store = MemCursorStore::with_cursor(Cursor::from(acked));
    let relay = start(config(1), &ledger, &after_crash, &store);
    after_crash.wait_for(1, WAIT).await;
    relay.stop().await;

    let a = before_crash.commands();
    let b = after_crash.commands();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].idempotency_key, b[0].idempotency_key);
    assert_eq!(b[0].idempotency_key, key_for(lost, key));
}

#[tokio::test]
async fn reorganized_events_are_replayed_from_last_final_block() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let a = ApplianceKey::new(0, 1);
    let b = ApplianceKey::new(0, 2);
    ledger.set_config(a, binary(3));
    ledger.set_config(b, binary(4));
    ledger.set_switch_state(a, true);
    ledger.set_switch_state(b, true);

    let p1 = ledger.record_switch(a, true);
    ledger.append_block(vec![
        ("SingleStateChanged", json!({ "roomId": 0, "applianceId": 1, "state": false })),
        ("SingleStateChanged", json!({ "roomId": 0, "applianceId": 1, "state": true })),
    ]);
    ledger.set_finalized(p1.block_height);

    let relay = start(config(2), &ledger, &bus, &store);
    bus.wait_for(3, WAIT).await;

    ledger.reorg(p1.block_height + 1);
    let replacement = ledger.record_switch(b, false);
    ledger.disconnect_live();

    let sent = bus.wait_for(4, WAIT).await;
    let summary = relay.stop().await;

    assert_eq!(sent.len(), 4);
    let last: DeviceMessage = serde_json::from_str(&sent[3].payload).unwrap();
    assert_eq!(last.idempotency_key, key_for(replacement, b));
    assert_eq!(last.mode, 0);
    assert_eq!(summary.committed, Some(replacement));
    assert!(
        store
            .history()
            .contains(&Cursor::from(Position::end_of_block(p1.block_height)))
    );
}

#[tokio::test]
async fn reorg_seen_on_live_subscription_is_replayed() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let a = ApplianceKey::new(0, 1);
    let b = ApplianceKey::new(0, 2);
    ledger.set_config(a, binary(3));
    ledger.set_config(b, binary(4));
    ledger.set_switch_state(a, true);

    let relay = start(config(2), &ledger, &bus, &store);
    let p1 = ledger.record_switch(a, true);
    ledger.set_finalized(p1.block_height);
    ledger.append_block(vec![
        ("SingleStateChanged", json!({ "roomId": 0, "applianceId": 1, "state": false })),
        ("SingleStateChanged", json!({ "roomId": 0, "applianceId": 1, "state": true })),
    ]);
    bus.wait_for(3, WAIT).await;

    ledger.reorg(p1.block_height + 1);
    let replacement = ledger.record_switch(b, false);

    let sent = bus.wait_for(4, WAIT).await;
    let summary = relay.stop().await;

    assert_eq!(sent.len(), 4);
    let last: DeviceMessage = serde_json::from_str(&sent[3].payload).unwrap();
    assert_eq!(last.idempotency_key, key_for(replacement, b));
    assert_eq!(last.pin, 4);
    assert_eq!(summary.committed, Some(replacement));
    assert_eq!(store.load().unwrap(), Some(Cursor::from(replacement)));
}

#[tokio::test]
async fn shutdown_is_observed_while_a_worker_queue_is_full() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let key = ApplianceKey::new(0, 2);
    ledger.set_config(key, binary(14));
    for on in [true, false, true, false, true, false] {
        ledger.record_switch(key, on);
    }
    bus.set_publish_delay(Duration::from_secs(30));

    let relay = start(
        RelayConfig {
            queue_depth: 1,
            shutdown_grace: Duration::from_millis(50),
            ..config(1)
        },
        &ledger,
        &bus,
        &store,
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = relay.shutdown.send(());
    let summary = tokio::time::timeout(Duration::from_secs(2), relay.handle)
        .await
        .expect("relay stops while dispatch waits on a full queue")
        .expect("relay task")
        .expect("relay run");

    assert_eq!(summary.aborted_workers, 1);
    assert_eq!(summary.committed, None);
    assert!(bus.messages().is_empty());
    assert_eq!(store.load().unwrap(), None);
}

#[tokio::test]
async fn skipped_and_failed_events_still_advance_the_cursor() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let known = ApplianceKey::new(2, 1);
    let missing = ApplianceKey::new(2, 9);
    ledger.set_config(known, binary(7));

    ledger.append("OwnershipTransferred", json!({ "owner": "0x01" }));
    ledger.append_from(
        "0xsomeoneelse",
        "SingleStateChanged",
        json!({ "roomId": 2, "applianceId": 1, "state": true }),
    );
    ledger.append("SingleStateChanged", json!({ "roomId": "two" }));
    ledger.record_switch(missing, true);
    let last = ledger.record_switch(known, true);

    let relay = start(config(2), &ledger, &bus, &store);
    bus.wait_for(1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = relay.stop().await;

    let commands = bus.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].pin, 7);
    assert_eq!(summary.committed, Some(last));
}

#[tokio::test]
async fn config_change_applies_to_later_commands() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let key = ApplianceKey::new(3, 3);
    ledger.set_config(key, binary(14));
    ledger.record_switch(key, true);

    let relay = start(config(2), &ledger, &bus, &store);
    bus.wait_for(1, WAIT).await;

    ledger.record_config(key, binary(21));
    ledger.record_switch(key, false);
    bus.wait_for(2, WAIT).await;
    relay.stop().await;

    let pins: Vec<_> = bus.commands().iter().map(|m| (m.pin, m.mode)).collect();
    assert_eq!(pins, vec![(14, 1), (21, 0)]);
}

#[tokio::test]
async fn transient_bus_failures_are_retried_before_commit() {
    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let store = MemCursorStore::new();
    let key = ApplianceKey::new(0, 2);
    ledger.set_config(key, binary(14));
    let position = ledger.record_switch(key, true);
    bus.fail_next(2);

    let relay = start(config(1), &ledger, &bus, &store);
    bus.wait_for(1, WAIT).await;
    let summary = relay.stop().await;

    assert_eq!(bus.messages().len(), 1);
    assert_eq!(summary.committed, Some(position));
}

#[tokio::test]
async fn startup_fails_fast_when_dependencies_are_unreachable() {
    let store = MemCursorStore::new();

    let ledger = Arc::new(FakeLedger::new(EMITTER));
    ledger.set_unreachable(true);
    let bus = Arc::new(RecordingBus::new());
    let (_tx, rx) = broadcast::channel(1);
    let err = Relay::new(config(1), ledger, bus, Arc::new(store.clone()))
        .run(rx)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::LedgerUnreachable(_)));

    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    bus.set_unreachable(true);
    let (_tx, rx) = broadcast::channel(1);
    let err = Relay::new(config(1), ledger, bus, Arc::new(store.clone()))
        .run(rx)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::BusUnreachable(_)));

    let ledger = Arc::new(FakeLedger::new(EMITTER));
    let bus = Arc::new(RecordingBus::new());
    let (_tx, rx) = broadcast::channel(1);
    let err = Relay::new(config(0), ledger, bus, Arc::new(store))
        .run(rx)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Config(_)));
}
