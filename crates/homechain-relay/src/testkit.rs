//! In-process ledger and bus doubles for tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use homechain_types::{
    ApplianceConfig, ApplianceKey, DeviceMessage, EventKind, LedgerEvent, Position,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::bus::{BusError, BusMessage, DeviceBus};
use crate::ledger::{EventStream, LedgerClient, LedgerError};

pub fn single_fields(key: ApplianceKey, state: bool) -> serde_json::Value {
    json!({ "roomId": key.room_id, "applianceId": key.appliance_id, "state": state })
}

pub fn multi_fields(key: ApplianceKey, values: &[u32]) -> serde_json::Value {
    json!({ "roomId": key.room_id, "applianceId": key.appliance_id, "values": values })
}

pub fn config_fields(key: ApplianceKey) -> serde_json::Value {
    json!({ "roomId": key.room_id, "applianceId": key.appliance_id })
}

#[derive(Clone)]
enum LiveItem {
    Event(LedgerEvent),
    Reorg(Position),
    Disconnect,
}

#[derive(Default)]
struct LedgerState {
    events: Vec<LedgerEvent>,
    head: u64,
    finalized: u64,
    pruned: BTreeSet<Position>,
    switches: HashMap<ApplianceKey, bool>,
    multis: HashMap<ApplianceKey, Vec<u32>>,
    configs: HashMap<ApplianceKey, ApplianceConfig>,
    config_read_delay: Duration,
}

/// Scriptable ledger. Each `append` mines one block; `append_block` puts
/// several events in the same block.
pub struct FakeLedger {
    emitter: String,
    state: Mutex<LedgerState>,
    live: broadcast::Sender<LiveItem>,
    unreachable: AtomicBool,
    failing_reads: AtomicU32,
    config_reads: AtomicUsize,
}

impl FakeLedger {
    pub fn new(emitter: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            emitter: emitter.into(),
            state: Mutex::new(LedgerState::default()),
            live,
            unreachable: AtomicBool::new(false),
            failing_reads: AtomicU32::new(0),
            config_reads: AtomicUsize::new(0),
        }
    }

    pub fn emitter(&self) -> &str {
        &self.emitter
    }

    pub fn head_height(&self) -> u64 {
        self.lock().head
    }

    pub fn append(&self, kind: &str, fields: serde_json::Value) -> Position {
        let emitter = self.emitter.clone();
        self.mine(vec![(emitter, kind.to_string(), fields)])[0]
    }

    pub fn append_from(&self, emitter: &str, kind: &str, fields: serde_json::Value) -> Position {
        self.mine(vec![(emitter.to_string(), kind.to_string(), fields)])[0]
    }

    pub fn append_block(&self, events: Vec<(&str, serde_json::Value)>) -> Vec<Position> {
        self.mine(
            events
                .into_iter()
                .map(|(kind, fields)| (self.emitter.clone(), kind.to_string(), fields))
                .collect(),
        )
    }

    /// Set the switch state and emit the matching event.
    pub fn record_switch(&self, key: ApplianceKey, on: bool) -> Position {
        self.set_switch_state(key, on);
        self.append(EventKind::SINGLE_STATE_CHANGED, single_fields(key, on))
    }

    pub fn record_multi(&self, key: ApplianceKey, values: Vec<u32>) -> Position {
        let fields = multi_fields(key, &values);
        self.set_multi_state(key, values);
        self.append(EventKind::MULTI_STATE_CHANGED, fields)
    }

    pub fn record_config(&self, key: ApplianceKey, config: ApplianceConfig) -> Position {
        self.set_config(key, config);
        self.append(EventKind::APPLIANCE_CONFIG_CHANGED, config_fields(key))
    }

    pub fn set_switch_state(&self, key: ApplianceKey, on: bool) {
        self.lock().switches.insert(key, on);
    }

    pub fn set_multi_state(&self, key: ApplianceKey, values: Vec<u32>) {
        self.lock().multis.insert(key, values);
    }

    pub fn set_config(&self, key: ApplianceKey, config: ApplianceConfig) {
        self.lock().configs.insert(key, config);
    }

    pub fn set_config_read_delay(&self, delay: Duration) {
        self.lock().config_read_delay = delay;
    }

    pub fn config_reads(&self) -> usize {
        self.config_reads.load(Ordering::SeqCst)
    }

    /// The next `n` state or config reads fail with a transport error.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// While set, head, event and subscribe calls fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_finalized(&self, height: u64) {
        self.lock().finalized = height;
    }

    /// End every live subscription with an error.
    pub fn disconnect_live(&self) {
        let _ = self.live.send(LiveItem::Disconnect);
    }

    /// Drop every block at or above `from_height` and end live subscriptions
    /// with [`LedgerError::PositionPruned`]. Positions of removed events are
    /// reported as pruned until an event takes their place.
    pub fn reorg(&self, from_height: u64) {
        self.reorg_unannounced(from_height);
        let _ = self.live.send(LiveItem::Reorg(Position::new(from_height, 0)));
    }

    /// Like [`FakeLedger::reorg`], but live subscriptions are not told.
    pub fn reorg_unannounced(&self, from_height: u64) {
        let mut state = self.lock();
        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut state.events)
            .into_iter()
            .partition(|e| e.position.block_height < from_height);
        state.events = kept;
        state.pruned.extend(removed.iter().map(|e| e.position));
        state.head = from_height.saturating_sub(1);
        state.finalized = state.finalized.min(state.head);
    }

    fn mine(&self, batch: Vec<(String, String, serde_json::Value)>) -> Vec<Position> {
        let mut state = self.lock();
        state.head += 1;
        let height = state.head;
        let mut positions = Vec::with_capacity(batch.len());
        for (index, (emitter, kind, fields)) in batch.into_iter().enumerate() {
            let position = Position::new(height, index as u32);
            state.pruned.remove(&position);
            let event = LedgerEvent {
                emitter,
                position,
                kind,
                fields,
            };
            state.events.push(event.clone());
            let _ = self.live.send(LiveItem::Event(event));
            positions.push(position);
        }
        positions
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), LedgerError> {
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(LedgerError::Transport("injected read failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn head(&self) -> Result<u64, LedgerError> {
        self.check_reachable()?;
        Ok(self.lock().head)
    }

    async fn finalized_height(&self) -> Result<u64, LedgerError> {
        self.check_reachable()?;
        Ok(self.lock().finalized)
    }

    async fn events_after(
        &self,
        after: Option<Position>,
        to_height: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.check_reachable()?;
        let state = self.lock();
        if let Some(after) = after {
            if state.pruned.contains(&after) {
                return Err(LedgerError::PositionPruned(after));
            }
        }
        Ok(state
            .events
            .iter()
            .filter(|e| Some(e.position) > after && e.position.block_height <= to_height)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn subscribe(&self) -> Result<EventStream, LedgerError> {
        self.check_reachable()?;
        let rx = self.live.subscribe();
        Ok(futures::stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Ok(LiveItem::Event(event)) => Some((Ok(event), Some(rx))),
                Ok(LiveItem::Reorg(at)) => Some((Err(LedgerError::PositionPruned(at)), None)),
                Ok(LiveItem::Disconnect) => {
                    Some((Err(LedgerError::Transport("subscription dropped".into())), None))
                }
                Err(RecvError::Lagged(n)) => Some((
                    Err(LedgerError::Transport(format!("subscriber lagged by {n} events"))),
                    None,
                )),
                Err(RecvError::Closed) => None,
            }
        })
        .boxed())
    }

    async fn switch_state(&self, key: ApplianceKey) -> Result<bool, LedgerError> {
        self.check_read()?;
        self.lock()
            .switches
            .get(&key)
            .copied()
            .ok_or(LedgerError::NotFound(key))
    }

    async fn multi_state(&self, key: ApplianceKey) -> Result<Vec<u32>, LedgerError> {
        self.check_read()?;
        self.lock()
            .multis
            .get(&key)
            .cloned()
            .ok_or(LedgerError::NotFound(key))
    }

    async fn appliance_config(&self, key: ApplianceKey) -> Result<ApplianceConfig, LedgerError> {
        self.config_reads.fetch_add(1, Ordering::SeqCst);
        self.check_read()?;
        let (config, delay) = {
            let state = self.lock();
            (state.configs.get(&key).cloned(), state.config_read_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        config.ok_or(LedgerError::NotFound(key))
    }
}

/// Device bus that records every acknowledged message.
#[derive(Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<BusMessage>>,
    failing: AtomicU32,
    unreachable: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads of recorded messages, in publish order.
    pub fn commands(&self) -> Vec<DeviceMessage> {
        self.messages()
            .iter()
            .filter_map(|m| serde_json::from_str(&m.payload).ok())
            .collect()
    }

    /// The next `n` publishes fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay applied to every publish before it is acknowledged.
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Wait until at least `count` messages were recorded or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<BusMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.messages();
            if messages.len() >= count || tokio::time::Instant::now() >= deadline {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl DeviceBus for RecordingBus {
    fn kind(&self) -> &str {
        "recording"
    }

    async fn ready(&self) -> Result<(), BusError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BusError::Transport("broker unreachable".into()));
        }
        Ok(())
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        self.ready().await?;
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BusError::Transport("injected publish failure".into()));
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}
