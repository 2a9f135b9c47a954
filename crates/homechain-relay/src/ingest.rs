//! Ledger event ingestion and cursor commit tracking.
//!
//! A dedicated task follows the ledger:
//! 1. Subscribes for live events (buffered by the subscription)
//! 2. Backfills everything between the last delivered position and the head
//! 3. Drains the live subscription, dropping events catch-up already delivered
//!
//! Any subscription failure restarts this sequence after a jittered backoff.
//! A reorganization reported on the live subscription restarts it at once, so
//! catch-up finds the orphaned position and rewinds.
//! Delivered events carry an [`Ack`]; the durable cursor only moves past an
//! event once it and every event before it have been acknowledged.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use homechain_store::DynCursorStore;
use homechain_types::{Cursor, DecodeError, DomainEvent, LedgerEvent, ObservedEvent, Position};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::ledger::{LedgerClient, LedgerError};
use crate::metrics;
use crate::registry::DeviceRegistry;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Commit tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Pending {
    done: bool,
    /// Tracker epoch the position was delivered in.
    epoch: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Bumped on rewind so acks for positions that will be replayed are ignored.
    epoch: u64,
    /// Delivered positions not yet covered by the cursor.
    pending: BTreeMap<Position, Pending>,
    committed: Option<Position>,
}

/// Advances the persisted cursor to the highest position below which every
/// delivered event has completed.
pub struct CommitTracker {
    store: DynCursorStore,
    state: Mutex<TrackerState>,
}

impl fmt::Debug for CommitTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("CommitTracker")
            .field("committed", &state.committed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl CommitTracker {
    pub fn new(store: DynCursorStore, committed: Option<Cursor>) -> Self {
        Self {
            store,
            state: Mutex::new(TrackerState {
                committed: committed.map(|c| c.position()),
                ..TrackerState::default()
            }),
        }
    }

    /// Register a delivered event whose completion will be signalled via the
    /// returned [`Ack`]. Positions must be tracked in ledger order.
    pub fn track(self: &Arc<Self>, position: Position) -> Ack {
        let mut state = self.lock();
        let epoch = state.epoch;
        state.pending.insert(position, Pending { done: false, epoch });
        Ack {
            tracker: self.clone(),
            position,
            epoch: state.epoch,
        }
    }

    /// Register an event that needs no downstream handling.
    pub fn skip(&self, position: Position) {
        let mut state = self.lock();
        let epoch = state.epoch;
        state.pending.insert(position, Pending { done: true, epoch });
        self.advance(&mut state);
    }

    /// Prepare for a replay of everything after `to`.
    ///
    /// Positions above `to` are forgotten and their outstanding acks become
    /// no-ops. Positions at or below it stay tracked, so the cursor still waits
    /// for them. The persisted cursor only ever moves back here, to `to` when
    /// it was beyond it, and returns the resulting committed position.
    pub fn rewind(&self, to: Option<Position>) -> Option<Position> {
        let mut state = self.lock();
        state.epoch += 1;
        state.pending.retain(|pos, _| Some(*pos) <= to);
        if state.committed > to {
            state.committed = to;
            let res = match to {
                Some(pos) => self.store.save(&Cursor::from(pos)),
                None => self.store.clear(),
            };
            if let Err(err) = res {
                metrics::record_cursor_write_failure();
                tracing::error!(error = %err, "failed to persist rewound cursor");
            }
        }
        state.committed
    }

    pub fn committed(&self) -> Option<Position> {
        self.lock().committed
    }

    /// Delivered events still awaiting completion.
    pub fn in_flight(&self) -> usize {
        self.lock().pending.values().filter(|p| !p.done).count()
    }

    fn complete(&self, position: Position, epoch: u64) {
        let mut state = self.lock();
        match state.pending.get_mut(&position) {
            Some(entry) if entry.epoch == epoch => entry.done = true,
            _ => {
                tracing::debug!(%position, "ignoring ack for a position that is being replayed");
                return;
            }
        }
        self.advance(&mut state);
    }

    // Cursor writes happen under the state lock so they are never reordered.
    fn advance(&self, state: &mut TrackerState) {
        let mut watermark = None;
        while let Some((&pos, entry)) = state.pending.first_key_value() {
            if !entry.done {
                break;
            }
            state.pending.pop_first();
            watermark = Some(pos);
        }
        let Some(pos) = watermark else {
            return;
        };
        state.committed = Some(pos);
        match self.store.save(&Cursor::from(pos)) {
            Ok(()) => metrics::record_cursor(pos.block_height),
            Err(err) => {
                metrics::record_cursor_write_failure();
                tracing::error!(cursor = %pos, error = %err, "failed to persist cursor");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion handle for one delivered event.
///
/// Dropping it without calling [`Ack::complete`] leaves the event uncommitted,
/// so it is replayed after a restart.
#[must_use = "an unacknowledged event is never committed"]
pub struct Ack {
    tracker: Arc<CommitTracker>,
    position: Position,
    epoch: u64,
}

impl Ack {
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn complete(self) {
        self.tracker.complete(self.position, self.epoch);
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("position", &self.position)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A decoded event handed downstream together with its acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    pub event: ObservedEvent,
    pub ack: Ack,
}

/// Ledger-ordered stream of deliveries produced by the ingest task.
pub struct IngestStream {
    rx: mpsc::Receiver<Delivery>,
}

impl Stream for IngestStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub emitter: String,
    pub genesis_height: u64,
    pub page_size: usize,
    pub reconnect: RetryPolicy,
    /// Deliveries buffered between the ingest task and its consumer.
    pub channel_capacity: usize,
}

impl From<&RelayConfig> for IngestConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            emitter: config.emitter.clone(),
            genesis_height: config.genesis_height,
            page_size: config.page_size,
            reconnect: config.reconnect.clone(),
            channel_capacity: config.queue_depth,
        }
    }
}

pub struct Ingestor {
    ledger: Arc<dyn LedgerClient>,
    registry: Arc<DeviceRegistry>,
    tracker: Arc<CommitTracker>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        registry: Arc<DeviceRegistry>,
        tracker: Arc<CommitTracker>,
        config: IngestConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            tracker,
            config,
        }
    }

    /// Spawn the ingest task, resuming after `from` (or before the genesis
    /// block when no cursor exists). The task ends on shutdown or when the
    /// returned stream is dropped.
    pub fn start(
        self,
        from: Option<Cursor>,
        shutdown: broadcast::Receiver<()>,
    ) -> (IngestStream, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let last_delivered = match from {
            Some(cursor) => Some(cursor.position()),
            None => Position::before_block(self.config.genesis_height),
        };
        let task = IngestTask {
            ledger: self.ledger,
            registry: self.registry,
            tracker: self.tracker,
            config: self.config,
            last_delivered,
            tx,
        };
        let handle = tokio::spawn(task.run(shutdown));
        (IngestStream { rx }, handle)
    }
}

enum SessionEnd {
    Ledger(LedgerError),
    /// The live subscription saw the chain reorganize at or below this position.
    Reorganized(Position),
    DownstreamClosed,
}

impl From<LedgerError> for SessionEnd {
    fn from(err: LedgerError) -> Self {
        Self::Ledger(err)
    }
}

struct IngestTask {
    ledger: Arc<dyn LedgerClient>,
    registry: Arc<DeviceRegistry>,
    tracker: Arc<CommitTracker>,
    config: IngestConfig,
    last_delivered: Option<Position>,
    tx: mpsc::Sender<Delivery>,
}

impl IngestTask {
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            emitter = %self.config.emitter,
            resume_after = ?self.last_delivered,
            "ingestor started"
        );
        let mut failures = 0u32;
        loop {
            let end = tokio::select! {
                res = self.follow(&mut failures) => match res {
                    Err(end) => end,
                    Ok(never) => match never {},
                },
                _ = shutdown.recv() => {
                    tracing::info!("ingestor stopping");
                    return;
                }
            };
            match end {
                SessionEnd::DownstreamClosed => {
                    tracing::debug!("delivery channel closed; ingestor exiting");
                    return;
                }
                SessionEnd::Reorganized(at) => {
                    tracing::warn!(
                        %at,
                        last_delivered = ?self.last_delivered,
                        "ledger reorganized under the live subscription; resynchronizing"
                    );
                }
                SessionEnd::Ledger(err) => {
                    failures = failures.saturating_add(1);
                    metrics::record_reconnect();
                    let delay = self.config.reconnect.backoff(failures);
                    tracing::warn!(error = %err, attempt = failures, ?delay, "ledger subscription lost; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            tracing::info!("ingestor stopping");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn follow(&mut self, failures: &mut u32) -> Result<Infallible, SessionEnd> {
        // Subscribe before reading the head so nothing falls between the two.
        let mut live = self.ledger.subscribe().await?;
        let head = self.ledger.head().await?;
        self.catch_up(head).await?;
        if *failures > 0 {
            tracing::info!(after = ?self.last_delivered, "ledger subscription re-established");
        }
        *failures = 0;

        while let Some(item) = live.next().await {
            let event = match item {
                Ok(event) => event,
                Err(LedgerError::PositionPruned(at)) => return Err(SessionEnd::Reorganized(at)),
                Err(err) => return Err(err.into()),
            };
            if Some(event.position) <= self.last_delivered {
                // Above the catch-up head only live events were delivered, and
                // the subscription never repeats a position on a stable chain.
                if event.position.block_height > head {
                    return Err(SessionEnd::Reorganized(event.position));
                }
                tracing::trace!(position = %event.position, "live event already delivered");
                continue;
            }
            self.offer(event).await?;
        }
        Err(LedgerError::Transport("live subscription ended".into()).into())
    }

    async fn catch_up(&mut self, head: u64) -> Result<(), SessionEnd> {
        loop {
            let page = match self
                .ledger
                .events_after(self.last_delivered, head, self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(LedgerError::PositionPruned(pruned)) => {
                    self.rewind(pruned).await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let full = page.len() >= self.config.page_size;
            if !page.is_empty() {
                tracing::debug!(count = page.len(), head, "catch-up page");
            }
            for event in page {
                if Some(event.position) <= self.last_delivered {
                    continue;
                }
                self.offer(event).await?;
            }
            if !full {
                return Ok(());
            }
        }
    }

    async fn rewind(&mut self, pruned: Position) -> Result<(), SessionEnd> {
        let finalized = self.ledger.finalized_height().await?;
        // Never rewind to or past the pruned block itself.
        let target = Some(Position::end_of_block(finalized)).min(Position::before_block(pruned.block_height));
        tracing::warn!(
            %pruned,
            finalized,
            rewind_to = ?target,
            "cursor position reorganized away; replaying from last final block"
        );
        metrics::record_reorg_rewind();
        let committed = self.tracker.rewind(target);
        tracing::debug!(
            committed = ?committed,
            in_flight = self.tracker.in_flight(),
            "cursor rewound"
        );
        self.last_delivered = target;
        Ok(())
    }

    async fn offer(&mut self, raw: LedgerEvent) -> Result<(), SessionEnd> {
        let position = raw.position;
        self.last_delivered = Some(position);
        metrics::record_ingested();

        if !raw.emitter.eq_ignore_ascii_case(&self.config.emitter) {
            tracing::debug!(%position, emitter = %raw.emitter, "skipping event from foreign emitter");
            metrics::record_skipped("foreign_emitter");
            self.tracker.skip(position);
            return Ok(());
        }

        let observed = match ObservedEvent::decode(&raw) {
            Ok(observed) => observed,
            Err(DecodeError::UnknownKind(kind)) => {
                tracing::info!(%position, kind = %kind, "skipping unknown event kind");
                metrics::record_skipped("unknown_kind");
                self.tracker.skip(position);
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(%position, error = %err, "skipping malformed event");
                metrics::record_skipped("decode");
                self.tracker.skip(position);
                return Ok(());
            }
        };

        if let DomainEvent::ApplianceConfigChanged { key } = &observed.event {
            self.registry.invalidate(*key);
        }

        tracing::debug!(%position, kind = observed.event.kind().as_str(), key = %observed.key(), "event ingested");
        let ack = self.tracker.track(position);
        self.tx
            .send(Delivery {
                event: observed,
                ack,
            })
            .await
            .map_err(|_| SessionEnd::DownstreamClosed)
    }
}
