//! Relay daemon: wires ingestion, the worker pool, and shutdown together.

use std::sync::Arc;

use futures::StreamExt;
use homechain_store::DynCursorStore;
use homechain_types::Position;
use tokio::sync::broadcast;

use crate::bus::DeviceBus;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::ingest::{CommitTracker, IngestConfig, Ingestor};
use crate::ledger::LedgerClient;
use crate::pipeline::Pipeline;
use crate::pool::WorkerPool;
use crate::publisher::CommandPublisher;
use crate::reconciler::Reconciler;
use crate::registry::DeviceRegistry;

/// State at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    /// Last persisted position, if any.
    pub committed: Option<Position>,
    /// Workers cut off at the shutdown deadline.
    pub aborted_workers: usize,
}

pub struct Relay {
    config: RelayConfig,
    ledger: Arc<dyn LedgerClient>,
    bus: Arc<dyn DeviceBus>,
    store: DynCursorStore,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        ledger: Arc<dyn LedgerClient>,
        bus: Arc<dyn DeviceBus>,
        store: DynCursorStore,
    ) -> Self {
        Self {
            config,
            ledger,
            bus,
            store,
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped).
    ///
    /// Startup fails fast on invalid configuration, an unreadable cursor, or
    /// an unreachable ledger or bus. Once running, ledger and bus trouble is
    /// retried internally and never ends the run.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<RelaySummary, RelayError> {
        self.config.validate()?;
        let cursor = self.store.load()?;
        let head = self
            .ledger
            .head()
            .await
            .map_err(RelayError::LedgerUnreachable)?;
        self.bus.ready().await.map_err(RelayError::BusUnreachable)?;

        tracing::info!(
            emitter = %self.config.emitter,
            head,
            cursor = ?cursor,
            workers = self.config.workers,
            bus = self.bus.kind(),
            "relay starting"
        );

        let registry = Arc::new(DeviceRegistry::new(self.ledger.clone()));
        let tracker = Arc::new(CommitTracker::new(self.store.clone(), cursor));
        let pipeline = Arc::new(Pipeline::new(
            registry.clone(),
            Reconciler::new(self.ledger.clone()),
            CommandPublisher::new(self.bus.clone(), self.config.publish_retry.clone()),
            self.config.reconcile_retry.clone(),
        ));
        let pool = WorkerPool::spawn(self.config.workers, self.config.queue_depth, pipeline);
        let ingestor = Ingestor::new(
            self.ledger.clone(),
            registry,
            tracker.clone(),
            IngestConfig::from(&self.config),
        );
        let (mut stream, ingest_task) = ingestor.start(cursor, shutdown.resubscribe());

        let mut result = Ok(());
        loop {
            tokio::select! {
                delivery = stream.next() => match delivery {
                    Some(delivery) => {
                        // A full worker queue holds ingestion here; shutdown
                        // still wins, and the dropped delivery stays uncommitted.
                        let dispatched = tokio::select! {
                            res = pool.dispatch(delivery) => res,
                            _ = shutdown.recv() => {
                                tracing::info!("shutdown requested while a worker queue was full");
                                break;
                            }
                        };
                        if let Err(err) = dispatched {
                            tracing::error!(error = %err, "dispatch failed; stopping relay");
                            result = Err(err);
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("ingest stream ended");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("shutdown requested; draining in-flight events");
                    break;
                }
            }
        }

        drop(stream);
        ingest_task.abort();
        if let Err(err) = ingest_task.await {
            if err.is_panic() {
                tracing::error!(error = %err, "ingest task panicked");
            }
        }
        let aborted_workers = pool.shutdown(self.config.shutdown_grace).await;

        let committed = tracker.committed();
        tracing::info!(
            committed = ?committed,
            in_flight = tracker.in_flight(),
            aborted_workers,
            "relay stopped"
        );
        result.map(|()| RelaySummary {
            committed,
            aborted_workers,
        })
    }
}
