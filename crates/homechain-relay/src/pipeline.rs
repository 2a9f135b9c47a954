//! Per-event processing: resolve, reconcile, publish.

use std::sync::Arc;
use std::time::Instant;

use homechain_types::{DomainEvent, ObservedEvent};

use crate::metrics;
use crate::publisher::{CommandPublisher, PublishReceipt};
use crate::reconciler::Reconciler;
use crate::registry::DeviceRegistry;
use crate::retry::{RetryPolicy, Transient};

/// How one event left the pipeline. Every outcome is terminal: the event is
/// acknowledged afterwards either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Published(PublishReceipt),
    /// Configuration change; the registry entry was already invalidated on ingest.
    ConfigApplied,
    ReconcileFailed,
    PublishFailed,
}

pub struct Pipeline {
    registry: Arc<DeviceRegistry>,
    reconciler: Reconciler,
    publisher: CommandPublisher,
    reconcile_retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        reconciler: Reconciler,
        publisher: CommandPublisher,
        reconcile_retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            reconciler,
            publisher,
            reconcile_retry,
        }
    }

    pub async fn process(&self, observed: &ObservedEvent) -> Outcome {
        let started = Instant::now();
        let key = observed.key();
        let kind = observed.event.kind().as_str();

        if let DomainEvent::ApplianceConfigChanged { .. } = observed.event {
            tracing::debug!(%key, position = %observed.position, "appliance configuration changed");
            return Outcome::ConfigApplied;
        }

        let reconciled = self
            .reconcile_retry
            .run(|attempt| async move {
                let descriptor = self.registry.resolve(key).await?;
                let res = self.reconciler.reconcile(observed, &descriptor).await;
                if let Err(err) = &res {
                    tracing::debug!(%key, attempt, error = %err, "reconcile attempt failed");
                }
                res
            })
            .await;

        let command = match reconciled {
            Ok(done) => done.value,
            Err(failed) => {
                metrics::record_reconcile_failure(kind);
                let permanent = !failed.value.is_transient();
                tracing::error!(
                    %key,
                    position = %observed.position,
                    kind,
                    attempts = failed.attempts,
                    permanent,
                    error = %failed.value,
                    "reconciliation failed; dropping event"
                );
                return Outcome::ReconcileFailed;
            }
        };

        let outcome = match self.publisher.publish(&command).await {
            Ok(receipt) => Outcome::Published(receipt),
            Err(err) => {
                tracing::error!(
                    %key,
                    position = %observed.position,
                    topic = %command.topic(),
                    idempotency_key = %command.idempotency_key,
                    error = %err,
                    "publish failed; dropping command"
                );
                Outcome::PublishFailed
            }
        };
        metrics::record_pipeline_duration(kind, started.elapsed().as_secs_f64());
        outcome
    }
}
