//! Fixed-size worker pool sharded by appliance.
//!
//! Every delivery for a given appliance lands on the same worker, so events
//! for one appliance are processed strictly in ledger order while distinct
//! appliances proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use homechain_types::ApplianceKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RelayError;
use crate::ingest::Delivery;
use crate::metrics;
use crate::pipeline::Pipeline;

/// Worker index owning `key` in a pool of `workers`.
pub fn shard_for(key: ApplianceKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Delivery>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, queue_depth: usize, pipeline: Arc<Pipeline>) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(worker_loop(index, rx, pipeline.clone())));
        }
        tracing::info!(workers, queue_depth, "worker pool started");
        Self { senders, handles }
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    /// Queue a delivery on its appliance's worker, waiting while that queue is full.
    ///
    /// The wait is the pool's backpressure: ingestion pauses until the busy
    /// worker frees a slot, which bounds memory at `workers * queue_depth`.
    pub async fn dispatch(&self, delivery: Delivery) -> Result<(), RelayError> {
        let index = shard_for(delivery.event.key(), self.senders.len());
        let sender = &self.senders[index];
        let delivery = match sender.try_send(delivery) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(RelayError::WorkerExited(index)),
            Err(mpsc::error::TrySendError::Full(delivery)) => delivery,
        };
        tracing::debug!(
            worker = index,
            position = %delivery.ack.position(),
            "worker queue full; ingestion waiting"
        );
        metrics::record_queue_full(index);
        sender
            .send(delivery)
            .await
            .map_err(|_| RelayError::WorkerExited(index))
    }

    /// Stop accepting work and let workers drain their queues for up to
    /// `grace`. Returns the number of workers aborted at the deadline; their
    /// unfinished events stay uncommitted.
    pub async fn shutdown(self, grace: Duration) -> usize {
        drop(self.senders);
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for (index, mut handle) in self.handles.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(worker = index, error = %err, "worker task failed"),
                Err(_) => {
                    tracing::warn!(worker = index, "worker did not drain before deadline; aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

async fn worker_loop(index: usize, mut rx: mpsc::Receiver<Delivery>, pipeline: Arc<Pipeline>) {
    while let Some(Delivery { event, ack }) = rx.recv().await {
        pipeline.process(&event).await;
        ack.complete();
    }
    tracing::debug!(worker = index, "worker drained");
}
