use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use homechain_types::{DeviceCommand, IdempotencyKey};
use thiserror::Error;

use crate::bus::{BusError, BusMessage, DeviceBus, QOS_AT_LEAST_ONCE};
use crate::metrics;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("encode device message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed after {attempts} attempt(s): {source}")]
    Bus {
        attempts: u32,
        #[source]
        source: BusError,
    },
}

/// Transport acknowledgement of a published command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub idempotency_key: IdempotencyKey,
    pub attempts: u32,
}

/// Serializes commands and hands them to the device bus with retries.
pub struct CommandPublisher {
    bus: Arc<dyn DeviceBus>,
    retry: RetryPolicy,
}

impl CommandPublisher {
    pub fn new(bus: Arc<dyn DeviceBus>, retry: RetryPolicy) -> Self {
        Self { bus, retry }
    }

    pub async fn publish(&self, command: &DeviceCommand) -> Result<PublishReceipt, PublishError> {
        let message = BusMessage {
            topic: command.topic(),
            payload: serde_json::to_string(&command.to_message(now_unix_ms()))?,
            qos: QOS_AT_LEAST_ONCE,
            retain: true,
        };
        let room_id = command.room_id;
        let key = &command.idempotency_key;

        let result = self
            .retry
            .run(|attempt| {
                let message = &message;
                async move {
                    metrics::record_publish_attempt(room_id);
                    tracing::debug!(
                        bus = self.bus.kind(),
                        topic = %message.topic,
                        idempotency_key = %key,
                        attempt,
                        "publishing command"
                    );
                    let res = self.bus.publish(message).await;
                    if let Err(err) = &res {
                        tracing::warn!(topic = %message.topic, idempotency_key = %key, attempt, error = %err, "publish attempt failed");
                    }
                    res
                }
            })
            .await;

        match result {
            Ok(done) => {
                metrics::record_publish_success(room_id);
                tracing::info!(
                    topic = %message.topic,
                    pin = command.pin,
                    idempotency_key = %key,
                    origin_block_height = command.origin_block_height,
                    attempts = done.attempts,
                    "command published"
                );
                Ok(PublishReceipt {
                    topic: message.topic,
                    idempotency_key: key.clone(),
                    attempts: done.attempts,
                })
            }
            Err(failed) => {
                metrics::record_publish_failure(room_id);
                Err(PublishError::Bus {
                    attempts: failed.attempts,
                    source: failed.value,
                })
            }
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
