use async_trait::async_trait;

use super::{BusError, BusMessage, DeviceBus};

/// Dry-run bus that logs each message instead of publishing it.
#[derive(Debug, Default, Clone)]
pub struct LogBus;

#[async_trait]
impl DeviceBus for LogBus {
    fn kind(&self) -> &str {
        "log"
    }

    async fn ready(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        tracing::info!(
            topic = %message.topic,
            retain = message.retain,
            payload = %message.payload,
            "dry-run publish"
        );
        Ok(())
    }
}
