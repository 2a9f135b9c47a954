//! Publish side of the device bus.

mod http;
mod log;

pub use self::http::HttpBridgeBus;
pub use self::log::LogBus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Transient;

/// At-least-once delivery.
pub const QOS_AT_LEAST_ONCE: u8 = 1;

/// One message handed to the device bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    /// Keep the last value available to late subscribers.
    pub retain: bool,
}

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("device bus transport error: {0}")]
    Transport(String),
    #[error("device bus rejected publish with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl Transient for BusError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

#[async_trait]
pub trait DeviceBus: Send + Sync {
    /// Short name used in logs.
    fn kind(&self) -> &str;

    /// Fails when the bus cannot be reached at all.
    async fn ready(&self) -> Result<(), BusError>;

    /// Returns once the transport acknowledged the message.
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError>;
}
