//! Read and subscribe access to the external ledger.

mod rpc;

pub use rpc::{ERR_INTERNAL, ERR_NOT_FOUND, ERR_POSITION_PRUNED, RpcLedgerClient, is_server_fault};

use async_trait::async_trait;
use futures::stream::BoxStream;
use homechain_types::{ApplianceConfig, ApplianceKey, LedgerEvent, Position};
use thiserror::Error;

use crate::retry::Transient;

/// Live, pull-based sequence of ledger events. An `Err` item or the end of the
/// stream means the subscription is gone and must be re-established.
pub type EventStream = BoxStream<'static, Result<LedgerEvent, LedgerError>>;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("position {0} is no longer on the canonical chain")]
    PositionPruned(Position),
    #[error("{0} does not exist on the ledger")]
    NotFound(ApplianceKey),
    #[error("unexpected ledger response: {0}")]
    Decode(String),
}

impl Transient for LedgerError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rpc { code, .. } => is_server_fault(*code),
            Self::PositionPruned(_) | Self::NotFound(_) | Self::Decode(_) => false,
        }
    }
}

/// Authoritative, side-effect-free ledger access.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Height of the newest block.
    async fn head(&self) -> Result<u64, LedgerError>;

    /// Height of the newest block that can no longer be reorganized away.
    async fn finalized_height(&self) -> Result<u64, LedgerError>;

    /// Events strictly after `after` (from the start of the chain when `None`)
    /// up to and including block `to_height`, in ledger order, at most `limit`.
    ///
    /// Fails with [`LedgerError::PositionPruned`] when `after` no longer exists.
    async fn events_after(
        &self,
        after: Option<Position>,
        to_height: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, LedgerError>;

    /// Events appended after the subscription is established.
    async fn subscribe(&self) -> Result<EventStream, LedgerError>;

    /// Current on/off state of a binary appliance.
    async fn switch_state(&self, key: ApplianceKey) -> Result<bool, LedgerError>;

    /// Current value vector of a multi-value appliance.
    async fn multi_state(&self, key: ApplianceKey) -> Result<Vec<u32>, LedgerError>;

    /// Current pin assignment.
    async fn appliance_config(&self, key: ApplianceKey) -> Result<ApplianceConfig, LedgerError>;
}
