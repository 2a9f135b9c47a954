use thiserror::Error;

use crate::bus::BusError;
use crate::ledger::LedgerError;

/// Failures that stop the relay. Everything else is handled inside the
/// pipeline stage that detected it.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cursor store error: {0}")]
    Cursor(#[from] homechain_store::StoreError),
    #[error("ledger unreachable at startup: {0}")]
    LedgerUnreachable(#[source] LedgerError),
    #[error("device bus unreachable at startup: {0}")]
    BusUnreachable(#[source] BusError),
    #[error("worker {0} exited unexpectedly")]
    WorkerExited(usize),
}
