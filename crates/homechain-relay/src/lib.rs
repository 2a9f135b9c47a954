//! Ledger-to-actuator relay: ingests ledger events, reconciles them against
//! authoritative ledger reads, and publishes idempotent device commands.

pub mod bus;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod publisher;
pub mod reconciler;
pub mod registry;
pub mod relay;
pub mod retry;

pub mod testkit;

pub use bus::{BusError, BusMessage, DeviceBus, HttpBridgeBus, LogBus};
pub use config::{BusBridgeConfig, LedgerRpcConfig, RelayConfig};
pub use error::RelayError;
pub use ingest::{Ack, CommitTracker, Delivery, IngestConfig, IngestStream, Ingestor};
pub use ledger::{EventStream, LedgerClient, LedgerError, RpcLedgerClient};
pub use pipeline::{Outcome, Pipeline};
pub use pool::WorkerPool;
pub use publisher::{CommandPublisher, PublishError, PublishReceipt};
pub use reconciler::{ReconcileError, Reconciler};
pub use registry::DeviceRegistry;
pub use relay::{Relay, RelaySummary};
pub use retry::{Attempted, RetryPolicy, Transient};
