use std::time::Duration;

use crate::error::RelayError;
use crate::retry::RetryPolicy;

/// Largest worker pool the relay will start.
pub const MAX_WORKERS: usize = 64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Ledger identity whose events are relayed; others are skipped.
    pub emitter: String,
    /// Block to start from when no cursor has been persisted.
    pub genesis_height: u64,
    /// Number of pipeline workers; events for one appliance always share a worker.
    pub workers: usize,
    /// Bounded queue depth per worker.
    pub queue_depth: usize,
    /// Maximum events fetched per catch-up request.
    pub page_size: usize,
    /// How long in-flight work may drain after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Backoff between ledger reconnects (unbounded).
    pub reconnect: RetryPolicy,
    /// Retries of the resolve/reconcile stage before an event is dropped.
    pub reconcile_retry: RetryPolicy,
    /// Retries of a bus publish before a command is dropped.
    pub publish_retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            emitter: String::new(),
            genesis_height: 0,
            workers: 4,
            queue_depth: 64,
            page_size: 500,
            shutdown_grace: Duration::from_secs(10),
            reconnect: RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(30)),
            reconcile_retry: RetryPolicy::bounded(
                5,
                Duration::from_millis(250),
                Duration::from_secs(10),
            ),
            publish_retry: RetryPolicy::bounded(3, Duration::from_millis(200), Duration::from_secs(5)),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.emitter.trim().is_empty() {
            return Err(RelayError::Config("emitter identity must be set".into()));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(RelayError::Config(format!(
                "workers must be within 1..={MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.queue_depth == 0 {
            return Err(RelayError::Config("queue_depth must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(RelayError::Config("page_size must be at least 1".into()));
        }
        if self.reconnect.max_attempts.is_some() {
            return Err(RelayError::Config(
                "reconnect policy must retry without limit".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the JSON-RPC ledger client.
#[derive(Debug, Clone)]
pub struct LedgerRpcConfig {
    pub url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Interval between polls of the live subscription.
    pub poll_interval: Duration,
    /// Maximum events requested per poll.
    pub page_size: usize,
}

impl Default for LedgerRpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".into(),
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            page_size: 500,
        }
    }
}

/// Configuration for the device bus HTTP publish bridge.
#[derive(Debug, Clone)]
pub struct BusBridgeConfig {
    pub url: String,
    /// Bearer token for the bridge, if it requires one.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for BusBridgeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18083".into(),
            token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayConfig {
        RelayConfig {
            emitter: "0xhome".into(),
            ..RelayConfig::default()
        }
    }

    #[test]
    fn default_with_emitter_is_valid() {
        valid().validate().unwrap();
    }

    #[test]
    fn rejects_missing_emitter_and_bad_pool_sizes() {
        assert!(RelayConfig::default().validate().is_err());
        assert!(RelayConfig { workers: 0, ..valid() }.validate().is_err());
        assert!(RelayConfig { workers: MAX_WORKERS + 1, ..valid() }.validate().is_err());
        assert!(RelayConfig { queue_depth: 0, ..valid() }.validate().is_err());
    }

    #[test]
    fn reconnect_must_be_unbounded() {
        let config = RelayConfig {
            reconnect: RetryPolicy::default(),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }
}
