use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use homechain_types::{ApplianceConfig, ApplianceKey, LedgerEvent, Position};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{EventStream, LedgerClient, LedgerError};
use crate::config::LedgerRpcConfig;

/// JSON-RPC error code for an `after` position removed by a reorganization.
pub const ERR_POSITION_PRUNED: i64 = -32001;
/// JSON-RPC error code for reads of an appliance that does not exist.
pub const ERR_NOT_FOUND: i64 = -32004;
/// JSON-RPC internal error.
pub const ERR_INTERNAL: i64 = -32603;

/// Whether an error code reports a server-side fault that may clear on retry:
/// an internal error, or the implementation-defined server range (overload,
/// rate limiting) apart from the codes with a typed meaning.
pub fn is_server_fault(code: i64) -> bool {
    code == ERR_INTERNAL
        || ((-32099..=-32000).contains(&code) && code != ERR_POSITION_PRUNED && code != ERR_NOT_FOUND)
}

/// Ledger client speaking JSON-RPC 2.0 over HTTP to a ledger gateway.
///
/// The live subscription polls `ledger_getEvents` at the configured interval.
#[derive(Clone)]
pub struct RpcLedgerClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    url: Url,
    emitter: String,
    config: LedgerRpcConfig,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockRef {
    block_height: u64,
}

impl RpcLedgerClient {
    pub fn new(config: LedgerRpcConfig, emitter: impl Into<String>) -> Result<Self, LedgerError> {
        let url = Url::parse(&config.url)
            .map_err(|e| LedgerError::Transport(format!("invalid ledger url '{}': {e}", config.url)))?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LedgerError::Transport(format!("build http client: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url,
                emitter: emitter.into(),
                config,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .inner
            .client
            .post(self.inner.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(format!("{method}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Transport(format!("{method}: http status {status}")));
        }
        let envelope: RpcResponse<R> = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))?;
        if let Some(err) = envelope.error {
            return Err(LedgerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        envelope
            .result
            .ok_or_else(|| LedgerError::Decode(format!("{method}: response has no result")))
    }

    async fn read<R: DeserializeOwned>(&self, method: &str, key: ApplianceKey) -> Result<R, LedgerError> {
        let params = json!({
            "emitter": self.inner.emitter,
            "method": method,
            "roomId": key.room_id,
            "applianceId": key.appliance_id,
        });
        self.call("ledger_call", params)
            .await
            .map_err(|err| match err {
                LedgerError::Rpc { code, .. } if code == ERR_NOT_FOUND => LedgerError::NotFound(key),
                other => other,
            })
    }
}

struct PollState {
    client: RpcLedgerClient,
    /// Last event handed out, or the end of the head block at subscribe time.
    /// The server rejects it as pruned once it is reorganized away.
    after: Position,
    /// Highest block fully scanned.
    scanned: u64,
    buffer: VecDeque<LedgerEvent>,
    failed: bool,
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn head(&self) -> Result<u64, LedgerError> {
        let head: BlockRef = self.call("ledger_head", json!([])).await?;
        Ok(head.block_height)
    }

    async fn finalized_height(&self) -> Result<u64, LedgerError> {
        let finalized: BlockRef = self.call("ledger_finalized", json!([])).await?;
        Ok(finalized.block_height)
    }

    async fn events_after(
        &self,
        after: Option<Position>,
        to_height: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let params = json!({
            "emitter": self.inner.emitter,
            "after": after,
            "toBlock": to_height,
            "limit": limit,
        });
        self.call("ledger_getEvents", params)
            .await
            .map_err(|err| match err {
                LedgerError::Rpc { code, .. } if code == ERR_POSITION_PRUNED => {
                    LedgerError::PositionPruned(after.unwrap_or_default())
                }
                other => other,
            })
    }

    async fn subscribe(&self) -> Result<EventStream, LedgerError> {
        let head = self.head().await?;
        let state = PollState {
            client: self.clone(),
            after: Position::end_of_block(head),
            scanned: head,
            buffer: VecDeque::new(),
            failed: false,
        };
        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                if st.failed {
                    return None;
                }
                if let Some(event) = st.buffer.pop_front() {
                    return Some((Ok(event), st));
                }
                tokio::time::sleep(st.client.inner.config.poll_interval).await;
                let head = match st.client.head().await {
                    Ok(head) => head,
                    Err(err) => {
                        st.failed = true;
                        return Some((Err(err), st));
                    }
                };
                if head < st.scanned {
                    tracing::debug!(head, scanned = st.scanned, "ledger head moved backwards");
                    st.failed = true;
                    let dropped = Position::new(head + 1, 0);
                    return Some((Err(LedgerError::PositionPruned(dropped)), st));
                }
                if head == st.scanned {
                    continue;
                }
                let limit = st.client.inner.config.page_size;
                match st.client.events_after(Some(st.after), head, limit).await {
                    Ok(events) => {
                        if events.len() < limit {
                            st.scanned = head;
                        }
                        if let Some(last) = events.last() {
                            st.after = last.position;
                        }
                        st.buffer.extend(events);
                    }
                    Err(err) => {
                        st.failed = true;
                        return Some((Err(err), st));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn switch_state(&self, key: ApplianceKey) -> Result<bool, LedgerError> {
        self.read("switchState", key).await
    }

    async fn multi_state(&self, key: ApplianceKey) -> Result<Vec<u32>, LedgerError> {
        self.read("multiState", key).await
    }

    async fn appliance_config(&self, key: ApplianceKey) -> Result<ApplianceConfig, LedgerError> {
        self.read("applianceConfig", key).await
    }
}
