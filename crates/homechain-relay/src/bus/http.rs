use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use super::{BusError, BusMessage, DeviceBus};
use crate::config::BusBridgeConfig;

/// Publishes through a broker's HTTP bridge (`POST <url>/publish`).
#[derive(Clone)]
pub struct HttpBridgeBus {
    client: Client,
    publish_url: Url,
    status_url: Url,
    token: Option<String>,
}

impl HttpBridgeBus {
    pub fn new(config: BusBridgeConfig) -> Result<Self, BusError> {
        let base = config.url.trim_end_matches('/');
        let parse = |path: &str| {
            Url::parse(&format!("{base}/{path}"))
                .map_err(|e| BusError::Transport(format!("invalid bus url '{}': {e}", config.url)))
        };
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BusError::Transport(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            publish_url: parse("publish")?,
            status_url: parse("status")?,
            token: config.token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn check(response: reqwest::Response) -> Result<(), BusError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(BusError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl DeviceBus for HttpBridgeBus {
    fn kind(&self) -> &str {
        "http-bridge"
    }

    async fn ready(&self) -> Result<(), BusError> {
        let response = self
            .authorize(self.client.get(self.status_url.clone()))
            .send()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        check(response).await
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let response = self
            .authorize(self.client.post(self.publish_url.clone()))
            .json(message)
            .send()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        check(response).await
    }
}
