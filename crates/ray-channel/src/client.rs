use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::instrument;

use ray_core::{ChannelError, OutboundTurn, RemoteChannel, StopAck, StopRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_PATH: &str = "/api/agent/stop";
const USER_AGENT: &str = concat!("ray/", env!("CARGO_PKG_VERSION"));

/// Endpoints and timeouts for the HTTP channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub endpoint: Url,
    pub stop_endpoint: Url,
    pub request_timeout: Duration,
}

impl ChannelConfig {
    /// Parse the message endpoint and derive the stop endpoint from it
    /// unless one is given explicitly.
    pub fn new(endpoint: &str, stop_endpoint: Option<&str>) -> Result<Self, ChannelError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ChannelError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        let stop_endpoint = match stop_endpoint {
            Some(raw) => Url::parse(raw)
                .map_err(|e| ChannelError::InvalidEndpoint(format!("{raw}: {e}")))?,
            None => endpoint
                .join(STOP_PATH)
                .map_err(|e| ChannelError::InvalidEndpoint(format!("{STOP_PATH}: {e}")))?,
        };
        Ok(Self {
            endpoint,
            stop_endpoint,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// HTTP implementation of [`RemoteChannel`] backed by reqwest.
pub struct HttpRemoteChannel {
    client: Client,
    config: ChannelConfig,
}

impl HttpRemoteChannel {
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChannelError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }
}

#[async_trait]
impl RemoteChannel for HttpRemoteChannel {
    #[instrument(skip(self, turn), fields(endpoint = %self.config.endpoint))]
    async fn send_turn(&self, turn: &OutboundTurn) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.config.endpoint.clone())
            .json(turn)
            .send()
            .await
            .map_err(|e| classify_send_error(e, self.config.request_timeout))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        // Some deployments reply with an empty ack body and deliver the
        // actual turn over the webhook later.
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ChannelError::InvalidBody(e.to_string()))
    }

    #[instrument(skip(self, request), fields(endpoint = %self.config.stop_endpoint))]
    async fn request_stop(&self, request: StopRequest) -> Result<StopAck, ChannelError> {
        let resp = self
            .client
            .post(self.config.stop_endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_send_error(e, self.config.request_timeout))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| ChannelError::InvalidBody(e.to_string()))
    }
}

/// Sort a reqwest transport failure into the channel error taxonomy.
fn classify_send_error(error: reqwest::Error, timeout: Duration) -> ChannelError {
    if error.is_timeout() {
        return ChannelError::Timeout(timeout);
    }
    if error.is_connect() {
        let detail = source_chain(&error);
        let lowered = detail.to_lowercase();
        if lowered.contains("dns") || lowered.contains("resolve") {
            return ChannelError::DnsFailure(detail);
        }
        return ChannelError::ConnectionRefused(detail);
    }
    ChannelError::Network(error.to_string())
}

/// Flatten an error and its sources into one line. reqwest's top-level
/// Display hides the cause that distinguishes DNS from refused sockets.
fn source_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
