use std::time::Duration;

/// Typed taxonomy for remote channel failures.
///
/// Raw transport errors never reach the UI; every failure is classified
/// here and rendered through `user_message`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("dns lookup failed: {0}")]
    DnsFailure(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("http {status}: {body}")]
    BadStatus { status: u16, body: String },
    #[error("invalid response body: {0}")]
    InvalidBody(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("stop request needs a task id or chat id")]
    MissingStopTarget,
    #[error("network error: {0}")]
    Network(String),
}

impl ChannelError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionRefused(_) => "connection_refused",
            Self::DnsFailure(_) => "dns_failure",
            Self::Timeout(_) => "timeout",
            Self::BadStatus { .. } => "bad_status",
            Self::InvalidBody(_) => "invalid_body",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
            Self::MissingStopTarget => "missing_stop_target",
            Self::Network(_) => "network",
        }
    }

    /// Human-readable message shown in the conversation when delivery fails.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionRefused(_) => {
                "Cannot reach the Ray agent (connection refused). Check that the server is running.".into()
            }
            Self::DnsFailure(_) => {
                "Cannot resolve the Ray agent host. Check the endpoint address.".into()
            }
            Self::Timeout(duration) => {
                format!("The Ray agent did not respond within {}s.", duration.as_secs())
            }
            Self::BadStatus { status, .. } => {
                format!("The Ray agent returned HTTP {status}.")
            }
            Self::InvalidBody(_) => {
                "The Ray agent sent a response that could not be read.".into()
            }
            Self::InvalidEndpoint(endpoint) => {
                format!("The agent endpoint is not a valid URL: {endpoint}")
            }
            Self::MissingStopTarget => {
                "Nothing to cancel yet. No task or chat is active.".into()
            }
            Self::Network(detail) => {
                format!("Network error while contacting the Ray agent: {detail}")
            }
        }
    }
}
