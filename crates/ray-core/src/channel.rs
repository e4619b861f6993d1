use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ChannelError;
use crate::session::{ChatId, TaskId};
use crate::turn::OutboundTurn;

/// Outbound half of the remote channel.
///
/// The orchestrator receives an implementation at construction time; tests
/// drive it with a scripted in-memory channel instead of HTTP.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Deliver one turn and return the raw response body. An empty or
    /// unparseable-but-2xx body comes back as `Value::Null` so the caller
    /// can treat it as "reply will arrive over the webhook".
    async fn send_turn(&self, turn: &OutboundTurn) -> Result<Value, ChannelError>;

    /// Best-effort cancellation of the active remote task.
    async fn request_stop(&self, request: StopRequest) -> Result<StopAck, ChannelError>;
}

/// Body for the stop endpoint. At least one id is required; the remote
/// rejects an empty request with HTTP 400, so construction enforces it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct StopRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
}

impl StopRequest {
    pub fn new(task_id: Option<TaskId>, chat_id: Option<ChatId>) -> Result<Self, ChannelError> {
        if task_id.is_none() && chat_id.is_none() {
            return Err(ChannelError::MissingStopTarget);
        }
        Ok(Self { task_id, chat_id })
    }

    pub fn task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            chat_id: None,
        }
    }

    pub fn chat(chat_id: ChatId) -> Self {
        Self {
            task_id: None,
            chat_id: Some(chat_id),
        }
    }
}

/// Remote acknowledgement of a stop request.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StopAck {
    pub status: String,
    pub cancelled: bool,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub chat_id: Option<ChatId>,
}
