use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commands::CommandExecutionResult;
use crate::session::{ChatId, ProjectId, SessionContext, TaskId, UserId};

/// Fields the agent uses to say "still thinking", in either spelling.
const IN_PROGRESS_LABELS: [&str; 2] = ["working", "start working"];

/// Content can hide under any of these keys, first match wins.
const CONTENT_KEYS: [&str; 4] = ["message", "content", "response", "text"];

/// One inbound turn from the remote agent.
///
/// The wire shape is loose: the agent has been observed sending content
/// under several keys and booleans as strings, so parsing is lenient and
/// total. Anything unrecognizable becomes an empty turn and is dropped
/// downstream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentTurn {
    pub content: Option<String>,
    pub status: Option<TurnStatus>,
    pub command_calls: Vec<CommandCall>,
    pub task_id: Option<TaskId>,
    pub chat_id: Option<ChatId>,
    pub is_final: Option<bool>,
}

impl AgentTurn {
    pub fn from_value(value: &Value) -> Self {
        let content = CONTENT_KEYS
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::to_string);

        let status = value
            .get("status")
            .and_then(Value::as_str)
            .map(TurnStatus::parse);

        let command_calls = value
            .get("command_calls")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<CommandCall>(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let task_id = value
            .get("task_id")
            .and_then(Value::as_str)
            .map(TaskId::from_raw);
        let chat_id = value
            .get("chat_id")
            .and_then(Value::as_str)
            .map(ChatId::from_raw);

        let is_final = match value.get("is_final") {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        };

        Self {
            content,
            status,
            command_calls,
            task_id,
            chat_id,
            is_final,
        }
    }

    pub fn has_command_calls(&self) -> bool {
        !self.command_calls.is_empty()
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.as_ref().is_some_and(TurnStatus::is_in_progress)
    }
}

/// Progress marker on an inbound turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnStatus {
    Working,
    StartWorking,
    Other(String),
}

impl TurnStatus {
    pub fn parse(label: &str) -> Self {
        match label {
            "working" => Self::Working,
            "start working" => Self::StartWorking,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Working | Self::StartWorking)
    }

    pub fn as_label(&self) -> &str {
        match self {
            Self::Working => IN_PROGRESS_LABELS[0],
            Self::StartWorking => IN_PROGRESS_LABELS[1],
            Self::Other(label) => label,
        }
    }
}

/// A request to run one local command. `args` stays raw JSON until the
/// executor normalizes it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandCall {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

impl CommandCall {
    pub fn new(command: impl Into<String>, args: Value) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

/// One command result in the shape the remote agent expects back.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResultPayload {
    pub command: String,
    pub status: ResultStatus,
    pub output: String,
    pub args: Vec<String>,
}

impl CommandResultPayload {
    pub fn from_result(result: &CommandExecutionResult) -> Self {
        Self {
            command: result.command.clone(),
            status: if result.ok {
                ResultStatus::Success
            } else {
                ResultStatus::Error
            },
            output: result.outcome_text().to_string(),
            args: result.args.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Body POSTed to the remote agent. `model` is always present on the wire,
/// null unless a label was configured.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct OutboundTurn {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_results: Option<Vec<CommandResultPayload>>,
    pub model: Option<String>,
    pub project_id: ProjectId,
    pub chat_id: ChatId,
    pub user_id: UserId,
}

impl OutboundTurn {
    pub fn user_message(
        text: impl Into<String>,
        session: &SessionContext,
        model: Option<String>,
    ) -> Self {
        Self {
            message: text.into(),
            command_results: None,
            model,
            project_id: session.project_id.clone(),
            chat_id: session.chat_id.clone(),
            user_id: session.user_id.clone(),
        }
    }

    pub fn results_message(
        original: impl Into<String>,
        results: Vec<CommandResultPayload>,
        session: &SessionContext,
        model: Option<String>,
    ) -> Self {
        Self {
            message: original.into(),
            command_results: Some(results),
            model,
            project_id: session.project_id.clone(),
            chat_id: session.chat_id.clone(),
            user_id: session.user_id.clone(),
        }
    }
}
