use serde::{Deserialize, Serialize};

use crate::commands::CommandExecutionResult;

/// Events surfaced to the UI layer over the broadcast bus.
/// Wire names are camelCase because the consuming UI is JavaScript.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UiEvent {
    #[serde(rename = "toolStatus")]
    ToolStatus(ToolStatusData),
    #[serde(rename = "rayResponse")]
    RayResponse(RayResponseData),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatusData {
    pub status: BatchStatus,
    pub tools: Vec<String>,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<CommandExecutionResult>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Starting,
    Working,
    Completed,
    Partial,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RayResponseData {
    pub content: String,
    pub is_final: bool,
    pub is_working: bool,
}

impl UiEvent {
    pub fn response(content: impl Into<String>, is_final: bool, is_working: bool) -> Self {
        Self::RayResponse(RayResponseData {
            content: content.into(),
            is_final,
            is_working,
        })
    }

    pub fn batch_starting(tools: Vec<String>) -> Self {
        let total_count = tools.len();
        Self::ToolStatus(ToolStatusData {
            status: BatchStatus::Starting,
            tools,
            total_count,
            current_index: None,
            success_count: None,
            failed_count: None,
            results: None,
        })
    }

    pub fn batch_progress(tools: Vec<String>, current_index: usize) -> Self {
        let total_count = tools.len();
        Self::ToolStatus(ToolStatusData {
            status: BatchStatus::Working,
            tools,
            total_count,
            current_index: Some(current_index),
            success_count: None,
            failed_count: None,
            results: None,
        })
    }

    pub fn batch_complete(tools: Vec<String>, results: &[CommandExecutionResult]) -> Self {
        let total_count = tools.len();
        let success_count = results.iter().filter(|r| r.ok).count();
        let failed_count = results.len() - success_count;
        let status = if failed_count == 0 {
            BatchStatus::Completed
        } else if success_count == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        };
        Self::ToolStatus(ToolStatusData {
            status,
            tools,
            total_count,
            current_index: None,
            success_count: Some(success_count),
            failed_count: Some(failed_count),
            results: Some(results.to_vec()),
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ToolStatus(_) => "toolStatus",
            Self::RayResponse(_) => "rayResponse",
        }
    }
}
