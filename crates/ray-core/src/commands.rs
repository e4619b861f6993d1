use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Trait implemented by each locally executable command.
///
/// Arguments arrive pre-normalized as an ordered list of strings; handlers
/// never see raw JSON.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Path this command will mutate, derived from its arguments.
    /// A backup of the file is captured before the first mutation.
    fn mutation_target(&self, _args: &[String]) -> Option<PathBuf> {
        None
    }

    async fn run(&self, args: &[String]) -> Result<String, CommandError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command '{0}'")]
    Unknown(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Outcome of one command call. Exactly one of `output`/`error` is set,
/// matching the `ok` flag.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandExecutionResult {
    pub command: String,
    pub args: Vec<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandExecutionResult {
    pub fn success(command: impl Into<String>, args: Vec<String>, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ok: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(command: impl Into<String>, args: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ok: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// The populated side, whichever it is.
    pub fn outcome_text(&self) -> &str {
        self.output
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or_default()
    }
}

/// Outcome of a whole batch. `any_executed` is false only when the call
/// list itself was empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchExecutionResult {
    pub any_executed: bool,
    pub results: Vec<CommandExecutionResult>,
}

impl BatchExecutionResult {
    pub fn new(results: Vec<CommandExecutionResult>) -> Self {
        Self {
            any_executed: !results.is_empty(),
            results,
        }
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }
}
