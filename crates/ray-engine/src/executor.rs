use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, instrument, warn};

use ray_core::{BatchExecutionResult, CommandCall, CommandError, CommandExecutionResult};

use crate::backups::FileBackupStore;
use crate::registry::CommandRegistry;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Normalize the lenient `args` payload into positional strings.
///
/// Null means no arguments. Arrays convert element-wise; non-string elements
/// keep their JSON text so structured arguments survive. A bare scalar or
/// object becomes a single argument.
pub fn normalize_args(args: &Value) -> Vec<String> {
    match args {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(stringify_arg).collect(),
        other => vec![stringify_arg(other)],
    }
}

fn stringify_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs commands from the registry with per-call timeout and panic
/// isolation. One failing call never takes down the batch.
pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
    backups: Arc<FileBackupStore>,
    command_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(registry: Arc<CommandRegistry>, backups: Arc<FileBackupStore>) -> Self {
        Self {
            registry,
            backups,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn backups(&self) -> &FileBackupStore {
        &self.backups
    }

    /// Execute a single command call. Never errors: unknown names, handler
    /// failures, panics, and timeouts all land in the result's error field.
    #[instrument(skip(self, call), fields(command = %call.command))]
    pub async fn execute_one(&self, call: &CommandCall) -> CommandExecutionResult {
        let args = normalize_args(&call.args);

        let Some(handler) = self.registry.get(&call.command) else {
            return CommandExecutionResult::failure(
                &call.command,
                args,
                CommandError::Unknown(call.command.clone()).to_string(),
            );
        };

        // Snapshot the target before the handler can touch it.
        if let Some(target) = handler.mutation_target(&args) {
            self.backups.capture(&target).await;
        }

        let result = tokio::time::timeout(
            self.command_timeout,
            std::panic::AssertUnwindSafe(handler.run(&args)).catch_unwind(),
        )
        .await;

        match result {
            Ok(Ok(Ok(output))) => CommandExecutionResult::success(&call.command, args, output),
            Ok(Ok(Err(e))) => CommandExecutionResult::failure(&call.command, args, e.to_string()),
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(
                    command = %call.command,
                    panic = %msg,
                    "command panicked during execution"
                );
                CommandExecutionResult::failure(
                    &call.command,
                    args,
                    "Internal error: command crashed",
                )
            }
            Err(_) => {
                warn!(
                    command = %call.command,
                    timeout_secs = self.command_timeout.as_secs(),
                    "command timed out"
                );
                CommandExecutionResult::failure(
                    &call.command,
                    args,
                    CommandError::Timeout(self.command_timeout).to_string(),
                )
            }
        }
    }

    /// Execute calls strictly in order. With `stop_on_error`, the batch
    /// halts at the first failure; that failure is included and trailing
    /// calls are absent from the results.
    pub async fn execute_batch(
        &self,
        calls: &[CommandCall],
        stop_on_error: bool,
    ) -> BatchExecutionResult {
        self.execute_batch_with(calls, stop_on_error, |_, _| {}).await
    }

    /// Like [`execute_batch`](Self::execute_batch), invoking `on_step`
    /// before each call so callers can surface progress.
    pub async fn execute_batch_with(
        &self,
        calls: &[CommandCall],
        stop_on_error: bool,
        mut on_step: impl FnMut(usize, &CommandCall),
    ) -> BatchExecutionResult {
        let mut results = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().enumerate() {
            on_step(index, call);
            let result = self.execute_one(call).await;
            let failed = !result.ok;
            results.push(result);
            if stop_on_error && failed {
                warn!(command = %call.command, index, "batch halted on first failure");
                break;
            }
        }
        BatchExecutionResult::new(results)
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
