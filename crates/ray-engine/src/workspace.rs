use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use ray_core::{CommandError, CommandHandler};

use crate::registry::CommandRegistry;

/// Registry preloaded with the built-in filesystem commands, all confined
/// to `root`.
pub fn default_registry(root: &Path) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register(Arc::new(ReadFileCommand {
        root: root.to_path_buf(),
    }));
    registry.register(Arc::new(WriteFileCommand {
        root: root.to_path_buf(),
    }));
    registry.register(Arc::new(ListFilesCommand {
        root: root.to_path_buf(),
    }));
    registry
}

/// Join `raw` onto the root, rejecting anything that could land outside it.
fn resolve_path(root: &Path, raw: &str) -> Result<PathBuf, CommandError> {
    let path = Path::new(raw);
    if path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CommandError::InvalidArguments(format!(
            "path escapes the workspace root: {raw}"
        )));
    }
    Ok(root.join(path))
}

pub struct ReadFileCommand {
    root: PathBuf,
}

#[async_trait]
impl CommandHandler for ReadFileCommand {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file inside the workspace"
    }

    async fn run(&self, args: &[String]) -> Result<String, CommandError> {
        let raw = args
            .first()
            .ok_or_else(|| CommandError::InvalidArguments("path is required".into()))?;
        let path = resolve_path(&self.root, raw)?;

        tokio::fs::read_to_string(&path).await.map_err(|e| {
            CommandError::ExecutionFailed(format!("Failed to read {}: {e}", path.display()))
        })
    }
}

pub struct WriteFileCommand {
    root: PathBuf,
}

#[async_trait]
impl CommandHandler for WriteFileCommand {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the workspace"
    }

    fn mutation_target(&self, args: &[String]) -> Option<PathBuf> {
        let raw = args.first()?;
        resolve_path(&self.root, raw).ok()
    }

    async fn run(&self, args: &[String]) -> Result<String, CommandError> {
        let raw = args
            .first()
            .ok_or_else(|| CommandError::InvalidArguments("path is required".into()))?;
        let content = args
            .get(1)
            .ok_or_else(|| CommandError::InvalidArguments("content is required".into()))?;
        let path = resolve_path(&self.root, raw)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CommandError::ExecutionFailed(format!("Failed to create directory: {e}"))
            })?;
        }

        tokio::fs::write(&path, content).await.map_err(|e| {
            CommandError::ExecutionFailed(format!("Failed to write {}: {e}", path.display()))
        })?;

        let line_count = content.lines().count();
        Ok(format!(
            "Wrote {} bytes ({} lines) to {}",
            content.len(),
            line_count,
            path.display()
        ))
    }
}

pub struct ListFilesCommand {
    root: PathBuf,
}

#[async_trait]
impl CommandHandler for ListFilesCommand {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List directory entries inside the workspace"
    }

    async fn run(&self, args: &[String]) -> Result<String, CommandError> {
        let raw = args.first().map(String::as_str).unwrap_or(".");
        let path = resolve_path(&self.root, raw)?;

        let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| {
            CommandError::ExecutionFailed(format!("Failed to list {}: {e}", path.display()))
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| {
            CommandError::ExecutionFailed(format!("Failed to list {}: {e}", path.display()))
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }

        if entries.is_empty() {
            return Ok("(empty directory)".into());
        }
        entries.sort();
        Ok(entries.join("\n"))
    }
}
