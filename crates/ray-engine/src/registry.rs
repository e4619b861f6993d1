use std::collections::HashMap;
use std::sync::Arc;

use ray_core::CommandHandler;

/// Registry of executable commands, keyed by name.
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Register a command. Re-registering a name replaces the handler.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let name = handler.name().to_string();
        self.commands.insert(name, handler);
    }

    /// Unregister a command by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.commands.remove(name).is_some()
    }

    /// Get a command by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(name).map(Arc::clone)
    }

    /// Check if a command is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// List all command names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total command count.
    pub fn count(&self) -> usize {
        self.commands.len()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
