use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

/// How many file snapshots to keep before evicting the oldest.
pub const MAX_BACKUPS: usize = 50;

/// Pre-mutation snapshots of workspace files, captured once per path on the
/// first mutating command that targets it.
pub struct FileBackupStore {
    entries: Mutex<VecDeque<(PathBuf, String)>>,
    capacity: usize,
}

impl FileBackupStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BACKUPS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Snapshot the current contents of `path` unless one is already held.
    /// A file that does not exist yet is recorded as empty, so a later
    /// restore can distinguish "created by us" from prior content.
    pub async fn capture(&self, path: &Path) {
        if self.contains(path) {
            return;
        }
        let content = tokio::fs::read_to_string(path).await.unwrap_or_default();

        let mut entries = self.entries.lock();
        // Re-check under the lock; a concurrent capture may have won.
        if entries.iter().any(|(p, _)| p == path) {
            return;
        }
        if entries.len() == self.capacity {
            if let Some((evicted, _)) = entries.pop_front() {
                debug!(path = %evicted.display(), "backup evicted, capacity reached");
            }
        }
        entries.push_back((path.to_path_buf(), content));
    }

    /// The snapshot taken for `path`, if any.
    pub fn original(&self, path: &Path) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, content)| content.clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.lock().iter().any(|(p, _)| p == path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for FileBackupStore {
    fn default() -> Self {
        Self::new()
    }
}
