use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// How many payload fingerprints to remember before evicting the oldest.
pub const DEDUP_CAPACITY: usize = 100;

/// Hex SHA-256 over the canonical serialization of a payload. serde_json
/// keeps object keys sorted, so two payloads that differ only in key order
/// hash the same.
pub fn payload_fingerprint(payload: &Value) -> String {
    let digest = Sha256::digest(payload.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Bounded set of recently seen fingerprints, oldest evicted first.
pub struct FingerprintSet {
    seen: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl FingerprintSet {
    pub fn new() -> Self {
        Self::with_capacity(DEDUP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record a fingerprint. Returns false if it was already present.
    pub fn insert(&self, fingerprint: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.iter().any(|f| f == fingerprint) {
            return false;
        }
        if seen.len() == self.capacity {
            seen.pop_front();
        }
        seen.push_back(fingerprint.to_string());
        true
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.lock().iter().any(|f| f == fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

impl Default for FingerprintSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-flight guard around batch execution. Acquiring while held fails
/// instead of queueing.
pub struct ExecutionGuard {
    busy: AtomicBool,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    /// Try to take the guard. None means a batch is already running.
    pub fn try_acquire(&self) -> Option<ExecutionPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExecutionPermit { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Default for ExecutionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while a batch runs. Release explicitly before follow-up sends so a
/// reply arriving mid-send is not dropped as busy; Drop covers early exits.
pub struct ExecutionPermit<'a> {
    guard: &'a ExecutionGuard,
}

impl ExecutionPermit<'_> {
    pub fn release(self) {
        // Drop does the store.
    }
}

impl Drop for ExecutionPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}
