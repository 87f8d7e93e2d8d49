// Background Task Registry
// Tracks executions that keep running after the user's attention moves to a
// different task.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// A task whose stream keeps running without UI attention.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub task_id: String,
    pub session_id: Option<String>,
    /// Cancellation handle for the in-flight stream. Handed off here instead
    /// of being cancelled when the user switches away.
    pub cancel: CancellationToken,
    pub is_running: bool,
    pub prompt: String,
}

/// Change notification pushed to subscribers after every mutation.
#[derive(Debug, Clone)]
pub struct RegistryChange {
    pub task_id: String,
    pub kind: RegistryChangeKind,
    /// Number of entries still running, for badge-style UI counters.
    pub running: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChangeKind {
    Added,
    Updated,
    Removed,
}

/// Registry of backgrounded executions. At most one entry per task id; the
/// last write wins. Subscribers are notified synchronously after every
/// mutation.
pub struct BackgroundTaskRegistry {
    entries: RwLock<HashMap<String, BackgroundTask>>,
    tx: broadcast::Sender<RegistryChange>,
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(HashMap::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.tx.subscribe()
    }

    pub fn add(&self, entry: BackgroundTask) {
        let task_id = entry.task_id.clone();
        {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            entries.insert(task_id.clone(), entry);
        }
        self.notify(task_id, RegistryChangeKind::Added);
    }

    pub fn get(&self, task_id: &str) -> Option<BackgroundTask> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<BackgroundTask> {
        let removed = {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            entries.remove(task_id)
        };
        if removed.is_some() {
            self.notify(task_id.to_string(), RegistryChangeKind::Removed);
        }
        removed
    }

    /// Flip the running flag of an entry, if present.
    pub fn set_running(&self, task_id: &str, is_running: bool) {
        let updated = {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            match entries.get_mut(task_id) {
                Some(entry) => {
                    entry.is_running = is_running;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(task_id.to_string(), RegistryChangeKind::Updated);
        }
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|e| e.is_running)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, task_id: String, kind: RegistryChangeKind) {
        let change = RegistryChange {
            task_id,
            kind,
            running: self.running_count(),
        };
        // No receivers is fine.
        let _ = self.tx.send(change);
    }
}

// ============================================================================
// Tests
// ============================================================================
