use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::sandbox::{ProcessId, SandboxHandle};

#[derive(Debug, Clone)]
pub struct SandboxEntry {
    pub handle: SandboxHandle,
    pub url: Option<String>,
    pub dev_server: Option<ProcessId>,
    last_used: Instant,
}

impl SandboxEntry {
    pub fn new(handle: SandboxHandle) -> Self {
        Self {
            handle,
            url: None,
            dev_server: None,
            last_used: Instant::now(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// Process-wide project id -> sandbox map. Entries are created on first use,
/// dropped when a reconnect fails, and evicted once idle past a TTL.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    entries: Mutex<HashMap<String, SandboxEntry>>,
    creation: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot and marks the entry as used.
    pub fn get(&self, project_id: &str) -> Option<SandboxEntry> {
        let mut guard = self.entries.lock();
        let entry = guard.get_mut(project_id)?;
        entry.last_used = Instant::now();
        Some(entry.clone())
    }

    /// Per-project gate held across lookup, reconnect and create so one
    /// project never ends up with two live sandboxes.
    pub fn creation_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creation
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    pub fn peek(&self, project_id: &str) -> Option<SandboxEntry> {
        self.entries.lock().get(project_id).cloned()
    }

    pub fn insert(&self, project_id: impl Into<String>, handle: SandboxHandle) {
        self.entries
            .lock()
            .insert(project_id.into(), SandboxEntry::new(handle));
    }

    pub fn remove(&self, project_id: &str) -> Option<SandboxEntry> {
        self.entries.lock().remove(project_id)
    }

    pub fn set_url(&self, project_id: &str, url: impl Into<String>) {
        if let Some(entry) = self.entries.lock().get_mut(project_id) {
            entry.url = Some(url.into());
        }
    }

    pub fn set_dev_server(&self, project_id: &str, process: Option<ProcessId>) {
        if let Some(entry) = self.entries.lock().get_mut(project_id) {
            entry.dev_server = process;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes entries unused for longer than `ttl` and returns them so the caller can tear them down.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<(String, SandboxEntry)> {
        let mut guard = self.entries.lock();
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, entry)| entry.idle_for() > ttl)
            .map(|(project_id, _)| project_id.clone())
            .collect();
        let evicted: Vec<(String, SandboxEntry)> = expired
            .into_iter()
            .filter_map(|project_id| {
                guard
                    .remove(&project_id)
                    .map(|entry| (project_id, entry))
            })
            .collect();
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted idle sandboxes");
        }
        evicted
    }

    pub fn release(&self, project_id: &str) -> Option<SandboxEntry> {
        let released = self.remove(project_id);
        if released.is_some() {
            info!(project_id, "released sandbox");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> SandboxHandle {
        SandboxHandle::new(id, "/app", "/tmp")
    }

    #[test]
    fn insert_get_and_update() {
        let registry = SandboxRegistry::new();
        registry.insert("p1", handle("sb-1"));
        registry.set_url("p1", "https://sb-1.example");
        registry.set_dev_server("p1", Some(ProcessId("42".to_string())));
        let entry = registry.get("p1").expect("registered");
        assert_eq!(entry.handle.sandbox_id, "sb-1");
        assert_eq!(entry.url.as_deref(), Some("https://sb-1.example"));
        assert_eq!(entry.dev_server, Some(ProcessId("42".to_string())));
        assert!(registry.get("p2").is_none());
    }

    #[test]
    fn creation_lock_is_shared_per_project() {
        let registry = SandboxRegistry::new();
        let first = registry.creation_lock("p1");
        let again = registry.creation_lock("p1");
        let other = registry.creation_lock("p2");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn evict_idle_drops_only_stale_entries() {
        let registry = SandboxRegistry::new();
        registry.insert("stale", handle("sb-1"));
        std::thread::sleep(Duration::from_millis(30));
        registry.insert("fresh", handle("sb-2"));
        let evicted = registry.evict_idle(Duration::from_millis(20));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "stale");
        assert!(registry.peek("fresh").is_some());
        assert_eq!(registry.len(), 1);
    }
}
