//! Core service registry implementation

use crate::{
    backend::{FileBackend, MemoryBackend, RegistryBackend, ServiceTable},
    error::{Error, Result},
    models::*,
    REGISTRY_FILE, STATE_DIR,
};
use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 256;

/// Service registry with pluggable persistence
///
/// Reads are served from memory under a shared lock. Mutations are
/// serialized by an async writer lock that is held across the backend
/// write, so persisted snapshots never interleave.
pub struct Registry {
    /// Storage backend
    backend: Arc<Box<dyn RegistryBackend>>,
    /// In-memory table
    table: RwLock<ServiceTable>,
    /// Held for the full mutate-then-persist sequence
    writer: Mutex<()>,
    /// Event subscribers
    subscribers: std::sync::Mutex<Vec<Sender<RegistryEvent>>>,
}

impl Registry {
    /// Create an empty, non-persistent registry
    pub fn in_memory() -> Self {
        Self::with_table(Box::new(MemoryBackend::new()), ServiceTable::new())
    }

    /// Create a registry over `backend`, loading its current contents
    pub async fn with_backend(backend: Box<dyn RegistryBackend>) -> Result<Self> {
        let table = backend.load().await?;
        info!(
            backend = %backend.describe(),
            services = table.len(),
            "Loaded registry"
        );
        Ok(Self::with_table(backend, table))
    }

    fn with_table(backend: Box<dyn RegistryBackend>, table: ServiceTable) -> Self {
        Self {
            backend: Arc::new(backend),
            table: RwLock::new(table),
            writer: Mutex::new(()),
            subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Load registry from a JSON file, which need not exist yet
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_backend(Box::new(FileBackend::new(path.as_ref()))).await
    }

    /// Load the registry kept in `<project_dir>/.devstack/services.json`
    pub async fn for_project(project_dir: impl AsRef<Path>) -> Result<Self> {
        Self::load(project_dir.as_ref().join(STATE_DIR).join(REGISTRY_FILE)).await
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to a copy of the table, persist it, then swap it in and
    /// notify subscribers. A failed save leaves the in-memory table as it was.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut ServiceTable) -> Result<(T, Vec<RegistryEvent>)>,
    ) -> Result<T> {
        let _writer = self.writer.lock().await;
        let mut next = self.read().clone();
        let (output, events) = f(&mut next)?;
        self.backend.save(&next).await?;
        *self.write() = next;
        self.emit(events);
        Ok(output)
    }

    /// Entry as stored, without stale-process cleanup
    pub fn peek(&self, name: &str) -> Option<ServiceEntry> {
        self.read().get(name).cloned()
    }

    /// Register a service, replacing any existing entry with that name
    pub async fn register(&self, entry: ServiceEntry) -> Result<()> {
        info!(service = %entry.name, status = %entry.status, "Registering service");
        self.mutate(|table| {
            let event = RegistryEvent::Registered {
                name: entry.name.clone(),
                status: entry.status,
            };
            table.insert(entry.name.clone(), entry);
            Ok(((), vec![event]))
        })
        .await
    }

    /// Modify one entry in place.
    ///
    /// Status changes are validated against the lifecycle state machine;
    /// an entry entering `stopped` or `error` gets its end time stamped.
    pub async fn update(
        &self,
        name: &str,
        f: impl FnOnce(&mut ServiceEntry),
    ) -> Result<ServiceEntry> {
        self.mutate(|table| {
            let entry = table
                .get_mut(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            let mut updated = entry.clone();
            f(&mut updated);

            let (from, to) = (entry.status, updated.status);
            if !from.can_transition_to(to) {
                return Err(Error::InvalidStateTransition {
                    service: name.to_string(),
                    from,
                    to,
                });
            }

            let mut events = Vec::new();
            if from != to {
                debug!(service = %name, %from, %to, "Status changed");
                if matches!(to, ServiceStatus::Stopped | ServiceStatus::Error)
                    && updated.end_time.is_none()
                {
                    updated.end_time = Some(Utc::now());
                }
                events.push(RegistryEvent::StatusChanged {
                    name: name.to_string(),
                    from,
                    to,
                });
            }
            if entry.health != updated.health {
                debug!(service = %name, from = %entry.health, to = %updated.health, "Health changed");
                events.push(RegistryEvent::HealthChanged {
                    name: name.to_string(),
                    from: entry.health,
                    to: updated.health,
                });
            }

            *entry = updated.clone();
            Ok((updated, events))
        })
        .await
    }

    /// Set status and, optionally, health
    pub async fn update_status(
        &self,
        name: &str,
        status: ServiceStatus,
        health: Option<HealthState>,
    ) -> Result<ServiceEntry> {
        self.update(name, |entry| {
            entry.status = status;
            if let Some(health) = health {
                entry.health = health;
            }
        })
        .await
    }

    /// Record a health evaluation
    pub async fn update_health(
        &self,
        name: &str,
        health: HealthState,
        checked_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<ServiceEntry> {
        self.update(name, |entry| {
            entry.health = health;
            entry.last_checked = Some(checked_at);
            if health == HealthState::Healthy {
                entry.error = None;
            } else if error.is_some() {
                entry.error = error;
            }
        })
        .await
    }

    /// Record that the service's process has exited
    pub async fn record_exit(
        &self,
        name: &str,
        status: ServiceStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<ServiceEntry> {
        self.update(name, |entry| {
            entry.status = status;
            entry.exit_code = exit_code;
            entry.end_time = Some(Utc::now());
            if error.is_some() {
                entry.error = error;
            }
            if status == ServiceStatus::Error {
                entry.health = HealthState::Unhealthy;
            } else {
                entry.health = HealthState::Unknown;
            }
        })
        .await
    }

    /// Get a service by name, marking it stopped first if its process is gone
    pub async fn get(&self, name: &str) -> Option<ServiceEntry> {
        let entry = self.peek(name)?;
        if entry.is_stale() {
            self.mark_stale(vec![entry.name]).await;
            return self.peek(name);
        }
        Some(entry)
    }

    /// All services ordered by name, after stale-entry cleanup
    pub async fn list(&self) -> Vec<ServiceEntry> {
        let stale: Vec<String> = self
            .read()
            .values()
            .filter(|e| e.is_stale())
            .map(|e| e.name.clone())
            .collect();
        if !stale.is_empty() {
            self.mark_stale(stale).await;
        }
        self.read().values().cloned().collect()
    }

    /// Names of all registered services
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Remove a service, returning its last entry
    pub async fn unregister(&self, name: &str) -> Result<Option<ServiceEntry>> {
        let removed = self
            .mutate(|table| {
                let removed = table.remove(name);
                let events = removed
                    .iter()
                    .map(|_| RegistryEvent::Unregistered {
                        name: name.to_string(),
                    })
                    .collect();
                Ok((removed, events))
            })
            .await?;
        if removed.is_some() {
            info!(service = %name, "Unregistered service");
        }
        Ok(removed)
    }

    /// Replace the in-memory table with the backend's current contents.
    ///
    /// Lets a second process follow a registry file owned by another.
    pub async fn reload(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let table = self.backend.load().await?;
        *self.write() = table;
        Ok(())
    }

    /// Receive change notifications. Slow subscribers lose events rather
    /// than blocking writers.
    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = async_channel::bounded(EVENT_QUEUE);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn emit(&self, events: Vec<RegistryEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("Registry subscriber lagging, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Mark entries whose process has vanished as stopped. Entries are
    /// kept for auditability rather than deleted.
    async fn mark_stale(&self, names: Vec<String>) {
        let result = self
            .mutate(|table| {
                let mut events = Vec::new();
                for name in &names {
                    let Some(entry) = table.get_mut(name) else {
                        continue;
                    };
                    if !entry.is_stale() {
                        continue;
                    }
                    warn!(service = %name, pid = ?entry.pid, "Process no longer running, marking stopped");
                    events.push(RegistryEvent::StatusChanged {
                        name: name.clone(),
                        from: entry.status,
                        to: ServiceStatus::Stopped,
                    });
                    entry.status = ServiceStatus::Stopped;
                    entry.health = HealthState::Unknown;
                    entry.end_time = Some(Utc::now());
                    entry.error = Some("process no longer running".to_string());
                }
                Ok(((), events))
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist stale-entry cleanup");
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.backend.describe())
            .field("services", &self.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::RenameFn;
    use std::io;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[smol_potat::test]
    async fn test_registry_operations() {
        let registry = Registry::in_memory();

        registry
            .register(ServiceEntry::starting("api").with_port(8080))
            .await
            .unwrap();

        let entry = registry.get("api").await.unwrap();
        assert_eq!(entry.status, ServiceStatus::Starting);
        assert_eq!(entry.url.as_deref(), Some("http://localhost:8080"));

        registry
            .update_status("api", ServiceStatus::Running, Some(HealthState::Unknown))
            .await
            .unwrap();

        // Invalid transition
        let err = registry
            .update_status("api", ServiceStatus::Starting, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(registry.get("api").await.unwrap().status, ServiceStatus::Running);

        // Unknown service
        assert!(matches!(
            registry.update_status("nope", ServiceStatus::Running, None).await,
            Err(Error::ServiceNotFound(_))
        ));

        let removed = registry.unregister("api").await.unwrap();
        assert_eq!(removed.unwrap().name, "api");
        assert!(registry.get("api").await.is_none());
        assert!(registry.unregister("api").await.unwrap().is_none());
    }

    #[smol_potat::test]
    async fn test_exit_stamps_end_time() {
        let registry = Registry::in_memory();
        registry.register(ServiceEntry::starting("worker")).await.unwrap();

        let entry = registry
            .record_exit("worker", ServiceStatus::Error, Some(2), Some("exited".into()))
            .await
            .unwrap();

        assert_eq!(entry.exit_code, Some(2));
        assert_eq!(entry.health, HealthState::Unhealthy);
        assert!(entry.end_time.is_some());
    }

    #[smol_potat::test]
    async fn test_events() {
        let registry = Registry::in_memory();
        let events = registry.subscribe();

        registry.register(ServiceEntry::starting("db")).await.unwrap();
        registry
            .update_status("db", ServiceStatus::Running, Some(HealthState::Healthy))
            .await
            .unwrap();
        registry.unregister("db").await.unwrap();

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            received,
            vec![
                RegistryEvent::Registered {
                    name: "db".into(),
                    status: ServiceStatus::Starting
                },
                RegistryEvent::StatusChanged {
                    name: "db".into(),
                    from: ServiceStatus::Starting,
                    to: ServiceStatus::Running
                },
                RegistryEvent::HealthChanged {
                    name: "db".into(),
                    from: HealthState::Unknown,
                    to: HealthState::Healthy
                },
                RegistryEvent::Unregistered { name: "db".into() },
            ]
        );
    }

    #[smol_potat::test]
    async fn test_stale_entries_marked_stopped_on_read() {
        let registry = Registry::in_memory();
        let mut entry = ServiceEntry::starting("ghost");
        entry.status = ServiceStatus::Running;
        entry.pid = Some(dead_pid());
        registry.register(entry).await.unwrap();

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1, "stale entries are kept, not deleted");
        assert_eq!(listed[0].status, ServiceStatus::Stopped);
        assert_eq!(listed[0].health, HealthState::Unknown);
        assert!(listed[0].end_time.is_some());
    }

    #[smol_potat::test]
    async fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();

        {
            let registry = Registry::for_project(dir.path()).await.unwrap();
            for i in 0..3 {
                registry
                    .register(ServiceEntry::starting(format!("service-{i}")))
                    .await
                    .unwrap();
            }
            registry
                .update_status("service-1", ServiceStatus::Running, Some(HealthState::Healthy))
                .await
                .unwrap();
        }

        let path = dir.path().join(STATE_DIR).join(REGISTRY_FILE);
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["service-1"]["health"], "healthy");

        let registry = Registry::for_project(dir.path()).await.unwrap();
        let names: Vec<_> = registry.list().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["service-0", "service-1", "service-2"]);
    }

    #[smol_potat::test]
    async fn test_rename_fault_leaves_readable_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");

        let registry = Registry::load(&path).await.unwrap();
        registry.register(ServiceEntry::starting("a")).await.unwrap();

        let faulty: RenameFn = Arc::new(|_, _| Err(io::Error::other("crash before rename")));
        let broken = Registry::with_backend(Box::new(FileBackend::new(&path).with_rename(faulty)))
            .await
            .unwrap();
        assert_eq!(broken.names(), vec!["a"]);
        assert!(matches!(
            broken.register(ServiceEntry::starting("b")).await,
            Err(Error::Persist { .. })
        ));

        assert_eq!(broken.names(), vec!["a"], "failed write must not linger in memory");
        assert!(broken.peek("b").is_none());

        let reader = Registry::load(&path).await.unwrap();
        assert_eq!(reader.names(), vec!["a"]);
    }

    #[smol_potat::test]
    async fn test_failed_update_keeps_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        Registry::load(&path)
            .await
            .unwrap()
            .register(ServiceEntry::starting("a"))
            .await
            .unwrap();

        let faulty: RenameFn = Arc::new(|_, _| Err(io::Error::other("disk full")));
        let broken = Registry::with_backend(Box::new(FileBackend::new(&path).with_rename(faulty)))
            .await
            .unwrap();
        let events = broken.subscribe();
        assert!(
            broken
                .update_status("a", ServiceStatus::Running, None)
                .await
                .is_err()
        );
        assert_eq!(broken.peek("a").unwrap().status, ServiceStatus::Starting);
        assert!(events.try_recv().is_err(), "no event for a failed write");
    }
}
