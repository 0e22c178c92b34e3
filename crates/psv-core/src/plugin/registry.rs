//! The instance registry: single source of truth for installed plugins.
//!
//! One coarse lock guards the map. Callers get closures that run while the
//! lock is held; nothing in this module blocks on the OS, and no reference
//! into the map escapes a closure.

use psv_common::PluginId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::plugin::instance::{PluginInfo, PluginInstance, PluginStatus};
use crate::runtime::process::ProcessHandle;

#[derive(Debug, Default)]
struct RegistryState {
    instances: HashMap<PluginId, PluginInstance>,
    /// IDs with an install in flight.
    reserved: HashSet<PluginId>,
}

/// In-memory map from plugin ID to its [`PluginInstance`].
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

/// Why an ID could not be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    Installed,
    InstallInProgress,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panic inside a closure can only leave the entry it was editing
        // half-updated; the map itself stays consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.lock().instances.contains_key(id)
    }

    /// Claim `id` for an install. The claim is released when the returned
    /// guard is dropped unless it was committed.
    pub(crate) fn reserve(&self, id: &PluginId) -> Result<InstallReservation<'_>, ReserveError> {
        let mut state = self.lock();
        if state.instances.contains_key(id) {
            return Err(ReserveError::Installed);
        }
        if !state.reserved.insert(id.clone()) {
            return Err(ReserveError::InstallInProgress);
        }
        Ok(InstallReservation {
            registry: self,
            id: id.clone(),
            committed: false,
        })
    }

    /// Run `f` on the instance under the lock.
    pub(crate) fn with_instance<R>(
        &self,
        id: &PluginId,
        f: impl FnOnce(&mut PluginInstance) -> R,
    ) -> Option<R> {
        self.lock().instances.get_mut(id).map(f)
    }

    pub(crate) fn remove(&self, id: &PluginId) -> Option<PluginInstance> {
        self.lock().instances.remove(id)
    }

    pub fn status(&self, id: &PluginId) -> Option<PluginStatus> {
        self.lock().instances.get(id).map(|instance| instance.status)
    }

    pub fn info(&self, id: &PluginId) -> Option<PluginInfo> {
        self.lock().instances.get(id).map(PluginInstance::info)
    }

    /// Copies of every instance, sorted by ID.
    pub fn snapshot(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .lock()
            .instances
            .values()
            .map(PluginInstance::info)
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Running instances that are not being stopped, with their (possibly
    /// missing) process handles.
    pub(crate) fn running(&self) -> Vec<(PluginId, Option<Arc<ProcessHandle>>)> {
        let mut running: Vec<_> = self
            .lock()
            .instances
            .values()
            .filter(|instance| instance.status == PluginStatus::Running && !instance.stopping)
            .map(|instance| (instance.id.clone(), instance.process.clone()))
            .collect();
        running.sort_by(|a, b| a.0.cmp(&b.0));
        running
    }

    pub fn ids(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.lock().instances.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Exclusive claim on a plugin ID while its install pipeline runs.
#[derive(Debug)]
pub(crate) struct InstallReservation<'a> {
    registry: &'a Registry,
    id: PluginId,
    committed: bool,
}

impl InstallReservation<'_> {
    /// Insert the finished instance and release the claim atomically.
    pub(crate) fn commit(mut self, instance: PluginInstance) {
        let mut state = self.registry.lock();
        state.reserved.remove(&self.id);
        state.instances.insert(self.id.clone(), instance);
        self.committed = true;
    }
}

impl Drop for InstallReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.lock().reserved.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::PluginManifest;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn instance(id: &str) -> PluginInstance {
        let manifest: PluginManifest = serde_json::from_value(serde_json::json!({
            "id": id,
            "name": id.to_uppercase(),
            "version": "1.0.0",
            "entry": "run.sh"
        }))
        .unwrap();
        PluginInstance::new(
            PluginId::parse(id).unwrap(),
            manifest,
            PathBuf::from("/plugins").join(id),
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    fn id(s: &str) -> PluginId {
        PluginId::parse(s).unwrap()
    }

    #[test]
    fn test_reserve_commit() {
        let registry = Registry::new();
        let reservation = registry.reserve(&id("a")).unwrap();
        assert_eq!(
            registry.reserve(&id("a")).unwrap_err(),
            ReserveError::InstallInProgress
        );
        assert!(!registry.contains(&id("a")));

        reservation.commit(instance("a"));
        assert!(registry.contains(&id("a")));
        assert_eq!(
            registry.reserve(&id("a")).unwrap_err(),
            ReserveError::Installed
        );
        assert_eq!(registry.status(&id("a")), Some(PluginStatus::Installed));
    }

    #[test]
    fn test_dropped_reservation_releases_id() {
        let registry = Registry::new();
        {
            let _reservation = registry.reserve(&id("a")).unwrap();
        }
        assert!(registry.reserve(&id("a")).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted_copy() {
        let registry = Registry::new();
        for name in ["c", "a", "b"] {
            registry.reserve(&id(name)).unwrap().commit(instance(name));
        }

        let snapshot = registry.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        registry.with_instance(&id("a"), |i| i.status = PluginStatus::Error);
        // The earlier snapshot is unaffected.
        assert_eq!(snapshot[0].status, PluginStatus::Installed);
        assert_eq!(registry.status(&id("a")), Some(PluginStatus::Error));
    }

    #[test]
    fn test_running_filters_status() {
        let registry = Registry::new();
        registry.reserve(&id("a")).unwrap().commit(instance("a"));
        registry.reserve(&id("b")).unwrap().commit(instance("b"));
        registry.reserve(&id("c")).unwrap().commit(instance("c"));
        registry.with_instance(&id("b"), |i| i.status = PluginStatus::Running);
        registry.with_instance(&id("c"), |i| {
            i.status = PluginStatus::Running;
            i.stopping = true;
        });

        let running = registry.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].0, id("b"));
        assert!(running[0].1.is_none());
    }

    #[test]
    fn test_remove() {
        let registry = Registry::new();
        registry.reserve(&id("a")).unwrap().commit(instance("a"));
        assert!(registry.remove(&id("a")).is_some());
        assert!(registry.remove(&id("a")).is_none());
        assert!(registry.info(&id("a")).is_none());
    }
}
