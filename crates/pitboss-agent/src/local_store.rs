//! The agent's table of local function instances.
//!
//! Keyed by function id; each function holds its instances in arrival
//! order. One lock serializes every write, so a re-registration (wipe the
//! service everywhere, then insert) is never observed half done.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use pitboss_contracts::{session::LocalInstance, wire::LocalFunctionInstances};

#[derive(Default)]
pub struct LocalStore {
    inner: RwLock<HashMap<String, Vec<LocalInstance>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<LocalInstance>>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<LocalInstance>>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every instance of `service_id` with one fresh instance per
    /// listed function. Returns an opaque session id.
    pub fn register(&self, service_id: &str, addr: &str, version: &str, function_ids: &[String]) -> String {
        self.register_at(service_id, addr, version, function_ids, Utc::now())
    }

    pub fn register_at(
        &self,
        service_id: &str,
        addr: &str,
        version: &str,
        function_ids: &[String],
        now: DateTime<Utc>,
    ) -> String {
        let functions: BTreeSet<&str> = function_ids.iter().map(String::as_str).filter(|f| !f.is_empty()).collect();

        let mut table = self.write();
        remove_service(&mut table, service_id);
        for function_id in &functions {
            table.entry(function_id.to_string()).or_default().push(LocalInstance {
                service_id: service_id.to_string(),
                addr: addr.to_string(),
                version: version.to_string(),
                last_seen: now,
            });
        }
        drop(table);

        info!(service_id, addr, version, functions = functions.len(), "local instance registered");
        format!("{}:{}", service_id, now.timestamp_millis())
    }

    /// Refresh `last_seen` on every instance of `service_id`. Returns false
    /// when the service is unknown.
    pub fn heartbeat(&self, service_id: &str) -> bool {
        self.heartbeat_at(service_id, Utc::now())
    }

    pub fn heartbeat_at(&self, service_id: &str, now: DateTime<Utc>) -> bool {
        let mut known = false;
        for instances in self.write().values_mut() {
            for instance in instances.iter_mut().filter(|i| i.service_id == service_id) {
                instance.last_seen = now;
                known = true;
            }
        }
        known
    }

    /// Remove `service_id` from every function. Returns whether anything was
    /// removed.
    pub fn deregister(&self, service_id: &str) -> bool {
        remove_service(&mut self.write(), service_id) > 0
    }

    /// Deep copy of the table, ordered by function id.
    pub fn list(&self) -> Vec<LocalFunctionInstances> {
        let table = self.read();
        let mut out: Vec<LocalFunctionInstances> = table
            .iter()
            .map(|(id, instances)| LocalFunctionInstances { id: id.clone(), instances: instances.clone() })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Function ids with at least one instance, sorted.
    pub fn function_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, instances)| !instances.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The instance to call: the one named by `target_service_id` when
    /// given, otherwise the earliest registered.
    pub fn pick(&self, function_id: &str, target_service_id: Option<&str>) -> Option<LocalInstance> {
        let table = self.read();
        let instances = table.get(function_id)?;
        match target_service_id {
            Some(target) => instances.iter().find(|i| i.service_id == target).cloned(),
            None => instances.first().cloned(),
        }
    }

    /// Drop instances not seen for longer than `max_age`. Returns how many
    /// were removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        self.prune_at(max_age, Utc::now())
    }

    pub fn prune_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut table = self.write();
        let mut removed = 0;
        for instances in table.values_mut() {
            let before = instances.len();
            instances.retain(|i| now.signed_duration_since(i.last_seen) <= max_age);
            removed += before - instances.len();
        }
        table.retain(|_, instances| !instances.is_empty());
        if removed > 0 {
            info!(removed, "pruned stale local instances");
        }
        removed
    }
}

fn remove_service(table: &mut HashMap<String, Vec<LocalInstance>>, service_id: &str) -> usize {
    let mut removed = 0;
    for instances in table.values_mut() {
        let before = instances.len();
        instances.retain(|i| i.service_id != service_id);
        removed += before - instances.len();
    }
    table.retain(|_, instances| !instances.is_empty());
    if removed > 0 {
        debug!(service_id, removed, "previous instances removed");
    }
    removed
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn count_service(store: &LocalStore, function_id: &str, service_id: &str) -> usize {
        store
            .list()
            .iter()
            .filter(|f| f.id == function_id)
            .flat_map(|f| f.instances.iter())
            .filter(|i| i.service_id == service_id)
            .count()
    }

    #[test]
    fn register_places_one_instance_per_function() {
        let store = LocalStore::new();
        let session = store.register("svc-a", "127.0.0.1:20100", "1.0.0", &ids(&["player.ban", "player.wipe"]));
        assert!(session.starts_with("svc-a:"));
        assert_eq!(store.function_ids(), ids(&["player.ban", "player.wipe"]));
        assert_eq!(count_service(&store, "player.ban", "svc-a"), 1);
    }

    #[test]
    fn reregistration_replaces_the_old_function_set() {
        let store = LocalStore::new();
        store.register("svc-a", "127.0.0.1:20100", "1.0.0", &ids(&["player.ban", "player.wipe"]));
        store.register("svc-a", "127.0.0.1:20101", "1.1.0", &ids(&["player.ban", "reports.export"]));

        assert_eq!(store.function_ids(), ids(&["player.ban", "reports.export"]));
        assert_eq!(count_service(&store, "player.ban", "svc-a"), 1);
        assert_eq!(count_service(&store, "player.wipe", "svc-a"), 0);
        assert_eq!(store.pick("player.ban", None).unwrap().addr, "127.0.0.1:20101");
    }

    #[test]
    fn duplicate_function_ids_do_not_duplicate_instances() {
        let store = LocalStore::new();
        store.register("svc-a", "a", "", &ids(&["player.ban", "player.ban"]));
        assert_eq!(count_service(&store, "player.ban", "svc-a"), 1);
    }

    #[test]
    fn pick_is_first_registered_unless_targeted() {
        let store = LocalStore::new();
        store.register("svc-a", "addr-a", "", &ids(&["player.ban"]));
        store.register("svc-b", "addr-b", "", &ids(&["player.ban"]));

        assert_eq!(store.pick("player.ban", None).unwrap().service_id, "svc-a");
        assert_eq!(store.pick("player.ban", Some("svc-b")).unwrap().addr, "addr-b");
        assert!(store.pick("player.ban", Some("svc-z")).is_none());
        assert!(store.pick("player.kick", None).is_none());
    }

    #[test]
    fn heartbeat_and_prune() {
        let store = LocalStore::new();
        let t0 = Utc::now();
        store.register_at("svc-a", "a", "", &ids(&["player.ban"]), t0);
        store.register_at("svc-b", "b", "", &ids(&["player.ban", "reports.export"]), t0);

        assert!(store.heartbeat_at("svc-a", t0 + ChronoDuration::seconds(50)));
        assert!(!store.heartbeat_at("svc-z", t0));

        let removed = store.prune_at(std::time::Duration::from_secs(60), t0 + ChronoDuration::seconds(70));
        assert_eq!(removed, 2);
        assert_eq!(store.function_ids(), ids(&["player.ban"]));
        assert_eq!(store.pick("player.ban", None).unwrap().service_id, "svc-a");
    }

    #[test]
    fn deregister_removes_everywhere() {
        let store = LocalStore::new();
        store.register("svc-a", "a", "", &ids(&["player.ban", "reports.export"]));
        assert!(store.deregister("svc-a"));
        assert!(store.function_ids().is_empty());
        assert!(!store.deregister("svc-a"));
    }

    #[test]
    fn concurrent_reregistration_never_duplicates() {
        let store = Arc::new(LocalStore::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let addr = format!("addr-{n}-{round}");
                        store.register("svc-a", &addr, "", &ids(&["player.ban", "player.wipe"]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(count_service(&store, "player.ban", "svc-a"), 1);
        assert_eq!(count_service(&store, "player.wipe", "svc-a"), 1);
    }
}
