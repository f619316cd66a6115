//! Host configuration cache
//!
//! Maps request hosts to their built configuration. Reads are lock-free via
//! DashMap; writes come from the reconciler.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::HostConfiguration;

/// Cached host entry
#[derive(Debug, Clone)]
struct HostEntry {
    /// Name of the configuration that owns this host
    owner: String,
    config: Arc<HostConfiguration>,
}

/// Registered configuration
#[derive(Debug, Clone)]
struct ConfigEntry {
    /// Every host the configuration asks for, owned or not
    hosts: Vec<String>,
    config: Arc<HostConfiguration>,
    /// Resource version for change detection
    resource_version: String,
}

/// Concurrent host -> configuration lookup
#[derive(Debug, Default)]
pub struct HostCache {
    hosts: DashMap<String, HostEntry>,
    configs: DashMap<String, ConfigEntry>,
}

impl HostCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the configuration for a host
    ///
    /// Tries the exact host first, then the host with any `:port` suffix
    /// removed.
    pub fn get(&self, host: &str) -> Option<Arc<HostConfiguration>> {
        if let Some(entry) = self.hosts.get(host) {
            return Some(entry.config.clone());
        }

        let (bare, _) = host.split_once(':')?;
        self.hosts.get(bare).map(|entry| entry.config.clone())
    }

    /// Register or replace a configuration under all of its hosts
    ///
    /// Skips the update if the resource version hasn't changed. Hosts the
    /// configuration no longer lists are released. A host already owned by a
    /// different configuration stays with its owner; the configuration takes
    /// it over once the owner lets go.
    ///
    /// Returns whether anything changed.
    pub fn upsert(
        &self,
        name: &str,
        hosts: &[String],
        config: Arc<HostConfiguration>,
        resource_version: &str,
    ) -> bool {
        let previous = self.configs.get(name).map(|entry| entry.clone());

        if let Some(existing) = &previous {
            if existing.resource_version == resource_version {
                debug!(
                    config = %name,
                    version = %resource_version,
                    "Configuration unchanged, skipping"
                );
                return false;
            }
        }

        self.configs.insert(
            name.to_string(),
            ConfigEntry {
                hosts: hosts.to_vec(),
                config: config.clone(),
                resource_version: resource_version.to_string(),
            },
        );

        let claimed: Vec<&String> = hosts
            .iter()
            .filter(|host| self.claim(host, name, &config))
            .collect();

        if let Some(existing) = previous {
            for host in existing.hosts.iter().filter(|h| !hosts.contains(h)) {
                self.release(host, name);
            }
        }

        info!(
            config = %name,
            hosts = ?claimed,
            version = %resource_version,
            "Configuration updated"
        );

        true
    }

    /// Remove a configuration and every host it owns
    ///
    /// Released hosts pass to another configuration that lists them.
    pub fn remove(&self, name: &str) -> bool {
        let Some((_, entry)) = self.configs.remove(name) else {
            return false;
        };

        for host in &entry.hosts {
            self.release(host, name);
        }

        info!(config = %name, "Configuration removed");
        true
    }

    /// Take `host` for `name` unless another configuration owns it
    fn claim(&self, host: &str, name: &str, config: &Arc<HostConfiguration>) -> bool {
        match self.hosts.entry(host.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().owner != name {
                    warn!(host = %host, config = %name, owner = %occupied.get().owner, "Host already taken, skipping");
                    return false;
                }
                occupied.get_mut().config = config.clone();
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(HostEntry {
                    owner: name.to_string(),
                    config: config.clone(),
                });
                true
            }
        }
    }

    /// Drop `name`'s ownership of `host` and hand it to the next claimant
    ///
    /// Claimants are tried in name order.
    fn release(&self, host: &str, name: &str) {
        if self
            .hosts
            .remove_if(host, |_, entry| entry.owner == name)
            .is_none()
        {
            return;
        }

        let mut claimants: Vec<(String, Arc<HostConfiguration>)> = self
            .configs
            .iter()
            .filter(|entry| entry.key() != name && entry.hosts.iter().any(|h| h == host))
            .map(|entry| (entry.key().clone(), entry.config.clone()))
            .collect();
        claimants.sort_by(|a, b| a.0.cmp(&b.0));

        for (claimant, config) in claimants {
            if self.claim(host, &claimant, &config) {
                info!(host = %host, from = %name, to = %claimant, "Host handed over");
                return;
            }
        }
    }

    /// Names of all registered configurations
    pub fn names(&self) -> Vec<String> {
        self.configs.iter().map(|e| e.key().clone()).collect()
    }

    /// Resource version of a registered configuration
    pub fn resource_version(&self, name: &str) -> Option<String> {
        self.configs.get(name).map(|e| e.resource_version.clone())
    }

    /// Number of registered hosts
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Check if no host is registered
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> Arc<HostConfiguration> {
        Arc::new(HostConfiguration {
            name: name.to_string(),
            ..Default::default()
        })
    }

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_exact_lookup() {
        let cache = HostCache::new();
        assert!(cache.is_empty());

        cache.upsert("talker", &hosts(&["talker-api"]), config("talker"), "v1");
        assert_eq!(cache.get("talker-api").unwrap().name, "talker");
        assert!(cache.get("other").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_port_is_stripped_on_miss() {
        let cache = HostCache::new();
        cache.upsert("talker", &hosts(&["talker-api"]), config("talker"), "v1");

        for port in [80u16, 443, 8000, 65535] {
            let with_port = format!("talker-api:{}", port);
            let found = cache.get(&with_port).unwrap();
            assert!(Arc::ptr_eq(&found, &cache.get("talker-api").unwrap()));
        }
    }

    #[test]
    fn test_exact_host_with_port_wins() {
        let cache = HostCache::new();
        cache.upsert("plain", &hosts(&["api"]), config("plain"), "v1");
        cache.upsert("ported", &hosts(&["api:8443"]), config("ported"), "v1");

        assert_eq!(cache.get("api:8443").unwrap().name, "ported");
        assert_eq!(cache.get("api:9000").unwrap().name, "plain");
    }

    #[test]
    fn test_resource_version_skips_update() {
        let cache = HostCache::new();
        assert!(cache.upsert("talker", &hosts(&["a"]), config("talker"), "v1"));
        assert!(!cache.upsert("talker", &hosts(&["a"]), config("talker"), "v1"));
        assert!(cache.upsert("talker", &hosts(&["a"]), config("talker"), "v2"));
        assert_eq!(cache.resource_version("talker").as_deref(), Some("v2"));
    }

    #[test]
    fn test_dropped_hosts_are_released() {
        let cache = HostCache::new();
        cache.upsert("talker", &hosts(&["a", "b"]), config("talker"), "v1");
        cache.upsert("talker", &hosts(&["b"]), config("talker"), "v2");

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_host_conflict_keeps_owner() {
        let cache = HostCache::new();
        cache.upsert("first", &hosts(&["shared"]), config("first"), "v1");
        cache.upsert("second", &hosts(&["shared", "own"]), config("second"), "v1");

        assert_eq!(cache.get("shared").unwrap().name, "first");
        assert_eq!(cache.get("own").unwrap().name, "second");

        assert!(cache.remove("second"));
        assert_eq!(cache.get("shared").unwrap().name, "first");
        assert!(cache.get("own").is_none());
    }

    #[test]
    fn test_removed_owner_hands_host_over() {
        let cache = HostCache::new();
        cache.upsert("first", &hosts(&["shared"]), config("first"), "v1");
        cache.upsert("second", &hosts(&["shared", "own"]), config("second"), "v1");

        assert!(cache.remove("first"));
        assert_eq!(cache.get("shared").unwrap().name, "second");
        assert_eq!(cache.get("own").unwrap().name, "second");
    }

    #[test]
    fn test_dropped_host_hands_over_to_waiting_config() {
        let cache = HostCache::new();
        cache.upsert("first", &hosts(&["shared", "a"]), config("first"), "v1");
        cache.upsert("second", &hosts(&["shared"]), config("second"), "v1");
        assert_eq!(cache.get("shared").unwrap().name, "first");

        cache.upsert("first", &hosts(&["a"]), config("first"), "v2");
        assert_eq!(cache.get("shared").unwrap().name, "second");
        assert_eq!(cache.get("a").unwrap().name, "first");
    }

    #[test]
    fn test_update_refreshes_owned_hosts() {
        let cache = HostCache::new();
        cache.upsert("talker", &hosts(&["a"]), config("talker"), "v1");
        let before = cache.get("a").unwrap();

        cache.upsert("talker", &hosts(&["a"]), config("talker"), "v2");
        assert!(!Arc::ptr_eq(&before, &cache.get("a").unwrap()));
    }

    #[test]
    fn test_concurrent_claims_pick_one_owner() {
        let cache = Arc::new(HostCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let name = format!("config-{}", i);
                    cache.upsert(&name, &hosts(&["contended"]), config(&name), "v1");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let owner = cache.get("contended").unwrap().name.clone();
        assert!(cache.remove(&owner));
        let next = cache.get("contended").unwrap().name.clone();
        assert_ne!(owner, next);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = HostCache::new();
        cache.upsert("talker", &hosts(&["a", "b"]), config("talker"), "v1");
        assert_eq!(cache.names(), vec!["talker".to_string()]);

        assert!(cache.remove("talker"));
        assert!(cache.is_empty());
        assert!(!cache.remove("talker"));
    }
}
