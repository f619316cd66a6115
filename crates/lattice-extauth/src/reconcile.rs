//! Configuration reconciler
//!
//! Reads `AuthConfig` documents from the configuration file and keeps the
//! host cache in line with them. Each document's canonical YAML text is its
//! resource version, so unchanged documents are not rebuilt.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::HostCache;
use crate::config::{AuthConfig, HostConfiguration};
use crate::error::Result;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Configurations built and stored
    pub updated: usize,
    /// Configurations whose document did not change
    pub unchanged: usize,
    /// Configurations dropped from the cache
    pub removed: usize,
    /// Documents rejected; any previous version stays in effect
    pub rejected: usize,
}

/// Applies configuration documents to the host cache
pub struct Reconciler {
    cache: Arc<HostCache>,
    /// Shared by every outbound evaluator
    client: reqwest::Client,
}

impl Reconciler {
    /// Create a reconciler over a cache
    pub fn new(cache: Arc<HostCache>, client: reqwest::Client) -> Self {
        Self { cache, client }
    }

    /// Read and apply the configuration file
    pub fn load_file(&self, path: &Path) -> Result<ReconcileReport> {
        let content = std::fs::read_to_string(path)?;
        self.reconcile(&content)
    }

    /// Apply a configuration document list
    ///
    /// A file that is not a YAML list fails as a whole and leaves the cache
    /// untouched. A single document that does not parse or build is rejected
    /// and its previous version, if any, stays in effect. Configurations no
    /// longer present are removed.
    pub fn reconcile(&self, content: &str) -> Result<ReconcileReport> {
        let documents: Vec<serde_yaml::Value> = serde_yaml::from_str(content)?;

        let mut report = ReconcileReport::default();

        // Free hosts of dropped configurations before anything claims them
        let listed: HashSet<&str> = documents
            .iter()
            .filter_map(|document| document.get("name").and_then(|n| n.as_str()))
            .collect();
        for name in self.cache.names() {
            if !listed.contains(name.as_str()) && self.cache.remove(&name) {
                report.removed += 1;
            }
        }

        let mut seen = HashSet::new();
        for document in &documents {
            let Some(name) = document.get("name").and_then(|n| n.as_str()) else {
                error!("configuration document without a name, skipping");
                report.rejected += 1;
                continue;
            };

            if !seen.insert(name) {
                error!(config = %name, "duplicate configuration name, skipping");
                report.rejected += 1;
                continue;
            }

            let version = serde_yaml::to_string(document)?;
            if self.cache.resource_version(name).as_deref() == Some(version.as_str()) {
                debug!(config = %name, "Configuration unchanged");
                report.unchanged += 1;
                continue;
            }

            match self.build(document.clone()) {
                Ok((host_config, hosts)) => {
                    self.cache
                        .upsert(name, &hosts, Arc::new(host_config), &version);
                    report.updated += 1;
                }
                Err(e) => {
                    error!(config = %name, error = %e, "invalid configuration, keeping previous version");
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    fn build(&self, document: serde_yaml::Value) -> Result<(HostConfiguration, Vec<String>)> {
        let config: AuthConfig = serde_yaml::from_value(document)?;
        let host_config = config.build(&self.client)?;
        Ok((host_config, config.hosts))
    }

    /// Re-read `path` every `interval` and reconcile when its content changes
    ///
    /// Runs until `shutdown` is cancelled.
    pub async fn watch(&self, path: PathBuf, interval: Duration, shutdown: CancellationToken) {
        let mut last_applied: Option<String> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        info!(path = %path.display(), ?interval, "Watching configuration file");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read configuration file");
                    continue;
                }
            };

            if last_applied.as_deref() == Some(content.as_str()) {
                continue;
            }
            if content.trim().is_empty() {
                warn!(path = %path.display(), "configuration file is empty, ignoring");
                continue;
            }

            match self.reconcile(&content) {
                Ok(report) => {
                    info!(
                        updated = report.updated,
                        unchanged = report.unchanged,
                        removed = report.removed,
                        rejected = report.rejected,
                        "Configuration reloaded"
                    );
                    last_applied = Some(content);
                }
                Err(e) => {
                    error!(error = %e, "configuration file rejected, keeping current configuration");
                }
            }
        }

        debug!("Configuration watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> (Reconciler, Arc<HostCache>) {
        let cache = Arc::new(HostCache::new());
        (Reconciler::new(cache.clone(), reqwest::Client::new()), cache)
    }

    const TWO_CONFIGS: &str = r#"
- name: talker
  hosts: ["talker-api"]
  identity:
    - name: anyone
      type: anonymous
- name: admin
  hosts: ["admin-api", "admin-api.internal"]
  identity:
    - name: anyone
      type: anonymous
"#;

    #[test]
    fn test_initial_load() {
        let (reconciler, cache) = reconciler();
        let report = reconciler.reconcile(TWO_CONFIGS).unwrap();

        assert_eq!(report.updated, 2);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("admin-api.internal:443").unwrap().name, "admin");
    }

    #[test]
    fn test_unchanged_documents_are_skipped() {
        let (reconciler, cache) = reconciler();
        reconciler.reconcile(TWO_CONFIGS).unwrap();
        let before = cache.get("talker-api").unwrap();

        let report = reconciler.reconcile(TWO_CONFIGS).unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.updated, 0);
        assert!(Arc::ptr_eq(&before, &cache.get("talker-api").unwrap()));
    }

    #[test]
    fn test_missing_configs_are_removed() {
        let (reconciler, cache) = reconciler();
        reconciler.reconcile(TWO_CONFIGS).unwrap();

        let report = reconciler
            .reconcile("- name: talker\n  hosts: [\"talker-api\"]\n")
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.updated, 1);
        assert!(cache.get("admin-api").is_none());
        assert!(cache.get("talker-api").unwrap().identity.is_empty());
    }

    #[test]
    fn test_invalid_update_keeps_previous_version() {
        let (reconciler, cache) = reconciler();
        reconciler.reconcile(TWO_CONFIGS).unwrap();

        let broken = r#"
- name: talker
  hosts: ["talker-api"]
  metadata:
    - name: lookup
      type: http
      endpoint: http://users.svc
      method: PUT
- name: admin
  hosts: ["admin-api", "admin-api.internal"]
  identity:
    - name: anyone
      type: anonymous
"#;
        let report = reconciler.reconcile(broken).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(cache.get("talker-api").unwrap().identity.len(), 1);
    }

    #[test]
    fn test_duplicate_and_unnamed_documents_rejected() {
        let (reconciler, cache) = reconciler();
        let yaml = r#"
- name: same
  hosts: ["a"]
- name: same
  hosts: ["b"]
- hosts: ["c"]
"#;
        let report = reconciler.reconcile(yaml).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.rejected, 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_renamed_config_keeps_its_hosts() {
        let (reconciler, cache) = reconciler();
        reconciler
            .reconcile("- name: old\n  hosts: [\"api\"]\n")
            .unwrap();

        let report = reconciler
            .reconcile("- name: new\n  hosts: [\"api\"]\n")
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(cache.get("api").unwrap().name, "new");
    }

    #[test]
    fn test_dropping_owner_hands_host_to_unchanged_config() {
        let (reconciler, cache) = reconciler();
        let both = "- name: first\n  hosts: [\"shared\"]\n- name: second\n  hosts: [\"shared\"]\n";
        reconciler.reconcile(both).unwrap();
        assert_eq!(cache.get("shared").unwrap().name, "first");

        let report = reconciler
            .reconcile("- name: second\n  hosts: [\"shared\"]\n")
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(cache.get("shared").unwrap().name, "second");
    }

    #[test]
    fn test_malformed_file_leaves_cache_untouched() {
        let (reconciler, cache) = reconciler();
        reconciler.reconcile(TWO_CONFIGS).unwrap();

        assert!(reconciler.reconcile("name: not-a-list").is_err());
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn test_watch_picks_up_changes() {
        let dir = std::env::temp_dir().join(format!("lattice-extauth-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("authconfigs.yaml");
        std::fs::write(&path, TWO_CONFIGS).unwrap();

        let cache = Arc::new(HostCache::new());
        let reconciler = Arc::new(Reconciler::new(cache.clone(), reqwest::Client::new()));
        reconciler.load_file(&path).unwrap();

        let shutdown = CancellationToken::new();
        let watcher = {
            let reconciler = reconciler.clone();
            let path = path.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                reconciler
                    .watch(path, Duration::from_millis(20), shutdown)
                    .await
            })
        };

        std::fs::write(&path, "- name: talker\n  hosts: [\"talker-api\"]\n").unwrap();

        let mut removed = false;
        for _ in 0..100 {
            if cache.get("admin-api").is_none() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        watcher.await.unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert!(removed, "watcher should drop the removed configuration");
        assert!(cache.get("talker-api").is_some());
    }
}
