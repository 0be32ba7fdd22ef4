use crate::storage::kv::{CasOutcome, DynKvStore, update_with_retry};
use crate::{CairnError, HashAlgorithm, Result, RevisionRetention};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const SETTINGS_KEY: &str = "cluster";

const MAX_INTERNODE_TIMEOUT_MS: u64 = 60 * 60 * 1000;
const MAX_NODE_STALE_AFTER_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_RECONCILE_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Cluster-wide tunables. Readers take a snapshot; reloads swap in a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub min_replicas: usize,
    pub revision_retention: RevisionRetention,
    pub hash: HashAlgorithm,
    pub internode_timeout_ms: u64,
    pub node_stale_after_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            min_replicas: 3,
            revision_retention: RevisionRetention::Limited(5),
            hash: HashAlgorithm::Sha256,
            internode_timeout_ms: 5_000,
            node_stale_after_secs: 60,
            reconcile_interval_secs: 300,
        }
    }
}

impl ClusterSettings {
    /// Rejects settings a node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.min_replicas == 0 {
            return Err(CairnError::Config(
                "min_replicas must be at least 1".to_string(),
            ));
        }
        if self.internode_timeout_ms == 0 || self.internode_timeout_ms > MAX_INTERNODE_TIMEOUT_MS {
            return Err(CairnError::Config(format!(
                "internode_timeout_ms must be between 1 and {}",
                MAX_INTERNODE_TIMEOUT_MS
            )));
        }
        if self.node_stale_after_secs == 0 || self.node_stale_after_secs > MAX_NODE_STALE_AFTER_SECS {
            return Err(CairnError::Config(format!(
                "node_stale_after_secs must be between 1 and {}",
                MAX_NODE_STALE_AFTER_SECS
            )));
        }
        if self.reconcile_interval_secs > MAX_RECONCILE_INTERVAL_SECS {
            return Err(CairnError::Config(format!(
                "reconcile_interval_secs must be at most {}",
                MAX_RECONCILE_INTERVAL_SECS
            )));
        }
        Ok(())
    }

    pub fn internode_timeout(&self) -> Duration {
        Duration::from_millis(self.internode_timeout_ms.clamp(1, MAX_INTERNODE_TIMEOUT_MS))
    }

    /// Heartbeat age past which a node counts as gone. Clamped, since settings
    /// read back from the store may predate validation.
    pub fn node_stale_after(&self) -> chrono::Duration {
        let secs = self.node_stale_after_secs.clamp(1, MAX_NODE_STALE_AFTER_SECS);
        chrono::Duration::try_seconds(secs as i64).unwrap_or(chrono::Duration::MAX)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.clamp(1, MAX_RECONCILE_INTERVAL_SECS))
    }
}

/// Shared pointer to the current settings snapshot.
#[derive(Clone)]
pub struct SettingsHandle {
    current: Arc<RwLock<Arc<ClusterSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: ClusterSettings) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// The settings in force right now. Later `replace` calls do not affect it.
    pub fn snapshot(&self) -> Arc<ClusterSettings> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, settings: ClusterSettings) {
        let next = Arc::new(settings);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

/// Persisted copy of the settings in the `settings` namespace.
#[derive(Clone)]
pub struct SettingsStore {
    kv: DynKvStore,
}

impl SettingsStore {
    pub fn new(kv: DynKvStore) -> Self {
        Self { kv }
    }

    pub async fn load(&self) -> Result<Option<ClusterSettings>> {
        match self.kv.get(SETTINGS_KEY).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Validates and persists `settings` for every node sharing the store.
    pub async fn save(&self, settings: &ClusterSettings) -> Result<()> {
        settings.validate()?;
        let encoded = serde_json::to_vec(settings)?;
        update_with_retry(self.kv.as_ref(), SETTINGS_KEY, |_| Ok(encoded.clone())).await?;
        Ok(())
    }

    /// Stores `initial` unless settings were already persisted, and returns
    /// whichever copy is now authoritative.
    pub async fn load_or_init(&self, initial: &ClusterSettings) -> Result<ClusterSettings> {
        if let Some(existing) = self.load().await? {
            return Ok(existing);
        }

        initial.validate()?;
        let encoded = serde_json::to_vec(initial)?;
        match self.kv.put_if(SETTINGS_KEY, None, encoded).await? {
            CasOutcome::Committed(_) => Ok(initial.clone()),
            CasOutcome::Conflict => self.load().await?.ok_or_else(|| {
                CairnError::Internal("cluster settings vanished after conflict".to_string())
            }),
        }
    }

    /// Re-reads the persisted settings into `handle`. The hash algorithm is
    /// fixed for the lifetime of the process and is never swapped.
    pub async fn reload_into(&self, handle: &SettingsHandle) -> Result<bool> {
        let Some(mut loaded) = self.load().await? else {
            return Ok(false);
        };

        let current = handle.snapshot();
        if loaded.hash != current.hash {
            tracing::warn!(
                "ignoring hash change {:?} -> {:?} until restart",
                current.hash,
                loaded.hash
            );
            loaded.hash = current.hash;
        }

        if loaded == *current {
            return Ok(false);
        }

        tracing::info!("cluster settings reloaded: {:?}", loaded);
        handle.replace(loaded);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKv;

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let store = SettingsStore::new(Arc::new(MemoryKv::new()));
        let initial = store.load_or_init(&ClusterSettings::default()).await.unwrap();
        let handle = SettingsHandle::new(initial);
        let before = handle.snapshot();

        let mut changed = ClusterSettings::default();
        changed.min_replicas = 2;
        changed.hash = HashAlgorithm::Sha512;
        store.save(&changed).await.unwrap();

        assert!(store.reload_into(&handle).await.unwrap());
        let after = handle.snapshot();
        assert_eq!(after.min_replicas, 2);
        assert_eq!(after.hash, HashAlgorithm::Sha256);
        assert_eq!(before.min_replicas, 3);

        assert!(!store.reload_into(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_or_init_keeps_existing() {
        let store = SettingsStore::new(Arc::new(MemoryKv::new()));
        let mut first = ClusterSettings::default();
        first.min_replicas = 1;
        store.load_or_init(&first).await.unwrap();

        let loaded = store
            .load_or_init(&ClusterSettings::default())
            .await
            .unwrap();
        assert_eq!(loaded.min_replicas, 1);
    }

    #[test]
    fn test_out_of_range_durations_are_rejected_and_clamped() {
        let huge = ClusterSettings {
            node_stale_after_secs: 10_000_000_000_000_000,
            ..ClusterSettings::default()
        };
        assert!(huge.validate().is_err());
        // a stored value that skipped validation still yields a usable window
        assert_eq!(
            huge.node_stale_after(),
            chrono::Duration::seconds(MAX_NODE_STALE_AFTER_SECS as i64)
        );

        let slow = ClusterSettings {
            internode_timeout_ms: u64::MAX,
            ..ClusterSettings::default()
        };
        assert!(slow.validate().is_err());
        assert_eq!(
            slow.internode_timeout(),
            Duration::from_millis(MAX_INTERNODE_TIMEOUT_MS)
        );

        let never_stale = ClusterSettings {
            node_stale_after_secs: 0,
            ..ClusterSettings::default()
        };
        assert!(never_stale.validate().is_err());
        assert!(ClusterSettings::default().validate().is_ok());
    }

    #[test]
    fn test_settings_wire_format() {
        let parsed: ClusterSettings =
            serde_json::from_str(r#"{"min_replicas": 2, "revision_retention": -1}"#).unwrap();
        assert_eq!(parsed.min_replicas, 2);
        assert_eq!(parsed.revision_retention, RevisionRetention::Unlimited);
        assert_eq!(parsed.hash, HashAlgorithm::Sha256);

        assert!(serde_json::from_str::<ClusterSettings>(r#"{"revision_retention": -3}"#).is_err());
        let zero = ClusterSettings {
            min_replicas: 0,
            ..ClusterSettings::default()
        };
        assert!(zero.validate().is_err());
    }
}
