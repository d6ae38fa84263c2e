//! Key-value store used as both cache and durable session store.
//!
//! The core only relies on the [`KeyValueStore`] trait. [`MemoryStore`] is the
//! bundled backend: an in-process map with TTLs that can be snapshotted to a
//! JSON file so sessions survive a restart.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::utils::get_timestamp;

/// String-keyed store with expiry, cursor scans and atomic counters.
///
/// `scan` follows the Redis cursor convention: start with cursor `0`, keep
/// calling with the returned cursor until it comes back as `0`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;
    async fn disconnect(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn scan(
        &self,
        cursor: u64,
        prefix: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    /// Applies every increment or none of them, re-arming `ttl` on each
    /// touched key. Returns the new values in input order.
    async fn incr_many_with_expiry(
        &self,
        increments: &[(String, i64)],
        ttl: Duration,
    ) -> Result<Vec<i64>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Entry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreSnapshot {
    saved_at: u64,
    entries: BTreeMap<String, Entry>,
}

/// In-process [`KeyValueStore`] with optional JSON snapshot persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    snapshot_path: Option<PathBuf>,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that loads `path` on connect and writes it back on disconnect.
    ///
    /// Both are no-ops when already in that state, so a second connect never
    /// replaces live keys and a disconnect before connect never overwrites
    /// the file.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = get_timestamp();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn load_snapshot(&self, path: &PathBuf) -> Result<(), StoreError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No store snapshot at {}, starting empty", path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(StoreError::Connection(format!(
                    "cannot read snapshot {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let snapshot: StoreSnapshot = serde_json::from_str(&raw).map_err(|e| {
            StoreError::Connection(format!("corrupt snapshot {}: {}", path.display(), e))
        })?;

        let now = get_timestamp();
        let total = snapshot.entries.len();
        let live: BTreeMap<String, Entry> = snapshot
            .entries
            .into_iter()
            .filter(|(_, entry)| entry.is_live(now))
            .collect();

        info!(
            "Loaded {} keys from {} ({} expired while offline)",
            live.len(),
            path.display(),
            total - live.len()
        );
        *self.entries.write().await = live;
        Ok(())
    }

    async fn write_snapshot(&self, path: &PathBuf) -> Result<(), StoreError> {
        let now = get_timestamp();
        let snapshot = {
            let entries = self.entries.read().await;
            StoreSnapshot {
                saved_at: now,
                entries: entries
                    .iter()
                    .filter(|(_, entry)| entry.is_live(now))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }
        };

        let json = serde_json::to_string(&snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::backend("snapshot", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::backend("snapshot", e))?;

        debug!("Wrote {} keys to {}", snapshot.entries.len(), path.display());
        Ok(())
    }

    async fn insert(&self, key: &str, value: &str, expires_at: Option<u64>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            debug!("Store already connected");
            return Ok(());
        }
        if let Some(path) = &self.snapshot_path {
            self.load_snapshot(path).await?;
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Ok(());
        }
        if let Some(path) = &self.snapshot_path {
            self.write_snapshot(path).await?;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = get_timestamp();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.insert(key, value, None).await;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = get_timestamp() + ttl.as_millis() as u64;
        self.insert(key, value, Some(expires_at)).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = get_timestamp();
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .map_or(false, |entry| entry.is_live(now)))
    }

    async fn scan(
        &self,
        cursor: u64,
        prefix: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        if count == 0 {
            return Err(StoreError::InvalidArgument("scan count must be > 0".into()));
        }

        let now = get_timestamp();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.is_live(now));

        let matching = entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key);

        let offset = cursor as usize;
        let keys: Vec<String> = matching.clone().skip(offset).take(count).cloned().collect();
        let consumed = offset + keys.len();
        let next = if matching.count() > consumed {
            consumed as u64
        } else {
            0
        };

        Ok((next, keys))
    }

    async fn incr_many_with_expiry(
        &self,
        increments: &[(String, i64)],
        ttl: Duration,
    ) -> Result<Vec<i64>, StoreError> {
        let now = get_timestamp();
        let expires_at = now + ttl.as_millis() as u64;
        let mut entries = self.entries.write().await;

        // Compute every result before touching the map so a bad key aborts the batch.
        let mut results = Vec::with_capacity(increments.len());
        let mut pending: HashMap<&str, i64> = HashMap::new();
        for (key, delta) in increments {
            let base = match pending.get(key.as_str()) {
                Some(value) => *value,
                None => match entries.get(key).filter(|entry| entry.is_live(now)) {
                    Some(entry) => entry.value.parse::<i64>().map_err(|_| {
                        StoreError::InvalidArgument(format!("value at {} is not an integer", key))
                    })?,
                    None => 0,
                },
            };
            let value = base.saturating_add(*delta);
            pending.insert(key.as_str(), value);
            results.push(value);
        }

        for (key, value) in pending {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(expires_at),
                },
            );
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("short", "x", Duration::from_millis(10))
            .await
            .unwrap();
        store
            .set_with_ttl("long", "y", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("y"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_scan_paginates_until_zero() {
        let store = MemoryStore::new();
        for i in 0..7 {
            store.set(&format!("player:{}", i), "{}").await.unwrap();
        }
        store.set("cache:world_state", "{}").await.unwrap();
        store.set("playerz", "{}").await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        let mut rounds = 0;
        loop {
            let (next, keys) = store.scan(cursor, "player:", 3).await.unwrap();
            seen.extend(keys);
            rounds += 1;
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        assert_eq!(rounds, 3);
        assert_eq!(seen.len(), 7);
        assert!(seen.iter().all(|k| k.starts_with("player:")));
    }

    #[tokio::test]
    async fn test_scan_rejects_zero_count() {
        let store = MemoryStore::new();
        let result = store.scan(0, "", 0).await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_incr_many_with_expiry() {
        let store = MemoryStore::new();
        let increments = vec![("hits:a".to_string(), 2), ("hits:b".to_string(), -1)];

        let first = store
            .incr_many_with_expiry(&increments, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first, vec![2, -1]);

        let second = store
            .incr_many_with_expiry(&increments, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second, vec![4, -2]);
    }

    #[tokio::test]
    async fn test_incr_repeated_key_accumulates() {
        let store = MemoryStore::new();
        let increments = vec![("n".to_string(), 1), ("n".to_string(), 5)];
        let values = store
            .incr_many_with_expiry(&increments, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(values, vec![1, 6]);
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("6"));
    }

    #[tokio::test]
    async fn test_incr_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.set("text", "hello").await.unwrap();

        let increments = vec![("count".to_string(), 1), ("text".to_string(), 1)];
        let result = store
            .incr_many_with_expiry(&increments, Duration::from_secs(60))
            .await;

        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert!(store.get("count").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::with_snapshot(&path);
        store.connect().await.unwrap();
        store.set("keep", "1").await.unwrap();
        store
            .set_with_ttl("session", "2", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_with_ttl("gone", "3", Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.disconnect().await.unwrap();
        assert!(!store.is_connected());

        let restored = MemoryStore::with_snapshot(&path);
        restored.connect().await.unwrap();
        assert!(restored.is_connected());
        assert_eq!(restored.get("keep").await.unwrap().as_deref(), Some("1"));
        assert_eq!(restored.get("session").await.unwrap().as_deref(), Some("2"));
        assert!(restored.get("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"savedAt":1,"entries":{"old":{"value":"1"}}}"#).unwrap();

        let store = MemoryStore::with_snapshot(&path);
        // Not connected yet: the file is left alone.
        store.disconnect().await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("old"));

        store.connect().await.unwrap();
        store.set("new", "2").await.unwrap();
        // A second connect keeps the live keys.
        store.connect().await.unwrap();
        assert_eq!(store.get("new").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("old").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_snapshot(dir.path().join("absent.json"));
        store.connect().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();

        let store = MemoryStore::with_snapshot(&path);
        let result = store.connect().await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
        assert!(!store.is_connected());
    }
}
