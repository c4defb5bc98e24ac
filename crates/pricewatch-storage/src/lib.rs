//! Key/value persistence surface for the dedup engine plus retry timing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json stored under {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key/value surface supplied by the hosting environment.
///
/// No transactions and no compare-and-set: a single writer per store is assumed.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn open(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn set(&self, key: &str, value: JsonValue) -> Result<(), StoreError>;

    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, JsonValue>,
    fail_open: bool,
    failing_sets: usize,
    failing_set_prefix: Option<String>,
    failing_gets: usize,
    set_calls: usize,
}

/// In-process store. Failures can be scheduled to exercise retry and rollback paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, JsonValue)>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: entries.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    /// The next `n` calls to `set` fail with `StoreError::Unavailable`.
    pub async fn fail_next_sets(&self, n: usize) {
        let mut state = self.state.lock().await;
        state.failing_sets = n;
        state.failing_set_prefix = None;
    }

    /// Like `fail_next_sets`, but only writes to keys starting with `prefix` fail or count down.
    pub async fn fail_sets_with_prefix(&self, prefix: impl Into<String>, n: usize) {
        let mut state = self.state.lock().await;
        state.failing_sets = n;
        state.failing_set_prefix = Some(prefix.into());
    }

    /// The next `n` calls to `get` fail with `StoreError::Unavailable`.
    pub async fn fail_next_gets(&self, n: usize) {
        self.state.lock().await.failing_gets = n;
    }

    pub async fn fail_open(&self, fail: bool) {
        self.state.lock().await.fail_open = fail;
    }

    /// Number of `set` calls attempted, failed ones included.
    pub async fn set_calls(&self) -> usize {
        self.state.lock().await.set_calls
    }

    pub async fn snapshot(&self) -> BTreeMap<String, JsonValue> {
        self.state.lock().await.entries.clone()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn open(&self) -> Result<(), StoreError> {
        if self.state.lock().await.fail_open {
            return Err(StoreError::Unavailable("memory store refused open".to_string()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(StoreError::Unavailable(format!("injected read failure for {key}")));
        }
        Ok(state.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.set_calls += 1;
        let targeted = state
            .failing_set_prefix
            .as_deref()
            .is_none_or(|prefix| key.starts_with(prefix));
        if targeted && state.failing_sets > 0 {
            state.failing_sets -= 1;
            return Err(StoreError::Unavailable(format!("injected write failure for {key}")));
        }
        state.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().await.entries.keys().cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().await.entries.remove(key);
        Ok(())
    }
}

/// One JSON document per key under a root directory, replaced atomically on write.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            target: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn open(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::io_error(&self.root, e))
    }

    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json {
                key: key.to_string(),
                source,
            })
    }

    /// Writes a uniquely named temp file next to the target, then renames it into place.
    async fn set(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec(&value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| Self::io_error(&temp_path, e))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_error(&temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_error(&path, err));
        }
        debug!(key, bytes = bytes.len(), "stored document");
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| Self::io_error(&self.root, e))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_store_round_trips_and_replaces_documents() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("state"));
        store.open().await.expect("open");

        assert_eq!(store.get("seen_listings").await.expect("get"), None);
        store
            .set("seen_listings", json!([{"fingerprint": "a", "lastSeen": 1}]))
            .await
            .expect("first set");
        store
            .set("seen_listings", json!([{"fingerprint": "b", "lastSeen": 2}]))
            .await
            .expect("second set");

        let value = store.get("seen_listings").await.expect("get").expect("present");
        assert_eq!(value[0]["fingerprint"], "b");

        let leftovers = std::fs::read_dir(store.root())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_store_lists_and_deletes_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        store.open().await.expect("open");
        store.set("price_history_b", json!([])).await.expect("set");
        store.set("price_history_a", json!([])).await.expect("set");

        assert_eq!(
            store.list_keys().await.expect("list"),
            vec!["price_history_a".to_string(), "price_history_b".to_string()]
        );

        store.delete("price_history_a").await.expect("delete");
        store.delete("price_history_a").await.expect("delete missing is a no-op");
        assert_eq!(store.list_keys().await.expect("list"), vec!["price_history_b".to_string()]);
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let err = store.set("../escape", json!(1)).await.expect_err("invalid key");
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn memory_store_consumes_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_sets(1).await;
        assert!(store.set("k", json!(1)).await.is_err());
        store.set("k", json!(2)).await.expect("second set succeeds");
        assert_eq!(store.set_calls().await, 2);
        assert_eq!(store.get("k").await.expect("get"), Some(json!(2)));

        store.fail_sets_with_prefix("price_history_", 1).await;
        store.set("seen_listings", json!(3)).await.expect("untargeted key");
        assert!(store.set("price_history_x", json!(3)).await.is_err());
        store.set("price_history_x", json!(4)).await.expect("budget consumed");

        store.fail_next_gets(1).await;
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_ok());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
