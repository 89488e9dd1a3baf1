use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::TimeStore;
use crate::error::StoreError;

/// On-disk record. `joinTime` is kept for file compatibility and is always
/// written as null.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Entry {
    #[serde(rename = "totalTime")]
    total_time: u64,
    #[serde(rename = "joinTime", default)]
    join_time: Option<u64>,
}

type Document = BTreeMap<String, Entry>;

/// Stores all totals in a single JSON object keyed by user id.
pub struct JsonFileStore {
    path: PathBuf,
    // Serialises read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_document(&self) -> Result<Document, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "data file not found, starting empty");
                return Ok(Document::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if raw.trim().is_empty() {
            return Ok(Document::new());
        }
        serde_json::from_str(&raw).map_err(|source| StoreError::Json {
            path: self.path.display().to_string(),
            source,
        })
    }

    async fn write_totals<'a>(
        &self,
        totals: impl Iterator<Item = (&'a String, &'a u64)>,
    ) -> Result<(), StoreError> {
        let document: Document = totals
            .map(|(user_id, total)| {
                (
                    user_id.clone(),
                    Entry {
                        total_time: *total,
                        join_time: None,
                    },
                )
            })
            .collect();
        let content = serde_json::to_string_pretty(&document).map_err(|source| StoreError::Json {
            path: self.path.display().to_string(),
            source,
        })?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes()))
            .await?
            .map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), users = document.len(), "data file written");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

/// Writes to a temp file beside `path` and renames it into place.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn totals_of(document: Document) -> HashMap<String, u64> {
    document
        .into_iter()
        .map(|(user_id, entry)| (user_id, entry.total_time))
        .collect()
}

#[async_trait]
impl TimeStore for JsonFileStore {
    async fn load_all(&self) -> Result<HashMap<String, u64>, StoreError> {
        Ok(totals_of(self.read_document().await?))
    }

    async fn flush_all(&self, totals: &HashMap<String, u64>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_totals(totals.iter()).await
    }

    async fn apply_delta(&self, user_id: &str, delta_ms: u64) -> Result<(), StoreError> {
        self.apply_delta_all(&[user_id.to_string()], delta_ms).await
    }

    async fn apply_delta_all(&self, user_ids: &[String], delta_ms: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut totals = totals_of(self.read_document().await?);
        for user_id in user_ids {
            let total = totals.entry(user_id.clone()).or_insert(0);
            *total = total.saturating_add(delta_ms);
        }
        self.write_totals(totals.iter()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn totals(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("user_times.json"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delta_inserts_then_accumulates() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("user_times.json"));
        store.apply_delta("u1", 1_500).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), totals(&[("u1", 1_500)]));
        store.apply_delta("u1", 2_000).await.unwrap();
        store.apply_delta("u2", 10).await.unwrap();
        assert_eq!(
            store.load_all().await.unwrap(),
            totals(&[("u1", 3_500), ("u2", 10)])
        );
    }

    #[tokio::test]
    async fn flush_replaces_and_round_trips() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("user_times.json"));
        store.apply_delta("stale", 99).await.unwrap();

        let written = totals(&[("a", 5_000), ("b", 0), ("c", 12_000)]);
        store.flush_all(&written).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, written);

        store.flush_all(&loaded).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), written);
    }

    #[tokio::test]
    async fn file_layout_keeps_join_time_null() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("user_times.json");
        let store = JsonFileStore::new(&path);
        store.flush_all(&totals(&[("42", 7)])).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, serde_json::json!({ "42": { "totalTime": 7, "joinTime": null } }));
    }

    #[tokio::test]
    async fn stored_join_time_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("user_times.json");
        std::fs::write(&path, r#"{"9": {"totalTime": 300, "joinTime": 1700000000000}}"#).unwrap();
        let store = JsonFileStore::new(&path);
        assert_eq!(store.load_all().await.unwrap(), totals(&[("9", 300)]));
    }

    #[tokio::test]
    async fn bulk_delta_writes_every_user() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("user_times.json"));
        store.flush_all(&totals(&[("a", 1)])).await.unwrap();
        store
            .apply_delta_all(&["a".to_string(), "b".to_string()], 60_000)
            .await
            .unwrap();
        assert_eq!(
            store.load_all().await.unwrap(),
            totals(&[("a", 60_001), ("b", 60_000)])
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("user_times.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load_all().await, Err(StoreError::Json { .. })));
        assert!(store.apply_delta("a", 1).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[tokio::test]
    async fn concurrent_deltas_are_not_lost() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileStore::new(dir.path().join("user_times.json")));
        let writes: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.apply_delta("u", 100).await })
            })
            .collect();
        for write in writes {
            write.await.unwrap().unwrap();
        }
        assert_eq!(store.load_all().await.unwrap(), totals(&[("u", 800)]));
    }
}
