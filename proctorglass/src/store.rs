// proctorglass/src/store.rs
//
// Keyed upsert/read contract the scoring core persists through. Two
// implementations, picked at construction time:
//
//   MemoryStore — DashMap; the default, and the test harness
//   JsonlStore  — append-only JSONL file, replayed at open (last write
//                 per key wins)
//
// The core behaves identically against either; the file store only adds
// durability across restarts.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{CoreError, Result};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn upsert(&self, key: &str, value: String) -> Result<()>;
}

// ── In-memory store ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn upsert(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

// ── JSONL-backed store ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct JsonlEntry {
    key: String,
    value: String,
}

pub struct JsonlStore {
    path: PathBuf,
    entries: DashMap<String, String>,
    // Serializes appends so records never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlStore {
    /// Open (or create) the backing file and replay it into memory.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path: PathBuf = path.into();
        let entries = DashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let mut replayed = 0usize;
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Ok(entry) = serde_json::from_str::<JsonlEntry>(line) {
                        entries.insert(entry.key, entry.value);
                        replayed += 1;
                    }
                }
                info!(path = %path.display(), replayed, keys = entries.len(), "store replayed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::Store(e.to_string())),
        }

        Ok(Self { path, entries, write_lock: tokio::sync::Mutex::new(()) })
    }
}

#[async_trait]
impl KvStore for JsonlStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn upsert(&self, key: &str, value: String) -> Result<()> {
        let line = serde_json::to_string(&JsonlEntry {
            key: key.to_string(),
            value: value.clone(),
        })
        .map_err(|e| CoreError::Store(e.to_string()))? + "\n";

        let _guard = self.write_lock.lock().await;
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        f.write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.upsert("k", "v1".to_string()).await.unwrap();
        store.upsert("k", "v2".to_string()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), "v2");
    }

    #[tokio::test]
    async fn jsonl_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!("pg_store_{}.jsonl", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        {
            let store = JsonlStore::open(&path).await.unwrap();
            store.upsert("a", "1".to_string()).await.unwrap();
            store.upsert("b", "2".to_string()).await.unwrap();
            store.upsert("a", "3".to_string()).await.unwrap();
        }

        let reopened = JsonlStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap().unwrap(), "3"); // last write wins
        assert_eq!(reopened.get("b").await.unwrap().unwrap(), "2");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
