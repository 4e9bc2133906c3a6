use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheKind, CacheStore};
use crate::error::StorageResult;

/// Process-local cache store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> StorageResult<()> {
        self.entries
            .write()
            .await
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self, kind: Option<CacheKind>) -> StorageResult<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        match kind {
            Some(kind) => entries.retain(|_, entry| entry.kind != kind),
            None => entries.clear(),
        }
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(key: &str, kind: CacheKind) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            kind,
            payload: "{}".to_string(),
            created_at: Utc::now(),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryCacheStore::new();
        store.put(&entry("a", CacheKind::DataRows)).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());
        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        store.remove("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_by_kind() {
        let store = MemoryCacheStore::new();
        store.put(&entry("catalog/2023", CacheKind::Catalog)).await.unwrap();
        store.put(&entry("rows/1", CacheKind::DataRows)).await.unwrap();
        store.put(&entry("rows/2", CacheKind::DataRows)).await.unwrap();

        assert_eq!(store.clear(Some(CacheKind::DataRows)).await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.clear(None).await.unwrap(), 1);
        assert!(store.is_empty().await);
    }
}
