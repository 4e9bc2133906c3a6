//! Cache of expensive lookups.
//!
//! Three entry kinds with their own freshness rules:
//!
//! | Kind | Key | TTL |
//! |------|-----|-----|
//! | catalog | ACS year | `CATALOG_TTL_DAYS` (14 by default) |
//! | data rows | year, state, region set, indicator set | none |
//! | region areas | gazetteer vintage, state | none |
//!
//! Entries without TTL stay until explicitly invalidated. Conversation state
//! is never cached here; it lives in [`crate::context`] for the process
//! lifetime.
//!
//! [`CacheManager::get_or_fetch`] serializes work per key: concurrent misses
//! for the same key share one fetch.

mod memory;
mod sqlite;

pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{StorageError, StorageResult};

/// Entry kind, stored alongside each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Catalog,
    DataRows,
    RegionAreas,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Catalog => "catalog",
            CacheKind::DataRows => "data_rows",
            CacheKind::RegionAreas => "region_areas",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "catalog" => Ok(CacheKind::Catalog),
            "data_rows" => Ok(CacheKind::DataRows),
            "region_areas" => Ok(CacheKind::RegionAreas),
            other => Err(StorageError::Query {
                message: format!("unknown cache kind '{}'", other),
            }),
        }
    }
}

/// Composite cache key: entry kind plus its typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Catalog {
        year: u16,
    },
    /// Region and indicator sets are kept sorted and deduplicated.
    DataRows {
        year: u16,
        state: String,
        regions: Vec<String>,
        indicators: Vec<String>,
    },
    RegionAreas {
        vintage: u16,
        state: String,
    },
}

fn sorted_set<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut items: Vec<String> = items.into_iter().map(Into::into).collect();
    items.sort();
    items.dedup();
    items
}

impl CacheKey {
    pub fn catalog(year: u16) -> Self {
        CacheKey::Catalog { year }
    }

    /// Key for fetched rows. An empty region set means statewide.
    pub fn data_rows<R, I>(
        year: u16,
        state: impl Into<String>,
        regions: impl IntoIterator<Item = R>,
        indicators: impl IntoIterator<Item = I>,
    ) -> Self
    where
        R: Into<String>,
        I: Into<String>,
    {
        CacheKey::DataRows {
            year,
            state: state.into(),
            regions: sorted_set(regions),
            indicators: sorted_set(indicators),
        }
    }

    pub fn region_areas(vintage: u16, state: impl Into<String>) -> Self {
        CacheKey::RegionAreas {
            vintage,
            state: state.into(),
        }
    }

    pub fn kind(&self) -> CacheKind {
        match self {
            CacheKey::Catalog { .. } => CacheKind::Catalog,
            CacheKey::DataRows { .. } => CacheKind::DataRows,
            CacheKey::RegionAreas { .. } => CacheKind::RegionAreas,
        }
    }

    /// Canonical string form used by stores.
    pub fn storage_key(&self) -> String {
        match self {
            CacheKey::Catalog { year } => format!("catalog/{}", year),
            CacheKey::DataRows {
                year,
                state,
                regions,
                indicators,
            } => {
                let regions = if regions.is_empty() {
                    "*".to_string()
                } else {
                    regions.join(",")
                };
                format!("data_rows/{}/{}/{}/{}", year, state, regions, indicators.join(","))
            }
            CacheKey::RegionAreas { vintage, state } => {
                format!("region_areas/{}/{}", vintage, state)
            }
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A stored payload with its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub kind: CacheKind,
    /// Serialized JSON value.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// `None` keeps the entry until explicit invalidation.
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    /// Whether the entry may still be served at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            None => true,
            Some(ttl) => now.signed_duration_since(self.created_at) < ttl,
        }
    }
}

/// Time-to-live per entry kind.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub catalog_ttl: Duration,
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            catalog_ttl: Duration::days(config.catalog_ttl_days),
        }
    }

    pub fn ttl_for(&self, kind: CacheKind) -> Option<Duration> {
        match kind {
            CacheKind::Catalog => Some(self.catalog_ttl),
            CacheKind::DataRows | CacheKind::RegionAreas => None,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Key-value persistence behind the cache manager.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch an entry. A malformed persisted entry yields [`StorageError::Corrupt`].
    async fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>>;

    /// Insert or replace an entry.
    async fn put(&self, entry: &CacheEntry) -> StorageResult<()>;

    /// Remove one entry; missing keys are not an error.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Remove all entries, or all of one kind. Returns the number removed.
    async fn clear(&self, kind: Option<CacheKind>) -> StorageResult<u64>;
}

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Served from a fresh entry.
    Hit,
    /// No entry existed; fetched and stored.
    Fetched,
    /// The entry had expired; refetched and overwritten.
    Refreshed,
    /// The entry was unreadable; refetched and overwritten.
    Recovered,
}

/// A value plus how the cache produced it.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub source: CacheSource,
    /// Problems the cache recovered from (corrupt entries, failed writes).
    pub warnings: Vec<String>,
}

/// A caller's claim on a key's fetch lock. Dropping it, including when the
/// caller's future is cancelled, removes the map entry once nobody else
/// holds the lock.
struct InFlight<'a> {
    manager: &'a CacheManager,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .manager
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map's reference plus ours: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            in_flight.remove(&self.key);
        }
    }
}

/// Read-through cache with per-key fetch coalescing.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    policy: CachePolicy,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, policy: CachePolicy) -> Self {
        Self {
            store,
            policy,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Join or start the in-flight slot for `key`.
    fn in_flight_slot(&self, key: &str) -> InFlight<'_> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        InFlight {
            manager: self,
            key: key.to_string(),
            lock,
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Fresh, readable entry for `key`, if any. Problems are left to the
    /// locked path, which records them.
    async fn fresh_hit<T: DeserializeOwned>(&self, storage_key: &str) -> Option<T> {
        let entry = self.store.get(storage_key).await.ok().flatten()?;
        if !entry.is_fresh(Utc::now()) {
            return None;
        }
        serde_json::from_str(&entry.payload).ok()
    }

    /// Return the cached value for `key`, or fetch, store and return it.
    ///
    /// Hits are served without taking the key lock. Concurrent misses for
    /// the same key wait for the first fetch and then read its result.
    /// Unreadable entries count as misses. Fetch errors are returned
    /// unchanged and nothing is written.
    pub async fn get_or_fetch<T, E, F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let storage_key = key.storage_key();
        if let Some(value) = self.fresh_hit(&storage_key).await {
            debug!(key = %storage_key, "Cache hit");
            return Ok(Cached {
                value,
                source: CacheSource::Hit,
                warnings: Vec::new(),
            });
        }

        let slot = self.in_flight_slot(&storage_key);
        let _guard = slot.lock.lock().await;
        self.read_through(key, &storage_key, fetch).await
    }

    async fn read_through<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        storage_key: &str,
        fetch: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut warnings = Vec::new();
        let mut source = CacheSource::Fetched;
        let mut existing: Option<CacheEntry> = None;

        match self.store.get(storage_key).await {
            Ok(Some(entry)) if entry.is_fresh(Utc::now()) => {
                match serde_json::from_str::<T>(&entry.payload) {
                    Ok(value) => {
                        debug!(key = %storage_key, "Cache hit");
                        return Ok(Cached {
                            value,
                            source: CacheSource::Hit,
                            warnings,
                        });
                    }
                    Err(e) => {
                        let err = StorageError::Corrupt {
                            key: storage_key.to_string(),
                            message: e.to_string(),
                        };
                        warn!(error = %err, "Discarding unreadable cache entry");
                        warnings.push(err.to_string());
                        source = CacheSource::Recovered;
                    }
                }
            }
            Ok(Some(entry)) => {
                debug!(key = %storage_key, created_at = %entry.created_at, "Cache entry expired");
                source = CacheSource::Refreshed;
                existing = Some(entry);
            }
            Ok(None) => debug!(key = %storage_key, "Cache miss"),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Cache read failed, refetching");
                warnings.push(e.to_string());
                source = CacheSource::Recovered;
            }
        }

        let value = fetch().await?;

        match serde_json::to_string(&value) {
            Ok(payload) => {
                if let Err(e) = self.write(key, payload, existing.as_ref()).await {
                    warn!(key = %storage_key, error = %e, "Cache write failed");
                    warnings.push(e.to_string());
                }
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Value not serializable, not cached");
                warnings.push(format!("value for {} not cached: {}", storage_key, e));
            }
        }

        info!(key = %storage_key, source = ?source, "Cache filled");
        Ok(Cached {
            value,
            source,
            warnings,
        })
    }

    /// Write-through with idempotence: an identical payload is a no-op,
    /// except for catalog entries whose timestamp is refreshed.
    async fn write(
        &self,
        key: &CacheKey,
        payload: String,
        existing: Option<&CacheEntry>,
    ) -> StorageResult<()> {
        let kind = key.kind();
        if let Some(current) = existing {
            if current.payload == payload && kind != CacheKind::Catalog {
                debug!(key = %current.key, "Identical payload, write skipped");
                return Ok(());
            }
        }

        let entry = CacheEntry {
            key: key.storage_key(),
            kind,
            payload,
            created_at: Utc::now(),
            ttl: self.policy.ttl_for(kind),
        };
        self.store.put(&entry).await
    }

    /// Store a value directly, following the same idempotence rule.
    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T) -> StorageResult<()> {
        let payload = serde_json::to_string(value)?;
        let storage_key = key.storage_key();
        let existing = match self.store.get(&storage_key).await {
            Ok(entry) => entry,
            Err(StorageError::Corrupt { .. }) => None,
            Err(e) => return Err(e),
        };
        self.write(key, payload, existing.as_ref()).await
    }

    /// Drop one entry.
    pub async fn invalidate(&self, key: &CacheKey) -> StorageResult<()> {
        info!(key = %key, "Invalidating cache entry");
        self.store.remove(&key.storage_key()).await
    }

    /// Drop all entries, or all of one kind.
    pub async fn clear(&self, kind: Option<CacheKind>) -> StorageResult<u64> {
        let removed = self.store.clear(kind).await?;
        info!(kind = ?kind, removed, "Cache cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_rows_key_is_order_independent() {
        let a = CacheKey::data_rows(2023, "22", ["071", "017"], ["B2_001E", "B1_001E", "B2_001E"]);
        let b = CacheKey::data_rows(2023, "22", ["017", "071"], ["B1_001E", "B2_001E"]);
        assert_eq!(a, b);
        assert_eq!(a.storage_key(), "data_rows/2023/22/017,071/B1_001E,B2_001E");
    }

    #[test]
    fn test_statewide_key() {
        let key = CacheKey::data_rows(2023, "22", Vec::<String>::new(), ["B1_001E"]);
        assert_eq!(key.storage_key(), "data_rows/2023/22/*/B1_001E");
        assert_eq!(key.kind(), CacheKind::DataRows);
    }

    #[test]
    fn test_other_keys() {
        assert_eq!(CacheKey::catalog(2023).storage_key(), "catalog/2023");
        assert_eq!(
            CacheKey::region_areas(2024, "22").storage_key(),
            "region_areas/2024/22"
        );
    }

    #[test]
    fn test_policy_ttls() {
        let policy = CachePolicy::default();
        assert_eq!(policy.ttl_for(CacheKind::Catalog), Some(Duration::days(14)));
        assert_eq!(policy.ttl_for(CacheKind::DataRows), None);
        assert_eq!(policy.ttl_for(CacheKind::RegionAreas), None);
    }

    #[test]
    fn test_entry_freshness() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "catalog/2023".to_string(),
            kind: CacheKind::Catalog,
            payload: "[]".to_string(),
            created_at: now - Duration::days(15),
            ttl: Some(Duration::days(14)),
        };
        assert!(!entry.is_fresh(now));

        let permanent = CacheEntry {
            ttl: None,
            ..entry.clone()
        };
        assert!(permanent.is_fresh(now));

        let recent = CacheEntry {
            created_at: now - Duration::days(1),
            ..entry
        };
        assert!(recent.is_fresh(now));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [CacheKind::Catalog, CacheKind::DataRows, CacheKind::RegionAreas] {
            assert_eq!(kind.as_str().parse::<CacheKind>().unwrap(), kind);
        }
        assert!("thoughts".parse::<CacheKind>().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let manager = CacheManager::new(Arc::new(MemoryCacheStore::new()), CachePolicy::default());
        let key = CacheKey::catalog(2023);

        let slow = manager.get_or_fetch(&key, || async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok::<_, String>(1)
        });
        let impatient = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            manager.get_or_fetch(&key, || async { Ok::<_, String>(2) }),
        );
        let (first, second) = tokio::join!(slow, impatient);

        assert_eq!(first.unwrap().value, 1);
        assert!(second.is_err());
        assert_eq!(manager.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_hits_do_not_wait_for_key_lock() {
        let manager = CacheManager::new(Arc::new(MemoryCacheStore::new()), CachePolicy::default());
        let key = CacheKey::catalog(2023);
        manager.put(&key, &7).await.unwrap();

        let slot = manager.in_flight_slot(&key.storage_key());
        let _held = slot.lock.lock().await;

        let cached = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            manager.get_or_fetch(&key, || async { Ok::<i32, String>(0) }),
        )
        .await
        .expect("a hit must not wait for the key lock")
        .unwrap();
        assert_eq!(cached.source, CacheSource::Hit);
        assert_eq!(cached.value, 7);
    }
}
