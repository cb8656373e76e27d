use super::store::{LocalStore, StoredFile};
use crate::error::GatewayResult;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// `(calendar_day, file_id)`, both already sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub day: String,
    pub file_id: String,
}

impl CacheKey {
    pub fn new(day: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            day: day.into(),
            file_id: file_id.into(),
        }
    }

    /// Key for `file_id` on the UTC day of `now`.
    pub fn for_day(now: DateTime<Utc>, file_id: impl Into<String>) -> Self {
        Self::new(now.format("%Y%m%d").to_string(), file_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub filename: String,
    /// Relative to the storage root.
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub stored_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expires_at <= now
    }

    /// Path component of the public `/local-files/...` URL.
    pub fn url_path(&self) -> String {
        format!(
            "/local-files/{}/{}/{}",
            self.key.day, self.key.file_id, self.filename
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_bytes: u64,
    pub max_files: usize,
    pub ttl: Duration,
}

impl CacheLimits {
    /// Expiry for something stored at `stored_at`, saturating instead of
    /// overflowing.
    pub fn expires_at(&self, stored_at: DateTime<Utc>) -> DateTime<Utc> {
        stored_at
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// The index of what is on disk. Mutations are synchronous and never touch
/// the filesystem; callers delete whatever comes back as evicted.
#[derive(Debug, Default)]
pub struct CacheState {
    total_bytes: u64,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl CacheState {
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_files(&self) -> usize {
        self.entries.len()
    }

    /// Unexpired entry for `key`.
    pub fn get_live(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|e| !e.is_expired(now))
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Insert, then evict soonest-expiring (oldest first on ties) until both
    /// bounds hold. Returns entries whose bytes must be deleted.
    pub fn insert(&mut self, entry: CacheEntry, limits: &CacheLimits) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();

        if let Some(previous) = self.remove(&entry.key) {
            // Same path means the new download already replaced the bytes.
            if previous.local_path != entry.local_path {
                evicted.push(previous);
            }
        }

        self.total_bytes += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);

        while self.total_bytes > limits.max_bytes || self.entries.len() > limits.max_files {
            let victim = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.ttl_expires_at
                        .cmp(&b.ttl_expires_at)
                        .then(a.stored_at.cmp(&b.stored_at))
                        .then(a.key.cmp(&b.key))
                })
                .map(|e| e.key.clone());
            match victim.and_then(|key| self.remove(&key)) {
                Some(removed) => evicted.push(removed),
                None => break,
            }
        }
        evicted
    }

    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let expired: Vec<CacheKey> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        expired.iter().filter_map(|k| self.remove(k)).collect()
    }
}

/// Bounded, TTL-limited index over a [`LocalStore`].
pub struct FileCache {
    state: Mutex<CacheState>,
    limits: CacheLimits,
    store: LocalStore,
}

impl FileCache {
    pub fn new(store: LocalStore, limits: CacheLimits) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            limits,
            store,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    pub fn lookup(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        self.state().get_live(key, now).cloned()
    }

    /// `(files, bytes)` currently indexed.
    pub fn usage(&self) -> (usize, u64) {
        let state = self.state();
        (state.total_files(), state.total_bytes())
    }

    /// Register a stored file. Returns false when the entry was evicted by its
    /// own insertion (it alone exceeds the byte bound).
    pub async fn insert(&self, entry: CacheEntry) -> bool {
        let (key, path) = (entry.key.clone(), entry.local_path.clone());
        let evicted = self.state().insert(entry, &self.limits);
        let survived = !evicted.iter().any(|e| e.key == key && e.local_path == path);
        self.delete_all(&evicted, "capacity").await;
        survived
    }

    /// Drop expired entries and their bytes.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = self.state().remove_expired(now);
        self.delete_all(&expired, "ttl").await;
        expired.len()
    }

    async fn delete_all(&self, entries: &[CacheEntry], reason: &str) {
        for entry in entries {
            match self.store.remove(&entry.local_path).await {
                Ok(()) => tracing::info!(
                    file_id = %entry.key.file_id,
                    day = %entry.key.day,
                    bytes = entry.size_bytes,
                    reason,
                    "Evicted cached file"
                ),
                Err(e) => tracing::warn!(
                    file_id = %entry.key.file_id,
                    error = %e,
                    "Failed to delete evicted file"
                ),
            }
        }
    }

    /// Re-index files left on disk by a previous run. Expired files are
    /// deleted and bounds are enforced as if each was inserted in age order.
    pub async fn rebuild(&self, now: DateTime<Utc>) -> GatewayResult<usize> {
        let store = self.store.clone();
        let mut found: Vec<StoredFile> = tokio::task::spawn_blocking(move || store.scan())
            .await
            .map_err(|e| crate::error::GatewayError::Internal(format!("cache scan failed: {}", e)))??;
        found.sort_by_key(|f| f.modified);

        let mut stale = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut state = self.state();
            for file in found {
                let stored_at: DateTime<Utc> = file.modified.into();
                let entry = CacheEntry {
                    key: CacheKey::new(file.day, file.file_id),
                    content_type: mime_type_for(&file.filename),
                    filename: file.filename,
                    local_path: file.relative_path,
                    size_bytes: file.size_bytes,
                    stored_at,
                    ttl_expires_at: self.limits.expires_at(stored_at),
                };
                if entry.is_expired(now) {
                    stale.push(entry);
                } else {
                    evicted.extend(state.insert(entry, &self.limits));
                }
            }
        }

        self.delete_all(&stale, "ttl").await;
        self.delete_all(&evicted, "capacity").await;

        let (files, bytes) = self.usage();
        tracing::info!(files, bytes, removed = stale.len() + evicted.len(), "Rebuilt file cache index");
        Ok(files)
    }
}

fn mime_type_for(filename: &str) -> Option<String> {
    mime_guess::from_path(filename)
        .first()
        .map(|m| m.essence_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits(max_bytes: u64, max_files: usize) -> CacheLimits {
        CacheLimits {
            max_bytes,
            max_files,
            ttl: Duration::hours(24),
        }
    }

    fn entry(id: &str, size: u64, stored_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: CacheKey::new("20240101", id),
            filename: format!("{}.bin", id),
            local_path: PathBuf::from("20240101").join(id).join(format!("{}.bin", id)),
            size_bytes: size,
            content_type: None,
            stored_at,
            ttl_expires_at: stored_at + Duration::hours(24),
        }
    }

    #[test]
    fn test_key_uses_utc_day() {
        let now = DateTime::parse_from_rfc3339("2024-05-06T23:30:00-02:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(CacheKey::for_day(now, "7").day, "20240507");
    }

    #[test]
    fn test_evicts_soonest_expiry_first() {
        let t0 = Utc::now();
        let mut state = CacheState::default();
        let l = limits(1000, 2);

        assert!(state.insert(entry("a", 10, t0), &l).is_empty());
        assert!(state.insert(entry("b", 10, t0 + Duration::seconds(1)), &l).is_empty());
        let evicted = state.insert(entry("c", 10, t0 + Duration::seconds(2)), &l);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key.file_id, "a");
        assert_eq!(state.total_files(), 2);
        assert_eq!(state.total_bytes(), 20);
    }

    #[test]
    fn test_oversized_entry_evicts_itself() {
        let mut state = CacheState::default();
        let evicted = state.insert(entry("huge", 500, Utc::now()), &limits(100, 10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(state.total_files(), 0);
        assert_eq!(state.total_bytes(), 0);
    }

    #[test]
    fn test_expired_entries_are_absent() {
        let t0 = Utc::now() - Duration::hours(30);
        let mut state = CacheState::default();
        state.insert(entry("old", 5, t0), &limits(100, 10));

        let key = CacheKey::new("20240101", "old");
        assert!(state.get_live(&key, Utc::now()).is_none());
        assert_eq!(state.remove_expired(Utc::now()).len(), 1);
        assert_eq!(state.total_bytes(), 0);
    }

    #[test]
    fn test_reinsert_same_path_does_not_delete_new_bytes() {
        let t0 = Utc::now();
        let mut state = CacheState::default();
        state.insert(entry("a", 5, t0), &limits(100, 10));
        let evicted = state.insert(entry("a", 7, t0 + Duration::seconds(5)), &limits(100, 10));
        assert!(evicted.is_empty());
        assert_eq!(state.total_bytes(), 7);
    }

    #[tokio::test]
    async fn test_rebuild_restores_and_bounds() {
        use bytes::Bytes;
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        for id in ["1", "2", "3"] {
            let rel = LocalStore::relative_path("20240101", id, "g1", "doc.pdf");
            let body = futures::stream::iter(vec![Ok(Bytes::from_static(b"12345"))]).boxed();
            store.write_stream(&rel, body).await.unwrap();
        }

        let cache = FileCache::new(store, limits(1000, 2));
        let kept = cache.rebuild(Utc::now()).await.unwrap();
        assert_eq!(kept, 2);
        assert_eq!(cache.usage(), (2, 10));

        let remaining = cache.store().scan().unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_drops_expired_files() {
        use bytes::Bytes;
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let rel = LocalStore::relative_path("20240101", "1", "g1", "doc.pdf");
        let body = futures::stream::iter(vec![Ok(Bytes::from_static(b"x"))]).boxed();
        store.write_stream(&rel, body).await.unwrap();

        let cache = FileCache::new(store, limits(1000, 10));
        // A day past the TTL
        let kept = cache.rebuild(Utc::now() + Duration::hours(48)).await.unwrap();
        assert_eq!(kept, 0);
        assert!(cache.store().scan().unwrap().is_empty());
    }

    async fn write(store: &LocalStore, rel: &std::path::Path, data: &'static [u8]) {
        let body = futures::stream::iter(vec![Ok(bytes::Bytes::from_static(data))]);
        store
            .write_stream(rel, futures::StreamExt::boxed(body))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeping_expired_entry_keeps_successor_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let cache = FileCache::new(store.clone(), limits(1000, 10));
        let now = Utc::now();

        let old_rel = LocalStore::relative_path("20240101", "7", &LocalStore::new_generation(), "doc.pdf");
        write(&store, &old_rel, b"old").await;
        let mut old = entry("7", 3, now - Duration::hours(30));
        old.filename = "doc.pdf".into();
        old.local_path = old_rel.clone();
        cache.insert(old).await;

        // A fresh download for the same key lands while the expired entry is
        // still indexed, and the sweep runs before it is registered.
        let new_rel = LocalStore::relative_path("20240101", "7", &LocalStore::new_generation(), "doc.pdf");
        assert_ne!(old_rel, new_rel);
        write(&store, &new_rel, b"fresh").await;
        assert_eq!(cache.sweep(now).await, 1);

        let mut fresh = entry("7", 5, now);
        fresh.filename = "doc.pdf".into();
        fresh.local_path = new_rel.clone();
        assert!(cache.insert(fresh).await);

        let live = cache.lookup(&CacheKey::new("20240101", "7"), now).unwrap();
        let path = store.resolve_existing(&live.local_path).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"fresh");
        assert!(store.resolve_existing(&old_rel).await.is_err());
        assert_eq!(cache.usage(), (1, 5));
    }

    #[tokio::test]
    async fn test_replacing_entry_deletes_only_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let cache = FileCache::new(store.clone(), limits(1000, 10));
        let now = Utc::now();

        let mut paths = Vec::new();
        for (i, data) in [&b"one"[..], &b"two"[..]].into_iter().enumerate() {
            let rel = LocalStore::relative_path("20240101", "9", &format!("g{}", i), "doc.pdf");
            let body = futures::stream::iter(vec![Ok(bytes::Bytes::copy_from_slice(data))]);
            store.write_stream(&rel, futures::StreamExt::boxed(body)).await.unwrap();
            let mut e = entry("9", 3, now + Duration::seconds(i as i64));
            e.local_path = rel.clone();
            assert!(cache.insert(e).await);
            paths.push(rel);
        }

        assert!(store.resolve_existing(&paths[0]).await.is_err());
        assert!(store.resolve_existing(&paths[1]).await.is_ok());
        assert_eq!(cache.usage(), (1, 3));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_newest_generation_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let older = LocalStore::relative_path("20240101", "5", "a", "doc.pdf");
        let newer = LocalStore::relative_path("20240101", "5", "b", "doc.pdf");
        write(&store, &older, b"old").await;
        // Distinct modification times
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        write(&store, &newer, b"newer").await;

        let cache = FileCache::new(store, limits(1000, 10));
        assert_eq!(cache.rebuild(Utc::now()).await.unwrap(), 1);
        assert_eq!(cache.usage(), (1, 5));
        assert!(cache.store().resolve_existing(&older).await.is_err());
    }

    #[test]
    fn test_expiry_saturates() {
        let l = CacheLimits {
            max_bytes: 1,
            max_files: 1,
            ttl: Duration::MAX,
        };
        assert_eq!(l.expires_at(Utc::now()), DateTime::<Utc>::MAX_UTC);
    }

    proptest! {
        #[test]
        fn prop_bounds_hold_after_every_insert(
            sizes in proptest::collection::vec(0u64..400, 1..60),
            max_bytes in 1u64..1000,
            max_files in 1usize..8,
        ) {
            let l = limits(max_bytes, max_files);
            let mut state = CacheState::default();
            let t0 = Utc::now();

            for (i, size) in sizes.iter().enumerate() {
                let e = entry(&format!("f{}", i % 12), *size, t0 + Duration::seconds(i as i64));
                state.insert(e, &l);

                prop_assert!(state.total_bytes() <= max_bytes);
                prop_assert!(state.total_files() <= max_files);
                let sum: u64 = state.entries.values().map(|e| e.size_bytes).sum();
                prop_assert_eq!(sum, state.total_bytes());
            }
        }
    }
}
