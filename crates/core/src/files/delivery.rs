use super::cache::{CacheEntry, CacheKey, CacheLimits, FileCache};
use super::store::{has_traversal, is_day, is_safe_segment, sanitize_filename, sanitize_id, LocalStore};
use crate::config::{FileDeliveryConfig, FileDownloadStrategy};
use crate::error::{GatewayError, GatewayResult};
use crate::session::Credential;
use crate::upstream::{DealpathApi, FileDescriptor, FileDownload};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a file request resolved to.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Hand the signed upstream URL to the caller.
    Remote { descriptor: FileDescriptor },
    /// The caller should fetch through the gateway's streaming route.
    Proxied { descriptor: FileDescriptor },
    /// Served from the local cache. `descriptor` is only set when this call
    /// performed the download.
    Cached {
        entry: CacheEntry,
        descriptor: Option<FileDescriptor>,
    },
}

type InflightMap = Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>;

/// Drops the per-key gate from the in-flight map once no caller holds it.
struct InflightGuard<'a> {
    map: &'a InflightMap,
    key: CacheKey,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&self.gate) <= 2 {
            map.remove(&self.key);
        }
    }
}

/// Strategy-driven file delivery. The strategy is fixed at construction.
pub struct FileDelivery {
    strategy: FileDownloadStrategy,
    upstream: Arc<dyn DealpathApi>,
    cache: Option<Arc<FileCache>>,
    inflight: InflightMap,
    download_timeout: Duration,
}

impl FileDelivery {
    /// Build the subsystem. Under `local_cache` this creates the storage root
    /// and re-indexes whatever a previous run left there.
    pub async fn new(
        config: &FileDeliveryConfig,
        upstream: Arc<dyn DealpathApi>,
        download_timeout: Duration,
    ) -> GatewayResult<Self> {
        let cache = match config.strategy {
            FileDownloadStrategy::LocalCache => {
                let store = LocalStore::new(&config.storage_dir)?;
                let cache = FileCache::new(
                    store,
                    CacheLimits {
                        max_bytes: config.cache_max_bytes,
                        max_files: config.cache_max_files,
                        ttl: config.ttl(),
                    },
                );
                cache.rebuild(Utc::now()).await?;
                Some(Arc::new(cache))
            }
            FileDownloadStrategy::RemoteOnly | FileDownloadStrategy::ProxyStream => None,
        };

        info!(strategy = %config.strategy, "File delivery ready");
        Ok(Self {
            strategy: config.strategy,
            upstream,
            cache,
            inflight: Mutex::new(HashMap::new()),
            download_timeout,
        })
    }

    pub fn strategy(&self) -> FileDownloadStrategy {
        self.strategy
    }

    pub fn cache(&self) -> Option<&Arc<FileCache>> {
        self.cache.as_ref()
    }

    /// Resolve a file id according to the configured strategy.
    pub async fn deliver(&self, credential: &Credential, file_id: &str) -> GatewayResult<Delivery> {
        check_file_id(file_id)?;

        match (self.strategy, &self.cache) {
            (FileDownloadStrategy::LocalCache, Some(cache)) => {
                self.deliver_cached(cache, credential, file_id).await
            }
            (FileDownloadStrategy::ProxyStream, _) => {
                let descriptor = self.upstream.file_descriptor(credential, file_id).await?;
                Ok(Delivery::Proxied { descriptor })
            }
            _ => {
                let descriptor = self.upstream.file_descriptor(credential, file_id).await?;
                Ok(Delivery::Remote { descriptor })
            }
        }
    }

    async fn deliver_cached(
        &self,
        cache: &FileCache,
        credential: &Credential,
        file_id: &str,
    ) -> GatewayResult<Delivery> {
        // Ids that only survive as a lossy rewrite would share a key with
        // another file, so they are never cached.
        if sanitize_id(file_id) != file_id {
            debug!(file_id = %sanitize_id(file_id), "Id is not cacheable, returning remote link");
            let descriptor = self.upstream.file_descriptor(credential, file_id).await?;
            return Ok(Delivery::Remote { descriptor });
        }

        let key = CacheKey::for_day(Utc::now(), file_id);
        if let Some(entry) = cache.lookup(&key, Utc::now()) {
            debug!(file_id, "Cache hit");
            return Ok(Delivery::Cached {
                entry,
                descriptor: None,
            });
        }

        let inflight = self.gate(&key);
        let _permit = inflight.gate.lock().await;

        // Another caller may have finished the download while we waited.
        if let Some(entry) = cache.lookup(&key, Utc::now()) {
            debug!(file_id, "Cache hit after coalesced download");
            return Ok(Delivery::Cached {
                entry,
                descriptor: None,
            });
        }

        let descriptor = self.upstream.file_descriptor(credential, file_id).await?;
        let filename = sanitize_filename(&descriptor.filename);
        let relative =
            LocalStore::relative_path(&key.day, &key.file_id, &LocalStore::new_generation(), &filename);

        let download = async {
            let FileDownload {
                content_type, body, ..
            } = self.upstream.open_download(&descriptor).await?;
            let size = cache.store().write_stream(&relative, body).await?;
            Ok::<_, GatewayError>((size, content_type))
        };
        let (size_bytes, content_type) = tokio::time::timeout(self.download_timeout, download)
            .await
            .map_err(|_| {
                warn!(file_id, "Download timed out");
                GatewayError::UpstreamTimeout
            })??;

        let stored_at = Utc::now();
        let entry = CacheEntry {
            key,
            filename,
            local_path: relative,
            size_bytes,
            content_type: content_type.or_else(|| descriptor.content_type.clone()),
            stored_at,
            ttl_expires_at: cache.limits().expires_at(stored_at),
        };

        if cache.insert(entry.clone()).await {
            info!(file_id, bytes = size_bytes, "Cached download");
            Ok(Delivery::Cached {
                entry,
                descriptor: Some(descriptor),
            })
        } else {
            warn!(file_id, bytes = size_bytes, "File exceeds cache capacity, returning remote link");
            Ok(Delivery::Remote { descriptor })
        }
    }

    fn gate(&self, key: &CacheKey) -> InflightGuard<'_> {
        let gate = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        InflightGuard {
            map: &self.inflight,
            key: key.clone(),
            gate,
        }
    }

    /// Open the upstream bytes for a file without touching local storage.
    pub async fn open_stream(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> GatewayResult<(FileDescriptor, FileDownload)> {
        check_file_id(file_id)?;
        let descriptor = self.upstream.file_descriptor(credential, file_id).await?;
        let download = self.upstream.open_download(&descriptor).await?;
        Ok((descriptor, download))
    }

    /// Locate a cached file for `/local-files/{day}/{file_id}/{filename}`.
    /// Every failure, including a path outside the root, is `NotFound`.
    pub async fn local_file(
        &self,
        day: &str,
        file_id: &str,
        filename: &str,
    ) -> GatewayResult<(PathBuf, CacheEntry)> {
        let not_found = || GatewayError::NotFound("file".to_string());
        let cache = self.cache.as_ref().ok_or_else(not_found)?;

        if !is_day(day)
            || !is_safe_segment(file_id)
            || !is_safe_segment(filename)
            || sanitize_id(file_id) != file_id
            || sanitize_filename(filename) != filename
        {
            return Err(not_found());
        }

        let entry = cache
            .lookup(&CacheKey::new(day, file_id), Utc::now())
            .filter(|e| e.filename == filename)
            .ok_or_else(not_found)?;
        let path = cache.store().resolve_existing(&entry.local_path).await?;
        Ok((path, entry))
    }

    /// Remove expired cache entries. No-op for the other strategies.
    pub async fn sweep(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.sweep(Utc::now()).await,
            None => 0,
        }
    }

    /// Run [`FileDelivery::sweep`] every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        self.cache.as_ref()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep().await;
                if removed > 0 {
                    info!(removed, "Swept expired cache entries");
                }
            }
        }))
    }
}

fn check_file_id(file_id: &str) -> GatewayResult<()> {
    if file_id.trim().is_empty() {
        return Err(GatewayError::InvalidArguments("file_id must not be empty".to_string()));
    }
    if has_traversal(file_id) {
        return Err(GatewayError::NotFound(format!("file {}", sanitize_id(file_id))));
    }
    Ok(())
}
