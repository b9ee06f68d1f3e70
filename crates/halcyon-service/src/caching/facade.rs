use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::artifact::ArtifactProcessor;
use crate::config::{Config, RetrieveOptions};

use super::cache_key::CacheKey;
use super::disk::DiskStore;
use super::memory::MemoryStore;
use super::{RetrieveError, RetrieveResult, Tier};

/// Broadcast after an automatic cleanup sweep that actually removed files.
///
/// Collaborators that keep side-indexes keyed by cache entry (for example an
/// ETag map) subscribe to this to invalidate their own state. Manual
/// [`clear_disk`](ArtifactCache::clear_disk) calls do not notify; only
/// automatic cleanup does.
#[derive(Clone, Debug)]
pub struct CleanupNotice {
    /// Name of the cache instance that swept.
    pub cache_name: String,
    /// Filenames (key digests) of the removed entries.
    pub removed: Vec<String>,
}

/// The cache facade composing the memory and disk tiers.
///
/// Lookups go memory first, then disk; a disk hit is decoded and promoted
/// into memory (a memory-only write, the disk entry is untouched). Stores
/// write memory synchronously and schedule the disk write asynchronously.
/// Instances are named and independent; there is no process-wide default,
/// callers inject the instance they want.
pub struct ArtifactCache<P: ArtifactProcessor> {
    name: String,
    processor: Arc<P>,
    memory: MemoryStore<P::Artifact>,
    disk: Option<Arc<DiskStore>>,
    cleanup_tx: broadcast::Sender<CleanupNotice>,
}

impl<P: ArtifactProcessor> ArtifactCache<P> {
    pub fn from_config(config: &Config, processor: Arc<P>) -> Self {
        let memory = MemoryStore::new(config.max_memory_cost, config.memory_ttl);
        let disk = DiskStore::from_config(config).map(Arc::new);
        let (cleanup_tx, _) = broadcast::channel(16);

        Self {
            name: config.cache_name.clone(),
            processor,
            memory,
            disk,
            cleanup_tx,
        }
    }

    /// The name of this cache instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks `key` up in the cache tiers.
    ///
    /// Memory is consulted first; on a disk hit the raw bytes are decoded
    /// and the artifact is promoted into memory so the next lookup is a
    /// memory hit. Returns `None` when neither tier has the entry; falling
    /// back to the network is the manager's job.
    pub async fn retrieve(
        &self,
        key: &CacheKey,
        options: &RetrieveOptions,
    ) -> RetrieveResult<Option<(P::Artifact, Tier)>> {
        metric!(counter("caches.access") += 1, "cache" => &self.name);

        if let Some(artifact) = self.memory.get(key) {
            metric!(counter("caches.memory.hit") += 1, "cache" => &self.name);
            return Ok(Some((artifact, Tier::Memory)));
        }

        let Some(disk) = &self.disk else {
            return Ok(None);
        };
        let Some(data) = disk.retrieve(key).await else {
            return Ok(None);
        };

        let artifact = self.decode(data, options).await?;
        let cost = self.processor.cost(&artifact);
        self.memory.set(key.clone(), artifact.clone(), cost);

        Ok(Some((artifact, Tier::Disk)))
    }

    /// Decodes raw bytes into an artifact.
    ///
    /// With `decode_in_background` the CPU-bound decode runs on a blocking
    /// worker thread so it cannot stall the caller's task.
    pub async fn decode(
        &self,
        data: Bytes,
        options: &RetrieveOptions,
    ) -> RetrieveResult<P::Artifact> {
        if options.decode_in_background {
            let processor = Arc::clone(&self.processor);
            tokio::task::spawn_blocking(move || processor.decode(&data))
                .await
                .map_err(|_| RetrieveError::Cancelled)?
        } else {
            self.processor.decode(&data)
        }
    }

    /// Stores an artifact under `key`.
    ///
    /// The memory write happens synchronously (unless `to_disk_only`); the
    /// disk write is scheduled as a background task (unless `memory_only`)
    /// and its handle is returned so callers that need the entry on disk can
    /// await it. When `raw` holds the originally fetched bytes they are
    /// persisted verbatim, preserving the original encoding; otherwise the
    /// artifact is re-encoded as a fallback.
    pub fn store(
        &self,
        key: &CacheKey,
        artifact: P::Artifact,
        raw: Option<Bytes>,
        options: &RetrieveOptions,
    ) -> Option<JoinHandle<()>> {
        if !options.to_disk_only {
            let cost = self.processor.cost(&artifact);
            self.memory.set(key.clone(), artifact.clone(), cost);
        }

        if options.memory_only {
            return None;
        }
        let disk = self.disk.as_ref()?;

        let data = match raw {
            Some(data) => data,
            None => match self.processor.encode(&artifact) {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        key = %key,
                        "Failed to re-encode artifact for disk cache",
                    );
                    return None;
                }
            },
        };

        let disk = Arc::clone(disk);
        let key = key.clone();
        Some(tokio::spawn(async move {
            disk.store(&key, &data).await;
        }))
    }

    /// Says whether `key` is cached, and in which tier.
    ///
    /// Memory wins when the entry lives in both tiers.
    pub async fn is_cached(&self, key: &CacheKey) -> (bool, Tier) {
        if self.memory.contains(key) {
            return (true, Tier::Memory);
        }
        if let Some(disk) = &self.disk {
            if disk.is_cached(key).await {
                return (true, Tier::Disk);
            }
        }
        (false, Tier::None)
    }

    /// Removes `key` from both tiers.
    pub async fn remove(&self, key: &CacheKey) {
        self.memory.remove(key);
        if let Some(disk) = &self.disk {
            disk.remove(key).await;
        }
    }

    /// Runs the disk cleanup sweep.
    ///
    /// This is the automatic cleanup entry point: an embedder calls it on
    /// its platform's backgrounding signal or on a timer. When the sweep
    /// removed files, a [`CleanupNotice`] is broadcast to subscribers.
    pub async fn run_cleanup(&self) -> io::Result<Vec<String>> {
        let Some(disk) = &self.disk else {
            return Ok(Vec::new());
        };

        let stats = disk.clean_expired().await?;
        if !stats.removed.is_empty() {
            // Nobody listening is fine.
            let _ = self.cleanup_tx.send(CleanupNotice {
                cache_name: self.name.clone(),
                removed: stats.removed.clone(),
            });
        }
        Ok(stats.removed)
    }

    /// Subscribes to [`CleanupNotice`]s emitted by automatic cleanup.
    pub fn subscribe_cleanup(&self) -> broadcast::Receiver<CleanupNotice> {
        self.cleanup_tx.subscribe()
    }

    /// Drops every in-memory entry.
    pub fn clear_memory(&self) {
        self.memory.remove_all();
    }

    /// Removes every disk entry.
    ///
    /// Does not broadcast a [`CleanupNotice`]: the caller asked for the
    /// clear and can invalidate its own side-state directly.
    pub async fn clear_disk(&self) {
        if let Some(disk) = &self.disk {
            disk.remove_all().await;
        }
    }

    /// The total size of the disk tier, in bytes.
    pub async fn disk_size(&self) -> u64 {
        match &self.disk {
            Some(disk) => disk.total_size().await,
            None => 0,
        }
    }
}

impl<P: ArtifactProcessor> std::fmt::Debug for ArtifactCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("name", &self.name)
            .field("memory", &self.memory)
            .field("disk", &self.disk)
            .finish()
    }
}
