//! The retrieval front door.
//!
//! [`Manager`] ties the cache tiers and the downloader together into the
//! canonical flow: try the cache, fall back to a coalesced network fetch,
//! write the result back. Callers get a [`RetrieveTask`] handle back
//! synchronously and await the [`Retrieval`] separately, so a request can be
//! cancelled at any stage.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::artifact::ArtifactProcessor;
use crate::caching::{ArtifactCache, CacheKey, RetrieveError, RetrieveResult, Tier};
use crate::config::{Config, RetrieveOptions};
use crate::download::{Downloader, ProgressCallback, RetrieveTask};

/// The outcome of a successful retrieval.
#[derive(Debug)]
pub struct Retrieval<A> {
    /// The decoded artifact.
    pub artifact: A,
    /// The cache tier that satisfied the request, [`Tier::None`] for a fresh
    /// network fetch.
    pub tier: Tier,
    /// The key the artifact is cached under.
    pub key: CacheKey,
    /// Handle of the background disk write scheduled for a fresh fetch.
    ///
    /// `None` when nothing was written to disk. Callers that need the entry
    /// persisted before proceeding can await this.
    pub disk_write: Option<JoinHandle<()>>,
}

/// Orchestrates retrievals against one cache instance and one downloader.
pub struct Manager<P: ArtifactProcessor> {
    cache: Arc<ArtifactCache<P>>,
    downloader: Arc<Downloader>,
    processor: Arc<P>,
}

impl<P: ArtifactProcessor> Manager<P> {
    pub fn new(config: &Config, processor: P) -> Self {
        let processor = Arc::new(processor);
        let cache = Arc::new(ArtifactCache::from_config(config, Arc::clone(&processor)));
        let downloader = Arc::new(Downloader::new(config));

        Self {
            cache,
            downloader,
            processor,
        }
    }

    /// The cache instance behind this manager, for maintenance calls such as
    /// [`run_cleanup`](ArtifactCache::run_cleanup) or
    /// [`clear_memory`](ArtifactCache::clear_memory).
    pub fn cache(&self) -> &Arc<ArtifactCache<P>> {
        &self.cache
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// The key `resource` is cached under, including the processor suffix.
    pub fn cache_key(&self, resource: &str) -> RetrieveResult<CacheKey> {
        CacheKey::with_processor(resource, Some(self.processor.identifier()))
    }

    /// Says whether `resource` is cached, and in which tier.
    pub async fn is_cached(&self, resource: &str) -> RetrieveResult<(bool, Tier)> {
        let key = self.cache_key(resource)?;
        Ok(self.cache.is_cached(&key).await)
    }

    /// Retrieves the resource at the URL `resource`.
    ///
    /// Key validation happens synchronously, so a malformed resource fails
    /// fast without scheduling any work. On success, the returned
    /// [`RetrieveTask`] can cancel the retrieval and the returned future
    /// resolves to the [`Retrieval`] exactly once.
    ///
    /// The flow is cache first (memory, then disk), network second; a fresh
    /// fetch is decoded and written back into both tiers. Network transfers
    /// coalesce on the final request URL after the request modifier ran,
    /// while the cache key stays the caller's resource identity plus the
    /// processor suffix. With
    /// `force_refresh` the cache lookup is skipped but the write-back still
    /// happens. A server replying 304 Not Modified is treated as "the cached
    /// entry is still good": the cache is consulted (again) and its entry
    /// served. Should the entry have been evicted in the meantime, the
    /// retrieval degrades to [`RetrieveError::NotFound`] rather than
    /// silently refetching with different semantics.
    pub fn retrieve(
        &self,
        resource: &str,
        options: RetrieveOptions,
        progress: Option<ProgressCallback>,
    ) -> RetrieveResult<(
        RetrieveTask,
        impl Future<Output = RetrieveResult<Retrieval<P::Artifact>>>,
    )> {
        let key = self.cache_key(resource)?;
        let task = RetrieveTask::new();

        let cache = Arc::clone(&self.cache);
        let downloader = Arc::clone(&self.downloader);
        let url = resource.to_owned();
        let future_task = task.clone();
        let future = async move {
            Self::retrieve_inner(cache, downloader, key, url, future_task, options, progress).await
        };

        Ok((task, future))
    }

    async fn retrieve_inner(
        cache: Arc<ArtifactCache<P>>,
        downloader: Arc<Downloader>,
        key: CacheKey,
        url: String,
        task: RetrieveTask,
        options: RetrieveOptions,
        progress: Option<ProgressCallback>,
    ) -> RetrieveResult<Retrieval<P::Artifact>> {
        tracing::trace!(key = %key, options = ?options, "Retrieving resource");

        if !options.force_refresh {
            if let Some((artifact, tier)) = cache.retrieve(&key, &options).await? {
                return Ok(Retrieval {
                    artifact,
                    tier,
                    key,
                    disk_write: None,
                });
            }
        }

        if task.is_cancelled() {
            return Err(RetrieveError::Cancelled);
        }

        let modifier = options.request_modifier.clone();
        match downloader.fetch(&url, &task, progress, modifier).await {
            Ok(bytes) => {
                let artifact = cache.decode(bytes.clone(), &options).await?;
                let disk_write = cache.store(&key, artifact.clone(), Some(bytes), &options);
                Ok(Retrieval {
                    artifact,
                    tier: Tier::None,
                    key,
                    disk_write,
                })
            }
            Err(RetrieveError::NotModified) => {
                // The entry we hold is still good, serve it.
                match cache.retrieve(&key, &options).await? {
                    Some((artifact, tier)) => Ok(Retrieval {
                        artifact,
                        tier,
                        key,
                        disk_write: None,
                    }),
                    // Evicted between lookup and response.
                    None => Err(RetrieveError::NotFound),
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl<P: ArtifactProcessor> std::fmt::Debug for Manager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("cache", &self.cache)
            .field("downloader", &self.downloader)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::artifact::PassthroughProcessor;

    use super::*;

    fn manager(cache_dir: Option<std::path::PathBuf>) -> Manager<PassthroughProcessor> {
        halcyon_test::setup();
        let config = Config {
            cache_dir,
            ..Default::default()
        };
        Manager::new(&config, PassthroughProcessor)
    }

    async fn fetch(
        manager: &Manager<PassthroughProcessor>,
        url: &str,
        options: RetrieveOptions,
    ) -> RetrieveResult<Retrieval<Bytes>> {
        let (_task, future) = manager.retrieve(url, options, None)?;
        future.await
    }

    #[tokio::test]
    async fn test_miss_then_memory_hit() {
        let server = halcyon_test::Server::new();
        server.register("a.png", b"payload-a".to_vec());

        let manager = manager(None);
        let url = server.url("/files/a.png");

        let first = fetch(&manager, &url, Default::default()).await.unwrap();
        assert_eq!(first.tier, Tier::None);
        assert_eq!(&first.artifact[..], b"payload-a");

        let second = fetch(&manager, &url, Default::default()).await.unwrap();
        assert_eq!(second.tier, Tier::Memory);
        assert_eq!(&second.artifact[..], b"payload-a");

        assert_eq!(server.hits("/files/a.png"), 1);
    }

    #[tokio::test]
    async fn test_disk_fallback_and_promotion() {
        let server = halcyon_test::Server::new();
        server.register("b.png", b"payload-b".to_vec());

        let cache_dir = halcyon_test::tempdir();
        let manager = manager(Some(cache_dir.path().to_owned()));
        let url = server.url("/files/b.png");

        let first = fetch(&manager, &url, Default::default()).await.unwrap();
        first.disk_write.unwrap().await.unwrap();

        // Dropping memory leaves the disk entry, which the next retrieval
        // promotes back into memory.
        manager.cache().clear_memory();
        let second = fetch(&manager, &url, Default::default()).await.unwrap();
        assert_eq!(second.tier, Tier::Disk);

        let third = fetch(&manager, &url, Default::default()).await.unwrap();
        assert_eq!(third.tier, Tier::Memory);

        assert_eq!(server.hits("/files/b.png"), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_hits_network() {
        let server = halcyon_test::Server::new();
        server.register("c.png", b"payload-c".to_vec());

        let manager = manager(None);
        let url = server.url("/files/c.png");

        fetch(&manager, &url, Default::default()).await.unwrap();
        let options = RetrieveOptions {
            force_refresh: true,
            ..Default::default()
        };
        let refreshed = fetch(&manager, &url, options).await.unwrap();

        assert_eq!(refreshed.tier, Tier::None);
        assert_eq!(server.hits("/files/c.png"), 2);

        // The refreshed result was written back.
        let (cached, tier) = manager.is_cached(&url).await.unwrap();
        assert!(cached);
        assert_eq!(tier, Tier::Memory);
    }

    #[tokio::test]
    async fn test_not_modified_serves_cached_entry() {
        let server = halcyon_test::Server::new();
        let manager = manager(None);
        let url = server.url("/respond_statuscode/304/d.png");

        // Prime the cache under the same key the retrieval will use.
        let key = manager.cache_key(&url).unwrap();
        manager.cache().store(
            &key,
            Bytes::from_static(b"payload-d"),
            None,
            &Default::default(),
        );

        let options = RetrieveOptions {
            force_refresh: true,
            ..Default::default()
        };
        let retrieval = fetch(&manager, &url, options).await.unwrap();
        assert_eq!(retrieval.tier, Tier::Memory);
        assert_eq!(&retrieval.artifact[..], b"payload-d");
    }

    #[tokio::test]
    async fn test_not_modified_without_cached_entry() {
        let server = halcyon_test::Server::new();
        let manager = manager(None);
        let url = server.url("/respond_statuscode/304/e.png");

        let result = fetch(&manager, &url, Default::default()).await;
        assert_eq!(result.unwrap_err(), RetrieveError::NotFound);
    }

    #[tokio::test]
    async fn test_invalid_resource_fails_synchronously() {
        let manager = manager(None);
        let err = manager
            .retrieve("  ", Default::default(), None)
            .err()
            .unwrap();
        assert_eq!(err, RetrieveError::InvalidKey);
    }

    #[tokio::test]
    async fn test_decode_failure_is_not_cached() {
        let server = halcyon_test::Server::new();
        server.register("empty.bin", Vec::new());

        let manager = manager(None);
        let url = server.url("/files/empty.bin");

        let result = fetch(&manager, &url, Default::default()).await;
        assert!(matches!(result.unwrap_err(), RetrieveError::Decode(_)));

        let (cached, _) = manager.is_cached(&url).await.unwrap();
        assert!(!cached);
    }

    #[tokio::test]
    async fn test_memory_only_skips_disk() {
        let server = halcyon_test::Server::new();
        server.register("f.png", b"payload-f".to_vec());

        let cache_dir = halcyon_test::tempdir();
        let manager = manager(Some(cache_dir.path().to_owned()));
        let url = server.url("/files/f.png");

        let options = RetrieveOptions {
            memory_only: true,
            ..Default::default()
        };
        let retrieval = fetch(&manager, &url, options).await.unwrap();
        assert!(retrieval.disk_write.is_none());

        manager.cache().clear_memory();
        let (cached, _) = manager.is_cached(&url).await.unwrap();
        assert!(!cached);
    }

    #[tokio::test]
    async fn test_to_disk_only_skips_memory() {
        let server = halcyon_test::Server::new();
        server.register("g.png", b"payload-g".to_vec());

        let cache_dir = halcyon_test::tempdir();
        let manager = manager(Some(cache_dir.path().to_owned()));
        let url = server.url("/files/g.png");

        let options = RetrieveOptions {
            to_disk_only: true,
            ..Default::default()
        };
        let retrieval = fetch(&manager, &url, options).await.unwrap();
        retrieval.disk_write.unwrap().await.unwrap();

        let (cached, tier) = manager.is_cached(&url).await.unwrap();
        assert!(cached);
        assert_eq!(tier, Tier::Disk);
    }

    #[tokio::test]
    async fn test_cancelled_before_network() {
        let server = halcyon_test::Server::new();
        server.register("h.png", b"payload-h".to_vec());

        let manager = manager(None);
        let url = server.url("/files/h.png");

        let (task, future) = manager.retrieve(&url, Default::default(), None).unwrap();
        task.cancel();

        assert_eq!(future.await.unwrap_err(), RetrieveError::Cancelled);
        assert_eq!(server.accesses(), 0);
    }
}
