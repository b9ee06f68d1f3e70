use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::download::RequestModifier;

/// Timeouts for the network layer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// Global timeout for one request, headers and body included.
    #[serde(with = "humantime_serde")]
    pub request: Duration,
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            request: Duration::from_secs(15),
        }
    }
}

/// Static configuration of one cache/downloader instance.
///
/// Multiple independent instances may coexist in one process; they are
/// distinguished by [`cache_name`](Self::cache_name), which also becomes the
/// name of the on-disk cache directory below [`cache_dir`](Self::cache_dir).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this cache instance.
    pub cache_name: String,

    /// Base directory for on-disk caches. Each named instance uses the
    /// subdirectory `cache_dir/cache_name`, created lazily on first write.
    ///
    /// Leaving this as `None` disables the disk tier entirely.
    pub cache_dir: Option<PathBuf>,

    /// Ceiling on the total cost of in-memory entries. `0` means unlimited.
    pub max_memory_cost: u64,

    /// Optional time-to-live for in-memory entries.
    #[serde(with = "humantime_serde")]
    pub memory_ttl: Option<Duration>,

    /// Maximum age of a disk entry before the cleanup sweep removes it.
    #[serde(with = "humantime_serde")]
    pub max_disk_age: Duration,

    /// Ceiling on the aggregate size of disk entries, in bytes. `0` means
    /// unlimited. When exceeded, the cleanup sweep deletes oldest entries
    /// until the total drops below half of this value.
    pub max_disk_size: u64,

    /// Network timeouts.
    pub timeouts: DownloadTimeouts,

    /// Hostnames for which server certificates are accepted without
    /// validation (self-signed endpoints).
    pub trusted_hosts: BTreeSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_name: "default".into(),
            cache_dir: None,
            max_memory_cost: 0,
            memory_ttl: None,
            max_disk_age: Duration::from_secs(7 * 24 * 3600),
            max_disk_size: 0,
            timeouts: Default::default(),
            trusted_hosts: Default::default(),
        }
    }
}

impl Config {
    /// Loads a configuration from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        serde_yaml::from_reader(file).context("failed to parse YAML config")
    }

    /// The root directory of this instance's disk cache, if one is configured.
    pub fn disk_cache_root(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(&self.cache_name))
    }
}

/// Per-request options.
#[derive(Clone, Default)]
pub struct RetrieveOptions {
    /// Skip the cache lookup and always hit the network. The fetched result
    /// is still written back into the cache.
    pub force_refresh: bool,

    /// Do not keep the artifact in memory, only persist it to disk.
    pub to_disk_only: bool,

    /// Do not persist the artifact to disk, only keep it in memory.
    pub memory_only: bool,

    /// Run artifact decoding on a blocking worker thread instead of inline.
    pub decode_in_background: bool,

    /// Marks the request as low priority. Currently only recorded for
    /// diagnostics; the runtime has no priority lanes.
    pub low_priority: bool,

    /// Hook that may rewrite the outgoing request (headers, URL) before the
    /// coalescing key is fixed.
    pub request_modifier: Option<Arc<dyn RequestModifier>>,
}

impl fmt::Debug for RetrieveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveOptions")
            .field("force_refresh", &self.force_refresh)
            .field("to_disk_only", &self.to_disk_only)
            .field("memory_only", &self.memory_only)
            .field("decode_in_background", &self.decode_in_background)
            .field("low_priority", &self.low_priority)
            .field("request_modifier", &self.request_modifier.is_some())
            .finish()
    }
}
