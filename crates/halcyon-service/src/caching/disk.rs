use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

use super::cache_key::CacheKey;
use crate::config::Config;

/// Aggregate outcome of one cleanup sweep.
#[derive(Debug, Default)]
pub struct SweepStats {
    /// Filenames (key digests) of the removed entries.
    pub removed: Vec<String>,
    /// Total size of the removed entries, in bytes.
    pub removed_bytes: u64,
    /// Number of entries that survived the sweep.
    pub retained_files: usize,
    /// Total size of the surviving entries, in bytes.
    pub retained_bytes: u64,
}

/// The disk cache tier: a flat directory of files named by the hex digest of
/// their [`CacheKey`], holding raw encoded bytes.
///
/// Filesystem metadata stands in for entry metadata: the modification time is
/// the entry's write-recency (reads never bump it) and the file length is the
/// entry's size. There is no sidecar index.
///
/// All filesystem access for one store instance is serialized through a fair
/// async mutex, so writes and reads of the same path can never interleave.
/// Distinct instances do not share the queue. The actual filesystem work runs
/// through `tokio::fs` or on blocking worker threads, never on a runtime
/// worker.
#[derive(Debug)]
pub struct DiskStore {
    name: String,
    root: PathBuf,
    max_age: Duration,
    max_size: u64,
    io: Mutex<()>,
}

impl DiskStore {
    pub fn new(name: String, root: PathBuf, max_age: Duration, max_size: u64) -> Self {
        Self {
            name,
            root,
            max_age,
            max_size,
            io: Mutex::new(()),
        }
    }

    /// Creates the store described by `config`, or `None` if no cache
    /// directory is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let root = config.disk_cache_root()?;
        Some(Self::new(
            config.cache_name.clone(),
            root,
            config.max_disk_age,
            config.max_disk_size,
        ))
    }

    /// The directory holding this store's entries.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of the entry for `key`.
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.filename())
    }

    /// Persists `data` as the entry for `key`.
    ///
    /// The cache directory is created lazily on first use. The write goes to
    /// a temporary file first and is atomically moved into place, so a
    /// concurrent crash can never leave a torn entry behind. Failures are
    /// logged and swallowed: disk persistence is best-effort and never
    /// surfaces as an error to the caller.
    pub async fn store(&self, key: &CacheKey, data: &Bytes) {
        let _guard = self.io.lock().await;

        let root = self.root.clone();
        let path = self.path(key);
        let payload = data.clone();
        let written = spawn_blocking(move || write_entry(&root, &path, &payload))
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

        if let Err(e) = written {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %self.path(key).display(),
                "Failed to write cache file",
            );
            return;
        }

        metric!(counter("caches.file.write") += 1, "cache" => &self.name);
        metric!(time_raw("caches.file.size") = data.len() as u64, "cache" => &self.name);
        tracing::trace!("Stored `{}` at `{}`", key, self.path(key).display());
    }

    /// Reads back the entry for `key`, or `None` if absent.
    ///
    /// Does not update the file's modification time: read recency must not
    /// keep an entry alive through the cleanup sweep.
    pub async fn retrieve(&self, key: &CacheKey) -> Option<Bytes> {
        let _guard = self.io.lock().await;

        match tokio::fs::read(self.path(key)).await {
            Ok(data) => {
                metric!(counter("caches.file.hit") += 1, "cache" => &self.name);
                Some(Bytes::from(data))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.path(key).display(),
                    "Failed to read cache file",
                );
                None
            }
        }
    }

    /// Removes the entry for `key`, if present.
    pub async fn remove(&self, key: &CacheKey) {
        let _guard = self.io.lock().await;

        if let Err(e) = tokio::fs::remove_file(self.path(key)).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.path(key).display(),
                    "Failed to remove cache file",
                );
            }
        }
    }

    /// Removes every entry by deleting the cache directory.
    ///
    /// The directory is re-created lazily by the next write.
    pub async fn remove_all(&self) {
        let _guard = self.io.lock().await;

        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.root.display(),
                    "Failed to clear cache directory",
                );
            }
        }
    }

    /// Says whether an entry exists for `key`.
    pub async fn is_cached(&self, key: &CacheKey) -> bool {
        let _guard = self.io.lock().await;

        tokio::fs::metadata(self.path(key))
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
    }

    /// Walks the cache directory summing entry sizes.
    pub async fn total_size(&self) -> u64 {
        let _guard = self.io.lock().await;

        let root = self.root.clone();
        spawn_blocking(move || {
            let Ok(Some(entries)) = catch_not_found(|| fs::read_dir(&root)) else {
                return 0;
            };
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.metadata().ok())
                .filter(|metadata| metadata.is_file())
                .map(|metadata| metadata.len())
                .sum()
        })
        .await
        .unwrap_or_default()
    }

    /// Runs the two-phase cleanup sweep.
    ///
    /// 1. Expiration: every entry whose modification date is older than
    ///    `now - max_age` is removed, regardless of size pressure.
    /// 2. Capacity: if a size ceiling is configured and the survivors still
    ///    exceed it, the oldest entries (by modification date) are removed
    ///    one by one until the total drops to half the ceiling. Stopping at
    ///    half rather than at the ceiling itself keeps back-to-back sweeps
    ///    from thrashing at the boundary.
    pub async fn clean_expired(&self) -> io::Result<SweepStats> {
        let _guard = self.io.lock().await;

        tracing::debug!("Cleaning up `{}` cache", self.name);

        let root = self.root.clone();
        let max_age = self.max_age;
        let max_size = self.max_size;
        let stats = spawn_blocking(move || sweep(&root, max_age, max_size))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        tracing::debug!(
            "Cleaning up `{}` complete: removed {} files totaling {} bytes, retained {} files totaling {} bytes",
            self.name,
            stats.removed.len(),
            stats.removed_bytes,
            stats.retained_files,
            stats.retained_bytes,
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => &self.name);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => &self.name);
        metric!(counter("caches.size.files_removed") += stats.removed.len() as i64, "cache" => &self.name);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => &self.name);

        Ok(stats)
    }
}

fn write_entry(root: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    fs::create_dir_all(root)?;

    let mut temp_file = tempfile::Builder::new().prefix("tmp").tempfile_in(root)?;
    temp_file.write_all(data)?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The two-phase sweep body, run on a blocking worker.
fn sweep(root: &Path, max_age: Duration, max_size: u64) -> io::Result<SweepStats> {
    let mut stats = SweepStats::default();

    let Some(entries) = catch_not_found(|| fs::read_dir(root))? else {
        return Ok(stats);
    };

    let now = SystemTime::now();
    let mut survivors = Vec::new();

    for entry in entries {
        let path = entry?.path();
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let mtime = metadata.modified()?;
        let age = now.duration_since(mtime).unwrap_or_default();
        if age > max_age {
            remove_swept(&path, metadata.len(), &mut stats);
        } else {
            survivors.push((path, mtime, metadata.len()));
        }
    }

    let mut total: u64 = survivors.iter().map(|(_, _, size)| size).sum();
    if max_size > 0 && total > max_size {
        let target = max_size / 2;
        survivors.sort_by_key(|(_, mtime, _)| *mtime);

        for (path, _, size) in survivors {
            if total <= target {
                stats.retained_files += 1;
                stats.retained_bytes += size;
                continue;
            }
            // A failed removal keeps its bytes on disk, so the running total
            // must not shrink for it.
            if remove_swept(&path, size, &mut stats) {
                total -= size;
            }
        }
    } else {
        stats.retained_files = survivors.len();
        stats.retained_bytes = total;
    }

    Ok(stats)
}

/// Deletes one swept file, tolerating failure. Returns whether the file is
/// actually gone.
fn remove_swept(path: &Path, size: u64, stats: &mut SweepStats) -> bool {
    tracing::trace!("Removing file `{}`", path.display());
    if let Err(e) = catch_not_found(|| fs::remove_file(path)) {
        tracing::error!(
            error = &e as &dyn std::error::Error,
            path = %path.display(),
            "Failed to remove expired cache file",
        );
        stats.retained_files += 1;
        stats.retained_bytes += size;
        return false;
    }

    if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
        stats.removed.push(name.to_owned());
    }
    stats.removed_bytes += size;
    true
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use filetime::FileTime;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn store_in(dir: &Path, max_age: Duration, max_size: u64) -> DiskStore {
        halcyon_test::setup();
        DiskStore::new("test".into(), dir.to_path_buf(), max_age, max_size)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name).unwrap()
    }

    fn backdate(path: &Path, by: Duration) {
        let mtime = FileTime::from_system_time(SystemTime::now() - by);
        filetime::set_file_mtime(path, mtime).unwrap();
    }

    #[tokio::test]
    async fn test_store_retrieve_roundtrip() {
        let dir = halcyon_test::tempdir();
        let store = store_in(dir.path(), HOUR, 0);
        let key = key("https://example.com/a.png");

        assert_eq!(store.retrieve(&key).await, None);
        assert!(!store.is_cached(&key).await);

        let data = Bytes::from_static(b"\x89PNG\r\n\x1a\ncontents");
        store.store(&key, &data).await;

        assert_eq!(store.retrieve(&key).await, Some(data.clone()));
        assert!(store.is_cached(&key).await);
        assert_eq!(store.total_size().await, data.len() as u64);

        store.remove(&key).await;
        assert_eq!(store.retrieve(&key).await, None);
    }

    #[tokio::test]
    async fn test_retrieve_does_not_bump_mtime() {
        let dir = halcyon_test::tempdir();
        let store = store_in(dir.path(), HOUR, 0);
        let key = key("https://example.com/b.png");

        store.store(&key, &Bytes::from_static(b"data")).await;
        let path = store.path(&key);
        backdate(&path, 30 * Duration::from_secs(60));
        let before = path.metadata().unwrap().modified().unwrap();

        store.retrieve(&key).await.unwrap();

        let after = path.metadata().unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_entries() {
        let dir = halcyon_test::tempdir();
        let store = store_in(dir.path(), HOUR, 0);
        let old = key("https://example.com/old.png");
        let fresh = key("https://example.com/fresh.png");

        store.store(&old, &Bytes::from_static(b"old")).await;
        store.store(&fresh, &Bytes::from_static(b"fresh")).await;
        backdate(&store.path(&old), HOUR + Duration::from_secs(60));
        // Just under the age limit, must survive.
        backdate(&store.path(&fresh), HOUR - Duration::from_secs(60));

        let stats = store.clean_expired().await.unwrap();

        assert_eq!(stats.removed, vec![old.filename()]);
        assert_eq!(stats.removed_bytes, 3);
        assert_eq!(stats.retained_files, 1);
        assert_eq!(stats.retained_bytes, 5);

        assert!(!store.is_cached(&old).await);
        assert!(store.is_cached(&fresh).await);
    }

    #[tokio::test]
    async fn test_cleanup_shrinks_to_half_the_size_limit() {
        let dir = halcyon_test::tempdir();
        let store = store_in(dir.path(), 24 * HOUR, 100);

        // Four 40-byte entries, oldest first. 160 bytes exceed the 100-byte
        // limit, so the sweep removes the three oldest to get to 40 <= 50.
        for i in 0..4u32 {
            let key = key(&format!("https://example.com/{i}.png"));
            store.store(&key, &Bytes::from(vec![i as u8; 40])).await;
            backdate(&store.path(&key), (4 - i) * HOUR);
        }

        let stats = store.clean_expired().await.unwrap();

        assert_eq!(stats.removed.len(), 3);
        assert_eq!(stats.removed_bytes, 120);
        assert_eq!(stats.retained_files, 1);
        assert_eq!(stats.retained_bytes, 40);

        // The newest entry is the one that survives.
        assert!(store.is_cached(&key("https://example.com/3.png")).await);
        assert_eq!(store.total_size().await, 40);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capacity_sweep_tolerates_undeletable_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = halcyon_test::tempdir();
        let store = store_in(dir.path(), 24 * HOUR, 100);

        for i in 0..4u32 {
            let key = key(&format!("https://example.com/{i}.png"));
            store.store(&key, &Bytes::from(vec![i as u8; 40])).await;
            backdate(&store.path(&key), (4 - i) * HOUR);
        }

        // A read-only directory makes unlinking its entries fail.
        let mut perms = fs::metadata(store.root()).unwrap().permissions();
        perms.set_mode(0o555);
        fs::set_permissions(store.root(), perms.clone()).unwrap();

        // Privileged processes bypass directory permissions; nothing to
        // simulate then.
        if fs::remove_file(store.path(&key("https://example.com/0.png"))).is_ok() {
            perms.set_mode(0o755);
            fs::set_permissions(store.root(), perms).unwrap();
            return;
        }

        let stats = store.clean_expired().await.unwrap();

        perms.set_mode(0o755);
        fs::set_permissions(store.root(), perms).unwrap();

        // No file could be removed: everything counts as retained and the
        // reported sizes match what is actually still on disk.
        assert!(stats.removed.is_empty());
        assert_eq!(stats.removed_bytes, 0);
        assert_eq!(stats.retained_files, 4);
        assert_eq!(stats.retained_bytes, 160);
        assert_eq!(store.total_size().await, 160);
    }

    #[tokio::test]
    async fn test_cleanup_within_limits_removes_nothing() {
        let dir = halcyon_test::tempdir();
        let store = store_in(dir.path(), HOUR, 1000);
        let key = key("https://example.com/c.png");

        store.store(&key, &Bytes::from_static(b"data")).await;
        let stats = store.clean_expired().await.unwrap();

        assert!(stats.removed.is_empty());
        assert_eq!(stats.retained_files, 1);
        assert!(store.is_cached(&key).await);
    }

    #[tokio::test]
    async fn test_remove_all_clears_the_directory() {
        let dir = halcyon_test::tempdir();
        let store = store_in(dir.path(), HOUR, 0);
        let key = key("https://example.com/d.png");

        store.store(&key, &Bytes::from_static(b"data")).await;
        store.remove_all().await;

        assert!(!store.root().exists());
        assert_eq!(store.total_size().await, 0);

        // The directory is re-created on the next write.
        store.store(&key, &Bytes::from_static(b"data")).await;
        assert!(store.is_cached(&key).await);
    }

    #[tokio::test]
    async fn test_cleanup_without_directory() {
        let dir = halcyon_test::tempdir();
        let store = store_in(&dir.path().join("never-created"), HOUR, 0);

        let stats = store.clean_expired().await.unwrap();
        assert!(stats.removed.is_empty());
        assert_eq!(stats.retained_files, 0);
    }
}
