//! # Halcyon caching infrastructure
//!
//! This module contains the two cache tiers and the facade that composes
//! them, together with the central [`RetrieveError`] type.
//!
//! ## Cache tiers
//!
//! A retrieval goes through the following layers:
//!
//! - An in-memory tier ([`MemoryStore`]): a bounded, cost-weighted map from
//!   [`CacheKey`] to decoded artifact. Entries here are advisory, they can
//!   always be re-derived from disk or the network, so the store is free to
//!   evict under cost pressure using the underlying container's own
//!   heuristic.
//! - A disk tier ([`DiskStore`]): a flat directory of files named by the
//!   SHA-256 digest of the cache key, holding the raw *encoded* bytes. The
//!   file's modification time stands in for entry metadata; there is no
//!   sidecar index. Reads deliberately do not refresh the mtime: recency on
//!   disk means write-recency, which keeps the cleanup sweep's oldest-first
//!   ordering meaningful.
//!
//! The [`ArtifactCache`] facade defines the lookup order (memory, then disk),
//! promotes disk hits into memory, and schedules disk writes and cleanup
//! sweeps. A sweep that actually removed files broadcasts a
//! [`CleanupNotice`] so collaborators (for example an ETag side-index) can
//! invalidate their own state; manual clears intentionally do not notify.
//!
//! ## Errors
//!
//! [`RetrieveError`] covers the whole retrieval pipeline. Disk write
//! failures are notably absent: persisting to disk is a best-effort
//! optimization, failures there are logged and swallowed and never abort the
//! in-memory success path.

mod cache_error;
mod cache_key;
mod disk;
mod facade;
mod memory;

pub use cache_error::{RetrieveError, RetrieveResult};
pub use cache_key::CacheKey;
pub use disk::{DiskStore, SweepStats};
pub use facade::{ArtifactCache, CleanupNotice};
pub use memory::{MemoryEntry, MemoryStore};

/// Which layer satisfied a retrieval.
///
/// Reported to the caller for diagnostics; [`Tier::None`] means the artifact
/// was freshly fetched from the network.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tier {
    /// Not served from any cache layer.
    None,
    /// Served from the in-memory tier.
    Memory,
    /// Served from the disk tier.
    Disk,
}
