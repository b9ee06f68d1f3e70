//! # Halcyon
//!
//! Halcyon is a client-side resource-retrieval cache. Given a URL-like
//! resource key it coordinates the network fetch, on-disk persistence,
//! in-memory caching and single-flight request coalescing, and hands a
//! decoded artifact back to one or more concurrent callers.
//!
//! The crate is organized around three layers:
//!
//! - [`caching`] holds the two cache tiers: a bounded, cost-weighted
//!   in-memory store and a flat-directory disk store with mtime based
//!   expiration, composed by the [`ArtifactCache`] facade.
//! - [`download`] holds the [`Downloader`], which deduplicates concurrent
//!   fetches for the same key and fans progress and completion out to all
//!   waiters.
//! - [`manager`] ties both together: try the cache, fall back to the
//!   network, write the result back.
//!
//! Artifact decoding is pluggable via the [`ArtifactProcessor`] trait; the
//! cache core never interprets payload bytes itself.

#[macro_use]
pub mod metrics;

pub mod artifact;
pub mod caching;
pub mod config;
pub mod download;
pub mod manager;

pub use artifact::{ArtifactProcessor, PassthroughProcessor};
pub use caching::{
    ArtifactCache, CacheKey, CleanupNotice, RetrieveError, RetrieveResult, Tier,
};
pub use config::{Config, DownloadTimeouts, RetrieveOptions};
pub use download::{Downloader, ProgressCallback, RequestModifier, RetrieveTask};
pub use manager::{Manager, Retrieval};
