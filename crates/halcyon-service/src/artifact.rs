//! The decoder/encoder seam between the cache core and payload formats.

use bytes::Bytes;

use crate::caching::{RetrieveError, RetrieveResult};

/// Turns raw payload bytes into a ready-to-use in-memory artifact and back.
///
/// The cache core never interprets payload bytes itself; format sniffing and
/// transform pipelines live entirely behind this trait. Implementations must
/// be cheap to share, decoding may be dispatched to a blocking worker thread
/// (see `RetrieveOptions::decode_in_background`).
pub trait ArtifactProcessor: Send + Sync + 'static {
    type Artifact: Clone + Send + Sync + 'static;

    /// A stable identifier mixed into cache keys.
    ///
    /// Two processors producing different artifacts from the same bytes must
    /// return different identifiers, otherwise they will collide in the
    /// cache. The empty string is reserved for "no processing".
    fn identifier(&self) -> &str {
        ""
    }

    /// Decodes raw bytes into an artifact.
    fn decode(&self, bytes: &Bytes) -> RetrieveResult<Self::Artifact>;

    /// Re-encodes an artifact into bytes.
    ///
    /// This is only used as a fallback when the original raw bytes are not
    /// available at store time, so fidelity may be lower than the original
    /// encoding.
    fn encode(&self, artifact: &Self::Artifact) -> RetrieveResult<Bytes>;

    /// The cost of keeping this artifact in the in-memory cache.
    fn cost(&self, artifact: &Self::Artifact) -> u32;
}

/// A processor whose artifacts are the raw bytes themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughProcessor;

impl ArtifactProcessor for PassthroughProcessor {
    type Artifact = Bytes;

    fn decode(&self, bytes: &Bytes) -> RetrieveResult<Bytes> {
        if bytes.is_empty() {
            return Err(RetrieveError::Decode("empty payload".into()));
        }
        Ok(bytes.clone())
    }

    fn encode(&self, artifact: &Bytes) -> RetrieveResult<Bytes> {
        Ok(artifact.clone())
    }

    fn cost(&self, artifact: &Bytes) -> u32 {
        artifact.len().try_into().unwrap_or(u32::MAX)
    }
}
