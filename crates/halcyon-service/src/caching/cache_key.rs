use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::cache_error::RetrieveError;

/// The key under which a resource is cached.
///
/// A key is derived from the resource's URL plus an optional processor
/// identifier suffix, so the same URL decoded by two different processors
/// yields two distinct cache entries. The human-readable identity is kept
/// for diagnostics; equality and hashing use the SHA-256 digest, which also
/// forms the on-disk filename.
///
/// Hash collisions between distinct identities are accepted as a trade-off:
/// this is a cache, not a security boundary.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    identity: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] for a bare resource identifier.
    pub fn new(resource: &str) -> Result<Self, RetrieveError> {
        Self::with_processor(resource, None)
    }

    /// Creates a [`CacheKey`] for a resource identifier processed by the
    /// processor with the given identifier.
    ///
    /// An empty processor identifier means "no processing" and produces the
    /// same key as [`CacheKey::new`].
    pub fn with_processor(
        resource: &str,
        processor: Option<&str>,
    ) -> Result<Self, RetrieveError> {
        if resource.trim().is_empty() {
            return Err(RetrieveError::InvalidKey);
        }

        let identity = match processor {
            Some(id) if !id.is_empty() => format!("{resource}@{id}"),
            _ => resource.to_owned(),
        };

        let hash = Sha256::digest(identity.as_bytes());
        // FIXME: `sha2` should really adopt const generics, this is such a pain right now
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        Ok(Self {
            identity: identity.into(),
            hash,
        })
    }

    /// Returns the human-readable identity this key was built from.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the on-disk filename for this key.
    ///
    /// The filename is the hex-formatted SHA-256 digest of the identity, with
    /// no extension.
    pub fn filename(&self) -> String {
        let mut name = String::with_capacity(64);
        for b in &self.hash {
            name.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_is_stable() {
        let a = CacheKey::new("https://example.com/a.png").unwrap();
        let b = CacheKey::new("https://example.com/a.png").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.filename(), b.filename());
        assert_eq!(a.filename().len(), 64);
        assert!(a.filename().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_processor_suffix_changes_key() {
        let plain = CacheKey::new("https://example.com/a.png").unwrap();
        let processed =
            CacheKey::with_processor("https://example.com/a.png", Some("thumb-64")).unwrap();
        let empty = CacheKey::with_processor("https://example.com/a.png", Some("")).unwrap();

        assert_ne!(plain, processed);
        assert_eq!(plain, empty);
        assert_eq!(processed.identity(), "https://example.com/a.png@thumb-64");
    }

    #[test]
    fn test_invalid_keys_rejected() {
        assert_eq!(CacheKey::new("").unwrap_err(), RetrieveError::InvalidKey);
        assert_eq!(CacheKey::new("   ").unwrap_err(), RetrieveError::InvalidKey);
    }
}
