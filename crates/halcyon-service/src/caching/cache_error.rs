use std::time::Duration;

use thiserror::Error;

/// An error that happens while retrieving a resource.
///
/// Network and decode errors reach the original caller's completion exactly
/// once. Disk write failures never show up here: the disk tier is a
/// best-effort optimization and swallows its own errors. Nothing is retried
/// automatically, retry policy is a caller concern layered on top.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrieveError {
    /// The resource identifier was empty or otherwise malformed.
    ///
    /// This fails fast, synchronously, before any work is scheduled.
    #[error("invalid resource key")]
    InvalidKey,
    /// The resource was not found, either remotely (4xx) or in the cache.
    #[error("not found")]
    NotFound,
    /// The transport failed: connection loss, DNS, TLS, or a 5xx response.
    ///
    /// The attached string contains the innermost failure.
    #[error("download failed: {0}")]
    Network(String),
    /// The request did not complete within the configured timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The server replied with HTTP 304 Not Modified.
    ///
    /// This is a soft success: the orchestration layer re-runs the cache
    /// lookup and serves the existing entry instead of failing the request.
    #[error("resource not modified")]
    NotModified,
    /// The fetched bytes could not be decoded into a valid artifact.
    #[error("malformed artifact: {0}")]
    Decode(String),
    /// The shared fetch for this key was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

impl RetrieveError {
    /// Builds a [`Network`](Self::Network) error from the innermost source of
    /// an error chain.
    pub(crate) fn download_error(mut error: &dyn std::error::Error) -> Self {
        while let Some(source) = error.source() {
            error = source;
        }

        let mut error_string = error.to_string();

        // Special-case a few noisy TLS error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }
        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Network(error_string)
    }
}

/// Result of a retrieval step.
pub type RetrieveResult<T = ()> = Result<T, RetrieveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_uses_innermost_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        let err = RetrieveError::download_error(&inner);
        assert_eq!(err, RetrieveError::Network("connection reset".into()));
    }
}
