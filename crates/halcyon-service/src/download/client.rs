use std::time::Duration;

use crate::config::DownloadTimeouts;

/// Builds the [`reqwest::Client`] used for resource downloads.
///
/// When `accept_invalid_certs` is set, server certificates are not validated.
/// Such a client is only ever used for hosts explicitly listed in the
/// `trusted_hosts` configuration.
pub fn create_client(timeouts: &DownloadTimeouts, accept_invalid_certs: bool) -> reqwest::Client {
    reqwest::Client::builder()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        // The builder only errors on TLS backend / resolver initialization.
        .unwrap()
}
