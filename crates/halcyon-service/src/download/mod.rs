//! Coalescing resource downloads.
//!
//! The [`Downloader`] keeps a registry of in-flight fetches keyed by the
//! *final* request URL, after the caller's [`RequestModifier`] has run. The
//! first caller for a URL spawns the actual network transfer; every further
//! caller arriving while it runs is attached to the same transfer instead of
//! issuing a second request. Two different resource strings that a modifier
//! rewrites to the same URL therefore share one transfer. Progress is fanned
//! out to all attached callers as chunks arrive, and the final result
//! (success or error) is delivered to each of them exactly once.
//!
//! Cancellation is shared per key: cancelling any [`RetrieveTask`] attached
//! to a transfer aborts it for all waiters, which then observe
//! [`RetrieveError::Cancelled`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{self, HeaderValue};
use reqwest::{Method, StatusCode};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::caching::{CacheKey, RetrieveError, RetrieveResult};
use crate::config::{Config, DownloadTimeouts};

mod client;

pub use client::create_client;

/// The user agent sent with every outgoing request.
pub const USER_AGENT: &str = concat!("halcyon/", env!("CARGO_PKG_VERSION"));

/// Called with `(received_bytes, total_bytes)` as a transfer makes progress.
///
/// The total is `None` when the server did not announce a content length.
/// Callbacks attached to the same coalesced transfer all observe the same
/// progress stream.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Hook that can rewrite an outgoing request before it is sent.
///
/// The modifier runs before the coalescing key is derived from the request's
/// URL, so two resources rewritten to the same final URL share one transfer.
/// Callers that join an in-flight transfer share the request exactly as it
/// was built by the caller that started it, headers included.
pub trait RequestModifier: Send + Sync + 'static {
    fn modify(&self, request: &mut reqwest::Request);
}

#[derive(Default)]
struct Waiters {
    senders: Vec<oneshot::Sender<RetrieveResult<Bytes>>>,
    progress: Vec<ProgressCallback>,
}

/// One in-flight transfer shared by all callers waiting for the same key.
struct FetchLoad {
    key: CacheKey,
    cancelled: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
    waiters: Mutex<Waiters>,
}

impl FetchLoad {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            cancelled: AtomicBool::new(false),
            abort: Mutex::new(None),
            waiters: Mutex::new(Waiters::default()),
        }
    }

    /// Fans one progress update out to all attached callbacks.
    ///
    /// The callback list is snapshotted under the lock and invoked outside
    /// it, so a callback is free to call back into the downloader.
    fn report_progress(&self, received: u64, total: Option<u64>) {
        let callbacks = self.waiters.lock().unwrap().progress.clone();
        for callback in callbacks {
            callback(received, total);
        }
    }

    /// Aborts the transfer. The aborted task's cleanup guard notifies all
    /// waiters with [`RetrieveError::Cancelled`].
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.abort.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Handle to one caller's retrieval, usable to cancel it.
///
/// The handle is returned synchronously, before any network work is
/// scheduled, so cancellation is possible at every stage. Once the retrieval
/// is attached to a transfer, cancelling aborts that transfer for every
/// caller attached to it.
#[derive(Clone, Default)]
pub struct RetrieveTask {
    inner: Arc<TaskInner>,
}

#[derive(Default)]
struct TaskInner {
    cancelled: AtomicBool,
    binding: Mutex<Option<Arc<FetchLoad>>>,
}

impl RetrieveTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels the retrieval, and with it the shared transfer it is attached
    /// to, if any. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let load = self.inner.binding.lock().unwrap().clone();
        if let Some(load) = load {
            load.cancel();
        }
    }

    /// Attaches this handle to an in-flight transfer.
    ///
    /// A cancel that raced the attachment is applied immediately.
    fn bind(&self, load: &Arc<FetchLoad>) {
        *self.inner.binding.lock().unwrap() = Some(Arc::clone(load));
        if self.is_cancelled() {
            load.cancel();
        }
    }
}

impl fmt::Debug for RetrieveTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveTask")
            .field("cancelled", &self.is_cancelled())
            .field("bound", &self.inner.binding.lock().unwrap().is_some())
            .finish()
    }
}

/// Downloads resources over HTTP, coalescing concurrent fetches per final
/// request URL.
pub struct Downloader {
    timeouts: DownloadTimeouts,
    trusted_hosts: BTreeSet<String>,
    client: reqwest::Client,
    trusted_client: reqwest::Client,
    registry: Mutex<HashMap<CacheKey, Arc<FetchLoad>>>,
}

impl Downloader {
    pub fn new(config: &Config) -> Self {
        Self {
            timeouts: config.timeouts,
            trusted_hosts: config.trusted_hosts.clone(),
            client: client::create_client(&config.timeouts, false),
            trusted_client: client::create_client(&config.timeouts, true),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// The number of transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Fetches the resource at `url`, joining an in-flight transfer for the
    /// same final URL if one exists.
    ///
    /// The request is built and the `modifier` applied *before* the
    /// coalescing key is derived, so URL rewrites participate in
    /// deduplication. Whether this call starts or joins a transfer is then
    /// decided atomically, so two racing callers can never both start one.
    /// The result is the raw response body; decoding happens in the cache
    /// layer.
    pub async fn fetch(
        self: &Arc<Self>,
        url: &str,
        task: &RetrieveTask,
        progress: Option<ProgressCallback>,
        modifier: Option<Arc<dyn RequestModifier>>,
    ) -> RetrieveResult<Bytes> {
        if task.is_cancelled() {
            return Err(RetrieveError::Cancelled);
        }

        let request = build_request(url, modifier)?;
        let key = CacheKey::new(request.url().as_str())?;

        let (load, receiver) = {
            let mut registry = self.registry.lock().unwrap();

            if let Some(load) = registry.get(&key) {
                metric!(counter("downloads.coalesced") += 1);
                let receiver = Self::attach_waiter(load, progress);
                (Arc::clone(load), receiver)
            } else {
                let load = Arc::new(FetchLoad::new(key.clone()));
                let receiver = Self::attach_waiter(&load, progress);
                registry.insert(key, Arc::clone(&load));

                // Spawning and storing the abort handle happen under the
                // registry lock, so no joiner can observe the load without a
                // cancellable handle in place.
                let this = Arc::clone(self);
                let spawn_load = Arc::clone(&load);
                let handle = tokio::spawn(async move {
                    let guard_this = Arc::clone(&this);
                    let guard_load = Arc::clone(&spawn_load);
                    // Runs when the task is aborted or panics; a no-op after
                    // the regular finalize below.
                    let _guard = defer(move || {
                        guard_this.finalize_load(&guard_load, Err(RetrieveError::Cancelled));
                    });

                    let result = this.stream(&spawn_load, request).await;
                    this.finalize_load(&spawn_load, result);
                });
                *load.abort.lock().unwrap() = Some(handle.abort_handle());

                metric!(counter("downloads.started") += 1);
                (load, receiver)
            }
        };

        task.bind(&load);

        match receiver.await {
            Ok(result) => result,
            // The sender side is dropped without a value only if the transfer
            // task vanished; treat that like a cancellation.
            Err(_) => Err(RetrieveError::Cancelled),
        }
    }

    fn attach_waiter(
        load: &Arc<FetchLoad>,
        progress: Option<ProgressCallback>,
    ) -> oneshot::Receiver<RetrieveResult<Bytes>> {
        let (sender, receiver) = oneshot::channel();
        let mut waiters = load.waiters.lock().unwrap();
        waiters.senders.push(sender);
        if let Some(progress) = progress {
            waiters.progress.push(progress);
        }
        receiver
    }

    /// Removes the load from the registry and delivers `result` to every
    /// waiter. Idempotent; only the first call finds waiters to notify.
    fn finalize_load(&self, load: &Arc<FetchLoad>, result: RetrieveResult<Bytes>) {
        {
            let mut registry = self.registry.lock().unwrap();
            let is_current = registry
                .get(&load.key)
                .is_some_and(|current| Arc::ptr_eq(current, load));
            if is_current {
                registry.remove(&load.key);
            }
        }

        let waiters = std::mem::take(&mut *load.waiters.lock().unwrap());
        if waiters.senders.is_empty() {
            return;
        }

        let status = match &result {
            Ok(_) => "ok",
            Err(RetrieveError::NotModified) => "not_modified",
            Err(RetrieveError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        metric!(counter("downloads.finished") += 1, "status" => status);

        for sender in waiters.senders {
            // A waiter that stopped listening is fine.
            sender.send(result.clone()).ok();
        }
    }

    /// Performs the actual HTTP transfer for one load.
    async fn stream(&self, load: &FetchLoad, request: reqwest::Request) -> RetrieveResult<Bytes> {
        let url = request.url().clone();
        let trusted = url
            .host_str()
            .is_some_and(|host| self.trusted_hosts.contains(host));
        let client = if trusted {
            &self.trusted_client
        } else {
            &self.client
        };

        tracing::debug!("Fetching `{url}`");
        let response = client
            .execute(request)
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Err(RetrieveError::NotModified);
        } else if status.is_client_error() {
            tracing::debug!("Response from `{url}`: {status}");
            return Err(RetrieveError::NotFound);
        } else if !status.is_success() {
            tracing::debug!("Response from `{url}`: {status}");
            return Err(RetrieveError::Network(format!("server responded {status}")));
        }

        let total = response.content_length();
        let mut body = BytesMut::new();
        let mut received = 0u64;
        let mut chunks = response.bytes_stream();

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| self.map_error(e))?;
            received += chunk.len() as u64;
            body.extend_from_slice(&chunk);
            load.report_progress(received, total);
        }

        metric!(time_raw("downloads.size") = received);
        Ok(body.freeze())
    }

    fn map_error(&self, error: reqwest::Error) -> RetrieveError {
        if error.is_timeout() {
            RetrieveError::Timeout(self.timeouts.request)
        } else {
            RetrieveError::download_error(&error)
        }
    }
}

/// Builds the outgoing request and applies the caller's modifier, fixing the
/// final URL the transfer will coalesce on.
fn build_request(
    url: &str,
    modifier: Option<Arc<dyn RequestModifier>>,
) -> RetrieveResult<reqwest::Request> {
    let parsed = reqwest::Url::parse(url).map_err(|_| RetrieveError::InvalidKey)?;
    let mut request = reqwest::Request::new(Method::GET, parsed);
    request
        .headers_mut()
        .insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    if let Some(modifier) = modifier {
        modifier.modify(&mut request);
    }
    Ok(request)
}

/// Runs `f` when the returned guard is dropped, whether normally or because
/// the surrounding task was aborted.
fn defer<F: FnOnce()>(f: F) -> impl Drop {
    struct Guard<F: FnOnce()>(Option<F>);

    impl<F: FnOnce()> Drop for Guard<F> {
        fn drop(&mut self) {
            if let Some(f) = self.0.take() {
                f()
            }
        }
    }

    Guard(Some(f))
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("timeouts", &self.timeouts)
            .field("trusted_hosts", &self.trusted_hosts)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
