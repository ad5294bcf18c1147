//! Source retrieval into the content-addressed cache.
//!
//! The [`Fetcher`] never talks to the network itself: bytes come from a
//! [`Transport`], are checked against the manifest digest and only then land
//! in the [`ArtifactCache`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use reqwest::blocking::Client;
use tracing::{debug, error, warn};
use crate::cache::{ArtifactCache, CacheEntry};
use crate::digest;
use crate::error::{EngineError, EngineResult};

/// Caller-controlled cancellation: an explicit flag plus an optional deadline.
///
/// Clones share the flag, so cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns [`EngineError::Cancelled`] once cancelled.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Retrieves raw bytes for a URL.
pub trait Transport: Send + Sync {
    /// Fetches the full payload behind `url`.
    ///
    /// Failures must be reported as [`EngineError::NetworkError`] (or
    /// [`EngineError::Cancelled`]).
    fn get(&self, url: &str, cancel: &CancelToken) -> EngineResult<Vec<u8>>;
}

/// HTTP(S) transport on a blocking reqwest client.
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, cancel: &CancelToken) -> EngineResult<Vec<u8>> {
        cancel.check()?;
        let timeout = cancel
            .remaining()
            .map_or(self.timeout, |left| left.min(self.timeout));
        let response = self
            .client
            .get(url)
            .header("User-Agent", concat!("formulary/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| EngineError::network(url, e))?;
        let bytes = response.bytes().map_err(|e| EngineError::network(url, e))?;
        Ok(bytes.to_vec())
    }
}

/// Reads `file://` URLs from the local filesystem.
#[derive(Debug, Default)]
pub struct FileTransport;

impl Transport for FileTransport {
    fn get(&self, url: &str, cancel: &CancelToken) -> EngineResult<Vec<u8>> {
        cancel.check()?;
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        std::fs::read(&path).map_err(|e| EngineError::network(url, e))
    }
}

/// Dispatches on the URL scheme: `file://` locally, `http(s)://` over reqwest.
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: HttpTransport::new(timeout),
            file: FileTransport,
        }
    }
}

impl Transport for DefaultTransport {
    fn get(&self, url: &str, cancel: &CancelToken) -> EngineResult<Vec<u8>> {
        if url.starts_with("file://") {
            self.file.get(url, cancel)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.http.get(url, cancel)
        } else {
            Err(EngineError::network(url, "unsupported URL scheme"))
        }
    }
}

/// Fetches and verifies payloads, caching them by digest.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    cache: ArtifactCache,
}

impl Fetcher {
    pub fn new<T: Transport + 'static>(transport: T, cache: ArtifactCache) -> Self {
        Self::with_transport(Arc::new(transport), cache)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, cache: ArtifactCache) -> Self {
        Self { transport, cache }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Returns the cache entry for `expected`, fetching `url` only on a miss.
    ///
    /// # Errors
    /// - [`EngineError::NetworkError`] if the transport fails (retryable)
    /// - [`EngineError::DigestMismatch`] if the bytes do not hash to `expected`;
    ///   nothing is cached in that case
    pub fn fetch(&self, url: &str, expected: &str, cancel: &CancelToken) -> EngineResult<CacheEntry> {
        cancel.check()?;
        if let Some(entry) = self.cache.get(expected)? {
            if digest::verify(&entry.read()?, expected) {
                debug!("Cache hit for {} ({})", url, digest::short(expected));
                return Ok(entry);
            }
            warn!("Cached payload {} is corrupt, fetching again", digest::short(expected));
            self.cache.remove(expected)?;
        }

        debug!("Fetching {}", url);
        let bytes = self.transport.get(url, cancel)?;
        cancel.check()?;

        let actual = digest::compute(&bytes);
        if !digest::verify(&bytes, expected) {
            error!(url, expected, actual = %actual, "Digest mismatch, discarding payload");
            return Err(EngineError::DigestMismatch {
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        self.cache.put(expected, &bytes)
    }

    /// Fetches several `(url, digest)` pairs in parallel.
    ///
    /// Pairs sharing a digest are fetched once. Results are keyed by digest.
    pub fn fetch_many(
        &self,
        sources: &[(String, String)],
        cancel: &CancelToken,
    ) -> BTreeMap<String, EngineResult<CacheEntry>> {
        let mut unique: BTreeMap<&str, &str> = BTreeMap::new();
        for (url, digest) in sources {
            unique.entry(digest.as_str()).or_insert(url.as_str());
        }
        std::thread::scope(|scope| {
            let handles: Vec<_> = unique
                .into_iter()
                .map(|(digest, url)| {
                    let handle = scope.spawn(move || self.fetch(url, digest, cancel));
                    (digest.to_string(), url, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(digest, url, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(EngineError::network(url, "fetch worker panicked")));
                    (digest, result)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingTransport {
        payloads: Mutex<BTreeMap<String, Vec<u8>>>,
        calls: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn get(&self, url: &str, _cancel: &CancelToken) -> EngineResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payloads
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| EngineError::network(url, "not found"))
        }
    }

    fn fetcher(transport: Arc<CountingTransport>) -> (tempfile::TempDir, Fetcher) {
        let dir = tempdir().unwrap();
        let fetcher = Fetcher::with_transport(transport, ArtifactCache::new(dir.path()));
        (dir, fetcher)
    }

    #[test]
    fn test_second_fetch_is_served_from_cache() {
        let transport = Arc::new(CountingTransport::default());
        transport.payloads.lock().unwrap().insert("mem://a".into(), b"abc".to_vec());
        let (_dir, fetcher) = fetcher(transport.clone());
        let digest = digest::compute(b"abc");

        fetcher.fetch("mem://a", &digest, &CancelToken::new()).unwrap();
        fetcher.fetch("mem://a", &digest, &CancelToken::new()).unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mismatch_is_not_cached() {
        let transport = Arc::new(CountingTransport::default());
        transport.payloads.lock().unwrap().insert("mem://a".into(), b"abd".to_vec());
        let (_dir, fetcher) = fetcher(transport);
        let digest = digest::compute(b"abc");

        let err = fetcher.fetch("mem://a", &digest, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, EngineError::DigestMismatch { .. }));
        assert!(fetcher.cache().get(&digest).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_cache_entry_is_refetched() {
        let transport = Arc::new(CountingTransport::default());
        transport.payloads.lock().unwrap().insert("mem://a".into(), b"abc".to_vec());
        let (_dir, fetcher) = fetcher(transport.clone());
        let digest = digest::compute(b"abc");
        let entry = fetcher.cache().put(&digest, b"rotten").unwrap();

        let fetched = fetcher.fetch("mem://a", &digest, &CancelToken::new()).unwrap();
        assert_eq!(fetched.path, entry.path);
        assert_eq!(fetched.read().unwrap(), b"abc");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_token_stops_fetch() {
        let transport = Arc::new(CountingTransport::default());
        let (_dir, fetcher) = fetcher(transport.clone());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = fetcher.fetch("mem://a", &digest::compute(b"x"), &cancel).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_expired_deadline_is_cancelled() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        assert_eq!(token.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_fetch_many_dedupes_digests() {
        let transport = Arc::new(CountingTransport::default());
        {
            let mut payloads = transport.payloads.lock().unwrap();
            payloads.insert("mem://a".into(), b"same".to_vec());
            payloads.insert("mem://b".into(), b"other".to_vec());
        }
        let (_dir, fetcher) = fetcher(transport.clone());
        let same = digest::compute(b"same");
        let other = digest::compute(b"other");
        let results = fetcher.fetch_many(
            &[
                ("mem://a".into(), same.clone()),
                ("mem://a".into(), same.clone()),
                ("mem://b".into(), other.clone()),
            ],
            &CancelToken::new(),
        );
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.is_ok()));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_file_transport_reads_local_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        std::fs::write(&path, b"local").unwrap();
        let url = format!("file://{}", path.display());
        let bytes = DefaultTransport::new(Duration::from_secs(1))
            .get(&url, &CancelToken::new())
            .unwrap();
        assert_eq!(bytes, b"local");
    }

    #[test]
    fn test_unsupported_scheme_is_network_error() {
        let err = DefaultTransport::new(Duration::from_secs(1))
            .get("ftp://example.org/x", &CancelToken::new())
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
