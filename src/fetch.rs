// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! HTTP(S) fetching with caching, retries and digest verification.

The [Fetcher] is the single entry point for network I/O. Every retrieved
artifact lands in the [Cache]; a matching cached entry satisfies a fetch
without touching the network. Concurrent fetches of the same URL are
collapsed into one download by a per-URL single-flight lock.

Transport is abstracted behind the [Transport] trait so repository and
resolver logic can be exercised against in-memory fixtures; the production
implementation is [HttpTransport] (reqwest, which picks up `HTTP_PROXY` /
`HTTPS_PROXY` from the environment).
*/

use {
    crate::{
        cache::{sha256_file, Cache},
        cancel::CancelToken,
        error::{BuildError, Result},
    },
    async_trait::async_trait,
    std::{
        collections::HashMap,
        path::PathBuf,
        sync::Arc,
        time::Duration,
    },
    tokio::io::AsyncWriteExt,
    url::Url,
};

/// Maximum download attempts for one URL.
const MAX_ATTEMPTS: u32 = 5;

/// Base delay of the exponential backoff between attempts.
const BACKOFF_BASE_MS: u64 = 500;

/// Release files are refetched after this age when no digest pins them.
const RELEASE_TTL_SECS: u64 = 24 * 60 * 60;

/// Body of one transport request.
pub struct TransportBody {
    /// Received bytes. When `resumed`, these continue at the requested offset.
    pub data: Vec<u8>,
    /// Whether the server honored the range request.
    pub resumed: bool,
    /// Whether the server advertises `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
}

/// Generic mechanism for retrieving a URL.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a URL, optionally resuming from a byte offset.
    ///
    /// Implementations classify failures: [BuildError::NotFound] for missing
    /// resources, [BuildError::Network] for transient conditions worth
    /// retrying (connection failures, 5xx, 408, 429) and
    /// [BuildError::HttpStatus] for anything else.
    async fn get(&self, url: &Url, resume_from: u64) -> Result<TransportBody>;
}

/// [Transport] implementation over HTTP(S) via reqwest.
#[derive(Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url, resume_from: u64) -> Result<TransportBody> {
        let mut request = self.client.get(url.clone());

        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
        }

        let response = request.send().await.map_err(|e| BuildError::Network {
            url: url.to_string(),
            message: format!("{}", e),
        })?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BuildError::NotFound(url.to_string()));
        }

        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Err(BuildError::Network {
                url: url.to_string(),
                message: format!("HTTP status {}", status),
            });
        }

        if !(status.is_success()) {
            return Err(BuildError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resumed = status == reqwest::StatusCode::PARTIAL_CONTENT;
        let accept_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(resumed);

        let data = response
            .bytes()
            .await
            .map_err(|e| BuildError::Network {
                url: url.to_string(),
                message: format!("error reading body: {}", e),
            })?
            .to_vec();

        Ok(TransportBody {
            data,
            resumed,
            accept_ranges,
        })
    }
}

/// In-memory [Transport] test double.
///
/// Records every request so tests can assert on (the absence of) network I/O.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryTransport {
    entries: std::sync::Mutex<HashMap<String, Vec<u8>>>,
    requests: std::sync::Mutex<Vec<String>>,
    fail_first: std::sync::Mutex<HashMap<String, u32>>,
}

#[cfg(test)]
impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body served for a URL.
    pub fn insert(&self, url: impl ToString, data: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .unwrap()
            .insert(url.to_string(), data.into());
    }

    /// Make the first `count` requests for a URL fail with a transient error.
    pub fn fail_first(&self, url: impl ToString, count: u32) {
        self.fail_first.lock().unwrap().insert(url.to_string(), count);
    }

    /// Number of requests issued for one URL.
    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_str() == url)
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MemoryTransport {
    async fn get(&self, url: &Url, _resume_from: u64) -> Result<TransportBody> {
        let key = url.to_string();

        self.requests.lock().unwrap().push(key.clone());

        {
            let mut failures = self.fail_first.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BuildError::Network {
                        url: key,
                        message: "injected failure".to_string(),
                    });
                }
            }
        }

        match self.entries.lock().unwrap().get(&key) {
            Some(data) => Ok(TransportBody {
                data: data.clone(),
                resumed: false,
                accept_ranges: false,
            }),
            None => Err(BuildError::NotFound(key)),
        }
    }
}

/// Downloads artifacts into the cache, with verification and retries.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    cache: Cache,
    cancel: CancelToken,
    single_flight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Fetcher {
    /// Construct an instance over a transport and cache.
    pub fn new(transport: Arc<dyn Transport>, cache: Cache, cancel: CancelToken) -> Self {
        Self {
            transport,
            cache,
            cancel,
            single_flight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Construct an HTTP-backed instance.
    pub fn over_http(cache: Cache, cancel: CancelToken) -> Self {
        Self::new(Arc::new(HttpTransport::new()), cache, cancel)
    }

    /// The cache this fetcher writes into.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    async fn url_lock(&self, url: &Url) -> Arc<tokio::sync::Mutex<()>> {
        self.single_flight
            .lock()
            .await
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fetch a URL into the cache, returning the local path.
    ///
    /// With `expected_sha256` set, a cached file with a matching digest is
    /// returned without network I/O and the downloaded content is verified
    /// against the digest before being published. Without it, a cached entry
    /// younger than 24 hours is reused (release files).
    pub async fn fetch(&self, url: &Url, expected_sha256: Option<&str>) -> Result<PathBuf> {
        self.cancel.check()?;

        // file:// URLs bypass cache and network.
        if url.scheme() == "file" {
            let path = PathBuf::from(url.path());

            return if path.is_file() {
                Ok(path)
            } else {
                Err(BuildError::NotFound(url.to_string()))
            };
        }

        if let Some(path) = self.lookup(url, expected_sha256) {
            tracing::debug!(url = %url, "cache hit");
            return Ok(path);
        }

        let lock = self.url_lock(url).await;
        let _guard = lock.lock().await;

        // Another flight may have completed the download while we waited.
        if let Some(path) = self.lookup(url, expected_sha256) {
            return Ok(path);
        }

        let path = self.download(url, expected_sha256).await?;

        Ok(path)
    }

    /// Fetch a URL and read its content.
    pub async fn fetch_bytes(&self, url: &Url, expected_sha256: Option<&str>) -> Result<Vec<u8>> {
        let path = self.fetch(url, expected_sha256).await?;

        Ok(tokio::fs::read(path).await?)
    }

    fn lookup(&self, url: &Url, expected_sha256: Option<&str>) -> Option<PathBuf> {
        match expected_sha256 {
            Some(digest) => self.cache.lookup_download(url, digest),
            None => self.cache.lookup_download_fresh(url, RELEASE_TTL_SECS),
        }
    }

    async fn download(&self, url: &Url, expected_sha256: Option<&str>) -> Result<PathBuf> {
        let part_path = {
            let mut p = self.cache.download_path(url).into_os_string();
            p.push(".part");
            PathBuf::from(p)
        };

        let mut integrity_retried = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.cancel.check()?;

            let resume_from = tokio::fs::metadata(&part_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            match self
                .attempt_download(url, &part_path, resume_from, expected_sha256)
                .await
            {
                Ok(path) => return Ok(path),

                Err(BuildError::Integrity {
                    url: u,
                    expected,
                    actual,
                }) => {
                    // Never retry against the same cached bytes: drop them,
                    // then allow exactly one fresh download.
                    let _ = tokio::fs::remove_file(&part_path).await;
                    self.cache.invalidate_download(url)?;

                    if integrity_retried {
                        return Err(BuildError::Integrity {
                            url: u,
                            expected,
                            actual,
                        });
                    }

                    tracing::warn!(url = %url, "digest mismatch; retrying once with a fresh download");
                    integrity_retried = true;
                }

                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
                    tracing::debug!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient fetch failure; backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(BuildError::Cancelled),
                    }
                }

                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_download(
        &self,
        url: &Url,
        part_path: &PathBuf,
        resume_from: u64,
        expected_sha256: Option<&str>,
    ) -> Result<PathBuf> {
        let body = match self.transport.get(url, resume_from).await {
            Ok(body) => body,
            Err(e) => {
                // Partial state is only useful if the server can resume.
                if !matches!(e, BuildError::Network { .. }) || resume_from == 0 {
                    let _ = tokio::fs::remove_file(part_path).await;
                }
                return Err(e);
            }
        };

        let mut file = if body.resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(part_path)
                .await?
        } else {
            tokio::fs::File::create(part_path).await?
        };

        file.write_all(&body.data).await?;
        file.flush().await?;
        drop(file);

        self.cancel.check()?;

        let actual = sha256_file(part_path)?;

        if let Some(expected) = expected_sha256 {
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(BuildError::Integrity {
                    url: url.to_string(),
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }

        let path = self.cache.publish_download(url, part_path, &actual)?;

        tracing::debug!(url = %url, path = %path.display(), "fetched");

        Ok(path)
    }
}
