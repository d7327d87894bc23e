//! Linked file resolution: cache lookup, then download with mirrors and retries.

mod cache;

pub use cache::FileCache;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::error::{CartonError, Result};
use crate::telemetry;

enum Attempt {
    Verified(PathBuf),
    Mismatch(String),
    Failed(String),
}

/// Downloads linked files into a [`FileCache`].
pub struct LinkFetcher {
    client: reqwest::Client,
    cache: FileCache,
    config: FetchConfig,
    /// One lock per hash so concurrent loads share a download.
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl LinkFetcher {
    pub fn new(cache: FileCache, config: FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CartonError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            cache,
            config,
            inflight: DashMap::new(),
        })
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Path to verified content for `sha256`, downloading if needed.
    ///
    /// Each round tries every URL not yet known to serve wrong content,
    /// with exponential backoff between rounds. Fails with `Integrity` if
    /// every URL served the wrong content, otherwise `Fetch`.
    pub async fn fetch(&self, sha256: &str, urls: &[String]) -> Result<PathBuf> {
        if let Some(path) = self.cache.get(sha256).await? {
            telemetry::record_cache_hit();
            return Ok(path);
        }

        let lock = self
            .inflight
            .entry(sha256.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(path) = self.cache.get(sha256).await? {
            telemetry::record_cache_hit();
            return Ok(path);
        }

        let result = self.fetch_uncached(sha256, urls).await;
        telemetry::record_fetch(result.is_ok());
        drop(_guard);
        self.inflight.remove_if(sha256, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    async fn fetch_uncached(&self, sha256: &str, urls: &[String]) -> Result<PathBuf> {
        let mut failures = Vec::new();
        let mut bad_urls: HashSet<&str> = HashSet::new();
        let mut last_actual = String::new();
        let mut attempts = 0u32;

        for round in 0..self.config.max_attempts {
            if round > 0 {
                let delay = self.backoff(round);
                debug!(sha256, round, delay_ms = delay.as_millis() as u64, "Retrying linked file");
                tokio::time::sleep(delay).await;
            }
            attempts += 1;
            for url in urls {
                if bad_urls.contains(url.as_str()) {
                    continue;
                }
                match self.try_url(sha256, url).await {
                    Attempt::Verified(path) => {
                        info!(sha256, url = %url, "Fetched linked file");
                        return Ok(path);
                    }
                    Attempt::Mismatch(actual) => {
                        warn!(sha256, url = %url, actual = %actual, "Mirror served wrong content");
                        failures.push(format!("{url}: content hashed to {actual}"));
                        bad_urls.insert(url.as_str());
                        last_actual = actual;
                    }
                    Attempt::Failed(reason) => {
                        warn!(sha256, url = %url, error = %reason, "Linked file download failed");
                        failures.push(format!("{url}: {reason}"));
                    }
                }
            }
            if !urls.is_empty() && bad_urls.len() == urls.len() {
                break;
            }
        }

        if !urls.is_empty() && bad_urls.len() == urls.len() {
            return Err(CartonError::Integrity {
                what: format!("linked file from {}", urls.join(", ")),
                expected: sha256.to_string(),
                actual: last_actual,
            });
        }
        if urls.is_empty() {
            failures.push("no URLs listed in LINKS".to_string());
        }
        Err(CartonError::Fetch {
            sha256: sha256.to_string(),
            attempts,
            failures,
        })
    }

    /// Download an archive given by http(s) URL into the cache.
    ///
    /// Failed downloads are retried with the same backoff as linked
    /// files. The cached copy is named by the hash of what arrived.
    pub async fn fetch_archive(&self, url: &str) -> Result<PathBuf> {
        let mut failures = Vec::new();
        let mut attempts = 0u32;
        for round in 0..self.config.max_attempts {
            if round > 0 {
                tokio::time::sleep(self.backoff(round)).await;
            }
            attempts += 1;
            let staged = self.cache.archive_staging_file()?;
            match self.download(url, &staged).await {
                Ok(sha256) => {
                    let path = self.cache.commit_archive(staged, &sha256)?;
                    info!(url, sha256 = %sha256, path = %path.display(), "Downloaded archive");
                    telemetry::record_fetch(true);
                    return Ok(path);
                }
                Err(e) => {
                    warn!(url, attempt = attempts, error = %e, "Archive download failed");
                    failures.push(e.to_string());
                }
            }
        }
        telemetry::record_fetch(false);
        Err(CartonError::ArchiveDownload {
            url: url.to_string(),
            attempts,
            failures,
        })
    }

    fn backoff(&self, round: u32) -> Duration {
        let base = self.config.initial_backoff * 2u32.saturating_pow(round - 1);
        let jitter_ms = base.as_millis() as u64 / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    async fn try_url(&self, sha256: &str, url: &str) -> Attempt {
        let staged = match self.cache.staging_file() {
            Ok(f) => f,
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        let downloaded = if let Some(path) = url.strip_prefix("file://") {
            copy_local(Path::new(path), &staged).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.download(url, &staged).await
        } else {
            Err(CartonError::Validation(format!("unsupported URL scheme in '{url}'")))
        };
        let actual = match downloaded {
            Ok(actual) => actual,
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        if actual != sha256 {
            return Attempt::Mismatch(actual);
        }
        match self.cache.commit(staged, sha256, &actual) {
            Ok(path) => Attempt::Verified(path),
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    /// Stream `url` into `staged`, returning the sha256 of the body.
    async fn download(&self, url: &str, staged: &NamedTempFile) -> Result<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CartonError::Internal(format!("request failed: {e}")))?;
        let declared = response.content_length();
        let mut out = async_writer(staged)?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CartonError::Internal(format!("read failed: {e}")))?
        {
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        check_length(declared, written)?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Async handle on a staged file. The `NamedTempFile` still owns the path.
fn async_writer(staged: &NamedTempFile) -> Result<tokio::fs::File> {
    Ok(tokio::fs::File::from_std(staged.as_file().try_clone()?))
}

fn check_length(declared: Option<u64>, written: u64) -> Result<()> {
    match declared {
        Some(expected) if expected != written => Err(CartonError::Internal(format!(
            "server declared {expected} bytes but sent {written}"
        ))),
        _ => Ok(()),
    }
}

async fn copy_local(path: &Path, staged: &NamedTempFile) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut out = async_writer(staged)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
    }
    out.flush().await?;
    Ok(hex::encode(hasher.finalize()))
}
