//! Durable snapshot cache + HTTP fetch utilities for trendcast.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, info_span, warn, Instrument};
use trendcast_core::{SharedClock, TrendRecord, TrendSnapshot};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendcast-storage";

pub const CACHE_FORMAT_VERSION: &str = "1.0";

fn default_version() -> String {
    CACHE_FORMAT_VERSION.to_string()
}

/// On-disk envelope around the last known-good record list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default = "default_version")]
    pub version: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub data: Vec<TrendRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedCache {
    pub records: Vec<TrendRecord>,
    pub timestamp: DateTime<Utc>,
    pub age: Duration,
    pub is_valid: bool,
}

impl LoadedCache {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Snapshot for seeding in-memory state; `None` when the cache holds no records.
    pub fn into_snapshot(self) -> Option<TrendSnapshot> {
        TrendSnapshot::new(self.records, self.timestamp)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file not found")]
    Missing,
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache file is not valid json: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("cache schema violation: {0}")]
    Schema(String),
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    ttl: Duration,
    clock: SharedClock,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            path: path.into(),
            ttl,
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist records under a fresh timestamp. Failures are logged and reported as `false`.
    pub async fn save(&self, records: &[TrendRecord]) -> bool {
        let entry = CacheEntry {
            version: default_version(),
            timestamp: self.clock.now().timestamp_millis(),
            data: records.to_vec(),
        };

        match self.write_entry(&entry).await {
            Ok(()) => {
                info!(path = %self.path.display(), records = records.len(), "cache saved");
                true
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "error saving cache");
                false
            }
        }
    }

    /// Read the canonical file. Absence is silent; corruption deletes the file.
    pub async fn load(&self) -> Option<LoadedCache> {
        let entry = match self.read_entry().await {
            Ok(entry) => entry,
            Err(CacheError::Missing) => {
                info!(path = %self.path.display(), "no cache file found");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "error loading cache");
                if fs::remove_file(&self.path).await.is_ok() {
                    info!(path = %self.path.display(), "deleted corrupt cache file");
                }
                return None;
            }
        };

        let timestamp = DateTime::from_timestamp_millis(entry.timestamp)?;
        let age_ms = (self.clock.now() - timestamp).num_milliseconds().max(0) as u64;
        let age = Duration::from_millis(age_ms);
        let is_valid = age < self.ttl;

        info!(
            records = entry.data.len(),
            age_secs = age.as_secs(),
            valid = is_valid,
            "cache loaded"
        );

        Some(LoadedCache {
            records: entry.data,
            timestamp,
            age,
            is_valid,
        })
    }

    async fn read_entry(&self) -> Result<CacheEntry, CacheError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(CacheError::Missing),
            Err(err) => return Err(CacheError::Io(err)),
        };

        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if entry.timestamp <= 0 || DateTime::from_timestamp_millis(entry.timestamp).is_none() {
            return Err(CacheError::Schema(format!(
                "timestamp {} is not a usable epoch-ms value",
                entry.timestamp
            )));
        }
        if let Some(bad) = entry.data.iter().position(|r| !r.is_well_formed()) {
            return Err(CacheError::Schema(format!("record {bad} has empty text or non-positive volume")));
        }
        Ok(entry)
    }

    /// Serialize to a sibling temp file, then rename over the canonical path.
    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(entry)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trends-cache.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::Io(err));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use trendcast_core::{Clock, RawTrend};

    #[derive(Debug)]
    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn at(ts: &str) -> Arc<Self> {
            let ts = DateTime::parse_from_rfc3339(ts).expect("ts").with_timezone(&Utc);
            Arc::new(Self(Mutex::new(ts)))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn records() -> Vec<TrendRecord> {
        ["45K+", "1.2M+"]
            .iter()
            .zip(["storm", "election"])
            .map(|(volume, term)| TrendRecord::from_raw(&RawTrend::new(term, *volume)).unwrap())
            .collect()
    }

    const TTL: Duration = Duration::from_secs(35 * 60);

    #[tokio::test]
    async fn save_then_load_round_trips_records() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let store = CacheStore::new(dir.path().join("trends-cache.json"), TTL, clock.clone());

        assert!(store.save(&records()).await);
        clock.advance(Duration::from_secs(5));

        let loaded = store.load().await.expect("cache present");
        assert_eq!(loaded.records, records());
        assert_eq!(loaded.timestamp_ms(), clock.now().timestamp_millis() - 5_000);
        assert_eq!(loaded.age, Duration::from_secs(5));
        assert!(loaded.is_valid);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn written_envelope_has_version_timestamp_and_data() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let path = dir.path().join("trends-cache.json");
        let store = CacheStore::new(&path, TTL, clock.clone());
        assert!(store.save(&records()).await);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], "1.0");
        assert_eq!(raw["timestamp"], clock.now().timestamp_millis());
        assert_eq!(raw["data"].as_array().unwrap().len(), 2);
        assert_eq!(raw["data"][0]["text"], "storm");
    }

    #[tokio::test]
    async fn stale_cache_still_loads_but_is_flagged() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let store = CacheStore::new(dir.path().join("trends-cache.json"), TTL, clock.clone());
        assert!(store.save(&records()).await);

        clock.advance(Duration::from_secs(36 * 60));
        let loaded = store.load().await.expect("stale cache is still returned");
        assert!(!loaded.is_valid);
        assert_eq!(loaded.records.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_silent_no_cache() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let store = CacheStore::new(dir.path().join("absent.json"), TTL, clock);
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn truncated_file_is_deleted_and_reported_as_no_cache() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let path = dir.path().join("trends-cache.json");
        let store = CacheStore::new(&path, TTL, clock);
        assert!(store.save(&records()).await);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(store.load().await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn schema_violations_are_treated_as_corruption() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let path = dir.path().join("trends-cache.json");
        let store = CacheStore::new(&path, TTL, clock);

        for body in [
            r#"{"version":"1.0","timestamp":1760000000000}"#,
            r#"{"version":"1.0","data":[]}"#,
            r#"{"version":"1.0","timestamp":1760000000000,"data":{"text":"x"}}"#,
            r#"{"version":"1.0","timestamp":0,"data":[]}"#,
            r#"{"timestamp":1760000000000,"data":[{"text":"","volume":5}]}"#,
        ] {
            std::fs::write(&path, body).unwrap();
            assert!(store.load().await.is_none(), "accepted {body}");
            assert!(!path.exists(), "kept {body}");
        }
    }

    #[tokio::test]
    async fn legacy_envelope_without_version_loads() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let path = dir.path().join("trends-cache.json");
        let ts = clock.now().timestamp_millis() - 60_000;
        std::fs::write(
            &path,
            format!(r#"{{"timestamp":{ts},"data":[{{"text":"storm","size":45000,"volumeText":"45K+"}}]}}"#),
        )
        .unwrap();

        let store = CacheStore::new(&path, TTL, clock);
        let loaded = store.load().await.expect("legacy cache");
        assert_eq!(loaded.records[0].volume, 45_000.0);
        assert_eq!(loaded.age, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn failed_save_reports_false_and_keeps_previous_file() {
        let dir = tempdir().expect("tempdir");
        let clock = FixedClock::at("2026-10-19T12:00:00Z");
        let path = dir.path().join("trends-cache.json");
        let store = CacheStore::new(&path, TTL, clock.clone());
        assert!(store.save(&records()).await);

        // A directory sitting where the parent should be makes every write fail.
        let blocked = CacheStore::new(path.join("nested.json"), TTL, clock);
        assert!(!blocked.save(&records()).await);
        assert_eq!(store.load().await.expect("previous cache").records, records());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
