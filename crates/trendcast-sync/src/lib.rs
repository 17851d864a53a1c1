//! Collection orchestration, scrape scheduling and in-memory distribution state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use trendcast_adapters::{
    AdapterError, CollectionSession, FixtureSessionLauncher, HttpSessionLauncher, SessionLauncher,
    SessionProfile,
};
use trendcast_core::{
    system_clock, Admission, RawTrend, SharedClock, SourceDescriptor, TrendCollector, TrendRecord,
    TrendSnapshot,
};
use trendcast_storage::CacheStore;
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendcast-sync";

pub const TRENDS_UPDATE_EVENT: &str = "trends-update";
pub const STATUS_EVENT: &str = "status";
pub const NO_DATA_MESSAGE: &str = "Fetching trends...";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub label: String,
    pub endpoint: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn enabled(&self) -> Vec<SourceDescriptor> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| SourceDescriptor::new(s.endpoint.clone(), s.label.clone()))
            .collect()
    }
}

/// The six regional trending pages used when no registry file is present.
pub fn default_sources() -> Vec<SourceDescriptor> {
    [
        ("CA", "Canada"),
        ("US", "United States"),
        ("GB", "United Kingdom"),
        ("AU", "Australia"),
        ("IN", "India"),
        ("", "Global"),
    ]
    .into_iter()
    .map(|(geo, label)| {
        SourceDescriptor::new(
            format!("https://trends.google.com/trending?geo={geo}&hl=en-us"),
            label,
        )
    })
    .collect()
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub port: u16,
    pub cache_path: PathBuf,
    pub scrape_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub freshness_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub navigation_timeout_secs: u64,
    pub content_wait_secs: u64,
    pub sources_file: PathBuf,
    pub paginate_label: Option<String>,
    pub paginate_max_items: usize,
    pub fixtures_dir: Option<PathBuf>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            cache_path: PathBuf::from("trends-cache.json"),
            scrape_interval_secs: 30 * 60,
            cache_ttl_secs: 35 * 60,
            freshness_secs: 30 * 60,
            max_retries: 2,
            retry_delay_secs: 60,
            navigation_timeout_secs: 30,
            content_wait_secs: 10,
            sources_file: PathBuf::from("sources.yaml"),
            paginate_label: None,
            paginate_max_items: 100,
            fixtures_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("TRENDCAST_PORT")
                .or_else(|_| std::env::var("PORT"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            cache_path: std::env::var("TRENDCAST_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    if std::env::var_os("RAILWAY_ENVIRONMENT").is_some() {
                        PathBuf::from("/tmp/trends-cache.json")
                    } else {
                        defaults.cache_path.clone()
                    }
                }),
            scrape_interval_secs: env_u64("TRENDCAST_SCRAPE_INTERVAL_SECS", defaults.scrape_interval_secs),
            cache_ttl_secs: env_u64("TRENDCAST_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            freshness_secs: env_u64("TRENDCAST_FRESHNESS_SECS", defaults.freshness_secs),
            max_retries: std::env::var("TRENDCAST_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_delay_secs: env_u64("TRENDCAST_RETRY_DELAY_SECS", defaults.retry_delay_secs),
            navigation_timeout_secs: env_u64("TRENDCAST_NAV_TIMEOUT_SECS", defaults.navigation_timeout_secs),
            content_wait_secs: env_u64("TRENDCAST_CONTENT_WAIT_SECS", defaults.content_wait_secs),
            sources_file: std::env::var("TRENDCAST_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            paginate_label: std::env::var("TRENDCAST_PAGINATE_LABEL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            paginate_max_items: env_u64("TRENDCAST_PAGINATE_MAX_ITEMS", defaults.paginate_max_items as u64)
                as usize,
            fixtures_dir: std::env::var("TRENDCAST_FIXTURES_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            content_wait: Duration::from_secs(self.content_wait_secs),
            ..OrchestratorConfig::default()
        }
    }
}

pub async fn load_sources(path: &Path) -> Result<Vec<SourceDescriptor>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        info!(path = %path.display(), "no source registry, using built-in regions");
        return Ok(default_sources());
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(registry.enabled())
}

/// Suspension point for inter-source and retry delays.
#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub navigation_timeout: Duration,
    pub content_wait: Duration,
    pub min_source_delay: Duration,
    pub max_source_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            content_wait: Duration::from_secs(10),
            min_source_delay: Duration::from_millis(1_000),
            max_source_delay: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStrategy {
    /// Visit every source once, in order.
    FanOut(Vec<SourceDescriptor>),
    /// Page through one source until the cap, a page with nothing new, or no more pages.
    Paginate {
        source: SourceDescriptor,
        max_items: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOutcome {
    Collected(TrendSnapshot),
    /// Nothing usable was collected; the previous snapshot must be kept.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub label: String,
    pub raw_rows: usize,
    pub added: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CollectionOutcome,
    pub sources: Vec<SourceReport>,
}

impl CollectionRun {
    pub fn record_count(&self) -> usize {
        match &self.outcome {
            CollectionOutcome::Collected(snapshot) => snapshot.len(),
            CollectionOutcome::Empty => 0,
        }
    }
}

/// One complete collection attempt, as seen by the scheduler.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self) -> CollectionRun;
}

pub struct ScrapeOrchestrator {
    launcher: Arc<dyn SessionLauncher>,
    strategy: CollectionStrategy,
    config: OrchestratorConfig,
    sleeper: Arc<dyn Sleeper>,
    clock: SharedClock,
}

impl ScrapeOrchestrator {
    pub fn new(launcher: Arc<dyn SessionLauncher>, strategy: CollectionStrategy) -> Self {
        Self {
            launcher,
            strategy,
            config: OrchestratorConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            clock: system_clock(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timing(mut self, sleeper: Arc<dyn Sleeper>, clock: SharedClock) -> Self {
        self.sleeper = sleeper;
        self.clock = clock;
        self
    }

    fn source_delay(&self) -> Duration {
        let min = self.config.min_source_delay.as_millis() as u64;
        let max = (self.config.max_source_delay.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    async fn bounded<F>(&self, label: &str, profile: &SessionProfile, fut: F) -> Result<Vec<RawTrend>, AdapterError>
    where
        F: std::future::Future<Output = Result<Vec<RawTrend>, AdapterError>>,
    {
        let budget = profile.visit_budget();
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                label: label.to_string(),
                after: budget,
            }),
        }
    }

    async fn fan_out(
        &self,
        session: &mut dyn CollectionSession,
        profile: &SessionProfile,
        sources: &[SourceDescriptor],
        collector: &mut TrendCollector,
    ) -> Vec<SourceReport> {
        let mut reports = Vec::with_capacity(sources.len());
        for (idx, source) in sources.iter().enumerate() {
            if idx > 0 {
                self.sleeper.sleep(self.source_delay()).await;
            }

            info!(source = %source.label, "scraping source");
            let report = match self.bounded(&source.label, profile, session.visit(source)).await {
                Ok(rows) => {
                    let added = collector.extend(&rows);
                    info!(source = %source.label, found = rows.len(), added, "source scraped");
                    SourceReport {
                        label: source.label.clone(),
                        raw_rows: rows.len(),
                        added,
                        error: None,
                    }
                }
                Err(err) => {
                    error!(source = %source.label, error = %err, "error scraping source");
                    SourceReport {
                        label: source.label.clone(),
                        raw_rows: 0,
                        added: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    async fn paginate(
        &self,
        session: &mut dyn CollectionSession,
        profile: &SessionProfile,
        source: &SourceDescriptor,
        max_items: usize,
        collector: &mut TrendCollector,
    ) -> Vec<SourceReport> {
        let mut report = SourceReport {
            label: source.label.clone(),
            raw_rows: 0,
            added: 0,
            error: None,
        };

        let first = match self.bounded(&source.label, profile, session.visit(source)).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(source = %source.label, error = %err, "error scraping source");
                report.error = Some(err.to_string());
                return vec![report];
            }
        };
        report.raw_rows += first.len();
        report.added += offer_capped(collector, &first, max_items);

        let mut page = 1usize;
        while collector.len() < max_items {
            self.sleeper.sleep(self.source_delay()).await;
            let more = match tokio::time::timeout(profile.visit_budget(), session.load_more()).await {
                Ok(Ok(Some(rows))) => rows,
                Ok(Ok(None)) => {
                    info!(source = %source.label, page, "no more pages");
                    break;
                }
                Ok(Err(err)) => {
                    warn!(source = %source.label, page, error = %err, "load more failed");
                    report.error = Some(err.to_string());
                    break;
                }
                Err(_) => {
                    warn!(source = %source.label, page, "load more timed out");
                    report.error = Some(format!("load more timed out after {:?}", profile.visit_budget()));
                    break;
                }
            };
            page += 1;
            report.raw_rows += more.len();
            let added = offer_capped(collector, &more, max_items);
            report.added += added;
            info!(source = %source.label, page, found = more.len(), added, "page scraped");
            if added == 0 {
                break;
            }
        }
        vec![report]
    }

    async fn run(&self, run_id: Uuid) -> CollectionRun {
        let started_at = self.clock.now();
        let profile = SessionProfile::rotated(self.config.navigation_timeout, self.config.content_wait);
        info!(user_agent = %profile.user_agent, "starting collection run");

        let mut session = match self.launcher.launch(&profile).await {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "scraping failed: session did not start");
                return CollectionRun {
                    run_id,
                    started_at,
                    finished_at: self.clock.now(),
                    outcome: CollectionOutcome::Empty,
                    sources: Vec::new(),
                };
            }
        };

        let mut collector = TrendCollector::new();
        let sources = match &self.strategy {
            CollectionStrategy::FanOut(sources) => {
                self.fan_out(session.as_mut(), &profile, sources, &mut collector).await
            }
            CollectionStrategy::Paginate { source, max_items } => {
                self.paginate(session.as_mut(), &profile, source, *max_items, &mut collector)
                    .await
            }
        };
        session.close().await;

        let finished_at = self.clock.now();
        let total = collector.len();
        let outcome = match collector.finish(finished_at) {
            Some(snapshot) => {
                info!(total, "total unique trends aggregated");
                CollectionOutcome::Collected(snapshot)
            }
            None => {
                let per_source = sources
                    .iter()
                    .map(|r| format!("{}={}", r.label, r.raw_rows))
                    .collect::<Vec<_>>()
                    .join(", ");
                error!(per_source = %per_source, "scraped 0 trends");
                CollectionOutcome::Empty
            }
        };

        CollectionRun {
            run_id,
            started_at,
            finished_at,
            outcome,
            sources,
        }
    }
}

fn offer_capped(collector: &mut TrendCollector, rows: &[RawTrend], max_items: usize) -> usize {
    let mut added = 0;
    for raw in rows {
        if collector.len() >= max_items {
            break;
        }
        if collector.offer(raw) == Admission::Added {
            added += 1;
        }
    }
    added
}

#[async_trait]
impl Collector for ScrapeOrchestrator {
    async fn collect(&self) -> CollectionRun {
        let run_id = Uuid::new_v4();
        let strategy = match &self.strategy {
            CollectionStrategy::FanOut(_) => "fan-out",
            CollectionStrategy::Paginate { .. } => "paginate",
        };
        let span = info_span!("collection_run", %run_id, strategy);
        self.run(run_id).instrument(span).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapePhase {
    Idle,
    Scraping,
    RetryWait,
}

#[derive(Debug, Clone)]
pub struct ScrapeState {
    pub phase: ScrapePhase,
    pub last_snapshot: Option<Arc<TrendSnapshot>>,
    pub last_capture_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl Default for ScrapeState {
    fn default() -> Self {
        Self {
            phase: ScrapePhase::Idle,
            last_snapshot: None,
            last_capture_time: None,
            retry_count: 0,
        }
    }
}

impl ScrapeState {
    pub fn is_scraping_in_progress(&self) -> bool {
        self.phase != ScrapePhase::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Timer,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { attempt: u32 },
    Exhausted { attempts: u32 },
}

/// Pull response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendsView {
    pub data: Vec<TrendRecord>,
    pub timestamp: Option<i64>,
    pub fresh: bool,
    pub is_scraping_in_progress: bool,
    pub age: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendsPayload {
    pub data: Vec<TrendRecord>,
    pub timestamp: i64,
    pub fresh: bool,
    pub is_scraping_in_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub message: String,
    pub is_scraping_in_progress: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    TrendsUpdate(TrendsPayload),
    Status(StatusPayload),
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::TrendsUpdate(_) => TRENDS_UPDATE_EVENT,
            HubEvent::Status(_) => STATUS_EVENT,
        }
    }

    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            HubEvent::TrendsUpdate(payload) => serde_json::to_value(payload),
            HubEvent::Status(payload) => serde_json::to_value(payload),
        }
    }
}

/// A connected push client. Dropping the receiver unregisters the client.
pub struct Subscription {
    pub id: Uuid,
    pub initial: HubEvent,
    pub receiver: broadcast::Receiver<HubEvent>,
}

/// Holds the current snapshot and scrape state; serves pulls and fans out updates.
#[derive(Debug)]
pub struct TrendHub {
    state: RwLock<ScrapeState>,
    events: broadcast::Sender<HubEvent>,
    clock: SharedClock,
    freshness: Duration,
}

impl TrendHub {
    pub fn new(freshness: Duration, clock: SharedClock) -> Self {
        let (events, _receiver) = broadcast::channel(16);
        Self {
            state: RwLock::new(ScrapeState::default()),
            events,
            clock,
            freshness,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ScrapeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ScrapeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ScrapeState {
        self.read().clone()
    }

    pub fn phase(&self) -> ScrapePhase {
        self.read().phase
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn is_fresh(&self, age_ms: i64) -> bool {
        (age_ms as u128) < self.freshness.as_millis()
    }

    /// Best data currently held, however stale.
    pub fn pull(&self) -> TrendsView {
        let state = self.read();
        let now = self.clock.now();
        match &state.last_snapshot {
            Some(snapshot) => {
                let age = snapshot.age_ms(now);
                TrendsView {
                    data: snapshot.records().to_vec(),
                    timestamp: Some(snapshot.captured_at().timestamp_millis()),
                    fresh: self.is_fresh(age),
                    is_scraping_in_progress: state.is_scraping_in_progress(),
                    age: Some(age),
                }
            }
            None => TrendsView {
                data: Vec::new(),
                timestamp: None,
                fresh: false,
                is_scraping_in_progress: state.is_scraping_in_progress(),
                age: None,
            },
        }
    }

    /// Register a push client; the first event reflects current state.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let state = self.read();
        // Registered under the read guard: a concurrent publish lands either in
        // `initial` or on the receiver, never both.
        let receiver = self.events.subscribe();
        let initial = match &state.last_snapshot {
            Some(snapshot) => HubEvent::TrendsUpdate(TrendsPayload {
                data: snapshot.records().to_vec(),
                timestamp: snapshot.captured_at().timestamp_millis(),
                fresh: self.is_fresh(snapshot.age_ms(self.clock.now())),
                is_scraping_in_progress: state.is_scraping_in_progress(),
            }),
            None => HubEvent::Status(StatusPayload {
                message: NO_DATA_MESSAGE.to_string(),
                is_scraping_in_progress: state.is_scraping_in_progress(),
            }),
        };
        drop(state);
        info!(subscriber = %id, initial = initial.name(), "new client connected");
        Subscription {
            id,
            initial,
            receiver,
        }
    }

    /// Startup seeding from a persisted snapshot; ignored once live data exists.
    pub fn seed(&self, snapshot: TrendSnapshot) -> bool {
        let mut state = self.write();
        if state.last_snapshot.is_some() {
            return false;
        }
        state.last_capture_time = Some(snapshot.captured_at());
        state.last_snapshot = Some(Arc::new(snapshot));
        true
    }

    /// `Idle -> Scraping`. Returns the blocking phase when a run is already active.
    pub fn try_begin(&self, trigger: Trigger) -> Result<(), ScrapePhase> {
        let mut state = self.write();
        if state.phase != ScrapePhase::Idle {
            return Err(state.phase);
        }
        if matches!(trigger, Trigger::Startup | Trigger::Timer) {
            state.retry_count = 0;
        }
        state.phase = ScrapePhase::Scraping;
        Ok(())
    }

    /// `Scraping -> Idle` on success: replace the held snapshot and broadcast it
    /// with `fresh = true` in one critical section. Returns the receiver count.
    pub fn publish(&self, snapshot: Arc<TrendSnapshot>) -> usize {
        let event = HubEvent::TrendsUpdate(TrendsPayload {
            data: snapshot.records().to_vec(),
            timestamp: snapshot.captured_at().timestamp_millis(),
            fresh: true,
            is_scraping_in_progress: false,
        });
        let mut state = self.write();
        state.last_capture_time = Some(snapshot.captured_at());
        state.last_snapshot = Some(snapshot);
        state.retry_count = 0;
        state.phase = ScrapePhase::Idle;
        // No receivers is not an error: nobody is connected yet.
        self.events.send(event).unwrap_or(0)
    }

    /// `Scraping -> RetryWait` while retries remain, otherwise `Scraping -> Idle`.
    pub fn record_failure(&self, max_retries: u32) -> FailureDisposition {
        let mut state = self.write();
        if state.retry_count < max_retries {
            state.retry_count += 1;
            state.phase = ScrapePhase::RetryWait;
            FailureDisposition::Retry {
                attempt: state.retry_count,
            }
        } else {
            state.phase = ScrapePhase::Idle;
            FailureDisposition::Exhausted {
                attempts: state.retry_count,
            }
        }
    }

    /// `RetryWait -> Scraping`.
    pub fn resume_retry(&self) {
        let mut state = self.write();
        if state.phase == ScrapePhase::RetryWait {
            state.phase = ScrapePhase::Scraping;
        }
    }
}

/// Seed the hub from the persisted cache, stale or not.
pub async fn seed_from_cache(hub: &TrendHub, cache: &CacheStore) -> bool {
    let Some(loaded) = cache.load().await else {
        info!("no valid cache found, will scrape fresh data");
        return false;
    };
    let age_secs = loaded.age.as_secs();
    let is_valid = loaded.is_valid;
    match loaded.into_snapshot() {
        Some(snapshot) => {
            let count = snapshot.len();
            let seeded = hub.seed(snapshot);
            if seeded {
                info!(records = count, age_secs, valid = is_valid, "loaded trends from cache");
            }
            seeded
        }
        None => {
            info!("cache holds no trends, will scrape fresh data");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Updated { records: usize, cached: bool, notified: usize },
    Deferred { attempts: u32 },
    Dropped { phase: ScrapePhase },
}

/// Single-flight driver for collection runs with bounded retry.
pub struct ScrapeScheduler {
    collector: Arc<dyn Collector>,
    hub: Arc<TrendHub>,
    cache: CacheStore,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ScrapeScheduler {
    pub fn new(collector: Arc<dyn Collector>, hub: Arc<TrendHub>, cache: CacheStore, policy: RetryPolicy) -> Self {
        Self {
            collector,
            hub,
            cache,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run one cycle: collect, retrying up to the policy bound, then settle back to idle.
    pub async fn trigger(&self, trigger: Trigger) -> CycleOutcome {
        if let Err(phase) = self.hub.try_begin(trigger) {
            warn!(?trigger, ?phase, "scrape already in progress, skipping");
            return CycleOutcome::Dropped { phase };
        }

        loop {
            let retry_count = self.hub.state().retry_count;
            if retry_count > 0 {
                info!(retry = retry_count, max = self.policy.max_retries, "initiating scrape retry");
            } else {
                info!(?trigger, "initiating scheduled scrape");
            }

            let run = self.collector.collect().await;
            match run.outcome {
                CollectionOutcome::Collected(snapshot) => {
                    let records = snapshot.len();
                    let snapshot = Arc::new(snapshot);
                    let cached = self.cache.save(snapshot.records()).await;
                    let notified = self.hub.publish(snapshot);
                    info!(records, cached, notified, "scraped and published trends");
                    return CycleOutcome::Updated {
                        records,
                        cached,
                        notified,
                    };
                }
                CollectionOutcome::Empty => {
                    warn!("no trends found or scraping failed, retaining old data");
                    match self.hub.record_failure(self.policy.max_retries) {
                        FailureDisposition::Retry { attempt } => {
                            info!(
                                attempt,
                                delay_secs = self.policy.retry_delay.as_secs(),
                                "retrying after delay"
                            );
                            self.sleeper.sleep(self.policy.retry_delay).await;
                            self.hub.resume_retry();
                        }
                        FailureDisposition::Exhausted { attempts } => {
                            warn!(attempts, "retries exhausted, waiting for next scheduled run");
                            return CycleOutcome::Deferred { attempts };
                        }
                    }
                }
            }
        }
    }

    /// Fire the startup trigger in the background.
    pub fn spawn_startup(self: &Arc<Self>) -> tokio::task::JoinHandle<CycleOutcome> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.trigger(Trigger::Startup).await })
    }

    /// Register the fixed-interval timer. Each tick runs as its own task so a
    /// tick landing on an active run is dropped rather than queued.
    pub async fn start_periodic(self: &Arc<Self>, interval: Duration) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = Arc::clone(self);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let scheduler = Arc::clone(&scheduler);
            Box::pin(async move {
                scheduler.trigger(Trigger::Timer).await;
            })
        })
        .with_context(|| format!("creating scheduler job every {interval:?}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = interval.as_secs(), "scheduled scraping enabled");
        Ok(sched)
    }
}

/// Fully wired engine: hub, cache and scheduler built from [`SyncConfig`].
pub struct Engine {
    pub config: SyncConfig,
    pub hub: Arc<TrendHub>,
    pub cache: CacheStore,
    pub scheduler: Arc<ScrapeScheduler>,
    pub orchestrator: Arc<ScrapeOrchestrator>,
}

impl Engine {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let clock = system_clock();
        let sources = load_sources(&config.sources_file).await?;

        let strategy = match &config.paginate_label {
            Some(label) => {
                let source = sources
                    .iter()
                    .find(|s| &s.label == label)
                    .cloned()
                    .with_context(|| format!("no enabled source labelled {label}"))?;
                CollectionStrategy::Paginate {
                    source,
                    max_items: config.paginate_max_items.max(1),
                }
            }
            None => CollectionStrategy::FanOut(sources),
        };

        let launcher: Arc<dyn SessionLauncher> = match &config.fixtures_dir {
            Some(dir) => Arc::new(FixtureSessionLauncher::new(dir.clone())),
            None => Arc::new(HttpSessionLauncher::default()),
        };

        let orchestrator = Arc::new(
            ScrapeOrchestrator::new(launcher, strategy)
                .with_config(config.orchestrator_config())
                .with_timing(Arc::new(TokioSleeper), clock.clone()),
        );
        let hub = Arc::new(TrendHub::new(config.freshness(), clock.clone()));
        let cache = CacheStore::new(config.cache_path.clone(), config.cache_ttl(), clock);
        let scheduler = Arc::new(ScrapeScheduler::new(
            orchestrator.clone(),
            hub.clone(),
            cache.clone(),
            config.retry_policy(),
        ));

        Ok(Self {
            config,
            hub,
            cache,
            scheduler,
            orchestrator,
        })
    }

    /// Seed from cache, kick off the startup run and register the periodic timer.
    pub async fn start(&self) -> Result<JobScheduler> {
        seed_from_cache(&self.hub, &self.cache).await;
        self.scheduler.spawn_startup();
        self.scheduler.start_periodic(self.config.scrape_interval()).await
    }
}
