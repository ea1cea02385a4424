//! Incremental sync pipeline: watermark windows, paginated fetches, merged tables.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use oura_api::{CategoryFetcher, DEFAULT_BASE_URL};
use oura_core::{Category, ConfigError, FetchWindow};
use oura_storage::{
    FetchError, HttpClientConfig, HttpFetcher, JsonTransport, StateStore, StorageError, TableStore,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oura-sync";

pub const DEFAULT_LOOKBACK_HOURS: u32 = 48;
pub const DEFAULT_OUTPUT_DIR: &str = "data";
pub const DEFAULT_STATE_FILE: &str = ".oura_state.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub token: String,
    pub categories: Vec<Category>,
    pub output_dir: PathBuf,
    pub state_file: PathBuf,
    /// Window length used for categories that have never been fetched.
    pub lookback: chrono::Duration,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("OURA_PERSONAL_ACCESS_TOKEN").unwrap_or_default(),
            categories: Category::ALL.to_vec(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            lookback: chrono::Duration::hours(DEFAULT_LOOKBACK_HOURS.into()),
            base_url: std::env::var("OURA_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            user_agent: std::env::var("OURA_USER_AGENT")
                .unwrap_or_else(|_| format!("oura-sync/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("OURA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn set_lookback_hours(&mut self, hours: u32) {
        self.lookback = chrono::Duration::hours(hours.into());
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        self.lookback_start(Utc::now())?;
        Ok(())
    }

    /// Window start for a category without a watermark.
    pub fn lookback_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        now.checked_sub_signed(self.lookback)
            .ok_or(ConfigError::LookbackOutOfRange {
                hours: self.lookback.num_hours(),
            })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fetching category {category} failed: {source}")]
    Fetch {
        category: Category,
        source: FetchError,
    },
    #[error("writing category {category} failed: {source}")]
    Table {
        category: Category,
        source: StorageError,
    },
    #[error(transparent)]
    State(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct CategoryResult {
    pub category: Category,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub total_records: usize,
    pub new_records: usize,
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// End of every fetch window in this pass; the new watermark.
    pub fetched_through: DateTime<Utc>,
    pub results: Vec<CategoryResult>,
}

impl SyncRunSummary {
    pub fn total_records(&self) -> usize {
        self.results.iter().map(|r| r.total_records).sum()
    }

    pub fn new_records(&self) -> usize {
        self.results.iter().map(|r| r.new_records).sum()
    }

    pub fn log(&self) {
        for result in &self.results {
            info!(
                run_id = %self.run_id,
                category = %result.category,
                fetched = result.total_records,
                new_rows = result.new_records,
                "category synced"
            );
        }
        info!(
            run_id = %self.run_id,
            categories = self.results.len(),
            fetched = self.total_records(),
            new_rows = self.new_records(),
            "sync pass complete"
        );
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: CategoryFetcher,
    tables: TableStore,
    state: StateStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            bearer_token: config.token.clone(),
        })?;
        Ok(Self::with_transport(config, Box::new(http)))
    }

    pub fn with_transport(config: SyncConfig, transport: Box<dyn JsonTransport>) -> Self {
        let fetcher = CategoryFetcher::new(transport).with_base_url(config.base_url.clone());
        let tables = TableStore::new(config.output_dir.clone());
        let state = StateStore::new(config.state_file.clone());
        Self {
            config,
            fetcher,
            tables,
            state,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        self.run_once_at(Utc::now()).await
    }

    /// One pass over every configured category with `now` as the window end.
    ///
    /// The first failing category aborts the pass: its table and watermark are
    /// left alone and the state file is not rewritten.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let default_start = self.config.lookback_start(now)?;
        let mut state = self.state.load()?;

        let mut results = Vec::with_capacity(self.config.categories.len());
        for &category in &self.config.categories {
            let start = state.watermark(category.as_str()).unwrap_or(default_start);
            let window = FetchWindow::between(start, now);
            info!(
                %run_id,
                category = %category,
                start = %window.start,
                end = %window.end,
                "fetching category"
            );

            let records = self
                .fetcher
                .fetch_category(category, &window)
                .await
                .map_err(|source| SyncError::Fetch { category, source })?;
            let new_records = self
                .tables
                .write_records(category.as_str(), &records)
                .map_err(|source| SyncError::Table { category, source })?;

            if let Some(previous) = state.set_watermark(category.as_str(), now) {
                if previous > now {
                    warn!(
                        category = %category,
                        previous = %previous,
                        current = %now,
                        "watermark moved backwards"
                    );
                }
            }

            results.push(CategoryResult {
                category,
                window_start: window.start,
                window_end: window.end,
                total_records: records.len(),
                new_records,
            });
        }

        self.state.save(&state)?;
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched_through: now,
            results,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub interval: Duration,
    pub max_runs: Option<usize>,
}

impl ServiceConfig {
    pub const MIN_INTERVAL_HOURS: f64 = 0.1;

    pub fn from_hours(interval_hours: f64, max_runs: Option<usize>) -> Self {
        let hours = interval_hours.max(Self::MIN_INTERVAL_HOURS);
        Self {
            interval: Duration::try_from_secs_f64(hours * 3600.0).unwrap_or(Duration::MAX),
            max_runs,
        }
    }
}

/// Runs passes until `max_runs` is reached or Ctrl-C arrives. Returns the number of passes.
pub async fn run_service(pipeline: &SyncPipeline, service: &ServiceConfig) -> usize {
    run_service_until(pipeline, service, shutdown_signal(tokio::signal::ctrl_c())).await
}

/// Resolves when `signal` fires. If the listener could not be installed the
/// error is logged and the future never resolves.
pub async fn shutdown_signal<F>(signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(err) = signal.await {
        error!(error = %err, "failed to listen for Ctrl-C; running until the run limit");
        std::future::pending::<()>().await;
    }
}

/// Service loop with an explicit shutdown future.
///
/// A failed pass is logged and the loop carries on; its watermarks were not
/// advanced, so the next pass re-requests the same window.
pub async fn run_service_until<F>(pipeline: &SyncPipeline, service: &ServiceConfig, shutdown: F) -> usize
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!(
        interval_secs = service.interval.as_secs_f64(),
        max_runs = ?service.max_runs,
        "starting collection service"
    );

    let mut runs = 0usize;
    while service.max_runs.map_or(true, |max| runs < max) {
        let started = Instant::now();
        info!(run = runs + 1, "starting collection run");
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!(runs, "service interrupted; exiting");
                return runs;
            }
            result = pipeline.run_once() => match result {
                Ok(summary) => summary.log(),
                Err(err) => error!(error = %err, "collection run failed"),
            },
        }
        runs += 1;

        if service.max_runs.is_some_and(|max| runs >= max) {
            break;
        }

        let sleep_for = service.interval.saturating_sub(started.elapsed());
        if sleep_for.is_zero() {
            continue;
        }
        info!(seconds = sleep_for.as_secs_f64(), "sleeping until next run");
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!(runs, "service interrupted; exiting");
                return runs;
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
    runs
}
