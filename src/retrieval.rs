//! Remote retrieval with retry, rate-limit handling and bounded concurrency.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, Weekday};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::Serialize;
use thiserror::Error;

use crate::calendar::Calendar;
use crate::config::EntityTarget;
use crate::domain::{EntityId, FetchRequest};
use crate::error::{ConfigError, Error, FetchError, FetchErrorKind};
use crate::staging::{StagedFile, StagingStore};

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub url_template: String,
    pub timeout: Duration,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_pause: Duration,
    pub max_total: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            rate_limit_pause: Duration::from_secs(30),
            max_total: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed transient attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn rate_limit_delay(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|hint| hint.max(self.rate_limit_pause))
            .unwrap_or(self.rate_limit_pause)
    }
}

/// What the remote source answered for one request.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
    pub url: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("response interrupted: {0}")]
    Interrupted(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Request(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Interrupted(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

pub trait RemoteSource: Send + Sync {
    fn get(&self, request: &FetchRequest) -> Result<RemoteResponse, TransportError>;
}

/// Market-watch export over HTTP.
///
/// `{date}` in the template is rendered in the configured calendar, `{entity}`
/// verbatim.
pub struct HttpSource {
    client: Client,
    url_template: String,
    entity_templates: HashMap<EntityId, String>,
    calendar: Calendar,
}

impl HttpSource {
    pub fn new(config: &SourceConfig, calendar: Calendar) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|err| ConfigError::InvalidValue(format!("user agent: {err}")))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| ConfigError::InvalidValue(format!("http client: {err}")))?;
        Ok(Self {
            client,
            url_template: config.url_template.clone(),
            entity_templates: HashMap::new(),
            calendar,
        })
    }

    pub fn with_entity_templates<'a>(
        mut self,
        targets: impl IntoIterator<Item = &'a EntityTarget>,
    ) -> Self {
        for target in targets {
            if let Some(template) = &target.url_template {
                self.entity_templates
                    .insert(target.id.clone(), template.clone());
            }
        }
        self
    }

    pub fn url_for(&self, request: &FetchRequest) -> String {
        let template = self
            .entity_templates
            .get(&request.entity)
            .unwrap_or(&self.url_template);
        template
            .replace("{date}", &self.calendar.format(request.date))
            .replace("{entity}", request.entity.as_str())
    }
}

impl RemoteSource for HttpSource {
    fn get(&self, request: &FetchRequest) -> Result<RemoteResponse, TransportError> {
        let url = self.url_for(request);
        tracing::debug!(entity = %request.entity, date = %request.date, url = %url, "GET");
        let response = self.client.get(&url).send()?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.bytes()?.to_vec();
        Ok(RemoteResponse {
            status,
            retry_after,
            body,
            url,
        })
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classification of a non-success HTTP status.
pub fn classify_status(status: u16) -> FetchErrorKind {
    match status {
        429 => FetchErrorKind::RateLimited,
        408 | 500..=599 => FetchErrorKind::Transient,
        _ => FetchErrorKind::Permanent,
    }
}

/// Shared cancellation flag. A linked token also observes its ancestors.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked(parent: &CancellationToken) -> Self {
        let mut ancestors = parent.ancestors.clone();
        ancestors.push(parent.flag.clone());
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self
                .ancestors
                .iter()
                .any(|flag| flag.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    Staged { staged: StagedFile },
    Failed { error: FetchError },
    StoreFailed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub request: FetchRequest,
    #[serde(flatten)]
    pub status: FetchStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<FetchOutcome>,
}

impl BatchReport {
    pub fn staged(&self) -> impl Iterator<Item = &StagedFile> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.status {
            FetchStatus::Staged { staged } => Some(staged),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &FetchError> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.status {
            FetchStatus::Failed { error } => Some(error),
            _ => None,
        })
    }

    pub fn cancelled(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, FetchStatus::Cancelled))
            .count()
    }

    pub fn has_permanent_failures(&self) -> bool {
        self.failures().any(FetchError::is_permanent)
            || self
                .outcomes
                .iter()
                .any(|outcome| matches!(outcome.status, FetchStatus::StoreFailed { .. }))
    }
}

pub struct RetrievalClient<S: RemoteSource> {
    source: S,
    staging: StagingStore,
    policy: RetryPolicy,
    pool: ThreadPool,
}

impl<S: RemoteSource> RetrievalClient<S> {
    pub fn new(
        source: S,
        staging: StagingStore,
        policy: RetryPolicy,
        workers: usize,
    ) -> Result<Self, ConfigError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("tsetmc-fetch-{i}"))
            .build()
            .map_err(|err| ConfigError::InvalidValue(format!("worker pool: {err}")))?;
        Ok(Self {
            source,
            staging,
            policy,
            pool,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    /// Retrieve one unit of work and stage it.
    pub fn fetch(&self, request: &FetchRequest) -> Result<StagedFile, Error> {
        let response = self.retrieve(request)?;
        let staged =
            self.staging
                .write(request, &response.body, &response.url, response.status)?;
        tracing::info!(
            entity = %request.entity,
            date = %request.date,
            status = response.status,
            bytes = response.body.len(),
            "fetched"
        );
        Ok(staged)
    }

    /// Fetch every request on the worker pool. A failed unit never aborts the
    /// batch; a staging store failure stops further dispatch.
    pub fn fetch_batch(&self, requests: &[FetchRequest], cancel: &CancellationToken) -> BatchReport {
        let halt = CancellationToken::linked(cancel);
        let statuses = self.run_units(requests, &halt, |request| match self.fetch(request) {
            Ok(staged) => FetchStatus::Staged { staged },
            Err(Error::Fetch(error)) => FetchStatus::Failed { error },
            Err(err) => {
                tracing::error!(entity = %request.entity, date = %request.date, error = %err, "staging failed, stopping batch");
                halt.cancel();
                FetchStatus::StoreFailed {
                    reason: err.to_string(),
                }
            }
        });

        BatchReport {
            outcomes: requests
                .iter()
                .cloned()
                .zip(statuses)
                .map(|(request, status)| FetchOutcome {
                    request,
                    status: status.unwrap_or(FetchStatus::Cancelled),
                })
                .collect(),
        }
    }

    /// Run `work` for each request on the private pool, at most `workers` at a
    /// time. Requests reached after cancellation yield `None`. Results keep the
    /// order of `requests`.
    pub fn run_units<T, F>(
        &self,
        requests: &[FetchRequest],
        cancel: &CancellationToken,
        work: F,
    ) -> Vec<Option<T>>
    where
        T: Send,
        F: Fn(&FetchRequest) -> T + Sync,
    {
        self.pool.install(|| {
            requests
                .par_iter()
                .with_max_len(1)
                .map(|request| {
                    if cancel.is_cancelled() {
                        tracing::debug!(entity = %request.entity, date = %request.date, "cancelled before dispatch");
                        return None;
                    }
                    Some(work(request))
                })
                .collect()
        })
    }

    fn retrieve(&self, request: &FetchRequest) -> Result<RemoteResponse, FetchError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let fail = |kind, reason: String| {
            FetchError::new(kind, request.entity.as_str(), request.date, reason)
        };

        loop {
            attempt += 1;
            let (kind, reason, delay) = match self.source.get(request) {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) => {
                    let reason = format!("HTTP {} from {}", response.status, response.url);
                    match classify_status(response.status) {
                        FetchErrorKind::Permanent => {
                            return Err(fail(FetchErrorKind::Permanent, reason));
                        }
                        FetchErrorKind::RateLimited => (
                            FetchErrorKind::RateLimited,
                            reason,
                            self.policy.rate_limit_delay(response.retry_after),
                        ),
                        FetchErrorKind::Transient => {
                            (FetchErrorKind::Transient, reason, self.policy.backoff(attempt))
                        }
                    }
                }
                Err(err) if err.is_transient() => (
                    FetchErrorKind::Transient,
                    err.to_string(),
                    self.policy.backoff(attempt),
                ),
                Err(err) => return Err(fail(FetchErrorKind::Permanent, err.to_string())),
            };

            if attempt >= self.policy.max_attempts {
                return Err(fail(
                    FetchErrorKind::Permanent,
                    format!("gave up after {attempt} attempts ({kind}): {reason}"),
                ));
            }
            if started.elapsed() + delay > self.policy.max_total {
                return Err(fail(
                    FetchErrorKind::Permanent,
                    format!(
                        "retry budget of {:?} exhausted after {attempt} attempts ({kind}): {reason}",
                        self.policy.max_total
                    ),
                ));
            }

            tracing::warn!(
                entity = %request.entity,
                date = %request.date,
                attempt,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                "{reason}; retrying"
            );
            thread::sleep(delay);
        }
    }
}

/// Expansion of a date range into fetch requests.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    entities: Vec<EntityId>,
    start: NaiveDate,
    end: NaiveDate,
    skip_weekdays: Vec<Weekday>,
}

impl FetchPlan {
    /// Validate `start..=end` against `today`. The end is clipped to `today`.
    pub fn new(
        entities: Vec<EntityId>,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
    ) -> Result<Self, ConfigError> {
        if entities.is_empty() {
            return Err(ConfigError::InvalidValue(
                "no entities configured; pass --entity or list them in tsetmc.json".to_string(),
            ));
        }
        if start > end {
            return Err(ConfigError::InvertedRange { start, end });
        }
        if start > today {
            return Err(ConfigError::FutureDate(start));
        }
        let end = if end > today {
            tracing::warn!(requested = %end, today = %today, "end date is in the future, stopping at today");
            today
        } else {
            end
        };
        Ok(Self {
            entities,
            start,
            end,
            skip_weekdays: Vec::new(),
        })
    }

    pub fn skip_weekdays(mut self, weekdays: &[Weekday]) -> Self {
        self.skip_weekdays = weekdays.to_vec();
        self
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// One request per entity per non-skipped day, grouped by entity in the
    /// configured order, dates ascending.
    pub fn requests(&self) -> Vec<FetchRequest> {
        let days: Vec<NaiveDate> = self
            .start
            .iter_days()
            .take_while(|day| *day <= self.end)
            .filter(|day| !self.skip_weekdays.contains(&day.weekday()))
            .collect();
        let mut requests = Vec::with_capacity(days.len() * self.entities.len());
        for entity in &self.entities {
            for day in &days {
                requests.push(FetchRequest::new(entity.clone(), *day));
            }
        }
        requests
    }

    /// Split the plan into requests still to fetch and requests already staged.
    pub fn pending(
        &self,
        staging: &StagingStore,
        force: bool,
    ) -> (Vec<FetchRequest>, Vec<FetchRequest>) {
        self.requests()
            .into_iter()
            .partition(|request| force || !staging.exists(request))
    }
}

impl fmt::Display for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entities from {} to {}",
            self.entities.len(),
            self.start,
            self.end
        )
    }
}
