use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::dataset::{DatasetStore, UpsertReport};
use crate::domain::{EntityId, FetchRequest};
use crate::error::{Error, FetchError};
use crate::normalize::Normalizer;
use crate::retrieval::{CancellationToken, RemoteSource, RetrievalClient};
use crate::staging::StagedFile;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives progress from worker threads.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Ingested {
        upsert: UpsertReport,
        invalid_rows: usize,
    },
    /// The payload held no rows: a market holiday or a day without trading.
    Empty,
    FetchFailed {
        error: FetchError,
    },
    NormalizationFailed {
        reason: String,
    },
    StoreFailed {
        reason: String,
    },
    Cancelled,
}

impl UnitStatus {
    fn label(&self) -> &'static str {
        match self {
            UnitStatus::Ingested { .. } => "ingested",
            UnitStatus::Empty => "empty",
            UnitStatus::FetchFailed { .. } => "fetch failed",
            UnitStatus::NormalizationFailed { .. } => "normalization failed",
            UnitStatus::StoreFailed { .. } => "store failed",
            UnitStatus::Cancelled => "cancelled",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitStatus::FetchFailed { .. }
                | UnitStatus::NormalizationFailed { .. }
                | UnitStatus::StoreFailed { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub request: FetchRequest,
    #[serde(flatten)]
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntitySummary {
    pub ingested: usize,
    pub empty: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub rejected: usize,
}

impl EntitySummary {
    fn record(&mut self, status: &UnitStatus) {
        match status {
            UnitStatus::Ingested { upsert, .. } => {
                self.ingested += 1;
                self.inserted += upsert.inserted;
                self.replaced += upsert.replaced;
                self.skipped += upsert.skipped;
                self.rejected += upsert.rejected;
            }
            UnitStatus::Empty => self.empty += 1,
            UnitStatus::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub totals: EntitySummary,
    pub entities: BTreeMap<EntityId, EntitySummary>,
    pub outcomes: Vec<UnitOutcome>,
}

impl RunReport {
    pub fn from_outcomes(outcomes: Vec<UnitOutcome>) -> Self {
        let mut totals = EntitySummary::default();
        let mut entities: BTreeMap<EntityId, EntitySummary> = BTreeMap::new();
        for outcome in &outcomes {
            totals.record(&outcome.status);
            entities
                .entry(outcome.request.entity.clone())
                .or_default()
                .record(&outcome.status);
        }
        Self {
            totals,
            entities,
            outcomes,
        }
    }

    pub fn by_entity(&self) -> &BTreeMap<EntityId, EntitySummary> {
        &self.entities
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status.is_failure())
    }

    /// Units that will not succeed without intervention. A payload that fails
    /// normalization counts, since refetching yields the same export.
    pub fn has_permanent_failures(&self) -> bool {
        self.outcomes.iter().any(|outcome| match &outcome.status {
            UnitStatus::FetchFailed { error } => error.is_permanent(),
            UnitStatus::NormalizationFailed { .. } | UnitStatus::StoreFailed { .. } => true,
            _ => false,
        })
    }

    pub fn has_store_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| matches!(outcome.status, UnitStatus::StoreFailed { .. }))
    }
}

/// Fetch, stage, normalize and upsert, one unit of work per worker.
pub struct Pipeline<S: RemoteSource> {
    retrieval: RetrievalClient<S>,
    normalizer: Normalizer,
    dataset: DatasetStore,
    retain_staged: bool,
    force_refetch: bool,
}

impl<S: RemoteSource> Pipeline<S> {
    pub fn new(retrieval: RetrievalClient<S>, normalizer: Normalizer, dataset: DatasetStore) -> Self {
        Self {
            retrieval,
            normalizer,
            dataset,
            retain_staged: true,
            force_refetch: false,
        }
    }

    /// Keep staged payloads after a successful ingest (the default).
    pub fn retain_staged(mut self, retain: bool) -> Self {
        self.retain_staged = retain;
        self
    }

    /// Re-download units whose payload is already staged.
    pub fn force_refetch(mut self, force: bool) -> Self {
        self.force_refetch = force;
        self
    }

    pub fn retrieval(&self) -> &RetrievalClient<S> {
        &self.retrieval
    }

    pub fn dataset(&self) -> &DatasetStore {
        &self.dataset
    }

    pub fn run(
        &self,
        requests: &[FetchRequest],
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> RunReport {
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {} units", requests.len()),
            elapsed: None,
        });
        let halt = CancellationToken::linked(cancel);
        let statuses = self.retrieval.run_units(requests, &halt, |request| {
            let started = Instant::now();
            let status = self.process(request, &halt);
            report_unit(sink, request, &status, started);
            status
        });
        let report = collect(requests, statuses);
        log_report(&report);
        report
    }

    /// Normalize and upsert everything currently staged, without fetching.
    pub fn ingest_staged(
        &self,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, Error> {
        let staged = self.retrieval.staging().list()?;
        sink.event(ProgressEvent {
            message: format!("phase=Normalize; {} staged payloads", staged.len()),
            elapsed: None,
        });
        let requests: Vec<FetchRequest> = staged.iter().map(StagedFile::request).collect();
        let by_request: HashMap<FetchRequest, StagedFile> = requests
            .iter()
            .cloned()
            .zip(staged)
            .collect();

        let halt = CancellationToken::linked(cancel);
        let statuses = self.retrieval.run_units(&requests, &halt, |request| {
            let started = Instant::now();
            let status = match by_request.get(request) {
                Some(staged) => self.ingest(staged, &halt),
                None => UnitStatus::Cancelled,
            };
            report_unit(sink, request, &status, started);
            status
        });
        let report = collect(&requests, statuses);
        log_report(&report);
        Ok(report)
    }

    fn process(&self, request: &FetchRequest, halt: &CancellationToken) -> UnitStatus {
        if !self.force_refetch {
            match self.retrieval.staging().get(request) {
                Ok(Some(staged)) => match self.retrieval.staging().verify(&staged) {
                    Ok(true) => {
                        tracing::debug!(entity = %request.entity, date = %request.date, "already staged");
                        return self.ingest(&staged, halt);
                    }
                    Ok(false) => {
                        tracing::warn!(entity = %request.entity, date = %request.date, "staged payload does not match its hash, refetching");
                    }
                    Err(err) => return store_failed(request, err.into(), halt),
                },
                Ok(None) => {}
                Err(err) => return store_failed(request, err.into(), halt),
            }
        }

        match self.retrieval.fetch(request) {
            Ok(staged) => self.ingest(&staged, halt),
            Err(Error::Fetch(error)) => {
                tracing::warn!(entity = %request.entity, date = %request.date, error = %error, "fetch failed");
                UnitStatus::FetchFailed { error }
            }
            Err(err) => store_failed(request, err, halt),
        }
    }

    fn ingest(&self, staged: &StagedFile, halt: &CancellationToken) -> UnitStatus {
        let request = staged.request();
        let batch = match self.normalizer.normalize(staged) {
            Ok(batch) => batch,
            Err(Error::Normalization(err)) => {
                tracing::warn!(entity = %request.entity, date = %request.date, error = %err, "normalization failed");
                return UnitStatus::NormalizationFailed {
                    reason: err.to_string(),
                };
            }
            Err(err) => return store_failed(&request, err, halt),
        };

        let status = if batch.is_empty() {
            tracing::info!(entity = %request.entity, date = %request.date, "no rows for this day");
            UnitStatus::Empty
        } else {
            match self.dataset.upsert(&batch.records) {
                Ok(upsert) => UnitStatus::Ingested {
                    upsert,
                    invalid_rows: batch.invalid_rows,
                },
                Err(err) => return store_failed(&request, err, halt),
            }
        };

        if !self.retain_staged {
            if let Err(err) = self.retrieval.staging().remove(staged) {
                tracing::warn!(entity = %request.entity, date = %request.date, error = %err, "failed to remove staged payload");
            }
        }
        status
    }
}

fn store_failed(request: &FetchRequest, err: Error, halt: &CancellationToken) -> UnitStatus {
    tracing::error!(entity = %request.entity, date = %request.date, error = %err, "store failure, stopping dispatch");
    halt.cancel();
    UnitStatus::StoreFailed {
        reason: err.to_string(),
    }
}

fn report_unit(sink: &dyn ProgressSink, request: &FetchRequest, status: &UnitStatus, started: Instant) {
    sink.event(ProgressEvent {
        message: format!("phase=Ingest; {request} {}", status.label()),
        elapsed: Some(started.elapsed()),
    });
}

fn collect(requests: &[FetchRequest], statuses: Vec<Option<UnitStatus>>) -> RunReport {
    RunReport::from_outcomes(
        requests
            .iter()
            .cloned()
            .zip(statuses)
            .map(|(request, status)| UnitOutcome {
                request,
                status: status.unwrap_or(UnitStatus::Cancelled),
            })
            .collect(),
    )
}

fn log_report(report: &RunReport) {
    let totals = &report.totals;
    tracing::info!(
        ingested = totals.ingested,
        empty = totals.empty,
        failed = totals.failed,
        cancelled = totals.cancelled,
        inserted = totals.inserted,
        replaced = totals.replaced,
        skipped = totals.skipped,
        rejected = totals.rejected,
        "run finished"
    );
}
