use std::fmt;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Transient,
    Permanent,
    RateLimited,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transient => write!(f, "transient"),
            FetchErrorKind::Permanent => write!(f, "permanent"),
            FetchErrorKind::RateLimited => write!(f, "rate-limited"),
        }
    }
}

/// Failure to retrieve one unit of work from the remote source.
///
/// Carries the entity and date so a failed unit can be retried by hand.
#[derive(Debug, Clone, Error, Diagnostic, serde::Serialize)]
#[error("{kind} fetch failure for {entity} on {date}: {reason}")]
#[diagnostic(code(tsetmc::fetch))]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub entity: String,
    pub date: NaiveDate,
    pub reason: String,
}

impl FetchError {
    pub fn new(
        kind: FetchErrorKind,
        entity: impl Into<String>,
        date: NaiveDate,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            date,
            reason: reason.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FetchErrorKind::Permanent
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum NormalizationError {
    #[error("schema mismatch in {path}: {detail}")]
    #[diagnostic(
        code(tsetmc::normalize::schema_mismatch),
        help("the portal may have changed its export layout; inspect the staged payload")
    )]
    SchemaMismatch { path: Utf8PathBuf, detail: String },

    #[error("failed to parse {path}: {detail}")]
    #[diagnostic(code(tsetmc::normalize::parse_failure))]
    ParseFailure { path: Utf8PathBuf, detail: String },
}

#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum SchemaError {
    #[error("record {entity}@{date} does not match the dataset schema: {detail}")]
    #[diagnostic(code(tsetmc::schema::field_mismatch))]
    FieldMismatch {
        entity: String,
        date: NaiveDate,
        detail: String,
    },

    #[error("dataset schema version {found} does not match expected version {expected}")]
    #[diagnostic(
        code(tsetmc::schema::version_mismatch),
        help("schemas are never migrated automatically; point --dataset-dir at a fresh directory")
    )]
    VersionMismatch { expected: u32, found: u32 },

    #[error("dataset field definitions differ from the expected schema: {detail}")]
    #[diagnostic(code(tsetmc::schema::definition_mismatch))]
    DefinitionMismatch { detail: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("store unavailable at {path}: {detail}")]
    #[diagnostic(code(tsetmc::store::unavailable))]
    Unavailable { path: Utf8PathBuf, detail: String },

    #[error("corrupt store file {path}: {detail}")]
    #[diagnostic(code(tsetmc::store::corrupt))]
    Corrupt { path: Utf8PathBuf, detail: String },
}

impl StoreError {
    pub fn unavailable(path: impl Into<Utf8PathBuf>, err: impl fmt::Display) -> Self {
        StoreError::Unavailable {
            path: path.into(),
            detail: err.to_string(),
        }
    }

    pub fn corrupt(path: impl Into<Utf8PathBuf>, detail: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file at {0}")]
    #[diagnostic(code(tsetmc::config::read), help("pass --config or create tsetmc.json"))]
    Read(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    #[diagnostic(code(tsetmc::config::parse))]
    Parse(String),

    #[error("invalid entity identifier: {0:?}")]
    #[diagnostic(code(tsetmc::config::entity))]
    InvalidEntity(String),

    #[error("invalid date {0:?}; expected YYYY-MM-DD")]
    #[diagnostic(code(tsetmc::config::date))]
    InvalidDate(String),

    #[error("start date {start} is after end date {end}")]
    #[diagnostic(code(tsetmc::config::range))]
    InvertedRange { start: NaiveDate, end: NaiveDate },

    #[error("{0} is a future date")]
    #[diagnostic(code(tsetmc::config::future))]
    FutureDate(NaiveDate),

    #[error("invalid configuration value: {0}")]
    #[diagnostic(code(tsetmc::config::value))]
    InvalidValue(String),
}
