use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::domain::EntityId;
use crate::error::ConfigError;
use crate::normalize::NormalizerConfig;
use crate::retrieval::{RetryPolicy, SourceConfig};

pub const DEFAULT_CONFIG_FILE: &str = "tsetmc.json";
pub const DEFAULT_URL_TEMPLATE: &str =
    "http://members.tsetmc.com/tsev2/excel/MarketWatchPlus.aspx?d={date}";
const MAX_WORKERS: usize = 64;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub entities: Vec<EntityEntry>,
    #[serde(default)]
    pub source: Option<SourceSection>,
    #[serde(default)]
    pub retry: Option<RetrySection>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub staging_dir: Option<String>,
    #[serde(default)]
    pub dataset_dir: Option<String>,
    #[serde(default)]
    pub retain_staged: Option<bool>,
    #[serde(default)]
    pub max_invalid_ratio: Option<f64>,
    #[serde(default)]
    pub calendar: Option<Calendar>,
    #[serde(default)]
    pub skip_weekdays: Option<Vec<Weekday>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntityEntry {
    Shorthand(String),
    Detailed(EntityEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EntityEntryObject {
    pub id: String,
    #[serde(default)]
    pub url_template: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SourceSection {
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetrySection {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub rate_limit_pause_ms: Option<u64>,
    #[serde(default)]
    pub max_total_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EntityTarget {
    pub id: EntityId,
    pub url_template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub entities: Vec<EntityTarget>,
    pub source: SourceConfig,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub staging_dir: Utf8PathBuf,
    pub dataset_dir: Utf8PathBuf,
    pub retain_staged: bool,
    pub normalizer: NormalizerConfig,
    pub skip_weekdays: Vec<Weekday>,
}

impl ResolvedConfig {
    pub fn calendar(&self) -> Calendar {
        self.normalizer.calendar
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|target| target.id.clone()).collect()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load `path`, or `tsetmc.json` from the current directory when present.
    /// Without either, defaults apply and entities must come from the command line.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ConfigError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| ConfigError::Read(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ConfigError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(ConfigError::InvalidValue(format!(
                "unsupported config schema_version {schema_version}"
            )));
        }

        let entities = config
            .entities
            .into_iter()
            .map(|entry| match entry {
                EntityEntry::Shorthand(value) => Ok(EntityTarget {
                    id: value.parse()?,
                    url_template: None,
                }),
                EntityEntry::Detailed(obj) => {
                    if let Some(template) = &obj.url_template {
                        validate_template(template)?;
                    }
                    Ok(EntityTarget {
                        id: obj.id.parse()?,
                        url_template: obj.url_template,
                    })
                }
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let source_section = config.source.unwrap_or_default();
        let url_template = source_section
            .url_template
            .unwrap_or_else(|| DEFAULT_URL_TEMPLATE.to_string());
        validate_template(&url_template)?;
        let timeout_secs = source_section.timeout_secs.unwrap_or(30);
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "source.timeout_secs must be positive".to_string(),
            ));
        }
        let source = SourceConfig {
            url_template,
            timeout: Duration::from_secs(timeout_secs),
            user_agent: source_section
                .user_agent
                .unwrap_or_else(default_user_agent),
        };

        let retry = resolve_retry(config.retry.unwrap_or_default())?;

        let workers = validate_workers(config.workers.unwrap_or(4))?;

        let max_invalid_ratio = config.max_invalid_ratio.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&max_invalid_ratio) {
            return Err(ConfigError::InvalidValue(format!(
                "max_invalid_ratio must be within [0, 1], got {max_invalid_ratio}"
            )));
        }

        Ok(ResolvedConfig {
            schema_version,
            entities,
            source,
            retry,
            workers,
            staging_dir: Utf8PathBuf::from(config.staging_dir.unwrap_or_else(|| "Stage".into())),
            dataset_dir: Utf8PathBuf::from(
                config.dataset_dir.unwrap_or_else(|| "Datalake".into()),
            ),
            retain_staged: config.retain_staged.unwrap_or(true),
            normalizer: NormalizerConfig {
                max_invalid_ratio,
                calendar: config.calendar.unwrap_or_default(),
            },
            skip_weekdays: config.skip_weekdays.unwrap_or_else(default_skip_weekdays),
        })
    }
}

/// Worker count for a file value or a command-line override.
pub fn validate_workers(workers: usize) -> Result<usize, ConfigError> {
    if workers == 0 || workers > MAX_WORKERS {
        return Err(ConfigError::InvalidValue(format!(
            "workers must be between 1 and {MAX_WORKERS}, got {workers}"
        )));
    }
    Ok(workers)
}

fn resolve_retry(section: RetrySection) -> Result<RetryPolicy, ConfigError> {
    let defaults = RetryPolicy::default();
    let policy = RetryPolicy {
        max_attempts: section.max_attempts.unwrap_or(defaults.max_attempts),
        base_delay: section
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        max_delay: section
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
        rate_limit_pause: section
            .rate_limit_pause_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.rate_limit_pause),
        max_total: section
            .max_total_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_total),
    };
    if policy.max_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "retry.max_attempts must be at least 1".to_string(),
        ));
    }
    if policy.max_delay < policy.base_delay {
        return Err(ConfigError::InvalidValue(
            "retry.max_delay_ms must not be below retry.base_delay_ms".to_string(),
        ));
    }
    Ok(policy)
}

fn validate_template(template: &str) -> Result<(), ConfigError> {
    if !template.contains("{date}") {
        return Err(ConfigError::InvalidValue(format!(
            "url template must contain {{date}}: {template}"
        )));
    }
    if !(template.starts_with("http://") || template.starts_with("https://")) {
        return Err(ConfigError::InvalidValue(format!(
            "url template must be an http(s) URL: {template}"
        )));
    }
    Ok(())
}

pub fn default_user_agent() -> String {
    format!("tsetmc-ingest/{}", env!("CARGO_PKG_VERSION"))
}

/// Thursday and Friday: the Iranian market weekend.
pub fn default_skip_weekdays() -> Vec<Weekday> {
    vec![Weekday::Thu, Weekday::Fri]
}
