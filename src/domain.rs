use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SchemaError};

const MAX_ENTITY_LEN: usize = 64;

/// Instrument identifier: an ISIN-style code (`IRO1FOLD0001`) or a portal symbol.
///
/// Used verbatim as a path component in both stores, so separators, `..` and
/// control characters are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized.chars().count() <= MAX_ENTITY_LEN
            && !normalized.contains("..")
            && !normalized.starts_with('.')
            && normalized
                .chars()
                .all(|ch| !ch.is_control() && !matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'));
        if !is_valid {
            return Err(ConfigError::InvalidEntity(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for EntityId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

/// One unit of retrieval work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FetchRequest {
    pub entity: EntityId,
    pub date: NaiveDate,
}

impl FetchRequest {
    pub fn new(entity: EntityId, date: NaiveDate) -> Self {
        Self { entity, date }
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity, self.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    Float,
    Text,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Int => write!(f, "int"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Text => write!(f, "text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Integer(_) => FieldKind::Int,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Text(_) => FieldKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(value) => Some(*value as f64),
            FieldValue::Float(value) => Some(*value),
            FieldValue::Text(_) => None,
        }
    }

    /// Parse a stored cell back into a value of `kind`.
    pub fn parse_as(kind: FieldKind, raw: &str) -> Option<Self> {
        match kind {
            FieldKind::Int => raw.parse().ok().map(FieldValue::Integer),
            FieldKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(FieldValue::Float),
            FieldKind::Text => Some(FieldValue::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Float(value) => write!(f, "{value}"),
            FieldValue::Text(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Field set and types shared by every record in a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub fields: Vec<FieldSpec>,
}

pub const TRADE_COUNT: &str = "trade_count";
pub const VOLUME: &str = "volume";
pub const VALUE: &str = "value";
pub const PREV_CLOSE: &str = "prev_close";
pub const OPEN: &str = "open";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
pub const LAST: &str = "last";
pub const CLOSE: &str = "close";

impl Schema {
    pub const CANONICAL_VERSION: u32 = 1;

    /// Daily market-watch schema.
    pub fn canonical() -> Self {
        Self {
            version: Self::CANONICAL_VERSION,
            fields: vec![
                FieldSpec::new(TRADE_COUNT, FieldKind::Int),
                FieldSpec::new(VOLUME, FieldKind::Int),
                FieldSpec::new(VALUE, FieldKind::Float),
                FieldSpec::new(PREV_CLOSE, FieldKind::Float),
                FieldSpec::new(OPEN, FieldKind::Float),
                FieldSpec::new(HIGH, FieldKind::Float),
                FieldSpec::new(LOW, FieldKind::Float),
                FieldSpec::new(LAST, FieldKind::Float),
                FieldSpec::new(CLOSE, FieldKind::Float),
            ],
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Check that `record` carries exactly this schema's fields with matching types.
    pub fn check(&self, record: &CanonicalRecord) -> Result<(), SchemaError> {
        let mismatch = |detail: String| SchemaError::FieldMismatch {
            entity: record.entity.to_string(),
            date: record.date,
            detail,
        };

        for field in &self.fields {
            match record.fields.get(&field.name) {
                None => return Err(mismatch(format!("missing field '{}'", field.name))),
                Some(value) if value.kind() != field.kind => {
                    return Err(mismatch(format!(
                        "field '{}' is {}, expected {}",
                        field.name,
                        value.kind(),
                        field.kind
                    )));
                }
                Some(FieldValue::Float(value)) if !value.is_finite() => {
                    return Err(mismatch(format!("field '{}' is not finite", field.name)));
                }
                Some(_) => {}
            }
        }

        if let Some(extra) = record
            .fields
            .keys()
            .find(|name| self.field(name).is_none())
        {
            return Err(mismatch(format!("unexpected field '{extra}'")));
        }
        Ok(())
    }
}

/// One normalized row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity: EntityId,
    pub date: NaiveDate,
    pub fields: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    pub fn new(entity: EntityId, date: NaiveDate) -> Self {
        Self {
            entity,
            date,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn sample(entity: &str) -> CanonicalRecord {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let mut record = CanonicalRecord::new(entity.parse().unwrap(), date);
        for field in Schema::canonical().fields {
            let value = match field.kind {
                FieldKind::Int => FieldValue::Integer(10),
                FieldKind::Float => FieldValue::Float(1250.0),
                FieldKind::Text => FieldValue::Text(String::new()),
            };
            record = record.with(&field.name, value);
        }
        record
    }

    #[test]
    fn parse_entity_valid() {
        let id: EntityId = " IRO1FOLD0001 ".parse().unwrap();
        assert_eq!(id.as_str(), "IRO1FOLD0001");
        let symbol: EntityId = "فولاد".parse().unwrap();
        assert_eq!(symbol.as_str(), "فولاد");
    }

    #[test]
    fn parse_entity_invalid() {
        for bad in ["", "   ", "../etc", "a/b", "a\\b", ".hidden", "x\ny"] {
            let err = bad.parse::<EntityId>().unwrap_err();
            assert_matches!(err, ConfigError::InvalidEntity(_));
        }
    }

    #[test]
    fn canonical_record_passes_schema() {
        assert!(Schema::canonical().check(&sample("IRO1FOLD0001")).is_ok());
    }

    #[test]
    fn missing_field_is_rejected() {
        let mut record = sample("IRO1FOLD0001");
        record.fields.remove(CLOSE);
        let err = Schema::canonical().check(&record).unwrap_err();
        assert_matches!(err, SchemaError::FieldMismatch { ref detail, .. } if detail.contains("close"));
    }

    #[test]
    fn wrong_type_and_extra_field_are_rejected() {
        let record = sample("IRO1FOLD0001").with(VOLUME, FieldValue::Float(1.5));
        assert!(Schema::canonical().check(&record).is_err());

        let record = sample("IRO1FOLD0001").with("eps", FieldValue::Float(1.0));
        assert!(Schema::canonical().check(&record).is_err());
    }
}
