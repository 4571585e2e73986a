//! Staged payload to canonical records.
//!
//! The export layout is sniffed from the payload bytes, parsed into a [`RawTable`],
//! and the header row is located by column aliases (the portal prefixes title rows
//! whose count has changed over time). Rows that fail validation are dropped and
//! counted; too many of them fail the whole file. Market-wide exports carry every
//! symbol of the day, so rows for other entities than the requested one are set
//! aside and counted separately.

mod layout;

use std::collections::BTreeMap;

use camino::Utf8Path;
use chrono::{Duration, NaiveDate};
use serde::Serialize;

pub use layout::{PayloadLayout, RawTable};

use crate::calendar::{Calendar, fold_digits};
use crate::domain::{
    CanonicalRecord, EntityId, FetchRequest, FieldKind, FieldValue, Schema, CLOSE, HIGH, LAST, LOW,
    OPEN, PREV_CLOSE, TRADE_COUNT, VALUE, VOLUME,
};
use crate::error::{Error, NormalizationError};
use crate::staging::StagedFile;

const HEADER_SCAN_ROWS: usize = 16;
const ENTITY_COLUMN: &str = "entity";
const DATE_COLUMN: &str = "date";

/// Header spellings seen in portal exports and in files written by earlier tooling.
const ALIASES: &[(&str, &[&str])] = &[
    (ENTITY_COLUMN, &["نماد", "symbol", "entity", "ticker", "isin"]),
    (DATE_COLUMN, &["تاریخ", "date"]),
    (TRADE_COUNT, &["تعداد", "تعداد معاملات", "trade count", "trades", "count"]),
    (VOLUME, &["حجم", "حجم معاملات", "volume"]),
    (VALUE, &["ارزش", "ارزش معاملات", "value"]),
    (PREV_CLOSE, &["دیروز", "قیمت دیروز", "prev close", "previous close", "yesterday"]),
    (OPEN, &["اولین", "اولین قیمت", "open", "first"]),
    (HIGH, &["بیشترین", "بیشترین قیمت", "high", "max"]),
    (LOW, &["کمترین", "کمترین قیمت", "low", "min"]),
    (LAST, &["آخرین معامله مقدار", "آخرین معامله", "آخرین قیمت", "last", "last price"]),
    (CLOSE, &["قیمت پایانی مقدار", "قیمت پایانی", "پایانی", "close", "closing price"]),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizerConfig {
    /// Largest tolerated share of invalid data rows, in `[0, 1]`.
    pub max_invalid_ratio: f64,
    pub calendar: Calendar,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_invalid_ratio: 0.5,
            calendar: Calendar::Jalali,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedBatch {
    pub source: FetchRequest,
    pub layout: Option<PayloadLayout>,
    pub records: Vec<CanonicalRecord>,
    pub total_rows: usize,
    pub invalid_rows: usize,
    pub duplicate_rows: usize,
    /// Rows naming another entity than the requested one.
    pub other_entity_rows: usize,
}

impl NormalizedBatch {
    /// A header without data rows, or an empty payload: a day without trading.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    schema: Schema,
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(schema: Schema, config: NormalizerConfig) -> Self {
        Self { schema, config }
    }

    pub fn normalize(&self, staged: &StagedFile) -> Result<NormalizedBatch, Error> {
        let bytes = staged.read_payload()?;
        let batch = self.normalize_bytes(&bytes, &staged.request(), &staged.payload_path)?;
        tracing::debug!(
            entity = %staged.entity,
            date = %staged.date,
            records = batch.records.len(),
            invalid = batch.invalid_rows,
            other_entities = batch.other_entity_rows,
            "normalized"
        );
        Ok(batch)
    }

    /// Every record carries `source.entity`; `source.date` applies to rows
    /// without a date column. `path` is only used in error reports.
    pub fn normalize_bytes(
        &self,
        bytes: &[u8],
        source: &FetchRequest,
        path: &Utf8Path,
    ) -> Result<NormalizedBatch, NormalizationError> {
        let mut batch = NormalizedBatch {
            source: source.clone(),
            layout: None,
            records: Vec::new(),
            total_rows: 0,
            invalid_rows: 0,
            duplicate_rows: 0,
            other_entity_rows: 0,
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            tracing::info!(entity = %source.entity, date = %source.date, "empty payload");
            return Ok(batch);
        }

        let parse_failure = |detail: String| NormalizationError::ParseFailure {
            path: path.to_owned(),
            detail,
        };
        let layout = layout::detect(bytes).map_err(parse_failure)?;
        let table = layout::parse(layout, bytes)
            .map_err(|detail| parse_failure(format!("{layout}: {detail}")))?;
        batch.layout = Some(layout);

        if table.rows.iter().all(|row| RawTable::is_blank_row(row)) {
            return Ok(batch);
        }

        let (header_index, columns) = self.locate_header(&table).map_err(|detail| {
            NormalizationError::SchemaMismatch {
                path: path.to_owned(),
                detail,
            }
        })?;

        let mut deduped: BTreeMap<(EntityId, NaiveDate), CanonicalRecord> = BTreeMap::new();
        for (offset, row) in table.rows.iter().enumerate().skip(header_index + 1) {
            if RawTable::is_blank_row(row) {
                continue;
            }
            if columns.names_other_entity(row, &source.entity) {
                batch.other_entity_rows += 1;
                continue;
            }
            batch.total_rows += 1;
            match self.parse_row(row, &columns, source) {
                Ok(record) => {
                    let key = (record.entity.clone(), record.date);
                    if deduped.insert(key, record).is_some() {
                        batch.duplicate_rows += 1;
                    }
                }
                Err(reason) => {
                    batch.invalid_rows += 1;
                    tracing::debug!(row = offset + 1, %reason, "dropping invalid row");
                }
            }
        }

        if batch.total_rows > 0 {
            let ratio = batch.invalid_rows as f64 / batch.total_rows as f64;
            if ratio > self.config.max_invalid_ratio {
                return Err(NormalizationError::SchemaMismatch {
                    path: path.to_owned(),
                    detail: format!(
                        "{} of {} rows invalid, above the {:.0}% threshold",
                        batch.invalid_rows,
                        batch.total_rows,
                        self.config.max_invalid_ratio * 100.0
                    ),
                });
            }
        }
        if batch.invalid_rows > 0 {
            tracing::warn!(
                entity = %source.entity,
                date = %source.date,
                invalid = batch.invalid_rows,
                total = batch.total_rows,
                "dropped invalid rows"
            );
        }

        batch.records = deduped.into_values().collect();
        Ok(batch)
    }

    /// First row among the leading rows that names every schema field.
    fn locate_header(&self, table: &RawTable) -> Result<(usize, ColumnMap), String> {
        let mut best: Option<(usize, ColumnMap)> = None;
        for (index, row) in table.rows.iter().take(HEADER_SCAN_ROWS).enumerate() {
            let columns = ColumnMap::from_header(row);
            let missing = columns.missing(&self.schema);
            if missing.is_empty() {
                return Ok((index, columns));
            }
            let better = best
                .as_ref()
                .is_none_or(|(_, current)| current.fields.len() < columns.fields.len());
            if better {
                best = Some((index, columns));
            }
        }

        match best {
            Some((index, columns)) if !columns.fields.is_empty() => Err(format!(
                "header row {} lacks columns for: {}",
                index + 1,
                columns.missing(&self.schema).join(", ")
            )),
            _ => Err(format!(
                "no header row found in the first {HEADER_SCAN_ROWS} rows"
            )),
        }
    }

    fn parse_row(
        &self,
        row: &[String],
        columns: &ColumnMap,
        source: &FetchRequest,
    ) -> Result<CanonicalRecord, String> {
        let cell = |index: usize| row.get(index).map(|value| value.trim()).unwrap_or_default();

        if let Some(index) = columns.entity
            && cell(index).is_empty()
        {
            return Err("missing entity".to_string());
        }
        let date = match columns.date {
            Some(index) => parse_date_cell(self.config.calendar, cell(index))
                .ok_or_else(|| format!("invalid date {:?}", cell(index)))?,
            None => source.date,
        };

        let mut record = CanonicalRecord::new(source.entity.clone(), date);
        for field in &self.schema.fields {
            let Some(&index) = columns.fields.get(field.name.as_str()) else {
                return Err(format!("no column for '{}'", field.name));
            };
            let raw = cell(index);
            let value = parse_value(field.kind, raw)
                .ok_or_else(|| format!("invalid {} value {raw:?} for '{}'", field.kind, field.name))?;
            record.fields.insert(field.name.clone(), value);
        }
        Ok(record)
    }
}

#[derive(Debug, Default)]
struct ColumnMap {
    entity: Option<usize>,
    date: Option<usize>,
    fields: BTreeMap<&'static str, usize>,
}

impl ColumnMap {
    fn from_header(row: &[String]) -> Self {
        let mut map = ColumnMap::default();
        for (index, cell) in row.iter().enumerate() {
            let key = header_key(cell);
            if key.is_empty() {
                continue;
            }
            let Some((target, _)) = ALIASES
                .iter()
                .find(|(_, aliases)| aliases.iter().any(|alias| header_key(alias) == key))
            else {
                continue;
            };
            // First occurrence wins.
            match *target {
                ENTITY_COLUMN => {
                    map.entity.get_or_insert(index);
                }
                DATE_COLUMN => {
                    map.date.get_or_insert(index);
                }
                field => {
                    map.fields.entry(field).or_insert(index);
                }
            }
        }
        map
    }

    /// A non-empty entity cell that does not match `entity` after folding.
    fn names_other_entity(&self, row: &[String], entity: &EntityId) -> bool {
        let Some(cell) = self.entity.and_then(|index| row.get(index)) else {
            return false;
        };
        let key = header_key(cell);
        !key.is_empty() && key != header_key(entity.as_str())
    }

    fn missing<'a>(&self, schema: &'a Schema) -> Vec<&'a str> {
        schema
            .field_names()
            .filter(|name| !self.fields.contains_key(name))
            .collect()
    }
}

/// Comparable form of a header cell: Arabic letter variants folded to Persian,
/// zero-width joiners dropped, separators collapsed, ASCII lowercased.
fn header_key(raw: &str) -> String {
    let folded: String = fold_digits(raw)
        .chars()
        .map(|ch| match ch {
            'ي' | 'ى' => 'ی',
            'ك' => 'ک',
            '\u{200C}' | '\u{200F}' | '\u{200E}' => ' ',
            '-' | '_' | '–' | '/' => ' ',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Numbers as exported: thousands separators, Persian digits, exponents and
/// accounting-style parentheses for negatives.
pub fn parse_number(raw: &str) -> Option<f64> {
    let folded = fold_digits(raw.trim());
    let mut cleaned: String = folded
        .chars()
        .filter(|ch| !matches!(ch, ',' | ' ' | '\u{00A0}' | '\u{202F}'))
        .collect();
    if cleaned.starts_with('(') && cleaned.ends_with(')') && cleaned.len() > 2 {
        cleaned = format!("-{}", &cleaned[1..cleaned.len() - 1]);
    }
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_value(kind: FieldKind, raw: &str) -> Option<FieldValue> {
    match kind {
        FieldKind::Int => {
            let value = parse_number(raw)?;
            (value >= 0.0 && value.fract() == 0.0 && value <= i64::MAX as f64)
                .then(|| FieldValue::Integer(value as i64))
        }
        FieldKind::Float => parse_number(raw).map(FieldValue::Float),
        FieldKind::Text => Some(FieldValue::Text(raw.to_string())),
    }
}

/// A date cell in the configured calendar, or a spreadsheet serial day number.
fn parse_date_cell(calendar: Calendar, raw: &str) -> Option<NaiveDate> {
    if let Some(date) = calendar.parse(raw) {
        return Some(date);
    }
    let serial = parse_number(raw)?;
    if serial.fract() != 0.0 || !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(serial as i64))
}
