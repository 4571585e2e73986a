//! Market-wide rankings over a date range of the dataset.

use std::cmp::Ordering;
use std::ops::RangeInclusive;

use chrono::NaiveDate;
use serde::Serialize;

use crate::dataset::DatasetStore;
use crate::domain::{CLOSE, EntityId, OPEN, TRADE_COUNT, VALUE, VOLUME};
use crate::error::{ConfigError, Error};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntity {
    pub entity: EntityId,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    pub highest: Vec<RankedEntity>,
    pub lowest: Vec<RankedEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub entity: EntityId,
    pub first_open: f64,
    pub last_close: f64,
    pub change_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSummary {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub entities: usize,
    pub top_n: usize,
    pub trade_count: Ranking,
    pub volume: Ranking,
    pub value: Ranking,
    pub increases: Vec<PriceChange>,
    pub decreases: Vec<PriceChange>,
}

#[derive(Debug)]
struct EntityTotals {
    entity: EntityId,
    trade_count: f64,
    volume: f64,
    value: f64,
    change: Option<PriceChange>,
}

/// Rank entities by summed activity and by price change between the first
/// open and the last close in `range`. Entities without records in `range`
/// are left out.
pub fn summarize(
    store: &DatasetStore,
    range: RangeInclusive<NaiveDate>,
    top_n: usize,
) -> Result<MarketSummary, Error> {
    let (start, end) = (*range.start(), *range.end());
    if start > end {
        return Err(ConfigError::InvertedRange { start, end }.into());
    }

    let mut totals = Vec::new();
    for entity in store.entities()? {
        let records = store.query(&entity, range.clone())?;
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            continue;
        };
        let sum = |field: &str| records.iter().filter_map(|r| r.number(field)).sum::<f64>();
        let change = match (first.number(OPEN), last.number(CLOSE)) {
            (Some(open), Some(close)) if open != 0.0 => Some(PriceChange {
                entity: entity.clone(),
                first_open: open,
                last_close: close,
                change_pct: round2((close - open) / open * 100.0),
            }),
            _ => None,
        };
        totals.push(EntityTotals {
            trade_count: sum(TRADE_COUNT),
            volume: sum(VOLUME),
            value: sum(VALUE),
            change,
            entity,
        });
    }

    if top_n == 0 || top_n > totals.len() {
        return Err(ConfigError::InvalidValue(format!(
            "top_n must be between 1 and {} (entities with data in range), got {top_n}",
            totals.len()
        ))
        .into());
    }

    let changes: Vec<&PriceChange> = totals.iter().filter_map(|t| t.change.as_ref()).collect();
    let mut increases: Vec<PriceChange> = changes
        .iter()
        .filter(|change| change.change_pct > 0.0)
        .map(|change| (*change).clone())
        .collect();
    increases.sort_by(|a, b| by_value_then_entity(b.change_pct, a.change_pct, &a.entity, &b.entity));
    increases.truncate(top_n);

    let mut decreases: Vec<PriceChange> = changes
        .iter()
        .filter(|change| change.change_pct < 0.0)
        .map(|change| (*change).clone())
        .collect();
    decreases.sort_by(|a, b| by_value_then_entity(a.change_pct, b.change_pct, &a.entity, &b.entity));
    decreases.truncate(top_n);

    tracing::debug!(entities = totals.len(), top_n, "summarized dataset");

    Ok(MarketSummary {
        start,
        end,
        entities: totals.len(),
        top_n,
        trade_count: rank(&totals, top_n, |t| t.trade_count),
        volume: rank(&totals, top_n, |t| t.volume),
        value: rank(&totals, top_n, |t| t.value),
        increases,
        decreases,
    })
}

fn rank(totals: &[EntityTotals], top_n: usize, metric: impl Fn(&EntityTotals) -> f64) -> Ranking {
    let mut ranked: Vec<RankedEntity> = totals
        .iter()
        .map(|t| RankedEntity {
            entity: t.entity.clone(),
            total: metric(t),
        })
        .collect();

    ranked.sort_by(|a, b| by_value_then_entity(b.total, a.total, &a.entity, &b.entity));
    let highest = ranked.iter().take(top_n).cloned().collect();

    ranked.sort_by(|a, b| by_value_then_entity(a.total, b.total, &a.entity, &b.entity));
    let lowest = ranked.into_iter().take(top_n).collect();

    Ranking { highest, lowest }
}

/// Order by `left` against `right`, ties broken by entity id ascending.
fn by_value_then_entity(left: f64, right: f64, a: &EntityId, b: &EntityId) -> Ordering {
    left.total_cmp(&right).then_with(|| a.cmp(b))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
