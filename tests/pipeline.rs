mod support;

use assert_matches::assert_matches;

use tsetmc_ingest::dataset::DatasetStore;
use tsetmc_ingest::domain::{CLOSE, FetchRequest, FieldValue, Schema, VOLUME};
use tsetmc_ingest::normalize::{Normalizer, NormalizerConfig};
use tsetmc_ingest::pipeline::{Pipeline, UnitStatus};
use tsetmc_ingest::retrieval::{CancellationToken, RetrievalClient};
use tsetmc_ingest::staging::StagingStore;
use tsetmc_ingest::summary;

use support::{
    Quote, RecordingProgress, Reply, ScriptedSource, csv_payload, date, entity, fast_policy,
    html_payload, request, utf8_dir, xlsx_payload,
};

fn pipeline(source: ScriptedSource, dir: &tempfile::TempDir) -> Pipeline<ScriptedSource> {
    let schema = Schema::canonical();
    let retrieval = RetrievalClient::new(
        source,
        StagingStore::new(utf8_dir(dir, "Stage")),
        fast_policy(),
        4,
    )
    .unwrap();
    let dataset = DatasetStore::open(utf8_dir(dir, "Datalake"), &schema).unwrap();
    let normalizer = Normalizer::new(schema, NormalizerConfig::default());
    Pipeline::new(retrieval, normalizer, dataset)
}

#[test]
fn single_day_lands_in_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let unit = request("IRO1FOLD0001", date(2024, 1, 10));
    let quote = Quote::new("IRO1FOLD0001", 5_000.0, 5_250.0).activity(1_250, 3_400_000, 4.25e10);
    let source = ScriptedSource::new().script(unit.clone(), vec![Reply::Body(xlsx_payload(&[quote]))]);
    let pipeline = pipeline(source, &dir);
    let progress = RecordingProgress::default();

    let report = pipeline.run(&[unit.clone()], &CancellationToken::new(), &progress);
    assert_eq!(report.totals.ingested, 1);
    assert_eq!(report.totals.inserted, 1);
    assert!(!report.has_permanent_failures());
    assert!(pipeline.retrieval().staging().exists(&unit));
    assert!(
        progress
            .messages()
            .iter()
            .any(|m| m == "phase=Ingest; IRO1FOLD0001@2024-01-10 ingested")
    );

    let stored = pipeline
        .dataset()
        .query(&entity("IRO1FOLD0001"), date(2024, 1, 10)..=date(2024, 1, 10))
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get(VOLUME), Some(&FieldValue::Integer(3_400_000)));
    assert_eq!(stored[0].number(CLOSE), Some(5_250.0));
}

#[test]
fn rerun_is_idempotent_and_uses_staged_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let units: Vec<FetchRequest> = (6..=10)
        .map(|day| request("IRO1FOLD0001", date(2024, 1, day)))
        .collect();
    let mut source = ScriptedSource::new();
    for (offset, unit) in units.iter().enumerate() {
        let quote = Quote::new("IRO1FOLD0001", 5_000.0, 5_000.0 + offset as f64 * 10.0);
        source = source.script(unit.clone(), vec![Reply::Body(csv_payload(&[quote]))]);
    }
    let pipeline = pipeline(source, &dir);
    let progress = RecordingProgress::default();

    let first = pipeline.run(&units, &CancellationToken::new(), &progress);
    assert_eq!(first.totals.inserted, 5);
    let path = pipeline.dataset().entity_path(&entity("IRO1FOLD0001"));
    let written = std::fs::read(&path).unwrap();

    let second = pipeline.run(&units, &CancellationToken::new(), &progress);
    assert_eq!(second.totals.inserted, 0);
    assert_eq!(second.totals.replaced, 0);
    assert_eq!(second.totals.skipped, 5);
    assert_eq!(std::fs::read(&path).unwrap(), written);
    assert_eq!(pipeline.retrieval().source().calls().len(), 5);
}

#[test]
fn forced_refetch_of_same_content_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let unit = request("IRO1FOLD0001", date(2024, 1, 10));
    let body = html_payload(&[Quote::new("IRO1FOLD0001", 5_000.0, 5_250.0)]);
    let source = ScriptedSource::new().script(unit.clone(), vec![Reply::Body(body)]);
    let pipeline = pipeline(source, &dir).force_refetch(true);
    let progress = RecordingProgress::default();

    pipeline.run(&[unit.clone()], &CancellationToken::new(), &progress);
    let second = pipeline.run(&[unit.clone()], &CancellationToken::new(), &progress);

    assert_eq!(second.totals.skipped, 1);
    assert_eq!(second.totals.inserted + second.totals.replaced, 0);
    assert_eq!(pipeline.retrieval().source().calls_for(&unit), 2);
}

#[test]
fn one_failing_entity_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let good = request("IRO1FOLD0001", date(2024, 1, 10));
    let missing = request("IRO1KHOD0001", date(2024, 1, 10));
    let source = ScriptedSource::new()
        .script(
            good.clone(),
            vec![Reply::Body(csv_payload(&[Quote::new("IRO1FOLD0001", 5_000.0, 5_250.0)]))],
        )
        .script(missing.clone(), vec![Reply::Status(404)]);
    let pipeline = pipeline(source, &dir);

    let report = pipeline.run(
        &[good, missing],
        &CancellationToken::new(),
        &RecordingProgress::default(),
    );
    assert!(report.has_permanent_failures());
    assert!(!report.has_store_failures());
    assert_eq!(report.by_entity()[&entity("IRO1FOLD0001")].ingested, 1);
    assert_eq!(report.by_entity()[&entity("IRO1KHOD0001")].failed, 1);
    assert_eq!(report.failures().count(), 1);
    assert_matches!(report.outcomes[1].status, UnitStatus::FetchFailed { ref error } if error.is_permanent());
}

#[test]
fn holiday_payload_is_empty_not_failed() {
    let dir = tempfile::tempdir().unwrap();
    let unit = request("IRO1FOLD0001", date(2024, 1, 13));
    let source = ScriptedSource::new().script(unit.clone(), vec![Reply::Body(csv_payload(&[]))]);
    let pipeline = pipeline(source, &dir);

    let report = pipeline.run(&[unit], &CancellationToken::new(), &RecordingProgress::default());
    assert_eq!(report.totals.empty, 1);
    assert_eq!(report.totals.failed, 0);
    assert!(!report.has_permanent_failures());
}

#[test]
fn changed_export_layout_fails_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let unit = request("IRO1FOLD0001", date(2024, 1, 10));
    let source = ScriptedSource::new().script(
        unit.clone(),
        vec![Reply::Body(b"symbol,price\nIRO1FOLD0001,5250\n".to_vec())],
    );
    let pipeline = pipeline(source, &dir);

    let report = pipeline.run(&[unit], &CancellationToken::new(), &RecordingProgress::default());
    assert_matches!(report.outcomes[0].status, UnitStatus::NormalizationFailed { .. });
    assert!(report.has_permanent_failures());
    assert!(pipeline.dataset().entities().unwrap().is_empty());
}

#[test]
fn no_retain_removes_staged_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let unit = request("IRO1FOLD0001", date(2024, 1, 10));
    let source = ScriptedSource::new().script(
        unit.clone(),
        vec![Reply::Body(csv_payload(&[Quote::new("IRO1FOLD0001", 5_000.0, 5_250.0)]))],
    );
    let pipeline = pipeline(source, &dir).retain_staged(false);

    let report = pipeline.run(&[unit.clone()], &CancellationToken::new(), &RecordingProgress::default());
    assert_eq!(report.totals.ingested, 1);
    assert!(!pipeline.retrieval().staging().exists(&unit));
}

#[test]
fn tampered_staged_payload_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let unit = request("IRO1FOLD0001", date(2024, 1, 10));
    let staging = StagingStore::new(utf8_dir(&dir, "Stage"));
    let stale = csv_payload(&[Quote::new("IRO1FOLD0001", 5_000.0, 5_100.0)]);
    let staged = staging.write(&unit, &stale, "mock://seed", 200).unwrap();
    std::fs::write(&staged.payload_path, b"half written").unwrap();

    let fresh = csv_payload(&[Quote::new("IRO1FOLD0001", 5_000.0, 5_250.0)]);
    let source = ScriptedSource::new().script(unit.clone(), vec![Reply::Body(fresh)]);
    let pipeline = pipeline(source, &dir);

    let report = pipeline.run(&[unit.clone()], &CancellationToken::new(), &RecordingProgress::default());
    assert_eq!(report.totals.inserted, 1);
    assert_eq!(pipeline.retrieval().source().calls_for(&unit), 1);
    let stored = pipeline
        .dataset()
        .query(&entity("IRO1FOLD0001"), date(2024, 1, 10)..=date(2024, 1, 10))
        .unwrap();
    assert_eq!(stored[0].number(CLOSE), Some(5_250.0));
}

#[test]
fn market_wide_export_fills_only_the_requested_entity() {
    let dir = tempfile::tempdir().unwrap();
    let units = [
        request("IRO1FOLD0001", date(2024, 1, 10)),
        request("IRO1KHOD0001", date(2024, 1, 10)),
    ];
    let export = csv_payload(&[
        Quote::new("IRO1FOLD0001", 5_000.0, 5_250.0),
        Quote::new("IRO1KHOD0001", 2_100.0, 2_050.0),
    ]);
    let mut source = ScriptedSource::new();
    for unit in &units {
        source = source.script(unit.clone(), vec![Reply::Body(export.clone())]);
    }
    let pipeline = pipeline(source, &dir);

    let report = pipeline.run(&units, &CancellationToken::new(), &RecordingProgress::default());
    assert_eq!(report.totals.inserted, 2);
    assert_eq!(report.totals.skipped, 0);
    for (id, close) in [("IRO1FOLD0001", 5_250.0), ("IRO1KHOD0001", 2_050.0)] {
        let totals = &report.by_entity()[&entity(id)];
        assert_eq!((totals.ingested, totals.inserted), (1, 1));
        let stored = pipeline
            .dataset()
            .query(&entity(id), date(2024, 1, 10)..=date(2024, 1, 10))
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].number(CLOSE), Some(close));
    }
}

#[test]
fn ingest_staged_normalizes_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let staging = StagingStore::new(utf8_dir(&dir, "Stage"));
    for day in [9, 10] {
        let unit = request("IRO1FOLD0001", date(2024, 1, day));
        let body = csv_payload(&[Quote::new("IRO1FOLD0001", 5_000.0, 5_000.0 + day as f64)]);
        staging.write(&unit, &body, "mock://seed", 200).unwrap();
    }
    let source = ScriptedSource::new();
    let pipeline = pipeline(source, &dir);

    let report = pipeline
        .ingest_staged(&CancellationToken::new(), &RecordingProgress::default())
        .unwrap();
    assert_eq!(report.totals.inserted, 2);
    let stored = pipeline
        .dataset()
        .query(&entity("IRO1FOLD0001"), date(2024, 1, 1)..=date(2024, 1, 31))
        .unwrap();
    assert_eq!(stored.iter().map(|r| r.date).collect::<Vec<_>>(), vec![date(2024, 1, 9), date(2024, 1, 10)]);
}

#[test]
fn cancelled_run_reports_every_unit_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let units = vec![
        request("IRO1FOLD0001", date(2024, 1, 9)),
        request("IRO1KHOD0001", date(2024, 1, 9)),
    ];
    let pipeline = pipeline(ScriptedSource::new(), &dir);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline.run(&units, &cancel, &RecordingProgress::default());
    assert_eq!(report.totals.cancelled, 2);
    assert_eq!(report.failures().count(), 0);
}

#[test]
fn summary_ranks_ingested_days() {
    let dir = tempfile::tempdir().unwrap();
    let quotes = [
        ("IRO1FOLD0001", 5_000.0, 5_500.0, 900),
        ("IRO1KHOD0001", 2_000.0, 1_900.0, 2_500),
        ("IRO1BMLT0001", 1_000.0, 1_050.0, 400),
    ];
    let mut source = ScriptedSource::new();
    let mut units = Vec::new();
    for (id, open, close, trades) in quotes {
        for (day, price) in [(9, open), (10, close)] {
            let unit = request(id, date(2024, 1, day));
            let quote = Quote::new(id, price, price).activity(trades, trades * 100, trades as f64 * 1e6);
            source = source.script(unit.clone(), vec![Reply::Body(csv_payload(&[quote]))]);
            units.push(unit);
        }
    }
    let pipeline = pipeline(source, &dir);
    pipeline.run(&units, &CancellationToken::new(), &RecordingProgress::default());

    let summary = summary::summarize(pipeline.dataset(), date(2024, 1, 9)..=date(2024, 1, 10), 2).unwrap();
    assert_eq!(summary.entities, 3);
    let highest: Vec<_> = summary.trade_count.highest.iter().map(|r| r.entity.as_str()).collect();
    assert_eq!(highest, ["IRO1KHOD0001", "IRO1FOLD0001"]);
    assert_eq!(summary.trade_count.highest[0].total, 5_000.0);
    let lowest: Vec<_> = summary.trade_count.lowest.iter().map(|r| r.entity.as_str()).collect();
    assert_eq!(lowest, ["IRO1BMLT0001", "IRO1FOLD0001"]);

    let increases: Vec<_> = summary.increases.iter().map(|c| (c.entity.as_str(), c.change_pct)).collect();
    assert_eq!(increases, [("IRO1FOLD0001", 10.0), ("IRO1BMLT0001", 5.0)]);
    let decreases: Vec<_> = summary.decreases.iter().map(|c| (c.entity.as_str(), c.change_pct)).collect();
    assert_eq!(decreases, [("IRO1KHOD0001", -5.0)]);

    assert!(summary::summarize(pipeline.dataset(), date(2024, 1, 9)..=date(2024, 1, 10), 4).is_err());
}
