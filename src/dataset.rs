//! Versioned, per-entity dataset of canonical records.
//!
//! Layout: `{root}/schema.json` and one `{root}/entity={ID}.csv` per entity with
//! header `date,<fields...>`. Files are replaced atomically, and writers for the
//! same entity are serialized through a per-entity lock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::Serialize;

use crate::domain::{CanonicalRecord, EntityId, FieldValue, Schema};
use crate::error::{Error, SchemaError, StoreError};
use crate::fs_util;

const SCHEMA_FILE: &str = "schema.json";
const ENTITY_PREFIX: &str = "entity=";
const ENTITY_EXT: &str = ".csv";
const DATE_COLUMN: &str = "date";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub entity: EntityId,
    pub date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub rejections: Vec<Rejection>,
}

impl UpsertReport {
    pub fn changed(&self) -> usize {
        self.inserted + self.replaced
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStats {
    pub entity: EntityId,
    pub records: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug)]
pub struct DatasetStore {
    root: Utf8PathBuf,
    schema: Schema,
    locks: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl DatasetStore {
    /// Open the dataset at `root`, creating it with `schema` if it does not exist yet.
    ///
    /// An existing dataset must carry the same schema version and field definitions.
    pub fn open(root: impl Into<Utf8PathBuf>, schema: &Schema) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(root.as_std_path()).map_err(|err| StoreError::unavailable(&root, err))?;

        let schema_path = root.join(SCHEMA_FILE);
        if schema_path.as_std_path().is_file() {
            let content = fs::read_to_string(schema_path.as_std_path())
                .map_err(|err| StoreError::unavailable(&schema_path, err))?;
            let stored: Schema = serde_json::from_str(&content)
                .map_err(|err| StoreError::corrupt(&schema_path, err.to_string()))?;
            if stored.version != schema.version {
                return Err(SchemaError::VersionMismatch {
                    expected: schema.version,
                    found: stored.version,
                }
                .into());
            }
            if stored.fields != schema.fields {
                let stored_names: Vec<_> = stored.field_names().collect();
                let expected_names: Vec<_> = schema.field_names().collect();
                return Err(SchemaError::DefinitionMismatch {
                    detail: format!(
                        "stored fields [{}], expected [{}]",
                        stored_names.join(", "),
                        expected_names.join(", ")
                    ),
                }
                .into());
            }
        } else {
            let content = serde_json::to_vec_pretty(schema)
                .map_err(|err| StoreError::unavailable(&schema_path, err))?;
            fs_util::write_atomic(&schema_path, &content)
                .map_err(|err| StoreError::unavailable(&schema_path, err))?;
            tracing::info!(path = %schema_path, version = schema.version, "created dataset");
        }

        Ok(Self {
            root,
            schema: schema.clone(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn entity_path(&self, entity: &EntityId) -> Utf8PathBuf {
        self.root
            .join(format!("{ENTITY_PREFIX}{}{ENTITY_EXT}", entity.as_str()))
    }

    /// Insert new records, replace changed ones and skip identical ones.
    ///
    /// Records that fail the schema check are tallied as rejected; the rest of the
    /// batch is still applied.
    pub fn upsert(&self, records: &[CanonicalRecord]) -> Result<UpsertReport, Error> {
        let mut report = UpsertReport::default();
        let mut by_entity: BTreeMap<&EntityId, Vec<&CanonicalRecord>> = BTreeMap::new();

        for record in records {
            match self.schema.check(record) {
                Ok(()) => by_entity.entry(&record.entity).or_default().push(record),
                Err(err) => {
                    tracing::warn!(entity = %record.entity, date = %record.date, error = %err, "rejected record");
                    report.rejected += 1;
                    report.rejections.push(Rejection {
                        entity: record.entity.clone(),
                        date: record.date,
                        reason: err.to_string(),
                    });
                }
            }
        }

        for (entity, records) in by_entity {
            let lock = self.entity_lock(entity);
            let _guard = acquire(&lock);

            let path = self.entity_path(entity);
            let mut table = self.read_table(entity, &path)?;
            let mut changed = false;
            for record in records {
                match table.get(&record.date) {
                    None => {
                        report.inserted += 1;
                        changed = true;
                    }
                    Some(existing) if existing == record => {
                        report.skipped += 1;
                        continue;
                    }
                    Some(_) => {
                        report.replaced += 1;
                        changed = true;
                    }
                }
                table.insert(record.date, record.clone());
            }

            if changed {
                self.write_table(&path, &table)?;
                tracing::debug!(entity = %entity, records = table.len(), "wrote entity table");
            }
        }

        Ok(report)
    }

    /// Records for `entity` whose date lies in `range`, ascending by date.
    pub fn query(
        &self,
        entity: &EntityId,
        range: RangeInclusive<NaiveDate>,
    ) -> Result<Vec<CanonicalRecord>, Error> {
        let path = self.entity_path(entity);
        let table = self.read_table(entity, &path)?;
        Ok(table.range(range).map(|(_, record)| record.clone()).collect())
    }

    pub fn entities(&self) -> Result<Vec<EntityId>, Error> {
        let entries = self
            .root
            .read_dir_utf8()
            .map_err(|err| StoreError::unavailable(&self.root, err))?;
        let mut entities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::unavailable(&self.root, err))?;
            let Some(id) = entry
                .file_name()
                .strip_prefix(ENTITY_PREFIX)
                .and_then(|rest| rest.strip_suffix(ENTITY_EXT))
            else {
                continue;
            };
            match id.parse::<EntityId>() {
                Ok(entity) => entities.push(entity),
                Err(_) => tracing::warn!(file = entry.file_name(), "ignoring unrecognized dataset file"),
            }
        }
        entities.sort();
        Ok(entities)
    }

    pub fn stats(&self) -> Result<Vec<EntityStats>, Error> {
        let mut stats = Vec::new();
        for entity in self.entities()? {
            let path = self.entity_path(&entity);
            let table = self.read_table(&entity, &path)?;
            stats.push(EntityStats {
                records: table.len(),
                first_date: table.keys().next().copied(),
                last_date: table.keys().next_back().copied(),
                entity,
            });
        }
        Ok(stats)
    }

    fn entity_lock(&self, entity: &EntityId) -> Arc<Mutex<()>> {
        let mut locks = acquire(&self.locks);
        locks.entry(entity.clone()).or_default().clone()
    }

    fn read_table(
        &self,
        entity: &EntityId,
        path: &Utf8Path,
    ) -> Result<BTreeMap<NaiveDate, CanonicalRecord>, StoreError> {
        let mut table = BTreeMap::new();
        if !path.as_std_path().is_file() {
            return Ok(table);
        }

        let mut reader = csv::Reader::from_path(path.as_std_path())
            .map_err(|err| StoreError::unavailable(path, err))?;
        let headers = reader
            .headers()
            .map_err(|err| StoreError::corrupt(path, err.to_string()))?
            .clone();
        let expected: Vec<&str> = std::iter::once(DATE_COLUMN)
            .chain(self.schema.field_names())
            .collect();
        if headers.iter().ne(expected.iter().copied()) {
            return Err(StoreError::corrupt(
                path,
                format!("header [{}] does not match schema", headers.iter().collect::<Vec<_>>().join(",")),
            ));
        }

        for (index, row) in reader.records().enumerate() {
            let row = row.map_err(|err| StoreError::corrupt(path, err.to_string()))?;
            let line = index + 2;
            let date = row
                .get(0)
                .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
                .ok_or_else(|| StoreError::corrupt(path, format!("line {line}: invalid date")))?;
            let mut record = CanonicalRecord::new(entity.clone(), date);
            for (offset, field) in self.schema.fields.iter().enumerate() {
                let raw = row.get(offset + 1).unwrap_or_default();
                let value = FieldValue::parse_as(field.kind, raw).ok_or_else(|| {
                    StoreError::corrupt(
                        path,
                        format!("line {line}: invalid {} value {raw:?} for '{}'", field.kind, field.name),
                    )
                })?;
                record.fields.insert(field.name.clone(), value);
            }
            table.insert(date, record);
        }
        Ok(table)
    }

    fn write_table(
        &self,
        path: &Utf8Path,
        table: &BTreeMap<NaiveDate, CanonicalRecord>,
    ) -> Result<(), StoreError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let header: Vec<&str> = std::iter::once(DATE_COLUMN)
            .chain(self.schema.field_names())
            .collect();
        writer
            .write_record(&header)
            .map_err(|err| StoreError::unavailable(path, err))?;
        for (date, record) in table {
            let mut row = vec![date.format("%Y-%m-%d").to_string()];
            for name in self.schema.field_names() {
                row.push(record.get(name).map(ToString::to_string).unwrap_or_default());
            }
            writer
                .write_record(&row)
                .map_err(|err| StoreError::unavailable(path, err))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| StoreError::unavailable(path, err))?;
        fs_util::write_atomic(path, &bytes).map_err(|err| StoreError::unavailable(path, err))
    }
}

fn acquire<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
