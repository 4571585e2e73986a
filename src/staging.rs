//! Raw payload staging.
//!
//! Every (entity, date) pair owns exactly one slot:
//! `{root}/{entity}/{YYYY-MM-DD}.payload` plus a `{YYYY-MM-DD}.meta.json` sidecar.
//! The payload is written before the sidecar, so a slot only becomes visible to
//! [`StagingStore::list`] once both are complete.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EntityId, FetchRequest};
use crate::error::StoreError;
use crate::fs_util;

const PAYLOAD_EXT: &str = "payload";
const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub entity: EntityId,
    pub date: NaiveDate,
    pub source_url: String,
    pub retrieved_at: DateTime<Utc>,
    pub http_status: u16,
    pub content_hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    pub entity: EntityId,
    pub date: NaiveDate,
    pub payload_path: Utf8PathBuf,
    pub meta_path: Utf8PathBuf,
    pub content_hash: String,
}

impl StagedFile {
    pub fn request(&self) -> FetchRequest {
        FetchRequest::new(self.entity.clone(), self.date)
    }

    pub fn read_payload(&self) -> Result<Vec<u8>, StoreError> {
        fs::read(self.payload_path.as_std_path())
            .map_err(|err| StoreError::unavailable(&self.payload_path, err))
    }
}

#[derive(Debug, Clone)]
pub struct StagingStore {
    root: Utf8PathBuf,
}

impl StagingStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn payload_path(&self, request: &FetchRequest) -> Utf8PathBuf {
        self.root
            .join(request.entity.as_str())
            .join(format!("{}.{PAYLOAD_EXT}", request.date.format("%Y-%m-%d")))
    }

    pub fn meta_path(&self, request: &FetchRequest) -> Utf8PathBuf {
        self.root
            .join(request.entity.as_str())
            .join(format!("{}{META_SUFFIX}", request.date.format("%Y-%m-%d")))
    }

    pub fn exists(&self, request: &FetchRequest) -> bool {
        self.meta_path(request).as_std_path().is_file()
            && self.payload_path(request).as_std_path().is_file()
    }

    /// Stage `bytes` for `request`, replacing whatever the slot held before.
    pub fn write(
        &self,
        request: &FetchRequest,
        bytes: &[u8],
        source_url: &str,
        http_status: u16,
    ) -> Result<StagedFile, StoreError> {
        let payload_path = self.payload_path(request);
        let meta_path = self.meta_path(request);
        let content_hash = blake3::hash(bytes).to_hex().to_string();
        let meta = PayloadMeta {
            entity: request.entity.clone(),
            date: request.date,
            source_url: source_url.to_string(),
            retrieved_at: Utc::now(),
            http_status,
            content_hash: content_hash.clone(),
            size: bytes.len() as u64,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|err| StoreError::unavailable(&meta_path, err))?;

        // The slot stays invisible until the sidecar for the new payload lands.
        fs_util::remove_if_exists(&meta_path)
            .map_err(|err| StoreError::unavailable(&meta_path, err))?;
        fs_util::write_atomic(&payload_path, bytes)
            .map_err(|err| StoreError::unavailable(&payload_path, err))?;
        fs_util::write_atomic(&meta_path, &meta_bytes)
            .map_err(|err| StoreError::unavailable(&meta_path, err))?;

        tracing::debug!(
            entity = %request.entity,
            date = %request.date,
            size = meta.size,
            "staged payload"
        );

        Ok(StagedFile {
            entity: request.entity.clone(),
            date: request.date,
            payload_path,
            meta_path,
            content_hash,
        })
    }

    pub fn read_meta(&self, request: &FetchRequest) -> Result<Option<PayloadMeta>, StoreError> {
        let meta_path = self.meta_path(request);
        if !meta_path.as_std_path().is_file() {
            return Ok(None);
        }
        read_meta_file(&meta_path).map(Some)
    }

    pub fn get(&self, request: &FetchRequest) -> Result<Option<StagedFile>, StoreError> {
        if !self.payload_path(request).as_std_path().is_file() {
            return Ok(None);
        }
        Ok(self.read_meta(request)?.map(|meta| StagedFile {
            entity: request.entity.clone(),
            date: request.date,
            payload_path: self.payload_path(request),
            meta_path: self.meta_path(request),
            content_hash: meta.content_hash,
        }))
    }

    /// All complete slots, ordered by entity then date.
    pub fn list(&self) -> Result<Vec<StagedFile>, StoreError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut staged = Vec::new();
        for entity_dir in read_dir_sorted(&self.root)? {
            if !entity_dir.as_std_path().is_dir() {
                continue;
            }
            for path in read_dir_sorted(&entity_dir)? {
                let Some(name) = path.file_name() else {
                    continue;
                };
                if !name.ends_with(META_SUFFIX) {
                    continue;
                }
                let meta = match read_meta_file(&path) {
                    Ok(meta) => meta,
                    Err(err) => {
                        tracing::warn!(path = %path, error = %err, "skipping unreadable staging sidecar");
                        continue;
                    }
                };
                let request = FetchRequest::new(meta.entity.clone(), meta.date);
                let payload_path = self.payload_path(&request);
                if !payload_path.as_std_path().is_file() {
                    tracing::warn!(path = %payload_path, "staging sidecar without payload");
                    continue;
                }
                staged.push(StagedFile {
                    entity: meta.entity,
                    date: meta.date,
                    payload_path,
                    meta_path: path,
                    content_hash: meta.content_hash,
                });
            }
        }
        staged.sort_by(|a, b| (&a.entity, a.date).cmp(&(&b.entity, b.date)));
        Ok(staged)
    }

    /// Recompute the payload hash and compare it with the sidecar.
    pub fn verify(&self, staged: &StagedFile) -> Result<bool, StoreError> {
        let bytes = staged.read_payload()?;
        Ok(blake3::hash(&bytes).to_hex().as_str() == staged.content_hash)
    }

    pub fn remove(&self, staged: &StagedFile) -> Result<(), StoreError> {
        fs_util::remove_if_exists(&staged.meta_path)
            .map_err(|err| StoreError::unavailable(&staged.meta_path, err))?;
        fs_util::remove_if_exists(&staged.payload_path)
            .map_err(|err| StoreError::unavailable(&staged.payload_path, err))?;
        if let Some(dir) = staged.payload_path.parent() {
            // Only succeeds once the entity directory is empty.
            let _ = fs::remove_dir(dir.as_std_path());
        }
        Ok(())
    }
}

fn read_meta_file(path: &Utf8Path) -> Result<PayloadMeta, StoreError> {
    let content =
        fs::read_to_string(path.as_std_path()).map_err(|err| StoreError::unavailable(path, err))?;
    serde_json::from_str(&content).map_err(|err| StoreError::corrupt(path, err.to_string()))
}

fn read_dir_sorted(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StoreError> {
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| StoreError::unavailable(dir, err))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::unavailable(dir, err))?;
        if fs_util::is_temp_file(entry.file_name()) {
            continue;
        }
        paths.push(entry.into_path());
    }
    paths.sort();
    Ok(paths)
}
