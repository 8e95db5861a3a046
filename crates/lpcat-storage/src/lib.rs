//! Input snapshot storage and the file-backed catalogue store for lpcat.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lpcat_core::{CatalogueRecord, PageAnnotation, PageStatus, ResolvedFetch, StatusWrite, StatusWriter};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpcat-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed copies of the raw stream files a run consumed.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_relative_path(
        &self,
        taken_at: DateTime<Utc>,
        stream_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = taken_at.format("%Y%m%d").to_string();
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "dat",
            ext => ext,
        };
        PathBuf::from(day)
            .join(stream_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write `bytes` under its content hash. Identical content on the same day is stored once.
    pub async fn snapshot_stream(
        &self,
        taken_at: DateTime<Utc>,
        stream_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let span = info_span!("snapshot_stream", stream_id, bytes = bytes.len());
        self.write_snapshot(taken_at, stream_id, extension, bytes)
            .instrument(span)
            .await
    }

    async fn write_snapshot(
        &self,
        taken_at: DateTime<Utc>,
        stream_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(taken_at, stream_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("snapshot path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let stored = |deduplicated| StoredSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            debug!(path = %relative_path.display(), "snapshot already present");
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        write_new_file(&temp_path, bytes).await?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogueError {
    #[error("no catalogue record for page_id {0}")]
    UnknownPage(String),
}

/// Source-of-record row as it lands on the catalogue.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceObservation {
    pub page_id: String,
    pub url: String,
    pub business_status: Option<PageStatus>,
    pub external_id: Option<String>,
    pub category: Option<String>,
    pub vertical: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOutcome {
    pub created: bool,
    pub status_write: Option<StatusWrite>,
}

/// `page_id -> CatalogueRecord`, persisted as one JSON document.
///
/// Mutations take a per-page lock for the whole read-modify-write, so two writers
/// never interleave on the same record while different pages proceed in parallel.
#[derive(Debug)]
pub struct CatalogueStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, CatalogueRecord>>,
    page_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CatalogueStore {
    pub fn in_memory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: RwLock::new(BTreeMap::new()),
            page_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Load the catalogue at `path`, starting empty when the file does not exist yet.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let store = Self::in_memory(path.clone());
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking catalogue {}", path.display()))?
        {
            return Ok(store);
        }
        let raw = fs::read(&path)
            .await
            .with_context(|| format!("reading catalogue {}", path.display()))?;
        let records: BTreeMap<String, CatalogueRecord> = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing catalogue {}", path.display()))?;
        *store.records.write().await = records;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn page_lock(&self, page_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.page_locks.lock().await;
        locks
            .entry(page_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn update<T>(
        &self,
        page_id: &str,
        mutate: impl FnOnce(&mut CatalogueRecord) -> T,
    ) -> Result<T, CatalogueError> {
        let lock = self.page_lock(page_id).await;
        let _held = lock.lock().await;
        let mut record = self
            .records
            .read()
            .await
            .get(page_id)
            .cloned()
            .ok_or_else(|| CatalogueError::UnknownPage(page_id.to_string()))?;
        let out = mutate(&mut record);
        self.records.write().await.insert(page_id.to_string(), record);
        Ok(out)
    }

    /// Create or refresh the record for a source-of-record row.
    pub async fn observe_source_record(
        &self,
        observation: SourceObservation,
        seen_at: DateTime<Utc>,
    ) -> ObserveOutcome {
        let lock = self.page_lock(&observation.page_id).await;
        let _held = lock.lock().await;

        let existing = self.records.read().await.get(&observation.page_id).cloned();
        let created = existing.is_none();
        let mut record = existing.unwrap_or_else(|| {
            CatalogueRecord::observed(observation.page_id.clone(), observation.url.clone(), seen_at)
        });
        record.last_seen = seen_at;
        if observation.external_id.is_some() {
            record.external_id = observation.external_id;
        }
        if observation.category.is_some() {
            record.category = observation.category;
        }
        if observation.vertical.is_some() {
            record.vertical = observation.vertical;
        }
        let status_write = observation
            .business_status
            .map(|status| record.apply_business_status(status, StatusWriter::SourceOfRecordSync));

        self.records
            .write()
            .await
            .insert(observation.page_id, record);
        ObserveOutcome {
            created,
            status_write,
        }
    }

    pub async fn apply_fetch(
        &self,
        page_id: &str,
        fetch: &ResolvedFetch,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), CatalogueError> {
        self.update(page_id, |record| record.apply_fetch(fetch, fetched_at))
            .await
    }

    pub async fn mark_catalogued(
        &self,
        page_id: &str,
        annotation: PageAnnotation,
    ) -> Result<(), CatalogueError> {
        self.update(page_id, |record| record.mark_catalogued(annotation))
            .await
    }

    /// Reset a page so it is fetched and annotated again. `Ok(false)` means it was
    /// already pending.
    pub async fn mark_for_recatalogue(&self, page_id: &str) -> Result<bool, CatalogueError> {
        self.update(page_id, CatalogueRecord::mark_for_recatalogue)
            .await
    }

    pub async fn apply_status(
        &self,
        page_id: &str,
        status: PageStatus,
        writer: StatusWriter,
    ) -> Result<StatusWrite, CatalogueError> {
        self.update(page_id, |record| record.apply_business_status(status, writer))
            .await
    }

    pub async fn get(&self, page_id: &str) -> Option<CatalogueRecord> {
        self.records.read().await.get(page_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records ordered by `page_id`.
    pub async fn snapshot(&self) -> Vec<CatalogueRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Write the catalogue atomically next to its final path.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let bytes = {
            let records = self.records.read().await;
            serde_json::to_vec_pretty(&*records).context("serializing catalogue")?
        };
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating catalogue directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".catalogue.{}.tmp", Uuid::new_v4()));
        write_new_file(&temp_path, &bytes).await?;
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("replacing catalogue {}", self.path.display()));
        }
        Ok(())
    }
}
