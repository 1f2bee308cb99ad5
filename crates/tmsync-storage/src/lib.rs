//! Snapshot loading + immutable run artifact storage for tmsync.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tmsync_core::{MappingEntry, MilestoneRecord, TaskRecord};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tmsync-storage";

/// Mapping list as handed over by the mapping source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingFile {
    pub mappings: Vec<MappingEntry>,
    /// Entities the mapping source could not resolve; passed through to reports.
    #[serde(default)]
    pub invalid_entities: Vec<InvalidEntity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidEntity {
    pub entity_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemASnapshot {
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemBSnapshot {
    pub milestones: Vec<MilestoneRecord>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub async fn load_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, StorageError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).await.map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| StorageError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub async fn load_mapping_file(path: impl AsRef<Path>) -> Result<MappingFile, StorageError> {
    load_json_file(path).await
}

pub async fn load_system_a_snapshot(path: impl AsRef<Path>) -> Result<SystemASnapshot, StorageError> {
    load_json_file(path).await
}

pub async fn load_system_b_snapshot(path: impl AsRef<Path>) -> Result<SystemBSnapshot, StorageError> {
    load_json_file(path).await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Per-run output directory store; every file is written to a temp file, then linked into place.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_relative_dir(started_at: DateTime<Utc>, run_id: Uuid) -> PathBuf {
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(format!("{stamp}_{run_id}"))
    }

    pub fn run_dir(&self, started_at: DateTime<Utc>, run_id: Uuid) -> PathBuf {
        self.root.join(Self::run_relative_dir(started_at, run_id))
    }

    /// Atomically write `bytes` as `<run_dir>/<name>`. Fails if the name already exists, even when
    /// another writer creates it concurrently.
    pub async fn store_bytes(
        &self,
        started_at: DateTime<Utc>,
        run_id: Uuid,
        name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredFile> {
        let span = info_span!("store_run_file", %run_id, name);
        let _guard = span.enter();

        let run_dir = self.run_dir(started_at, run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating run directory {}", run_dir.display()))?;

        let relative_path = Self::run_relative_dir(started_at, run_id).join(name);
        let absolute_path = self.root.join(&relative_path);
        let content_hash = Self::sha256_hex(bytes);

        let temp_path = run_dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        // hard_link refuses an existing target atomically, unlike rename.
        let linked = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                anyhow::bail!("run file {} already exists", absolute_path.display());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "atomically linking {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                });
            }
        }

        debug!(bytes = bytes.len(), hash = %content_hash, "stored run file");
        Ok(StoredFile {
            name: name.to_string(),
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    pub async fn store_json<T: Serialize>(
        &self,
        started_at: DateTime<Utc>,
        run_id: Uuid,
        name: &str,
        value: &T,
    ) -> anyhow::Result<StoredFile> {
        let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
        self.store_bytes(started_at, run_id, name, &bytes).await
    }
}
