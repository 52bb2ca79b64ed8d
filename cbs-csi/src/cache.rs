//! Persisted attachment cache.
//!
//! The controller remembers which instance each disk was attached to so a
//! restarted driver can answer repeated publish calls without a cloud round
//! trip.  Records live one per file:
//!
//! ```text
//! <cache_dir>/
//!   <volume-id>.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CacheError;

const RECORD_SUFFIX: &str = ".json";

/// Extension metadata recorded for one attached disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub volume_id: String,
    pub instance_id: String,
    pub attached_at: DateTime<Utc>,
}

impl AttachmentRecord {
    pub fn new(volume_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            instance_id: instance_id.into(),
            attached_at: Utc::now(),
        }
    }
}

/// Durable storage for [`AttachmentRecord`]s.
#[async_trait]
pub trait CachePersister: Send + Sync {
    /// Every stored record.  A store that was never written is empty.
    async fn load_all(&self) -> Result<Vec<AttachmentRecord>, CacheError>;

    async fn persist(&self, record: &AttachmentRecord) -> Result<(), CacheError>;

    /// Forget the record for `volume_id`.  Missing records are not an error.
    async fn remove(&self, volume_id: &str) -> Result<(), CacheError>;
}

/// Directory-backed persister.
#[derive(Debug, Clone)]
pub struct FileCachePersister {
    dir: PathBuf,
}

impl FileCachePersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `volume_id`.  Ids that could name anything
    /// outside the cache directory are refused.
    fn record_path(&self, volume_id: &str) -> Result<PathBuf, CacheError> {
        let unsafe_id = volume_id.is_empty()
            || volume_id.starts_with("..")
            || volume_id.contains(['/', '\\', '\0']);
        if unsafe_id {
            return Err(CacheError::InvalidVolumeId(volume_id.to_owned()));
        }
        Ok(self.dir.join(format!("{volume_id}{RECORD_SUFFIX}")))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
        move |source| CacheError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

#[async_trait]
impl CachePersister for FileCachePersister {
    async fn load_all(&self) -> Result<Vec<AttachmentRecord>, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "cache dir absent, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(Self::io_err(&self.dir))? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Skips half-written `.tmp` files as well.
            if !name.ends_with(RECORD_SUFFIX) {
                continue;
            }

            let raw = tokio::fs::read(&path).await.map_err(Self::io_err(&path))?;
            let record: AttachmentRecord =
                serde_json::from_slice(&raw).map_err(|source| CacheError::Decode {
                    path: path.clone(),
                    source,
                })?;
            records.push(record);
        }

        info!(dir = %self.dir.display(), count = records.len(), "attachment cache loaded");
        Ok(records)
    }

    async fn persist(&self, record: &AttachmentRecord) -> Result<(), CacheError> {
        let path = self.record_path(&record.volume_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(Self::io_err(&self.dir))?;

        let json = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, json)
            .await
            .map_err(Self::io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(Self::io_err(&path))?;
        debug!(volume_id = %record.volume_id, "attachment record persisted");
        Ok(())
    }

    async fn remove(&self, volume_id: &str) -> Result<(), CacheError> {
        let path = self.record_path(volume_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }
}
