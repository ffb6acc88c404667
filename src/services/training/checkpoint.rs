// Checkpoint Store
// Versioned, immutable model checkpoints in a user-scoped directory.
// Writes go to a temp file that is synced and then renamed into place, so a
// reader only ever sees complete checkpoints.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::services::classifier::{BackendFactory, LoadedModel};

const FILE_PREFIX: &str = "checkpoint-";
const FILE_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".json.tmp";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("Checkpoint version {0} already exists")]
    Exists(u64),
    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Training examples the model was updated with in the producing cycle
    pub example_count: usize,
    /// Correction log length when the producing cycle started
    pub corrections_consumed: usize,
    pub feature_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub artifact: serde_json::Value,
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    meta: &'a CheckpointMeta,
    artifact: &'a serde_json::Value,
}

/// A fully written temp file awaiting its rename into place.
/// Dropping it without `commit` leaves the temp file behind, exactly like a
/// crash between writing and renaming.
#[must_use = "a staged checkpoint is invisible until committed"]
pub struct StagedCheckpoint {
    version: u64,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl StagedCheckpoint {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Atomically publish the checkpoint. On failure the temp file is removed.
    pub fn commit(self) -> Result<u64, CheckpointError> {
        if self.final_path.exists() {
            let version = self.version;
            self.abandon()?;
            return Err(CheckpointError::Exists(version));
        }
        if let Err(e) = fs::rename(&self.temp_path, &self.final_path) {
            let _ = fs::remove_file(&self.temp_path);
            return Err(e.into());
        }
        if let Some(dir) = self.final_path.parent() {
            // Persist the rename itself; not every platform can open a directory.
            if let Ok(handle) = File::open(dir) {
                let _ = handle.sync_all();
            }
        }
        info!(version = self.version, "[checkpoint] committed");
        Ok(self.version)
    }

    /// Remove the temp file without publishing
    pub fn abandon(self) -> Result<(), CheckpointError> {
        fs::remove_file(&self.temp_path)?;
        debug!(version = self.version, "[checkpoint] abandoned staged write");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}{:06}{}", FILE_PREFIX, version, FILE_SUFFIX))
    }

    fn temp_path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}{:06}{}", FILE_PREFIX, version, TEMP_SUFFIX))
    }

    fn entries(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        Ok(fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect())
    }

    /// Versions of committed checkpoint files, ascending
    pub fn list_versions(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut versions: Vec<u64> = self
            .entries()?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .filter_map(|name| {
                name.strip_prefix(FILE_PREFIX)
                    .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                    .and_then(|v| v.parse::<u64>().ok())
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Next version number to write; never reuses a committed one
    pub fn next_version(&self) -> Result<u64, CheckpointError> {
        Ok(self.list_versions()?.last().map_or(1, |v| v + 1))
    }

    pub fn load(&self, version: u64) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(version);
        let corrupt = |reason: String| CheckpointError::Corrupt {
            path: path.display().to_string(),
            reason,
        };

        let content = fs::read_to_string(&path)?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
        if checkpoint.meta.version != version {
            return Err(corrupt(format!(
                "metadata says version {}",
                checkpoint.meta.version
            )));
        }
        Ok(checkpoint)
    }

    /// Newest checkpoint that deserializes; unreadable ones are skipped
    pub fn load_latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        for version in self.list_versions()?.into_iter().rev() {
            match self.load(version) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!("[checkpoint] skipping version {}: {}", version, e),
            }
        }
        Ok(None)
    }

    /// Newest checkpoint the factory can restore a backend from
    pub fn load_model(&self, factory: &dyn BackendFactory) -> Option<LoadedModel> {
        let versions = match self.list_versions() {
            Ok(v) => v,
            Err(e) => {
                warn!("[checkpoint] cannot list {}: {}", self.dir.display(), e);
                return None;
            }
        };

        for version in versions.into_iter().rev() {
            let restored = self
                .load(version)
                .map_err(|e| e.to_string())
                .and_then(|cp| factory.restore(&cp.artifact).map_err(|e| e.to_string()));
            match restored {
                Ok(backend) => {
                    info!(version, "[checkpoint] restored model");
                    return Some(LoadedModel { version, backend });
                }
                Err(reason) => warn!("[checkpoint] skipping version {}: {}", version, reason),
            }
        }
        None
    }

    /// Write a checkpoint to its temp file and sync it; not yet visible
    pub fn stage(
        &self,
        meta: &CheckpointMeta,
        artifact: &serde_json::Value,
    ) -> Result<StagedCheckpoint, CheckpointError> {
        let temp_path = self.temp_path_for(meta.version);
        let final_path = self.path_for(meta.version);
        if final_path.exists() {
            return Err(CheckpointError::Exists(meta.version));
        }

        let payload = serde_json::to_vec(&CheckpointRef { meta, artifact })?;
        let written = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .and_then(|mut file| {
                file.write_all(&payload)?;
                file.sync_all()
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            warn!(version = meta.version, "[checkpoint] staging failed: {}", e);
            return Err(e.into());
        }

        debug!(version = meta.version, "[checkpoint] staged {}", temp_path.display());
        Ok(StagedCheckpoint {
            version: meta.version,
            temp_path,
            final_path,
        })
    }

    /// Temp files left by interrupted writes
    pub fn incomplete(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(TEMP_SUFFIX))
            })
            .collect())
    }

    /// Delete interrupted writes; returns how many were removed
    pub fn discard_incomplete(&self) -> Result<usize, CheckpointError> {
        let stale = self.incomplete()?;
        for path in &stale {
            fs::remove_file(path)?;
            info!("[checkpoint] discarded incomplete {}", path.display());
        }
        Ok(stale.len())
    }

    /// Remove every checkpoint, complete or not
    pub fn purge(&self) -> Result<usize, CheckpointError> {
        let mut removed = self.discard_incomplete()?;
        for version in self.list_versions()? {
            fs::remove_file(self.path_for(version))?;
            removed += 1;
        }
        info!(removed, "[checkpoint] purged {}", self.dir.display());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::classifier::{LinearFactory, ModelBackend};
    use tempfile::TempDir;

    fn meta(version: u64) -> CheckpointMeta {
        CheckpointMeta {
            version,
            created_at: Utc::now(),
            example_count: 3,
            corrections_consumed: 3,
            feature_dim: 64,
        }
    }

    fn artifact() -> serde_json::Value {
        LinearFactory::new(64, 0.5).fresh().export().unwrap()
    }

    #[test]
    fn test_commit_makes_checkpoint_visible() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        assert_eq!(store.next_version().unwrap(), 1);

        let staged = store.stage(&meta(1), &artifact()).unwrap();
        assert!(store.list_versions().unwrap().is_empty());
        assert_eq!(store.incomplete().unwrap().len(), 1);

        staged.commit().unwrap();
        assert_eq!(store.list_versions().unwrap(), vec![1]);
        assert!(store.incomplete().unwrap().is_empty());
        assert_eq!(store.next_version().unwrap(), 2);
        assert_eq!(store.load_latest().unwrap().unwrap().meta.version, 1);
    }

    #[test]
    fn test_uncommitted_stage_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.stage(&meta(1), &artifact()).unwrap().commit().unwrap();

        let staged = store.stage(&meta(2), &artifact()).unwrap();
        drop(staged);

        assert_eq!(store.load_latest().unwrap().unwrap().meta.version, 1);
        assert_eq!(store.discard_incomplete().unwrap(), 1);
        assert_eq!(store.list_versions().unwrap(), vec![1]);
    }

    #[test]
    fn test_corrupt_checkpoint_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.stage(&meta(1), &artifact()).unwrap().commit().unwrap();
        fs::write(store.path_for(2), b"{ truncated").unwrap();

        assert!(matches!(store.load(2), Err(CheckpointError::Corrupt { .. })));
        assert_eq!(store.load_latest().unwrap().unwrap().meta.version, 1);

        let loaded = store.load_model(&LinearFactory::new(64, 0.5)).unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_incompatible_artifact_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.stage(&meta(1), &artifact()).unwrap().commit().unwrap();

        // Restorable only by a 64-dimension factory
        assert!(store.load_model(&LinearFactory::new(128, 0.5)).is_none());
    }

    #[test]
    fn test_versions_are_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.stage(&meta(1), &artifact()).unwrap().commit().unwrap();
        assert!(matches!(
            store.stage(&meta(1), &artifact()),
            Err(CheckpointError::Exists(1))
        ));
    }

    #[test]
    fn test_failed_commit_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let staged = store.stage(&meta(1), &artifact()).unwrap();
        let temp_path = staged.temp_path().to_path_buf();

        // Another writer publishes version 1 first.
        fs::write(store.path_for(1), b"{}").unwrap();

        assert!(matches!(staged.commit(), Err(CheckpointError::Exists(1))));
        assert!(!temp_path.exists());
        assert!(store.incomplete().unwrap().is_empty());
    }

    #[test]
    fn test_purge() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.stage(&meta(1), &artifact()).unwrap().commit().unwrap();
        let _pending = store.stage(&meta(2), &artifact()).unwrap();

        assert_eq!(store.purge().unwrap(), 2);
        assert!(store.list_versions().unwrap().is_empty());
        assert!(store.load_latest().unwrap().is_none());
    }
}
