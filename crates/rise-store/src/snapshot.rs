//! On-disk cache snapshots written after each sampled epoch.

use crate::{SampleStoreError, StoreResult};
use chrono::{DateTime, Utc};
use rise_types::{Sample, SamplingStrategy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Current cache snapshot schema version.
pub const CURRENT_SNAPSHOT_VERSION: u32 = 1;

/// Full cache state: every sample with its current query and history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub snapshot_version: u32,
    pub round: u64,
    pub samples: Vec<Sample>,
    pub saved_at: DateTime<Utc>,
}

impl CacheSnapshot {
    pub fn new(round: u64, samples: Vec<Sample>) -> Self {
        Self {
            snapshot_version: CURRENT_SNAPSHOT_VERSION,
            round,
            samples,
            saved_at: Utc::now(),
        }
    }
}

/// `{dir}/cache_iter_{epoch}.{strategy}.json`
pub fn cache_snapshot_path(dir: &Path, epoch: u64, strategy: SamplingStrategy) -> PathBuf {
    dir.join(format!("cache_iter_{epoch}.{}.json", strategy.name()))
}

/// Writes a snapshot through a temp file and rename.
#[instrument(skip(snapshot), fields(path = %path.display(), round = snapshot.round))]
pub fn save_cache_snapshot(path: &Path, snapshot: &CacheSnapshot) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = temporary_snapshot_path(path);
    std::fs::write(&temp_path, bytes)?;
    std::fs::rename(&temp_path, path)?;
    tracing::info!(samples = snapshot.samples.len(), "saved cache snapshot");
    Ok(())
}

/// Loads a snapshot; a missing file is [`SampleStoreError::SnapshotAbsent`].
#[instrument(fields(path = %path.display()))]
pub fn load_cache_snapshot(path: &Path) -> StoreResult<CacheSnapshot> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(SampleStoreError::SnapshotAbsent(path.to_path_buf()));
        }
        Err(error) => return Err(error.into()),
    };
    let snapshot: CacheSnapshot = serde_json::from_str(&raw)?;
    if snapshot.snapshot_version != CURRENT_SNAPSHOT_VERSION {
        return Err(SampleStoreError::UnsupportedSnapshotVersion(
            snapshot.snapshot_version,
        ));
    }
    Ok(snapshot)
}

fn temporary_snapshot_path(path: &Path) -> PathBuf {
    let mut temp_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "cache".to_string());
    temp_name.push_str(".tmp");
    path.with_file_name(format!("{temp_name}.{}", std::process::id()))
}
