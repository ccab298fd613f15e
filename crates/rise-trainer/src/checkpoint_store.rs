//! Per-epoch model checkpoints for fold-loop resume.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::instrument;

/// Current checkpoint schema version.
pub const CURRENT_CHECKPOINT_VERSION: u32 = 1;

/// Errors raised while persisting or loading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {0} does not exist")]
    Absent(PathBuf),
    #[error(
        "unsupported checkpoint_version {found}; expected {expected}",
        expected = CURRENT_CHECKPOINT_VERSION
    )]
    UnsupportedVersion { found: u64 },
    #[error("missing required checkpoint field `{0}`")]
    MissingField(&'static str),
    #[error("invalid checkpoint field `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Model and loop state written at the end of every epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldCheckpoint {
    pub checkpoint_version: u32,
    pub run_id: String,
    pub epoch: u64,
    pub fold: u64,
    pub lamb: f64,
    pub optimizer_steps: u64,
    pub model_state: Value,
    pub saved_at_unix_seconds: u64,
}

impl FoldCheckpoint {
    pub fn new(
        run_id: impl Into<String>,
        epoch: u64,
        fold: u64,
        lamb: f64,
        optimizer_steps: u64,
        model_state: Value,
    ) -> Self {
        Self {
            checkpoint_version: CURRENT_CHECKPOINT_VERSION,
            run_id: run_id.into(),
            epoch,
            fold,
            lamb,
            optimizer_steps,
            model_state,
            saved_at_unix_seconds: u64::try_from(Utc::now().timestamp()).unwrap_or(0),
        }
    }
}

/// `{dir}/{run_id}-epoch-{epoch}.json`
pub fn checkpoint_path(dir: &Path, run_id: &str, epoch: u64) -> PathBuf {
    dir.join(format!("{run_id}-epoch-{epoch}.json"))
}

/// Saves a checkpoint through a temp file and rename.
#[instrument(skip(checkpoint), fields(path = %path.display(), epoch = checkpoint.epoch))]
pub fn save_fold_checkpoint(path: &Path, checkpoint: &FoldCheckpoint) -> Result<(), CheckpointError> {
    validate_checkpoint(checkpoint)?;
    let bytes = serde_json::to_vec_pretty(&checkpoint_to_value(checkpoint))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = temporary_checkpoint_path(path);
    std::fs::write(&temp_path, bytes)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Loads a checkpoint; a missing file is [`CheckpointError::Absent`].
#[instrument(fields(path = %path.display()))]
pub fn load_fold_checkpoint(path: &Path) -> Result<FoldCheckpoint, CheckpointError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(CheckpointError::Absent(path.to_path_buf()));
        }
        Err(error) => return Err(error.into()),
    };
    let value: Value = serde_json::from_str(&raw)?;
    let checkpoint = checkpoint_from_value(&value)?;
    validate_checkpoint(&checkpoint)?;
    Ok(checkpoint)
}

fn checkpoint_to_value(checkpoint: &FoldCheckpoint) -> Value {
    json!({
        "checkpoint_version": checkpoint.checkpoint_version,
        "run_id": checkpoint.run_id,
        "epoch": checkpoint.epoch,
        "fold": checkpoint.fold,
        "lamb": checkpoint.lamb,
        "optimizer_steps": checkpoint.optimizer_steps,
        "model_state": checkpoint.model_state,
        "saved_at_unix_seconds": checkpoint.saved_at_unix_seconds
    })
}

fn checkpoint_from_value(value: &Value) -> Result<FoldCheckpoint, CheckpointError> {
    let object = value.as_object().ok_or(CheckpointError::InvalidField {
        field: "<root>",
        reason: "checkpoint payload must be a JSON object",
    })?;

    let checkpoint_version = required_u64(object, "checkpoint_version")?;
    if checkpoint_version != u64::from(CURRENT_CHECKPOINT_VERSION) {
        return Err(CheckpointError::UnsupportedVersion {
            found: checkpoint_version,
        });
    }

    Ok(FoldCheckpoint {
        checkpoint_version: CURRENT_CHECKPOINT_VERSION,
        run_id: required_string(object, "run_id")?,
        epoch: required_u64(object, "epoch")?,
        fold: required_u64(object, "fold")?,
        lamb: object
            .get("lamb")
            .and_then(Value::as_f64)
            .ok_or(CheckpointError::MissingField("lamb"))?,
        optimizer_steps: required_u64(object, "optimizer_steps")?,
        model_state: object
            .get("model_state")
            .cloned()
            .ok_or(CheckpointError::MissingField("model_state"))?,
        saved_at_unix_seconds: required_u64(object, "saved_at_unix_seconds")?,
    })
}

fn required_string(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<String, CheckpointError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(CheckpointError::MissingField(field))
}

fn required_u64(object: &Map<String, Value>, field: &'static str) -> Result<u64, CheckpointError> {
    object
        .get(field)
        .and_then(Value::as_u64)
        .ok_or(CheckpointError::MissingField(field))
}

fn temporary_checkpoint_path(path: &Path) -> PathBuf {
    let mut temp_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "checkpoint".to_string());
    temp_name.push_str(".tmp");
    path.with_file_name(format!("{temp_name}.{}", std::process::id()))
}

fn validate_checkpoint(checkpoint: &FoldCheckpoint) -> Result<(), CheckpointError> {
    if checkpoint.checkpoint_version != CURRENT_CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            found: u64::from(checkpoint.checkpoint_version),
        });
    }
    if checkpoint.run_id.trim().is_empty() {
        return Err(CheckpointError::InvalidField {
            field: "run_id",
            reason: "must not be empty",
        });
    }
    if !checkpoint.lamb.is_finite() {
        return Err(CheckpointError::InvalidField {
            field: "lamb",
            reason: "must be finite",
        });
    }
    Ok(())
}
