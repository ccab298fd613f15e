//! Scalar telemetry emitted by the fold loop.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One scalar observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub tag: String,
    pub value: f64,
    pub step: u64,
    pub recorded_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn scalar(tag: impl Into<String>, value: f64, step: u64) -> Self {
        Self {
            tag: tag.into(),
            value,
            step,
            recorded_at: Utc::now(),
        }
    }
}

/// Destination for scalar telemetry.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent) -> Result<()>;

    /// Pushes buffered events to durable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Flushes buffered output; further records are still accepted.
    fn close(&self) -> Result<()> {
        self.flush()
    }
}

/// Appends one JSON object per event to a file.
#[derive(Debug, Clone)]
pub struct JsonlTelemetryWriter {
    path: PathBuf,
    file: Arc<Mutex<std::io::BufWriter<std::fs::File>>>,
}

impl JsonlTelemetryWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create telemetry directory {}", parent.display())
                })?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open telemetry log {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(std::io::BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlTelemetryWriter {
    fn record(&self, event: TelemetryEvent) -> Result<()> {
        let line = serde_json::to_string(&event).context("failed to encode telemetry event")?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("telemetry file lock is poisoned"))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to write telemetry log {}", self.path.display()))
    }

    fn flush(&self) -> Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("telemetry file lock is poisoned"))?;
        file.flush()
            .with_context(|| format!("failed to flush telemetry log {}", self.path.display()))
    }
}

/// Keeps events in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTelemetry {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
    closed: Arc<Mutex<bool>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Values recorded under `tag`, in order.
    pub fn values(&self, tag: &str) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter(|event| event.tag == tag)
            .map(|event| event.value)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|closed| *closed).unwrap_or(false)
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn record(&self, event: TelemetryEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("telemetry buffer lock is poisoned"))?
            .push(event);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self
            .closed
            .lock()
            .map_err(|_| anyhow!("telemetry buffer lock is poisoned"))? = true;
        Ok(())
    }
}
