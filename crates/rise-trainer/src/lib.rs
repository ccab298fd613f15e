//! Alternating train/sample orchestration for RISE edit models.

pub mod checkpoint_store;
pub mod config;
pub mod coordinator;
pub mod fixtures;
pub mod generation;
pub mod model;
pub mod scheduler;
pub mod telemetry;

pub use checkpoint_store::{
    checkpoint_path, load_fold_checkpoint, save_fold_checkpoint, CheckpointError, FoldCheckpoint,
    CURRENT_CHECKPOINT_VERSION,
};
pub use config::{wrapping_window, FoldPlan, RlTrainerConfig};
pub use coordinator::CacheCoordinator;
pub use generation::{EditGenerator, GenerationRecord};
pub use model::{
    EditModel, GeneratedSequence, GenerationQuery, LossAccumulator, StepLosses, TrainBatch,
};
pub use scheduler::{FoldReport, FoldScheduler, RunSummary, SamplingReport};
pub use telemetry::{InMemoryTelemetry, JsonlTelemetryWriter, TelemetryEvent, TelemetrySink};
