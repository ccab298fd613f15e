//! Edit alignment, path sampling and tag-plan utilities for RISE training.

mod aligner;
mod credit;
mod distance;
mod draw;
mod merge;
mod probability;
mod sampler;

pub use aligner::{AlignMove, AlignerConfig, AlignmentMatrix, SequenceAligner};
pub use credit::{
    coerce_boundaries, plan_from_actions, reassign_credit, reference_plan, CreditAdjustment,
};
pub use distance::{edit_distance, mean_edit_distance};
pub use draw::{argmax_index, draw_index, sample_slot_tokens, sample_tags};
pub use merge::{merge_spans, merge_tags};
pub use probability::{normalize_without_null, EditProbabilityMatrix};
pub use sampler::{path_to_actions, ActionSampler, PathSampler, RandomPathSampler, SamplingStats};
