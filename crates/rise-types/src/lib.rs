//! Shared data types for RISE edit-training pipelines.

mod action;

pub use action::{
    apply_actions, fill_plan, implied_output_len, slot_count, strip_boundaries, validate_actions,
    ActionError, ActionSpan, EditAction, EditTag, MergedAction, PlannedEdit, EDIT_CHANNELS,
    NULL_CHANNEL,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Token id produced by the (external) tokenizer.
pub type TokenId = u32;

/// Immutable token sequence shared between the store and round snapshots.
pub type Sequence = Arc<[TokenId]>;

/// Error returned when a sampling strategy name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sampling strategy '{0}'; expected RISE, greedy or multinomial")]
pub struct UnknownStrategyError(pub String);

/// How a sampling round turns model predictions into new cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SamplingStrategy {
    /// Alignment-matrix path sampling.
    #[default]
    #[serde(rename = "RISE")]
    Rise,
    /// Argmax tags and slot tokens.
    #[serde(rename = "greedy")]
    Greedy,
    /// Tags and slot tokens drawn from the predicted distributions.
    #[serde(rename = "multinomial")]
    Multinomial,
}

impl SamplingStrategy {
    /// Returns true when rounds go through the alignment sampler.
    pub fn is_rise(self) -> bool {
        matches!(self, Self::Rise)
    }

    /// Stable name used in artifact file names.
    pub fn name(self) -> &'static str {
        match self {
            Self::Rise => "RISE",
            Self::Greedy => "greedy",
            Self::Multinomial => "multinomial",
        }
    }
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SamplingStrategy {
    type Err = UnknownStrategyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        // Variant suffixes such as "RISE-v2" still select the RISE path.
        if trimmed.starts_with("RISE") {
            return Ok(Self::Rise);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "greedy" => Ok(Self::Greedy),
            "multinomial" | "sample" => Ok(Self::Multinomial),
            _ => Err(UnknownStrategyError(raw.to_string())),
        }
    }
}

/// One committed cache update kept in a sample's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHistoryEntry {
    pub round: u64,
    pub strategy: SamplingStrategy,
    pub edits: MergedAction,
    pub committed_at: DateTime<Utc>,
}

/// Training record owned by the sample store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub index: usize,
    pub input_query: Sequence,
    /// Evolving starting point for the next training round.
    pub current_output_query: Sequence,
    pub output_query: Sequence,
    pub reward: Option<f64>,
    #[serde(default)]
    pub history: Vec<CacheHistoryEntry>,
}

impl Sample {
    /// Creates a sample whose cache starts at the input query.
    pub fn new(index: usize, input_query: Vec<TokenId>, output_query: Vec<TokenId>) -> Self {
        let input_query: Sequence = input_query.into();
        Self {
            index,
            current_output_query: input_query.clone(),
            input_query,
            output_query: output_query.into(),
            reward: None,
            history: Vec::new(),
        }
    }

    /// Captures the immutable view used during one round.
    pub fn snapshot(&self, round: u64) -> SampleSnapshot {
        SampleSnapshot {
            index: self.index,
            round,
            current: self.current_output_query.clone(),
            target: self.output_query.clone(),
            reward: self.reward,
        }
    }
}

/// Read-only per-round view of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSnapshot {
    pub index: usize,
    pub round: u64,
    pub current: Sequence,
    pub target: Sequence,
    pub reward: Option<f64>,
}

impl SampleSnapshot {
    /// Returns `[BOS] + current + [EOS]`.
    pub fn extended_current(&self, bos: TokenId, eos: TokenId) -> Vec<TokenId> {
        extend_with_boundaries(bos, &self.current, eos)
    }
}

/// Surrounds a sequence with boundary markers.
pub fn extend_with_boundaries(bos: TokenId, sequence: &[TokenId], eos: TokenId) -> Vec<TokenId> {
    let mut extended = Vec::with_capacity(sequence.len() + 2);
    extended.push(bos);
    extended.extend_from_slice(sequence);
    extended.push(eos);
    extended
}

/// Candidates sampled for one sample in a RISE round.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitEntry {
    pub candidates: Vec<MergedAction>,
    pub extended_input: Vec<TokenId>,
    pub sample_index: usize,
}

/// Tag plan awaiting slot tokens in a greedy/multinomial round.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    pub plan: Vec<PlannedEdit>,
    pub extended_input: Vec<TokenId>,
    pub sample_index: usize,
}

/// Input handed to the generation model to fill a plan's slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRequest {
    pub sample_index: usize,
    pub extended_input: Vec<TokenId>,
    pub plan: Vec<PlannedEdit>,
}

impl SlotRequest {
    pub fn slot_count(&self) -> usize {
        slot_count(&self.plan)
    }
}

/// New cache value produced for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub edits: MergedAction,
    pub new_query: Vec<TokenId>,
    pub sample_index: usize,
}
