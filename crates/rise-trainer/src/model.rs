//! Contract between the fold loop and the neural edit model.

use anyhow::Result;
use async_trait::async_trait;
use rise_types::{EditTag, SampleSnapshot, SlotRequest, TokenId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One training batch handed to [`EditModel::forward`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainBatch {
    pub snapshots: Vec<SampleSnapshot>,
    /// Mixing weight between imitation and RL terms; grows with epochs.
    pub lamb: f64,
    pub compute_stopping_score: bool,
}

/// Per-batch losses reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StepLosses {
    pub gen_loss: f64,
    pub edit_loss: f64,
    pub score_loss: Option<f64>,
    pub reward: f64,
}

impl StepLosses {
    /// Sum of the terms that drive the gradient.
    pub fn total(&self) -> f64 {
        self.gen_loss + self.edit_loss + self.score_loss.unwrap_or(0.0)
    }
}

/// Running mean of [`StepLosses`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossAccumulator {
    sum: StepLosses,
    score_batches: usize,
    batches: usize,
}

impl LossAccumulator {
    pub fn push(&mut self, losses: &StepLosses) {
        self.sum.gen_loss += losses.gen_loss;
        self.sum.edit_loss += losses.edit_loss;
        self.sum.reward += losses.reward;
        if let Some(score_loss) = losses.score_loss {
            self.sum.score_loss = Some(self.sum.score_loss.unwrap_or(0.0) + score_loss);
            self.score_batches += 1;
        }
        self.batches += 1;
    }

    pub fn merge(&mut self, other: &LossAccumulator) {
        self.sum.gen_loss += other.sum.gen_loss;
        self.sum.edit_loss += other.sum.edit_loss;
        self.sum.reward += other.sum.reward;
        if let Some(score_loss) = other.sum.score_loss {
            self.sum.score_loss = Some(self.sum.score_loss.unwrap_or(0.0) + score_loss);
        }
        self.score_batches += other.score_batches;
        self.batches += other.batches;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Mean losses, or `None` before the first batch.
    pub fn mean(&self) -> Option<StepLosses> {
        if self.batches == 0 {
            return None;
        }
        let count = self.batches as f64;
        Some(StepLosses {
            gen_loss: self.sum.gen_loss / count,
            edit_loss: self.sum.edit_loss / count,
            score_loss: self
                .sum
                .score_loss
                .map(|total| total / self.score_batches.max(1) as f64),
            reward: self.sum.reward / count,
        })
    }
}

/// Query fed to one generation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationQuery {
    pub sample_index: usize,
    pub input_query: Vec<TokenId>,
}

/// Model output for one generation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSequence {
    pub sample_index: usize,
    pub input_query: Vec<TokenId>,
    pub gen_query: Vec<TokenId>,
    /// Predicted tag per extended-input position.
    pub edit_tags: Vec<EditTag>,
    pub stopping_score: Option<f64>,
}

/// Neural model driven by the fold scheduler.
///
/// Row blocks returned by the predict calls may carry padding rows past the
/// positions a caller needs.
#[async_trait]
pub trait EditModel: Send + Sync {
    /// Edit-tag distributions, one row block per snapshot; each row has
    /// [`rise_types::EDIT_CHANNELS`] entries.
    async fn edit_predict(&self, snapshots: &[SampleSnapshot]) -> Result<Vec<Vec<Vec<f64>>>>;

    /// Token distributions for every slot of every request; channel 0 is
    /// padding.
    async fn slot_predict(&self, requests: &[SlotRequest]) -> Result<Vec<Vec<Vec<f64>>>>;

    async fn forward(&mut self, batch: &TrainBatch) -> Result<StepLosses>;

    /// Accumulates gradients for an already scaled loss.
    async fn backward(&mut self, scaled_loss: f64) -> Result<()>;

    /// Clips, steps and zeroes accumulated gradients.
    async fn optimizer_step(&mut self) -> Result<()>;

    /// Makes every parameter trainable and resets the optimizer.
    async fn unfreeze(&mut self, learning_rate: f64) -> Result<()>;

    async fn export_state(&self) -> Result<Value>;
    async fn restore_state(&mut self, state: &Value) -> Result<()>;

    async fn generate(&self, queries: &[GenerationQuery]) -> Result<Vec<GeneratedSequence>>;
}

#[cfg(test)]
mod tests {
    use super::{LossAccumulator, StepLosses};

    #[test]
    fn accumulator_means_only_observed_score_losses() {
        let mut accumulator = LossAccumulator::default();
        assert_eq!(accumulator.mean(), None);
        accumulator.push(&StepLosses {
            gen_loss: 1.0,
            edit_loss: 2.0,
            score_loss: Some(0.5),
            reward: 1.0,
        });
        accumulator.push(&StepLosses {
            gen_loss: 3.0,
            edit_loss: 4.0,
            score_loss: None,
            reward: 0.0,
        });

        let mean = accumulator.mean().expect("mean");
        assert_eq!(mean.gen_loss, 2.0);
        assert_eq!(mean.edit_loss, 3.0);
        assert_eq!(mean.score_loss, Some(0.5));
        assert_eq!(mean.reward, 0.5);
        assert_eq!(accumulator.batches(), 2);

        let mut epoch = LossAccumulator::default();
        epoch.merge(&accumulator);
        epoch.merge(&accumulator);
        assert_eq!(epoch.batches(), 4);
        assert_eq!(epoch.mean(), accumulator.mean());
    }

    #[test]
    fn total_includes_optional_score_loss() {
        let losses = StepLosses {
            gen_loss: 1.0,
            edit_loss: 0.5,
            score_loss: Some(0.25),
            reward: 3.0,
        };
        assert_eq!(losses.total(), 1.75);
        assert_eq!(StepLosses { score_loss: None, ..losses }.total(), 1.5);
    }
}
