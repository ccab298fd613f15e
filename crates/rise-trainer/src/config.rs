//! Trainer configuration and the fold arithmetic derived from it.

use anyhow::{bail, Context, Result};
use rise_align::AlignerConfig;
use rise_types::{SamplingStrategy, TokenId};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Configuration for the alternating train/sample loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RlTrainerConfig {
    /// Candidate action lists drawn per sample in a RISE round (`L`).
    pub candidates_per_pair: usize,
    /// Training folds per epoch.
    pub train_fold: u64,
    /// Sampling folds per epoch; sets the width of each sampling pass.
    pub sample_fold: u64,
    /// Epoch after which sampling passes start.
    pub rl_begin_epoch: u64,
    pub rl_epoch: u64,
    /// Epoch to resume from; 0 starts fresh.
    pub load_epoch: u64,
    /// Epoch at which all parameters become trainable; 0 unfreezes at start.
    pub tune_epoch: u64,
    pub tune_lr: f64,
    pub batch_size: usize,
    /// Prediction batches during sampling are this many training batches.
    pub sample_batch_multiplier: usize,
    pub accumulation_steps: usize,
    pub sampling_strategy: SamplingStrategy,
    pub seed: u64,
    pub use_stopping_score: bool,
    /// Generated queries scoring at or below this keep the previous query.
    pub stopping_threshold: f64,
    pub max_gen_times: usize,
    pub bos_token_id: TokenId,
    pub eos_token_id: TokenId,
    pub run_id: String,
    pub checkpoint_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub lamb_initial: f64,
    pub aligner: AlignerConfig,
}

impl Default for RlTrainerConfig {
    fn default() -> Self {
        Self {
            candidates_per_pair: 1,
            train_fold: 4,
            sample_fold: 4,
            rl_begin_epoch: 1,
            rl_epoch: 10,
            load_epoch: 0,
            tune_epoch: 0,
            tune_lr: 1e-5,
            batch_size: 16,
            sample_batch_multiplier: 4,
            accumulation_steps: 1,
            sampling_strategy: SamplingStrategy::Rise,
            seed: 0,
            use_stopping_score: false,
            stopping_threshold: 0.5,
            max_gen_times: 5,
            bos_token_id: 101,
            eos_token_id: 102,
            run_id: "rise".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            cache_dir: PathBuf::from("cache"),
            lamb_initial: 0.1,
            aligner: AlignerConfig::default(),
        }
    }
}

impl RlTrainerConfig {
    /// Parses `RlTrainerConfig` from a JSON object; absent fields keep their
    /// defaults.
    #[tracing::instrument(level = "debug", skip(value))]
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .context("trainer config JSON payload must be an object")?;
        let mut config = Self::default();

        if let Some(raw) = optional_usize(object, "candidates_per_pair")? {
            config.candidates_per_pair = raw;
        }
        if let Some(raw) = optional_u64(object, "train_fold")? {
            config.train_fold = raw;
        }
        if let Some(raw) = optional_u64(object, "sample_fold")? {
            config.sample_fold = raw;
        }
        if let Some(raw) = optional_u64(object, "rl_begin_epoch")? {
            config.rl_begin_epoch = raw;
        }
        if let Some(raw) = optional_u64(object, "rl_epoch")? {
            config.rl_epoch = raw;
        }
        if let Some(raw) = optional_u64(object, "load_epoch")? {
            config.load_epoch = raw;
        }
        if let Some(raw) = optional_u64(object, "tune_epoch")? {
            config.tune_epoch = raw;
        }
        if let Some(raw) = optional_f64(object, "tune_lr")? {
            config.tune_lr = raw;
        }
        if let Some(raw) = optional_usize(object, "batch_size")? {
            config.batch_size = raw;
        }
        if let Some(raw) = optional_usize(object, "sample_batch_multiplier")? {
            config.sample_batch_multiplier = raw;
        }
        if let Some(raw) = optional_usize(object, "accumulation_steps")? {
            config.accumulation_steps = raw;
        }
        if let Some(raw) = object.get("sampling_strategy") {
            config.sampling_strategy = raw
                .as_str()
                .context("trainer config field 'sampling_strategy' must be a string")?
                .parse()?;
        }
        if let Some(raw) = optional_u64(object, "seed")? {
            config.seed = raw;
        }
        if let Some(raw) = object.get("use_stopping_score") {
            config.use_stopping_score = raw
                .as_bool()
                .context("trainer config field 'use_stopping_score' must be boolean")?;
        }
        if let Some(raw) = optional_f64(object, "stopping_threshold")? {
            config.stopping_threshold = raw;
        }
        if let Some(raw) = optional_usize(object, "max_gen_times")? {
            config.max_gen_times = raw;
        }
        if let Some(raw) = optional_u64(object, "bos_token_id")? {
            config.bos_token_id = TokenId::try_from(raw)
                .context("trainer config field 'bos_token_id' is out of range")?;
        }
        if let Some(raw) = optional_u64(object, "eos_token_id")? {
            config.eos_token_id = TokenId::try_from(raw)
                .context("trainer config field 'eos_token_id' is out of range")?;
        }
        if let Some(raw) = optional_string(object, "run_id")? {
            config.run_id = raw;
        }
        if let Some(raw) = optional_string(object, "checkpoint_dir")? {
            config.checkpoint_dir = PathBuf::from(raw);
        }
        if let Some(raw) = optional_string(object, "cache_dir")? {
            config.cache_dir = PathBuf::from(raw);
        }
        if let Some(raw) = optional_f64(object, "lamb_initial")? {
            config.lamb_initial = raw;
        }
        if let Some(raw) = object.get("aligner") {
            config.aligner = AlignerConfig::from_json(raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidates_per_pair == 0 {
            bail!("trainer config field 'candidates_per_pair' must be >= 1");
        }
        if self.train_fold == 0 || self.sample_fold == 0 {
            bail!("trainer config fields 'train_fold' and 'sample_fold' must be >= 1");
        }
        if self.rl_epoch == 0 {
            bail!("trainer config field 'rl_epoch' must be >= 1");
        }
        if self.load_epoch > self.rl_epoch {
            bail!(
                "trainer config field 'load_epoch' ({}) exceeds 'rl_epoch' ({})",
                self.load_epoch,
                self.rl_epoch
            );
        }
        if self.batch_size == 0 || self.sample_batch_multiplier == 0 {
            bail!("trainer config fields 'batch_size' and 'sample_batch_multiplier' must be >= 1");
        }
        if self.accumulation_steps == 0 {
            bail!("trainer config field 'accumulation_steps' must be >= 1");
        }
        if !self.tune_lr.is_finite() || self.tune_lr <= 0.0 {
            bail!("trainer config field 'tune_lr' must be finite and > 0.0");
        }
        if !self.stopping_threshold.is_finite() {
            bail!("trainer config field 'stopping_threshold' must be finite");
        }
        if self.max_gen_times == 0 {
            bail!("trainer config field 'max_gen_times' must be >= 1");
        }
        if self.bos_token_id == self.eos_token_id {
            bail!("trainer config fields 'bos_token_id' and 'eos_token_id' must differ");
        }
        if self.run_id.trim().is_empty() {
            bail!("trainer config field 'run_id' must not be empty");
        }
        if !(0.0..=1.0).contains(&self.lamb_initial) {
            bail!("trainer config field 'lamb_initial' must be in [0.0, 1.0]");
        }
        self.aligner.validate()
    }

    /// Prediction batch size used during sampling passes.
    pub fn sample_batch_size(&self) -> usize {
        self.batch_size.saturating_mul(self.sample_batch_multiplier)
    }
}

fn optional_u64(object: &Map<String, Value>, field: &'static str) -> Result<Option<u64>> {
    object
        .get(field)
        .map(|raw| {
            raw.as_u64().with_context(|| {
                format!("trainer config field '{field}' must be a non-negative integer")
            })
        })
        .transpose()
}

fn optional_usize(object: &Map<String, Value>, field: &'static str) -> Result<Option<usize>> {
    optional_u64(object, field)?
        .map(|raw| {
            usize::try_from(raw)
                .with_context(|| format!("trainer config field '{field}' is out of range"))
        })
        .transpose()
}

fn optional_f64(object: &Map<String, Value>, field: &'static str) -> Result<Option<f64>> {
    object
        .get(field)
        .map(|raw| {
            raw.as_f64()
                .with_context(|| format!("trainer config field '{field}' must be numeric"))
        })
        .transpose()
}

fn optional_string(object: &Map<String, Value>, field: &'static str) -> Result<Option<String>> {
    object
        .get(field)
        .map(|raw| {
            raw.as_str()
                .map(str::to_string)
                .with_context(|| format!("trainer config field '{field}' must be a string"))
        })
        .transpose()
}

/// Fold counts derived from the config and the dataset size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldPlan {
    pub sample_count: usize,
    pub batch_size: usize,
    pub train_fold: u64,
    pub epoch_batches: u64,
    pub fold_train_batches: u64,
    pub fold_sample_batches: u64,
    pub fold_all: u64,
    pub begin_sample_fold: u64,
    pub load_epoch_fold: u64,
}

impl FoldPlan {
    pub fn new(config: &RlTrainerConfig, sample_count: usize) -> Result<Self> {
        config.validate()?;
        if sample_count == 0 {
            bail!("fold plan requires at least one sample");
        }
        let epoch_batches = (sample_count as u64).div_ceil(config.batch_size as u64);
        Ok(Self {
            sample_count,
            batch_size: config.batch_size,
            train_fold: config.train_fold,
            epoch_batches,
            fold_train_batches: epoch_batches.div_ceil(config.train_fold),
            fold_sample_batches: epoch_batches.div_ceil(config.sample_fold),
            fold_all: config.train_fold * config.rl_epoch,
            begin_sample_fold: config.train_fold * config.rl_begin_epoch,
            load_epoch_fold: config.train_fold * config.load_epoch,
        })
    }

    /// Samples trained per fold, capped at the dataset size.
    pub fn train_window_len(&self) -> usize {
        (self.fold_train_batches as usize * self.batch_size).min(self.sample_count)
    }

    /// Samples re-sampled per sampling pass, capped at the dataset size.
    pub fn sample_window_len(&self) -> usize {
        (self.fold_sample_batches as usize * self.batch_size).min(self.sample_count)
    }

    /// Offset into the epoch order of the window trained in `fold` (1-based).
    pub fn window_start(&self, fold: u64) -> usize {
        let window = (fold.saturating_sub(1) % self.train_fold) as usize;
        window * self.fold_train_batches as usize * self.batch_size
    }

    pub fn samples_after(&self, fold: u64) -> bool {
        fold > self.begin_sample_fold
    }

    pub fn is_epoch_end(&self, fold: u64) -> bool {
        fold % self.train_fold == 0
    }

    pub fn epoch_of(&self, fold: u64) -> u64 {
        fold / self.train_fold
    }

    /// Folds still to run after resuming.
    pub fn remaining_folds(&self) -> std::ops::RangeInclusive<u64> {
        self.load_epoch_fold + 1..=self.fold_all
    }
}

/// Takes `len` entries of `order` starting at `start`, wrapping around and
/// skipping repeats.
pub fn wrapping_window(order: &[usize], start: usize, len: usize) -> Vec<usize> {
    if order.is_empty() {
        return Vec::new();
    }
    let mut seen = std::collections::BTreeSet::new();
    (0..len.min(order.len()))
        .map(|offset| order[(start + offset) % order.len()])
        .filter(|index| seen.insert(*index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{wrapping_window, FoldPlan, RlTrainerConfig};
    use rise_types::SamplingStrategy;
    use serde_json::json;

    #[test]
    fn fold_plan_matches_ceil_arithmetic() {
        let config = RlTrainerConfig {
            batch_size: 4,
            train_fold: 3,
            sample_fold: 2,
            rl_epoch: 5,
            rl_begin_epoch: 2,
            load_epoch: 1,
            ..RlTrainerConfig::default()
        };
        let plan = FoldPlan::new(&config, 30).expect("plan");
        assert_eq!(plan.epoch_batches, 8);
        assert_eq!(plan.fold_train_batches, 3);
        assert_eq!(plan.fold_sample_batches, 4);
        assert_eq!(plan.fold_all, 15);
        assert_eq!(plan.begin_sample_fold, 6);
        assert_eq!(plan.load_epoch_fold, 3);
        assert_eq!(plan.train_window_len(), 12);
        assert_eq!(plan.sample_window_len(), 16);
        assert_eq!(plan.remaining_folds(), 4..=15);
    }

    #[test]
    fn four_train_folds_over_two_epochs_sample_only_in_second_epoch() {
        let config = RlTrainerConfig {
            train_fold: 4,
            rl_epoch: 2,
            rl_begin_epoch: 1,
            ..RlTrainerConfig::default()
        };
        let plan = FoldPlan::new(&config, 8).expect("plan");
        assert_eq!(plan.fold_all, 8);
        assert_eq!(plan.begin_sample_fold, 4);
        let sampling: Vec<bool> = (1..=8).map(|fold| plan.samples_after(fold)).collect();
        assert_eq!(
            sampling,
            vec![false, false, false, false, true, true, true, true]
        );
        assert!(plan.is_epoch_end(4) && plan.is_epoch_end(8));
        assert_eq!(plan.epoch_of(8), 2);
    }

    #[test]
    fn windows_cycle_per_epoch_and_wrap() {
        let config = RlTrainerConfig {
            batch_size: 2,
            train_fold: 2,
            ..RlTrainerConfig::default()
        };
        let plan = FoldPlan::new(&config, 5).expect("plan");
        assert_eq!(plan.window_start(1), 0);
        assert_eq!(plan.window_start(2), 4);
        assert_eq!(plan.window_start(3), 0);

        let order = vec![4, 3, 2, 1, 0];
        assert_eq!(wrapping_window(&order, 4, 4), vec![0, 4, 3, 2]);
        assert_eq!(wrapping_window(&order, 1, 9), vec![3, 2, 1, 0, 4]);
    }

    #[test]
    fn config_parsing_applies_overrides_and_validates() {
        let config = RlTrainerConfig::from_json(&json!({
            "candidates_per_pair": 3,
            "train_fold": 2,
            "sampling_strategy": "greedy",
            "use_stopping_score": true,
            "run_id": "exp-7",
            "aligner": { "temperature": 0.5 }
        }))
        .expect("config");
        assert_eq!(config.candidates_per_pair, 3);
        assert_eq!(config.train_fold, 2);
        assert_eq!(config.sampling_strategy, SamplingStrategy::Greedy);
        assert!(config.use_stopping_score);
        assert_eq!(config.run_id, "exp-7");
        assert_eq!(config.aligner.temperature, 0.5);
        assert_eq!(config.sample_fold, 4);

        let error = RlTrainerConfig::from_json(&json!({ "batch_size": 0 })).expect_err("batch");
        assert!(error.to_string().contains("batch_size"));
        let error = RlTrainerConfig::from_json(&json!({ "sampling_strategy": "beam" }))
            .expect_err("strategy");
        assert!(error.to_string().contains("unknown sampling strategy"));
        assert!(RlTrainerConfig::from_json(&json!({ "load_epoch": 11 })).is_err());
        assert!(RlTrainerConfig::from_json(&json!([])).is_err());
    }

    #[test]
    fn empty_dataset_has_no_fold_plan() {
        assert!(FoldPlan::new(&RlTrainerConfig::default(), 0).is_err());
    }
}
