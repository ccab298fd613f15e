//! Alternating train/sample fold loop.

use crate::checkpoint_store::{checkpoint_path, load_fold_checkpoint, save_fold_checkpoint, FoldCheckpoint};
use crate::config::{wrapping_window, FoldPlan, RlTrainerConfig};
use crate::coordinator::CacheCoordinator;
use crate::model::{EditModel, LossAccumulator, StepLosses, TrainBatch};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rise_align::{mean_edit_distance, RandomPathSampler, SamplingStats};
use rise_store::{
    cache_snapshot_path, load_cache_snapshot, save_cache_snapshot, Phase, SampleStore,
    SampleStoreError,
};
use rise_types::CacheRecord;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

const TRAIN_SALT: u64 = 0x7472_6169_6e00_0000;
const SAMPLE_SALT: u64 = 0x7361_6d70_6c00_0000;

fn fold_seed(seed: u64, fold: u64, salt: u64) -> u64 {
    seed ^ salt ^ fold.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Outcome of one committed sampling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingReport {
    /// Fold the pass ran after; 0 for the pre-loop bootstrap.
    pub fold: u64,
    pub sampled: usize,
    pub committed: usize,
    pub round: u64,
    pub stats: SamplingStats,
    pub mean_edit_distance: f64,
}

/// What happened in one training fold.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldReport {
    pub fold: u64,
    /// Set when the fold closed an epoch.
    pub epoch: Option<u64>,
    pub trained_samples: usize,
    pub losses: Option<StepLosses>,
    pub sampling: Option<SamplingReport>,
}

/// Aggregate outcome of a scheduler run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    pub resumed_from: Option<u64>,
    pub bootstrap: Option<SamplingReport>,
    pub folds: Vec<FoldReport>,
    pub checkpoints: Vec<PathBuf>,
    pub cache_snapshots: Vec<PathBuf>,
    pub sampling: SamplingStats,
    pub nan_clamps: u64,
    pub optimizer_steps: u64,
    pub final_lamb: f64,
}

/// Drives `LOAD -> {TRAIN <-> SAMPLE} -> CHECKPOINT -> ... -> DONE`.
pub struct FoldScheduler<M, S: ?Sized, T> {
    config: RlTrainerConfig,
    model: M,
    store: Arc<S>,
    telemetry: T,
    coordinator: CacheCoordinator,
    lamb: f64,
    optimizer_steps: u64,
    accumulation_count: usize,
    nan_clamps: u64,
}

impl<M, S, T> FoldScheduler<M, S, T>
where
    M: EditModel,
    S: SampleStore + ?Sized,
    T: TelemetrySink,
{
    pub fn new(config: RlTrainerConfig, model: M, store: Arc<S>, telemetry: T) -> Result<Self> {
        config.validate()?;
        let coordinator = CacheCoordinator::new(
            config.aligner.clone(),
            config.candidates_per_pair,
            config.sampling_strategy,
            config.bos_token_id,
            config.eos_token_id,
        )?;
        Ok(Self {
            lamb: config.lamb_initial,
            config,
            model,
            store,
            telemetry,
            coordinator,
            optimizer_steps: 0,
            accumulation_count: 0,
            nan_clamps: 0,
        })
    }

    pub fn config(&self) -> &RlTrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    pub fn lamb(&self) -> f64 {
        self.lamb
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Runs every remaining fold and returns the per-fold reports.
    #[instrument(skip(self), fields(run_id = %self.config.run_id, strategy = %self.config.sampling_strategy))]
    pub async fn run(&mut self) -> Result<RunSummary> {
        let sample_count = self.store.sample_count().await?;
        let plan = FoldPlan::new(&self.config, sample_count)?;
        info!(
            epoch_batches = plan.epoch_batches,
            fold_train_batches = plan.fold_train_batches,
            fold_sample_batches = plan.fold_sample_batches,
            fold_all = plan.fold_all,
            begin_sample_fold = plan.begin_sample_fold,
            load_epoch_fold = plan.load_epoch_fold,
            "fold plan"
        );

        let mut summary = RunSummary {
            resumed_from: self.load().await?,
            ..RunSummary::default()
        };

        let mut order = self.store.all_indices().await?;
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(self.config.seed));

        if self.config.tune_epoch == 0 || self.config.load_epoch >= self.config.tune_epoch {
            self.model.unfreeze(self.config.tune_lr).await?;
            info!(learning_rate = self.config.tune_lr, "unfroze all parameters");
        }

        if !self.config.sampling_strategy.is_rise() {
            let indices = wrapping_window(
                &order,
                plan.window_start(plan.load_epoch_fold + 1),
                plan.sample_window_len(),
            );
            let report = self.sample_pass(0, &indices).await?;
            summary.sampling.absorb(&report.stats);
            summary.bootstrap = Some(report);
        }

        let mut epoch_losses = LossAccumulator::default();
        for fold in plan.remaining_folds() {
            let train_indices =
                wrapping_window(&order, plan.window_start(fold), plan.train_window_len());
            let fold_losses = self.train_fold(fold, &train_indices).await?;
            epoch_losses.merge(&fold_losses);
            info!(fold, loss = ?fold_losses.mean(), "trained fold");

            let sampling = if plan.samples_after(fold) {
                let indices = wrapping_window(
                    &order,
                    plan.window_start(fold + 1),
                    plan.sample_window_len(),
                );
                let report = self.sample_pass(fold, &indices).await?;
                summary.sampling.absorb(&report.stats);
                Some(report)
            } else {
                None
            };

            let mut report = FoldReport {
                fold,
                epoch: None,
                trained_samples: train_indices.len(),
                losses: fold_losses.mean(),
                sampling,
            };

            if plan.is_epoch_end(fold) {
                let epoch = plan.epoch_of(fold);
                self.lamb = (2.0 * epoch as f64 / self.config.rl_epoch as f64).min(1.0);
                self.flush_epoch(epoch, &epoch_losses)?;
                epoch_losses = LossAccumulator::default();

                summary.checkpoints.push(self.save_checkpoint(epoch, fold).await?);
                if plan.samples_after(fold) {
                    summary
                        .cache_snapshots
                        .push(self.save_cache(epoch).await?);
                }
                if epoch == self.config.tune_epoch {
                    self.model.unfreeze(self.config.tune_lr).await?;
                    info!(epoch, learning_rate = self.config.tune_lr, "unfroze all parameters");
                }
                report.epoch = Some(epoch);
            }
            summary.folds.push(report);
        }

        self.telemetry.close()?;
        summary.nan_clamps = self.nan_clamps;
        summary.optimizer_steps = self.optimizer_steps;
        summary.final_lamb = self.lamb;
        info!(
            folds = summary.folds.len(),
            nan_clamps = summary.nan_clamps,
            "fold loop finished"
        );
        Ok(summary)
    }

    /// Restores model and cache state for `load_epoch`; returns the epoch
    /// resumed from.
    async fn load(&mut self) -> Result<Option<u64>> {
        let epoch = self.config.load_epoch;
        if epoch == 0 {
            return Ok(None);
        }

        let path = checkpoint_path(&self.config.checkpoint_dir, &self.config.run_id, epoch);
        let checkpoint = load_fold_checkpoint(&path)
            .with_context(|| format!("failed to resume from epoch {epoch}"))?;
        self.model.restore_state(&checkpoint.model_state).await?;
        self.lamb = checkpoint.lamb;
        self.optimizer_steps = checkpoint.optimizer_steps;

        let cache_path =
            cache_snapshot_path(&self.config.cache_dir, epoch, self.config.sampling_strategy);
        match load_cache_snapshot(&cache_path) {
            Ok(snapshot) => {
                self.store.restore_cache(snapshot).await?;
                info!(epoch, path = %cache_path.display(), "restored cache snapshot");
            }
            Err(SampleStoreError::SnapshotAbsent(_)) => {
                info!(epoch, "no cache snapshot for resumed epoch; keeping current cache");
            }
            Err(error) => return Err(error.into()),
        }
        info!(epoch, path = %path.display(), "resumed from checkpoint");
        Ok(Some(epoch))
    }

    #[instrument(skip(self, indices), fields(samples = indices.len()))]
    async fn train_fold(&mut self, fold: u64, indices: &[usize]) -> Result<LossAccumulator> {
        let _guard = self.store.phase_gate().try_enter(Phase::Train)?;
        let mut shuffled = indices.to_vec();
        shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(fold_seed(
            self.config.seed,
            fold,
            TRAIN_SALT,
        )));

        let mut losses = LossAccumulator::default();
        for batch in shuffled.chunks(self.config.batch_size) {
            let snapshots = self.store.snapshots(batch).await?;
            let mut step = self
                .model
                .forward(&TrainBatch {
                    snapshots,
                    lamb: self.lamb,
                    compute_stopping_score: self.config.use_stopping_score,
                })
                .await?;
            if step.gen_loss.is_nan() {
                step.gen_loss = 0.0;
                self.nan_clamps += 1;
                warn!(fold, "generation loss is NaN; replaced with 0");
            }
            if !self.config.use_stopping_score {
                step.score_loss = None;
            }

            self.model
                .backward(step.total() / self.config.accumulation_steps as f64)
                .await?;
            self.accumulation_count += 1;
            if self.accumulation_count % self.config.accumulation_steps == 0 {
                self.step_optimizer().await?;
            }
            losses.push(&step);
        }
        self.step_optimizer().await?;
        Ok(losses)
    }

    async fn step_optimizer(&mut self) -> Result<()> {
        self.model.optimizer_step().await?;
        self.optimizer_steps += 1;
        self.accumulation_count = 0;
        Ok(())
    }

    /// Samples new cache values for `indices` and commits them as one round.
    #[instrument(skip(self, indices), fields(samples = indices.len()))]
    async fn sample_pass(&mut self, fold: u64, indices: &[usize]) -> Result<SamplingReport> {
        let guard = self.store.phase_gate().try_enter(Phase::Sample)?;
        let mut stats = SamplingStats::default();
        let staged: Result<usize> = match self.collect_records(fold, indices, &mut stats).await {
            Ok(records) => self.store.add_cache(records).await.map_err(Into::into),
            Err(error) => Err(error),
        };
        if let Err(error) = staged {
            self.discard_round(fold).await;
            return Err(error);
        }
        let commit = self
            .store
            .update_cache(&guard, self.config.sampling_strategy)
            .await?;
        drop(guard);

        let snapshots = self.store.snapshots(indices).await?;
        let mean_distance = mean_edit_distance(
            snapshots
                .iter()
                .map(|snapshot| (&snapshot.current[..], &snapshot.target[..])),
        );
        self.telemetry.record(TelemetryEvent::scalar(
            "sample_failure_rate",
            stats.failure_rate(),
            fold,
        ))?;
        self.telemetry.record(TelemetryEvent::scalar(
            "mean_edit_distance",
            mean_distance,
            fold,
        ))?;
        info!(
            fold,
            sample_num = indices.len(),
            fail_num = stats.failures,
            round = commit.round,
            mean_edit_distance = mean_distance,
            "sampling pass committed"
        );

        Ok(SamplingReport {
            fold,
            sampled: indices.len(),
            committed: commit.committed,
            round: commit.round,
            stats,
            mean_edit_distance: mean_distance,
        })
    }

    /// Drops staged records after a failed round; the round's own error wins.
    async fn discard_round(&self, fold: u64) {
        match self.store.discard_staged().await {
            Ok(discarded) => warn!(fold, discarded, "sampling round aborted; staged records discarded"),
            Err(error) => warn!(fold, %error, "failed to discard staged records of aborted round"),
        }
    }

    async fn collect_records(
        &self,
        fold: u64,
        indices: &[usize],
        stats: &mut SamplingStats,
    ) -> Result<Vec<CacheRecord>> {
        let mut rng = ChaCha8Rng::seed_from_u64(fold_seed(self.config.seed, fold, SAMPLE_SALT));
        let mut records = Vec::with_capacity(indices.len());
        for batch in indices.chunks(self.config.sample_batch_size()) {
            let snapshots = self.store.snapshots(batch).await?;
            let edit_rows = self.model.edit_predict(&snapshots).await?;

            if self.config.sampling_strategy.is_rise() {
                let mut paths = RandomPathSampler::new(&mut rng);
                let entries =
                    self.coordinator
                        .sample_action(&snapshots, &edit_rows, &mut paths, stats)?;
                let scores = self.coordinator.selection_scores(&entries, &edit_rows)?;
                records.extend(self.coordinator.obtain_cache(&scores, &entries)?);
            } else {
                let entries = self
                    .coordinator
                    .sample_greedy(&snapshots, &edit_rows, &mut rng)?;
                stats.pairs += entries.len() as u64;
                let requests = self.store.load_sample_prob_action(&entries).await?;
                let slot_rows = self.model.slot_predict(&requests).await?;
                records.extend(
                    self.coordinator
                        .obtain_cache_greedy(&slot_rows, &entries, &mut rng)?,
                );
            }
        }
        Ok(records)
    }

    fn flush_epoch(&self, epoch: u64, losses: &LossAccumulator) -> Result<()> {
        let Some(mean) = losses.mean() else {
            return self.telemetry.flush();
        };
        self.telemetry
            .record(TelemetryEvent::scalar("gen_loss", mean.gen_loss, epoch))?;
        self.telemetry
            .record(TelemetryEvent::scalar("edit_loss", mean.edit_loss, epoch))?;
        if self.config.use_stopping_score {
            if let Some(score_loss) = mean.score_loss {
                self.telemetry
                    .record(TelemetryEvent::scalar("score_loss", score_loss, epoch))?;
            }
        }
        self.telemetry
            .record(TelemetryEvent::scalar("reward", mean.reward, epoch))?;
        self.telemetry
            .record(TelemetryEvent::scalar("lamb", self.lamb, epoch))?;
        self.telemetry.flush()?;
        info!(epoch, loss = ?mean, "epoch finished");
        Ok(())
    }

    async fn save_checkpoint(&self, epoch: u64, fold: u64) -> Result<PathBuf> {
        let path = checkpoint_path(&self.config.checkpoint_dir, &self.config.run_id, epoch);
        let checkpoint = FoldCheckpoint::new(
            self.config.run_id.clone(),
            epoch,
            fold,
            self.lamb,
            self.optimizer_steps,
            self.model.export_state().await?,
        );
        save_fold_checkpoint(&path, &checkpoint)
            .with_context(|| format!("failed to save checkpoint for epoch {epoch}"))?;
        info!(epoch, path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    async fn save_cache(&self, epoch: u64) -> Result<PathBuf> {
        let path =
            cache_snapshot_path(&self.config.cache_dir, epoch, self.config.sampling_strategy);
        let snapshot = self.store.export_cache().await?;
        save_cache_snapshot(&path, &snapshot)
            .with_context(|| format!("failed to save cache snapshot for epoch {epoch}"))?;
        Ok(path)
    }
}
