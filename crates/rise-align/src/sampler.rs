//! Stochastic and greedy path walks through an alignment matrix.

use crate::aligner::{AlignMove, AlignmentMatrix};
use crate::merge::merge_tags;
use anyhow::{bail, Result};
use rand::Rng;
use rise_types::{EditAction, MergedAction};

impl AlignmentMatrix {
    /// Draws one path by walking back from the terminal cell, picking each
    /// incoming move proportionally to its mass.
    ///
    /// Returns `None` when a visited cell has no finite positive mass.
    pub fn sample_path<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Vec<AlignMove>> {
        let (mut i, mut j) = (self.len_a(), self.len_b());
        let mut path = Vec::with_capacity(i + j);

        while i > 0 || j > 0 {
            let feasible = self.feasible_moves(i, j);
            let mass = self.move_mass(i, j);
            let weighted: Vec<(AlignMove, f64)> = feasible
                .iter()
                .zip(mass)
                .filter_map(|(step, weight)| step.map(|step| (step, weight)))
                .collect();
            let total: f64 = weighted.iter().map(|(_, weight)| weight).sum();
            if !total.is_finite() || total <= 0.0 {
                return None;
            }

            let mut threshold = rng.random::<f64>() * total;
            let mut chosen = None;
            for (step, weight) in &weighted {
                if *weight <= 0.0 {
                    continue;
                }
                chosen = Some(*step);
                if threshold < *weight {
                    break;
                }
                threshold -= weight;
            }
            let step = chosen?;
            path.push(step);
            (i, j) = step.predecessor(i, j);
        }

        path.reverse();
        Some(path)
    }

    /// Deterministic argmax walk; ties and all-zero cells resolve by
    /// keep > substitute > insert > delete.
    pub fn greedy_path(&self) -> Vec<AlignMove> {
        let (mut i, mut j) = (self.len_a(), self.len_b());
        let mut path = Vec::with_capacity(i + j);

        while i > 0 || j > 0 {
            let mass = self.move_mass(i, j);
            let mut best: Option<(f64, AlignMove)> = None;
            for (rank, step) in self.feasible_moves(i, j).iter().enumerate() {
                let Some(step) = step else {
                    continue;
                };
                let weight = if mass[rank].is_finite() {
                    mass[rank]
                } else {
                    0.0
                };
                match best {
                    Some((best_weight, _)) if weight <= best_weight => {}
                    _ => best = Some((weight, *step)),
                }
            }
            // Every cell other than the origin has at least one feasible move.
            let Some((_, step)) = best else {
                break;
            };
            path.push(step);
            (i, j) = step.predecessor(i, j);
        }

        path.reverse();
        path
    }
}

/// Converts an alignment path into a boundary-inclusive action list of
/// length `len_a + 2`.
///
/// Inserted tokens attach to the next consumed position: a keep becomes an
/// insert, a delete becomes a substitute, and trailing insertions land on EOS.
pub fn path_to_actions(path: &[AlignMove], len_a: usize) -> Vec<EditAction> {
    let mut actions = Vec::with_capacity(len_a + 2);
    actions.push(EditAction::Keep);
    let mut pending = Vec::new();

    for step in path {
        match *step {
            AlignMove::Insert(token) => pending.push(token),
            AlignMove::Keep => actions.push(if pending.is_empty() {
                EditAction::Keep
            } else {
                EditAction::Insert(std::mem::take(&mut pending))
            }),
            AlignMove::Substitute(token) => {
                pending.push(token);
                actions.push(EditAction::Substitute(std::mem::take(&mut pending)));
            }
            AlignMove::Delete => actions.push(if pending.is_empty() {
                EditAction::Delete
            } else {
                EditAction::Substitute(std::mem::take(&mut pending))
            }),
        }
    }

    actions.push(if pending.is_empty() {
        EditAction::Keep
    } else {
        EditAction::Insert(pending)
    });
    actions
}

/// Source of stochastic alignment paths.
pub trait PathSampler {
    /// Draws one path, or `None` when the draw degenerates.
    fn draw(&mut self, matrix: &AlignmentMatrix) -> Option<Vec<AlignMove>>;
}

/// Path sampler backed by a random number generator.
#[derive(Debug, Clone)]
pub struct RandomPathSampler<R> {
    rng: R,
}

impl<R: Rng> RandomPathSampler<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }
}

impl<R: Rng> PathSampler for RandomPathSampler<R> {
    fn draw(&mut self, matrix: &AlignmentMatrix) -> Option<Vec<AlignMove>> {
        matrix.sample_path(&mut self.rng)
    }
}

/// Aggregate draw counters for one sampling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplingStats {
    pub pairs: u64,
    pub draws: u64,
    pub failures: u64,
}

impl SamplingStats {
    /// Fraction of stochastic draws replaced by the greedy path.
    pub fn failure_rate(&self) -> f64 {
        if self.draws == 0 {
            0.0
        } else {
            self.failures as f64 / self.draws as f64
        }
    }

    pub fn absorb(&mut self, other: &SamplingStats) {
        self.pairs += other.pairs;
        self.draws += other.draws;
        self.failures += other.failures;
    }
}

/// Draws `L` merged candidates per (current, target) pair.
#[derive(Debug, Clone)]
pub struct ActionSampler {
    candidates_per_pair: usize,
}

impl ActionSampler {
    pub fn new(candidates_per_pair: usize) -> Result<Self> {
        if candidates_per_pair == 0 {
            bail!("action sampler requires at least one candidate per pair");
        }
        Ok(Self {
            candidates_per_pair,
        })
    }

    pub fn candidates_per_pair(&self) -> usize {
        self.candidates_per_pair
    }

    /// Draws exactly `L` candidates; each degenerate draw is replaced by the
    /// greedy path and counted in `stats.failures`.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(len_a = matrix.len_a(), len_b = matrix.len_b(), candidates = self.candidates_per_pair)
    )]
    pub fn sample_candidates<S: PathSampler + ?Sized>(
        &self,
        matrix: &AlignmentMatrix,
        sampler: &mut S,
        stats: &mut SamplingStats,
    ) -> Result<Vec<MergedAction>> {
        stats.pairs += 1;
        let mut candidates = Vec::with_capacity(self.candidates_per_pair);
        for draw in 0..self.candidates_per_pair {
            stats.draws += 1;
            let path = match sampler.draw(matrix) {
                Some(path) => path,
                None => {
                    stats.failures += 1;
                    tracing::debug!(draw, "degenerate draw replaced by greedy path");
                    matrix.greedy_path()
                }
            };
            candidates.push(merge_tags(&path_to_actions(&path, matrix.len_a()))?);
        }
        Ok(candidates)
    }

    /// Deterministic candidate used when stochastic sampling is disabled.
    pub fn greedy_candidate(&self, matrix: &AlignmentMatrix) -> Result<MergedAction> {
        Ok(merge_tags(&path_to_actions(
            &matrix.greedy_path(),
            matrix.len_a(),
        ))?)
    }
}
