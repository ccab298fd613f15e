//! Probability-weighted edit alignment between a current and a target sequence.

use crate::probability::EditProbabilityMatrix;
use anyhow::{bail, Context, Result};
use rise_types::{EditTag, TokenId};
use serde_json::Value;

/// Knobs for the probability bias folded into the edit-distance recurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignerConfig {
    /// Scale applied to the `-ln(p)` bias of every move.
    pub bias_weight: f64,
    /// Softness of the move distribution derived from excess cost.
    pub temperature: f64,
    /// Floor added to probabilities before taking logarithms.
    pub min_prob: f64,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            bias_weight: 1.0,
            temperature: 1.0,
            min_prob: 1e-8,
        }
    }
}

impl AlignerConfig {
    /// Parses `AlignerConfig` from a JSON object.
    #[tracing::instrument(level = "debug", skip(value))]
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .context("aligner config JSON payload must be an object")?;
        let mut config = Self::default();

        if let Some(bias_weight) = object.get("bias_weight") {
            config.bias_weight = bias_weight
                .as_f64()
                .context("aligner config field 'bias_weight' must be numeric")?;
        }
        if let Some(temperature) = object.get("temperature") {
            config.temperature = temperature
                .as_f64()
                .context("aligner config field 'temperature' must be numeric")?;
        }
        if let Some(min_prob) = object.get("min_prob") {
            config.min_prob = min_prob
                .as_f64()
                .context("aligner config field 'min_prob' must be numeric")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.bias_weight.is_finite() || self.bias_weight < 0.0 {
            bail!("aligner config field 'bias_weight' must be finite and >= 0.0");
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            bail!("aligner config field 'temperature' must be finite and > 0.0");
        }
        if !self.min_prob.is_finite() || self.min_prob <= 0.0 {
            bail!("aligner config field 'min_prob' must be finite and > 0.0");
        }
        Ok(())
    }
}

/// One step of an alignment path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignMove {
    Keep,
    Substitute(TokenId),
    Insert(TokenId),
    Delete,
}

impl AlignMove {
    pub fn tag(self) -> EditTag {
        match self {
            Self::Keep => EditTag::Keep,
            Self::Substitute(_) => EditTag::Substitute,
            Self::Insert(_) => EditTag::Insert,
            Self::Delete => EditTag::Delete,
        }
    }

    /// Cell reached by undoing this move from `(i, j)`.
    pub(crate) fn predecessor(self, i: usize, j: usize) -> (usize, usize) {
        match self {
            Self::Keep | Self::Substitute(_) => (i - 1, j - 1),
            Self::Insert(_) => (i, j - 1),
            Self::Delete => (i - 1, j),
        }
    }
}

/// DP table over `(len(a) + 1) x (len(b) + 1)` cells.
///
/// Each cell stores the minimal biased cost of aligning the prefixes and the
/// normalized mass of its incoming moves, indexed by
/// [`EditTag::precedence_rank`].
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentMatrix {
    seq_a: Vec<TokenId>,
    seq_b: Vec<TokenId>,
    costs: Vec<f64>,
    pub(crate) moves: Vec<[f64; 4]>,
}

impl AlignmentMatrix {
    pub fn seq_a(&self) -> &[TokenId] {
        &self.seq_a
    }

    pub fn seq_b(&self) -> &[TokenId] {
        &self.seq_b
    }

    pub fn len_a(&self) -> usize {
        self.seq_a.len()
    }

    pub fn len_b(&self) -> usize {
        self.seq_b.len()
    }

    pub fn cost(&self, i: usize, j: usize) -> f64 {
        self.costs[self.cell(i, j)]
    }

    /// Minimal biased cost of the whole alignment.
    pub fn total_cost(&self) -> f64 {
        self.cost(self.len_a(), self.len_b())
    }

    /// Normalized incoming-move mass at `(i, j)` in precedence order.
    pub fn move_mass(&self, i: usize, j: usize) -> [f64; 4] {
        self.moves[self.cell(i, j)]
    }

    pub(crate) fn cell(&self, i: usize, j: usize) -> usize {
        i * (self.seq_b.len() + 1) + j
    }

    /// Moves that can enter `(i, j)`, indexed by precedence rank.
    pub(crate) fn feasible_moves(&self, i: usize, j: usize) -> [Option<AlignMove>; 4] {
        feasible_moves(&self.seq_a, &self.seq_b, i, j)
    }
}

fn feasible_moves(seq_a: &[TokenId], seq_b: &[TokenId], i: usize, j: usize) -> [Option<AlignMove>; 4] {
    let mut moves = [None; 4];
    if i > 0 && j > 0 {
        if seq_a[i - 1] == seq_b[j - 1] {
            moves[EditTag::Keep.precedence_rank()] = Some(AlignMove::Keep);
        } else {
            moves[EditTag::Substitute.precedence_rank()] =
                Some(AlignMove::Substitute(seq_b[j - 1]));
        }
    }
    if j > 0 {
        moves[EditTag::Insert.precedence_rank()] = Some(AlignMove::Insert(seq_b[j - 1]));
    }
    if i > 0 {
        moves[EditTag::Delete.precedence_rank()] = Some(AlignMove::Delete);
    }
    moves
}

/// Builds alignment matrices from model edit probabilities.
#[derive(Debug, Clone, Default)]
pub struct SequenceAligner {
    config: AlignerConfig,
}

impl SequenceAligner {
    pub fn new(config: AlignerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AlignerConfig {
        &self.config
    }

    /// Aligns `seq_a` to `seq_b` under the given extended-input probabilities.
    ///
    /// `probabilities` must cover `len(seq_a) + 2` positions. The move at
    /// cell `(i, j)` reads the row of the extended position it edits:
    /// `i` for keep/substitute/delete of `a[i - 1]`, and `i + 1` for an
    /// insertion placed before the next input token (EOS when `i == len(a)`).
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(len_a = seq_a.len(), len_b = seq_b.len())
    )]
    pub fn align(
        &self,
        seq_a: &[TokenId],
        seq_b: &[TokenId],
        probabilities: &EditProbabilityMatrix,
    ) -> Result<AlignmentMatrix> {
        let positions = seq_a.len() + 2;
        if probabilities.len() < positions {
            bail!(
                "alignment shape mismatch: expected {positions} probability rows, found {}",
                probabilities.len()
            );
        }

        let rows = seq_a.len() + 1;
        let cols = seq_b.len() + 1;
        let mut costs = vec![0.0; rows * cols];
        let mut moves = vec![[0.0; 4]; rows * cols];

        for i in 0..rows {
            for j in 0..cols {
                if i == 0 && j == 0 {
                    continue;
                }
                let candidates = feasible_moves(seq_a, seq_b, i, j).map(|entry| {
                    entry.map(|step| {
                        let (pi, pj) = step.predecessor(i, j);
                        costs[pi * cols + pj] + self.step_cost(step, i, probabilities)
                    })
                });
                let best = candidates
                    .iter()
                    .flatten()
                    .copied()
                    .fold(f64::INFINITY, f64::min);

                let mut mass = [0.0; 4];
                for (rank, candidate) in candidates.iter().enumerate() {
                    if let Some(cost) = candidate {
                        mass[rank] = (-(cost - best) / self.config.temperature).exp();
                    }
                }
                let total: f64 = mass.iter().sum();
                if total.is_finite() && total > 0.0 {
                    for value in &mut mass {
                        *value /= total;
                    }
                }

                costs[i * cols + j] = best;
                moves[i * cols + j] = mass;
            }
        }

        Ok(AlignmentMatrix {
            seq_a: seq_a.to_vec(),
            seq_b: seq_b.to_vec(),
            costs,
            moves,
        })
    }

    fn step_cost(&self, step: AlignMove, i: usize, probabilities: &EditProbabilityMatrix) -> f64 {
        let (base, row) = match step {
            AlignMove::Keep => (0.0, i),
            AlignMove::Substitute(_) | AlignMove::Delete => (1.0, i),
            AlignMove::Insert(_) => (1.0, i + 1),
        };
        let probability = probabilities.probability(row, step.tag());
        base - self.config.bias_weight * (self.config.min_prob + probability).ln()
    }
}
