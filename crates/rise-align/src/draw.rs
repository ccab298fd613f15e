//! Per-position tag and slot-token draws for the greedy/multinomial rounds.

use crate::credit::coerce_boundaries;
use crate::probability::{normalize_without_null, EditProbabilityMatrix};
use anyhow::{bail, Result};
use rand::Rng;
use rise_types::{EditTag, PlannedEdit, SamplingStrategy, TokenId};

/// Index of the largest finite entry; the first one wins ties.
pub fn argmax_index(weights: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, weight) in weights.iter().copied().enumerate() {
        if !weight.is_finite() {
            continue;
        }
        match best {
            Some((_, best_weight)) if weight <= best_weight => {}
            _ => best = Some((index, weight)),
        }
    }
    best.map(|(index, _)| index)
}

/// Index drawn proportionally to the weights, or `None` without positive
/// finite mass.
pub fn draw_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
        return None;
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let mut threshold = rng.random::<f64>() * total;
    let mut chosen = None;
    for (index, weight) in weights.iter().copied().enumerate() {
        if weight <= 0.0 {
            continue;
        }
        chosen = Some(index);
        if threshold < weight {
            break;
        }
        threshold -= weight;
    }
    chosen
}

fn pick<R: Rng + ?Sized>(weights: &[f64], strategy: SamplingStrategy, rng: &mut R) -> Option<usize> {
    match strategy {
        SamplingStrategy::Multinomial => draw_index(weights, rng).or_else(|| argmax_index(weights)),
        SamplingStrategy::Greedy | SamplingStrategy::Rise => argmax_index(weights),
    }
}

/// Picks one tag per extended-input position.
///
/// Payload tags get width 1 and boundaries are coerced; a row without any
/// usable mass falls back to keep.
pub fn sample_tags<R: Rng + ?Sized>(
    probabilities: &EditProbabilityMatrix,
    strategy: SamplingStrategy,
    rng: &mut R,
) -> Vec<PlannedEdit> {
    let mut plan: Vec<PlannedEdit> = (0..probabilities.len())
        .map(|position| {
            let row = probabilities.row(position);
            let tag = pick(row, strategy, rng)
                .and_then(EditTag::from_channel)
                .unwrap_or(EditTag::Keep);
            PlannedEdit::new(tag)
        })
        .collect();
    coerce_boundaries(&mut plan);
    plan
}

/// Picks one token per slot row; channel 0 is padding and never chosen.
pub fn sample_slot_tokens<R: Rng + ?Sized>(
    rows: &[Vec<f64>],
    strategy: SamplingStrategy,
    rng: &mut R,
) -> Result<Vec<TokenId>> {
    let mut tokens = Vec::with_capacity(rows.len());
    for (slot, row) in rows.iter().enumerate() {
        let Some(normalized) = normalize_without_null(row) else {
            bail!("slot distribution {slot} has no mass outside the padding channel");
        };
        let Some(index) = pick(&normalized, strategy, rng) else {
            bail!("slot distribution {slot} has no finite entries");
        };
        let token = TokenId::try_from(index)?;
        tokens.push(token);
    }
    Ok(tokens)
}
