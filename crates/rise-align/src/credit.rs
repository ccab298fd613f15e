//! Target-length credit reassignment for tag plans.
//!
//! A sampled tag plan rarely implies an output of exactly the target length.
//! The positions that disagree with an unbiased reference alignment are the
//! ones the model is least sure about, so length corrections land there first.

use crate::aligner::{AlignerConfig, SequenceAligner};
use crate::probability::EditProbabilityMatrix;
use crate::sampler::path_to_actions;
use anyhow::{bail, Result};
use rise_types::{implied_output_len, EditAction, EditTag, PlannedEdit, TokenId};

/// How a plan was changed to hit the target length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditAdjustment {
    Unchanged,
    Grown { position: usize, by: usize },
    Shrunk { positions: Vec<usize>, by: usize },
}

/// Maximal run of positions whose planned edit disagrees with the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MismatchRun {
    start: usize,
    len: usize,
}

impl MismatchRun {
    fn last(&self) -> usize {
        self.start + self.len - 1
    }
}

/// Converts a boundary-inclusive action list into its tag plan.
pub fn plan_from_actions(actions: &[EditAction]) -> Vec<PlannedEdit> {
    actions
        .iter()
        .map(|action| PlannedEdit {
            tag: action.tag(),
            width: action.payload().len(),
        })
        .collect()
}

/// Plan of the cost-minimal unbiased alignment from `seq_a` to `seq_b`.
#[tracing::instrument(level = "debug", skip_all, fields(len_a = seq_a.len(), len_b = seq_b.len()))]
pub fn reference_plan(seq_a: &[TokenId], seq_b: &[TokenId]) -> Result<Vec<PlannedEdit>> {
    let aligner = SequenceAligner::new(AlignerConfig {
        bias_weight: 0.0,
        ..AlignerConfig::default()
    })?;
    let matrix = aligner.align(
        seq_a,
        seq_b,
        &EditProbabilityMatrix::uniform(seq_a.len() + 2),
    )?;
    Ok(plan_from_actions(&path_to_actions(
        &matrix.greedy_path(),
        seq_a.len(),
    )))
}

/// Forces BOS to keep and EOS to keep or insert.
pub fn coerce_boundaries(plan: &mut [PlannedEdit]) {
    let Some(last) = plan.len().checked_sub(1) else {
        return;
    };
    plan[0] = PlannedEdit::new(EditTag::Keep);
    if last == 0 {
        return;
    }
    let eos = &mut plan[last];
    match eos.tag {
        EditTag::Delete => *eos = PlannedEdit::new(EditTag::Keep),
        EditTag::Substitute => eos.tag = EditTag::Insert,
        EditTag::Keep | EditTag::Insert => {}
    }
}

/// Corrects `plan` in place so that it implies exactly `len(seq_b)` output
/// tokens.
#[tracing::instrument(level = "debug", skip_all, fields(len_a = seq_a.len(), len_b = seq_b.len()))]
pub fn reassign_credit(
    seq_a: &[TokenId],
    seq_b: &[TokenId],
    plan: &mut [PlannedEdit],
) -> Result<CreditAdjustment> {
    let positions = seq_a.len() + 2;
    if plan.len() != positions {
        bail!(
            "credit plan shape mismatch: expected {positions} positions, found {}",
            plan.len()
        );
    }
    coerce_boundaries(plan);

    let implied = implied_output_len(plan);
    let target = seq_b.len();
    if implied == target {
        return Ok(CreditAdjustment::Unchanged);
    }

    let reference = reference_plan(seq_a, seq_b)?;
    let mut runs = mismatch_runs(plan, &reference);
    runs.sort_by_key(|run| (run.len, run.start));

    if implied < target {
        let by = target - implied;
        // Only the EOS insertion remains when every position already agrees.
        let position = runs.first().map_or(positions - 1, MismatchRun::last);
        grow(&mut plan[position], by);
        tracing::debug!(position, by, "grew plan to target length");
        return Ok(CreditAdjustment::Grown { position, by });
    }

    let by = implied - target;
    let mut excess = by;
    let mut touched = Vec::new();
    let in_runs = runs
        .iter()
        .flat_map(|run| (run.start..=run.last()).rev());
    let remaining = (1..positions).rev();
    for position in in_runs.chain(remaining) {
        if excess == 0 {
            break;
        }
        let boundary = position == positions - 1;
        let mut changed = false;
        while excess > 0 && shrink_one(&mut plan[position], boundary) {
            excess -= 1;
            changed = true;
        }
        if changed && !touched.contains(&position) {
            touched.push(position);
        }
    }
    if excess > 0 {
        bail!("credit plan cannot shrink by {by}: {excess} tokens left over");
    }
    tracing::debug!(by, positions = touched.len(), "shrank plan to target length");
    Ok(CreditAdjustment::Shrunk {
        positions: touched,
        by,
    })
}

fn mismatch_runs(plan: &[PlannedEdit], reference: &[PlannedEdit]) -> Vec<MismatchRun> {
    let mut runs: Vec<MismatchRun> = Vec::new();
    for (position, (planned, expected)) in plan.iter().zip(reference).enumerate() {
        if planned == expected {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.last() + 1 == position => run.len += 1,
            _ => runs.push(MismatchRun { start: position, len: 1 }),
        }
    }
    runs
}

fn grow(edit: &mut PlannedEdit, by: usize) {
    match edit.tag {
        EditTag::Keep => {
            *edit = PlannedEdit {
                tag: EditTag::Insert,
                width: by,
            }
        }
        EditTag::Delete => {
            *edit = PlannedEdit {
                tag: EditTag::Substitute,
                width: by,
            }
        }
        EditTag::Insert | EditTag::Substitute => edit.width += by,
    }
}

/// Removes one output token from `edit`; returns false when nothing is left
/// to remove.
fn shrink_one(edit: &mut PlannedEdit, boundary: bool) -> bool {
    if edit.width == 0 {
        match edit.tag {
            EditTag::Insert => *edit = PlannedEdit::new(EditTag::Keep),
            EditTag::Substitute => *edit = PlannedEdit::new(EditTag::Delete),
            EditTag::Keep | EditTag::Delete => {}
        }
    }
    match edit.tag {
        EditTag::Insert | EditTag::Substitute if edit.width > 1 => edit.width -= 1,
        EditTag::Insert => *edit = PlannedEdit::new(EditTag::Keep),
        EditTag::Substitute => *edit = PlannedEdit::new(EditTag::Delete),
        EditTag::Keep if !boundary => *edit = PlannedEdit::new(EditTag::Delete),
        EditTag::Keep | EditTag::Delete => return false,
    }
    true
}
