//! Edit-probability rows as consumed by the aligner.

use anyhow::{bail, Result};
use rise_types::{EditAction, EditTag, EDIT_CHANNELS, NULL_CHANNEL};

/// Per-position edit-type distribution over the extended input.
///
/// Channel [`NULL_CHANNEL`] is always zero and the remaining channels of a
/// finite row sum to one.
#[derive(Debug, Clone, PartialEq)]
pub struct EditProbabilityMatrix {
    rows: Vec<[f64; EDIT_CHANNELS]>,
}

impl EditProbabilityMatrix {
    /// Normalizes the first `positions` rows of a model output block.
    ///
    /// Rows past `positions` are padding and ignored. Non-finite entries, and
    /// rows whose only mass sits in the null channel, come out as NaN so that
    /// downstream sampling can detect the degenerate distribution.
    #[tracing::instrument(level = "debug", skip(rows), fields(row_count = rows.len()))]
    pub fn from_probabilities(rows: &[Vec<f64>], positions: usize) -> Result<Self> {
        if rows.len() < positions {
            bail!(
                "edit probability shape mismatch: expected at least {positions} rows, found {}",
                rows.len()
            );
        }

        let mut normalized = Vec::with_capacity(positions);
        for (index, row) in rows.iter().take(positions).enumerate() {
            if row.len() != EDIT_CHANNELS {
                bail!(
                    "edit probability shape mismatch: row {index} has {} channels, expected {EDIT_CHANNELS}",
                    row.len()
                );
            }
            if row.iter().any(|value| *value < 0.0) {
                bail!("edit probability row {index} contains a negative entry");
            }
            let mut channels = [0.0; EDIT_CHANNELS];
            channels.copy_from_slice(row);
            channels[NULL_CHANNEL] = 0.0;
            let mass: f64 = channels.iter().sum();
            if mass == 0.0 {
                // 0/0: the row becomes NaN and every draw through it degenerates.
                channels[1..].fill(f64::NAN);
            } else if mass.is_finite() {
                for value in channels.iter_mut().skip(1) {
                    *value /= mass;
                }
            }
            normalized.push(channels);
        }
        Ok(Self { rows: normalized })
    }

    /// Uniform distribution over the four edit tags.
    pub fn uniform(positions: usize) -> Self {
        let mut row = [0.25; EDIT_CHANNELS];
        row[NULL_CHANNEL] = 0.0;
        Self {
            rows: vec![row; positions],
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, position: usize) -> &[f64; EDIT_CHANNELS] {
        &self.rows[position]
    }

    pub fn probability(&self, position: usize, tag: EditTag) -> f64 {
        self.rows[position][tag.channel()]
    }

    /// Sum of `ln(min_prob + p)` over the tags an action list assigns.
    pub fn log_likelihood(&self, actions: &[EditAction], min_prob: f64) -> f64 {
        actions
            .iter()
            .enumerate()
            .take(self.rows.len())
            .map(|(position, action)| (min_prob + self.probability(position, action.tag())).ln())
            .sum()
    }
}

/// Zeroes the reserved channel of a distribution and renormalizes the rest.
///
/// Returns `None` when no finite positive mass remains.
pub fn normalize_without_null(row: &[f64]) -> Option<Vec<f64>> {
    let mut normalized = row.to_vec();
    if let Some(null) = normalized.get_mut(NULL_CHANNEL) {
        *null = 0.0;
    }
    let mass: f64 = normalized.iter().sum();
    if !mass.is_finite() || mass <= 0.0 || normalized.iter().any(|value| *value < 0.0) {
        return None;
    }
    for value in &mut normalized {
        *value /= mass;
    }
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::{normalize_without_null, EditProbabilityMatrix};
    use rise_types::{EditAction, EditTag, EDIT_CHANNELS, NULL_CHANNEL};

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-12,
            "actual={actual}, expected={expected}"
        );
    }

    #[test]
    fn rows_are_renormalized_after_zeroing_null_channel() {
        let rows = vec![
            vec![0.5, 0.1, 0.1, 0.1, 0.2],
            vec![0.0, 2.0, 1.0, 1.0, 0.0],
            vec![0.9, 0.0, 0.0, 0.0, 0.1],
        ];
        let matrix = EditProbabilityMatrix::from_probabilities(&rows, 3).expect("normalize");

        for position in 0..matrix.len() {
            let row = matrix.row(position);
            assert_eq!(row[NULL_CHANNEL], 0.0);
            assert_close(row.iter().sum::<f64>(), 1.0);
        }
        assert_close(matrix.probability(0, EditTag::Substitute), 0.4);
        assert_close(matrix.probability(1, EditTag::Keep), 0.5);
        assert_close(matrix.probability(2, EditTag::Substitute), 1.0);
    }

    #[test]
    fn padding_rows_are_ignored_and_short_blocks_rejected() {
        let rows = vec![vec![0.0, 1.0, 0.0, 0.0, 0.0]; 6];
        let matrix = EditProbabilityMatrix::from_probabilities(&rows, 4).expect("normalize");
        assert_eq!(matrix.len(), 4);

        let error = EditProbabilityMatrix::from_probabilities(&rows, 7).expect_err("too short");
        assert!(error.to_string().contains("shape mismatch"));
    }

    #[test]
    fn rows_with_wrong_width_or_negative_entries_are_rejected() {
        let narrow = vec![vec![0.5; EDIT_CHANNELS - 1]];
        assert!(EditProbabilityMatrix::from_probabilities(&narrow, 1).is_err());

        let negative = vec![vec![0.0, -0.1, 0.5, 0.3, 0.3]];
        assert!(EditProbabilityMatrix::from_probabilities(&negative, 1).is_err());
    }

    #[test]
    fn nan_rows_propagate_instead_of_failing() {
        let rows = vec![vec![0.0, f64::NAN, 0.2, 0.2, 0.2]];
        let matrix = EditProbabilityMatrix::from_probabilities(&rows, 1).expect("normalize");
        assert!(matrix.probability(0, EditTag::Keep).is_nan());
    }

    #[test]
    fn null_only_rows_become_nan() {
        let rows = vec![
            vec![1.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let matrix = EditProbabilityMatrix::from_probabilities(&rows, 2).expect("normalize");
        for position in 0..2 {
            assert_eq!(matrix.row(position)[NULL_CHANNEL], 0.0);
            assert!(EditTag::ALL
                .iter()
                .all(|tag| matrix.probability(position, *tag).is_nan()));
        }
    }

    #[test]
    fn log_likelihood_sums_tag_probabilities() {
        let matrix = EditProbabilityMatrix::uniform(3);
        let actions = vec![EditAction::Keep, EditAction::Delete, EditAction::Keep];
        assert_close(matrix.log_likelihood(&actions, 0.0), 3.0 * 0.25f64.ln());
    }

    #[test]
    fn normalize_without_null_handles_degenerate_rows() {
        let normalized = normalize_without_null(&[3.0, 1.0, 3.0]).expect("mass");
        assert_close(normalized[0], 0.0);
        assert_close(normalized[1], 0.25);
        assert_close(normalized[2], 0.75);
        assert!(normalize_without_null(&[1.0, 0.0]).is_none());
        assert!(normalize_without_null(&[0.0, f64::NAN]).is_none());
    }
}
