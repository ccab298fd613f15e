//! Turns model predictions into staged cache records.

use anyhow::{bail, Context, Result};
use rand::Rng;
use rise_align::{
    argmax_index, merge_tags, reassign_credit, sample_slot_tokens, sample_tags, ActionSampler,
    AlignerConfig, EditProbabilityMatrix, PathSampler, SamplingStats, SequenceAligner,
};
use rise_types::{
    fill_plan, strip_boundaries, CacheRecord, PlannedEntry, SampleSnapshot, SamplingStrategy,
    TokenId, WaitEntry,
};
use std::collections::BTreeSet;

/// Builds candidate actions and cache records for one sampling round.
#[derive(Debug, Clone)]
pub struct CacheCoordinator {
    aligner: SequenceAligner,
    sampler: ActionSampler,
    strategy: SamplingStrategy,
    bos: TokenId,
    eos: TokenId,
}

impl CacheCoordinator {
    pub fn new(
        aligner: AlignerConfig,
        candidates_per_pair: usize,
        strategy: SamplingStrategy,
        bos: TokenId,
        eos: TokenId,
    ) -> Result<Self> {
        Ok(Self {
            aligner: SequenceAligner::new(aligner)?,
            sampler: ActionSampler::new(candidates_per_pair)?,
            strategy,
            bos,
            eos,
        })
    }

    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy
    }

    /// Draws `L` merged candidates per snapshot from the alignment between its
    /// current and target queries.
    #[tracing::instrument(level = "debug", skip_all, fields(snapshots = snapshots.len()))]
    pub fn sample_action<P: PathSampler + ?Sized>(
        &self,
        snapshots: &[SampleSnapshot],
        edit_rows: &[Vec<Vec<f64>>],
        paths: &mut P,
        stats: &mut SamplingStats,
    ) -> Result<Vec<WaitEntry>> {
        check_row_blocks(snapshots.len(), edit_rows.len())?;

        let mut entries = Vec::with_capacity(snapshots.len());
        for (snapshot, rows) in snapshots.iter().zip(edit_rows) {
            let extended_input = snapshot.extended_current(self.bos, self.eos);
            let probabilities = EditProbabilityMatrix::from_probabilities(rows, extended_input.len())
                .with_context(|| format!("edit rows for sample {}", snapshot.index))?;
            let matrix = self
                .aligner
                .align(&snapshot.current, &snapshot.target, &probabilities)?;
            let candidates = self.sampler.sample_candidates(&matrix, paths, stats)?;
            entries.push(WaitEntry {
                candidates,
                extended_input,
                sample_index: snapshot.index,
            });
        }
        Ok(entries)
    }

    /// Log-likelihood of every candidate under the model rows, `[entries][L]`.
    pub fn selection_scores(
        &self,
        entries: &[WaitEntry],
        edit_rows: &[Vec<Vec<f64>>],
    ) -> Result<Vec<Vec<f64>>> {
        check_row_blocks(entries.len(), edit_rows.len())?;
        let min_prob = self.aligner.config().min_prob;
        entries
            .iter()
            .zip(edit_rows)
            .map(|(entry, rows)| -> Result<Vec<f64>> {
                let probabilities =
                    EditProbabilityMatrix::from_probabilities(rows, entry.extended_input.len())?;
                Ok(entry
                    .candidates
                    .iter()
                    .map(|candidate| probabilities.log_likelihood(&candidate.expand(), min_prob))
                    .collect())
            })
            .collect()
    }

    /// Applies the highest-scoring candidate of every entry.
    #[tracing::instrument(level = "debug", skip_all, fields(entries = entries.len()))]
    pub fn obtain_cache(
        &self,
        action_prob: &[Vec<f64>],
        entries: &[WaitEntry],
    ) -> Result<Vec<CacheRecord>> {
        if action_prob.len() != entries.len() {
            bail!(
                "selection shape mismatch: {} score rows for {} entries",
                action_prob.len(),
                entries.len()
            );
        }

        let mut seen = BTreeSet::new();
        let mut records = Vec::with_capacity(entries.len());
        for (scores, entry) in action_prob.iter().zip(entries) {
            if scores.len() != entry.candidates.len() {
                bail!(
                    "selection shape mismatch for sample {}: {} scores for {} candidates",
                    entry.sample_index,
                    scores.len(),
                    entry.candidates.len()
                );
            }
            if !seen.insert(entry.sample_index) {
                bail!("sample {} appears twice in one round", entry.sample_index);
            }
            // All-NaN scores fall back to the first candidate.
            let selected = argmax_index(scores).unwrap_or(0);
            let edits = entry.candidates[selected].clone();
            let new_query = strip_boundaries(edits.apply(&entry.extended_input)?);
            records.push(CacheRecord {
                edits,
                new_query,
                sample_index: entry.sample_index,
            });
        }
        Ok(records)
    }

    /// Tag plans for the greedy/multinomial path, corrected to the target
    /// length.
    #[tracing::instrument(level = "debug", skip_all, fields(snapshots = snapshots.len()))]
    pub fn sample_greedy<R: Rng + ?Sized>(
        &self,
        snapshots: &[SampleSnapshot],
        edit_rows: &[Vec<Vec<f64>>],
        rng: &mut R,
    ) -> Result<Vec<PlannedEntry>> {
        check_row_blocks(snapshots.len(), edit_rows.len())?;

        let mut entries = Vec::with_capacity(snapshots.len());
        for (snapshot, rows) in snapshots.iter().zip(edit_rows) {
            let extended_input = snapshot.extended_current(self.bos, self.eos);
            let probabilities = EditProbabilityMatrix::from_probabilities(rows, extended_input.len())
                .with_context(|| format!("edit rows for sample {}", snapshot.index))?;
            let mut plan = sample_tags(&probabilities, self.strategy, rng);
            reassign_credit(&snapshot.current, &snapshot.target, &mut plan)?;
            entries.push(PlannedEntry {
                plan,
                extended_input,
                sample_index: snapshot.index,
            });
        }
        Ok(entries)
    }

    /// Fills every plan with tokens drawn from its slot distributions.
    #[tracing::instrument(level = "debug", skip_all, fields(entries = entries.len()))]
    pub fn obtain_cache_greedy<R: Rng + ?Sized>(
        &self,
        slot_rows: &[Vec<Vec<f64>>],
        entries: &[PlannedEntry],
        rng: &mut R,
    ) -> Result<Vec<CacheRecord>> {
        if slot_rows.len() != entries.len() {
            bail!(
                "slot shape mismatch: {} row blocks for {} entries",
                slot_rows.len(),
                entries.len()
            );
        }

        let mut seen = BTreeSet::new();
        let mut records = Vec::with_capacity(entries.len());
        for (rows, entry) in slot_rows.iter().zip(entries) {
            if !seen.insert(entry.sample_index) {
                bail!("sample {} appears twice in one round", entry.sample_index);
            }
            let slots = rise_types::slot_count(&entry.plan);
            if rows.len() < slots {
                bail!(
                    "slot shape mismatch for sample {}: expected {slots} rows, found {}",
                    entry.sample_index,
                    rows.len()
                );
            }
            let tokens = sample_slot_tokens(&rows[..slots], self.strategy, rng)?;
            let actions = fill_plan(&entry.plan, &tokens)?;
            let edits = merge_tags(&actions)?;
            let new_query = strip_boundaries(edits.apply(&entry.extended_input)?);
            records.push(CacheRecord {
                edits,
                new_query,
                sample_index: entry.sample_index,
            });
        }
        Ok(records)
    }
}

fn check_row_blocks(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        bail!("edit row shape mismatch: expected {expected} row blocks, found {actual}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::CacheCoordinator;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rise_align::{AlignerConfig, RandomPathSampler, SamplingStats};
    use rise_types::{
        EditAction, EditTag, PlannedEdit, PlannedEntry, Sample, SampleSnapshot, SamplingStrategy,
        WaitEntry,
    };

    const BOS: u32 = 100;
    const EOS: u32 = 101;

    fn coordinator(candidates: usize, strategy: SamplingStrategy) -> CacheCoordinator {
        CacheCoordinator::new(AlignerConfig::default(), candidates, strategy, BOS, EOS)
            .expect("coordinator")
    }

    fn snapshot(index: usize, current: Vec<u32>, target: Vec<u32>) -> SampleSnapshot {
        Sample::new(index, current, target).snapshot(0)
    }

    fn uniform_rows(positions: usize) -> Vec<Vec<f64>> {
        vec![vec![0.0, 0.25, 0.25, 0.25, 0.25]; positions]
    }

    #[test]
    fn rise_round_produces_target_queries() {
        let coordinator = coordinator(3, SamplingStrategy::Rise);
        let snapshots = vec![
            snapshot(0, vec![5, 6, 7], vec![5, 8, 7]),
            snapshot(1, vec![1, 2], vec![1, 2, 3]),
        ];
        let rows = vec![uniform_rows(6), uniform_rows(5)];
        let mut paths = RandomPathSampler::new(ChaCha8Rng::seed_from_u64(1));
        let mut stats = SamplingStats::default();

        let entries = coordinator
            .sample_action(&snapshots, &rows, &mut paths, &mut stats)
            .expect("sample");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.candidates.len() == 3));
        assert_eq!(entries[1].extended_input, vec![BOS, 1, 2, EOS]);
        assert_eq!(stats.pairs, 2);
        assert_eq!(stats.draws, 6);

        let scores = coordinator
            .selection_scores(&entries, &rows)
            .expect("scores");
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].len(), 3);

        let records = coordinator.obtain_cache(&scores, &entries).expect("cache");
        assert_eq!(records[0].new_query, vec![5, 8, 7]);
        assert_eq!(records[1].new_query, vec![1, 2, 3]);
        assert_eq!(records[1].sample_index, 1);
    }

    #[test]
    fn null_only_row_degenerates_every_draw_but_still_yields_a_record() {
        let coordinator = coordinator(3, SamplingStrategy::Rise);
        let snapshots = vec![snapshot(0, vec![5, 6, 7], vec![5, 8, 7])];
        let mut rows = uniform_rows(5);
        rows[2] = vec![1.0, 0.0, 0.0, 0.0, 0.0];
        let rows = vec![rows];
        let mut paths = RandomPathSampler::new(ChaCha8Rng::seed_from_u64(9));
        let mut stats = SamplingStats::default();

        let entries = coordinator
            .sample_action(&snapshots, &rows, &mut paths, &mut stats)
            .expect("degenerate rows are not an error");
        assert_eq!(stats.pairs, 1);
        assert_eq!(stats.draws, 3);
        assert_eq!(stats.failures, 3);
        assert_eq!(entries[0].candidates.len(), 3);

        let scores = coordinator
            .selection_scores(&entries, &rows)
            .expect("scores");
        let records = coordinator.obtain_cache(&scores, &entries).expect("cache");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].new_query, vec![5, 8, 7]);
    }

    #[test]
    fn row_block_count_must_match_snapshots() {
        let coordinator = coordinator(1, SamplingStrategy::Rise);
        let snapshots = vec![snapshot(0, vec![1], vec![2])];
        let mut paths = RandomPathSampler::new(ChaCha8Rng::seed_from_u64(1));
        let error = coordinator
            .sample_action(&snapshots, &[], &mut paths, &mut SamplingStats::default())
            .expect_err("shape");
        assert!(error.to_string().contains("shape mismatch"));
    }

    #[test]
    fn obtain_cache_picks_first_best_and_rejects_bad_shapes() {
        let coordinator = coordinator(2, SamplingStrategy::Rise);
        let keep = rise_align::merge_tags(&[EditAction::Keep, EditAction::Keep, EditAction::Keep])
            .expect("keep");
        let delete =
            rise_align::merge_tags(&[EditAction::Keep, EditAction::Delete, EditAction::Keep])
                .expect("delete");
        let entry = WaitEntry {
            candidates: vec![delete, keep],
            extended_input: vec![BOS, 9, EOS],
            sample_index: 4,
        };

        let records = coordinator
            .obtain_cache(&[vec![-1.0, -1.0]], std::slice::from_ref(&entry))
            .expect("tie");
        assert!(records[0].new_query.is_empty());

        let records = coordinator
            .obtain_cache(&[vec![-3.0, -1.0]], std::slice::from_ref(&entry))
            .expect("best");
        assert_eq!(records[0].new_query, vec![9]);

        assert!(coordinator
            .obtain_cache(&[vec![0.0]], std::slice::from_ref(&entry))
            .is_err());
        assert!(coordinator.obtain_cache(&[], std::slice::from_ref(&entry)).is_err());
        let error = coordinator
            .obtain_cache(&[vec![0.0, 0.0], vec![0.0, 0.0]], &[entry.clone(), entry])
            .expect_err("duplicate");
        assert!(error.to_string().contains("twice"));
    }

    #[test]
    fn greedy_round_fills_plans_to_target_length() {
        let coordinator = coordinator(1, SamplingStrategy::Greedy);
        let snapshots = vec![snapshot(0, vec![1, 2], vec![1, 2, 3, 4])];
        let keep_rows = vec![vec![0.0, 0.7, 0.1, 0.1, 0.1]; 4];
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let entries = coordinator
            .sample_greedy(&snapshots, &[keep_rows], &mut rng)
            .expect("plans");
        let plan = &entries[0].plan;
        assert_eq!(rise_types::implied_output_len(plan), 4);
        assert_eq!(plan[0], PlannedEdit::new(EditTag::Keep));

        let slots = rise_types::slot_count(plan);
        let slot_rows = vec![vec![vec![0.0, 0.0, 0.0, 0.0, 1.0]; slots]];
        let records = coordinator
            .obtain_cache_greedy(&slot_rows, &entries, &mut rng)
            .expect("records");
        assert_eq!(records[0].new_query.len(), 4);
        assert_eq!(records[0].sample_index, 0);
    }

    #[test]
    fn greedy_cache_rejects_missing_slot_rows() {
        let coordinator = coordinator(1, SamplingStrategy::Multinomial);
        let entry = PlannedEntry {
            plan: vec![
                PlannedEdit::new(EditTag::Keep),
                PlannedEdit::new(EditTag::Substitute),
                PlannedEdit::new(EditTag::Keep),
            ],
            extended_input: vec![BOS, 7, EOS],
            sample_index: 0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let error = coordinator
            .obtain_cache_greedy(&[vec![]], std::slice::from_ref(&entry), &mut rng)
            .expect_err("slots");
        assert!(error.to_string().contains("slot shape mismatch"));

        let records = coordinator
            .obtain_cache_greedy(&[vec![vec![0.0, 0.0, 1.0]]], &[entry], &mut rng)
            .expect("records");
        assert_eq!(records[0].new_query, vec![2]);
    }
}
