//! Multi-turn edit generation over an evaluation set.

use crate::config::RlTrainerConfig;
use crate::model::{EditModel, GenerationQuery};
use anyhow::{bail, Context, Result};
use rise_types::{EditTag, Sample, TokenId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument};

/// Every turn generated for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub sample_index: usize,
    pub input_query: Vec<TokenId>,
    pub output_query: Vec<TokenId>,
    /// Query recorded per turn.
    pub gen_queries: Vec<Vec<TokenId>>,
    pub edit_tags: Vec<Vec<EditTag>>,
    /// Present only when stopping scores are enabled.
    pub stopping_scores: Vec<f64>,
}

/// Runs `max_gen_times` generation turns, feeding each turn's output into
/// the next.
#[derive(Debug, Clone, PartialEq)]
pub struct EditGenerator {
    pub max_gen_times: usize,
    pub batch_size: usize,
    pub use_stopping_score: bool,
    pub stopping_threshold: f64,
}

impl EditGenerator {
    pub fn from_config(config: &RlTrainerConfig) -> Self {
        Self {
            max_gen_times: config.max_gen_times,
            batch_size: config.sample_batch_size(),
            use_stopping_score: config.use_stopping_score,
            stopping_threshold: config.stopping_threshold,
        }
    }

    #[instrument(level = "debug", skip_all, fields(samples = samples.len(), turns = self.max_gen_times))]
    pub async fn gen_epoch<M: EditModel + ?Sized>(
        &self,
        model: &M,
        samples: &[Sample],
    ) -> Result<Vec<GenerationRecord>> {
        if self.batch_size == 0 {
            bail!("generation batch size must be >= 1");
        }

        let mut records: Vec<GenerationRecord> = samples
            .iter()
            .map(|sample| GenerationRecord {
                sample_index: sample.index,
                input_query: sample.input_query.to_vec(),
                output_query: sample.output_query.to_vec(),
                gen_queries: Vec::with_capacity(self.max_gen_times),
                edit_tags: Vec::with_capacity(self.max_gen_times),
                stopping_scores: Vec::new(),
            })
            .collect();
        let mut inputs: Vec<Vec<TokenId>> = samples
            .iter()
            .map(|sample| sample.input_query.to_vec())
            .collect();

        for turn in 1..=self.max_gen_times {
            for chunk_start in (0..samples.len()).step_by(self.batch_size) {
                let chunk_end = (chunk_start + self.batch_size).min(samples.len());
                let queries: Vec<GenerationQuery> = (chunk_start..chunk_end)
                    .map(|position| GenerationQuery {
                        sample_index: samples[position].index,
                        input_query: inputs[position].clone(),
                    })
                    .collect();
                let generated = model.generate(&queries).await?;
                if generated.len() != queries.len() {
                    bail!(
                        "generation shape mismatch in turn {turn}: {} outputs for {} queries",
                        generated.len(),
                        queries.len()
                    );
                }

                for (offset, sequence) in generated.into_iter().enumerate() {
                    let position = chunk_start + offset;
                    if sequence.sample_index != samples[position].index {
                        bail!(
                            "generation returned sample {} where {} was expected",
                            sequence.sample_index,
                            samples[position].index
                        );
                    }
                    let record = &mut records[position];
                    record.edit_tags.push(sequence.edit_tags);

                    let mut stop = false;
                    if self.use_stopping_score {
                        let score = sequence.stopping_score.with_context(|| {
                            format!(
                                "model returned no stopping score for sample {}",
                                sequence.sample_index
                            )
                        })?;
                        record.stopping_scores.push(score);
                        stop = score <= self.stopping_threshold;
                    }
                    record.gen_queries.push(if stop {
                        sequence.input_query
                    } else {
                        sequence.gen_query.clone()
                    });
                    inputs[position] = sequence.gen_query;
                }
            }
            tracing::debug!(turn, "generation turn finished");
        }
        Ok(records)
    }

    /// Runs [`Self::gen_epoch`] and writes the records as JSON to `path`.
    #[instrument(skip(self, model, samples), fields(path = %path.display()))]
    pub async fn generate_mld<M: EditModel + ?Sized>(
        &self,
        model: &M,
        samples: &[Sample],
        path: &Path,
    ) -> Result<Vec<GenerationRecord>> {
        let records = self.gen_epoch(model, samples).await?;
        let bytes =
            serde_json::to_vec_pretty(&records).context("failed to encode generation records")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create generation directory {}", parent.display())
            })?;
        }
        let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&temp_path, bytes)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("failed to move generation dump to {}", path.display()))?;
        info!(path = %path.display(), records = records.len(), "generated data saved");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::{EditGenerator, GenerationRecord};
    use crate::fixtures::ScriptedEditModel;
    use rise_types::Sample;
    use tempfile::tempdir;

    fn generator(use_stopping_score: bool) -> EditGenerator {
        EditGenerator {
            max_gen_times: 3,
            batch_size: 2,
            use_stopping_score,
            stopping_threshold: 0.5,
        }
    }

    fn samples() -> Vec<Sample> {
        vec![
            Sample::new(0, vec![1, 2, 3, 4], vec![1, 2]),
            Sample::new(1, vec![5], vec![5, 6]),
            Sample::new(2, vec![7, 8], vec![7]),
        ]
    }

    #[tokio::test]
    async fn each_turn_feeds_the_previous_output() {
        let records = generator(false)
            .gen_epoch(&ScriptedEditModel::default(), &samples())
            .await
            .expect("generate");

        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0].gen_queries,
            vec![vec![1, 2, 3], vec![1, 2], vec![1]]
        );
        assert_eq!(records[1].gen_queries, vec![vec![5]; 3]);
        assert_eq!(records[2].edit_tags.len(), 3);
        assert!(records.iter().all(|record| record.stopping_scores.is_empty()));
    }

    #[tokio::test]
    async fn low_stopping_score_records_the_turn_input() {
        let model = ScriptedEditModel {
            stopping_score: Some(0.5),
            ..ScriptedEditModel::default()
        };
        let records = generator(true)
            .gen_epoch(&model, &samples())
            .await
            .expect("generate");
        // The recorded query stays at the turn input while the next turn
        // still consumes the generated query.
        assert_eq!(
            records[0].gen_queries,
            vec![vec![1, 2, 3, 4], vec![1, 2, 3], vec![1, 2]]
        );
        assert_eq!(records[0].stopping_scores, vec![0.5; 3]);

        let missing = generator(true)
            .gen_epoch(&ScriptedEditModel::default(), &samples())
            .await
            .expect_err("missing score");
        assert!(missing.to_string().contains("no stopping score"));
    }

    #[tokio::test]
    async fn generate_mld_writes_records_as_json() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("gen/eval.json");
        let records = generator(false)
            .generate_mld(&ScriptedEditModel::default(), &samples(), &path)
            .await
            .expect("generate");

        let raw = std::fs::read_to_string(&path).expect("read");
        let decoded: Vec<GenerationRecord> = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded, records);
    }
}
