//! Deterministic [`EditModel`] used by unit and integration tests.

use crate::model::{EditModel, GeneratedSequence, GenerationQuery, StepLosses, TrainBatch};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rise_align::edit_distance;
use rise_types::{EditTag, SampleSnapshot, SlotRequest, TokenId, EDIT_CHANNELS};
use serde_json::{json, Value};
use std::collections::VecDeque;

/// Scripted model: favors KEEP, predicts `slot_token` for every slot and
/// records every mutating call.
#[derive(Debug, Clone)]
pub struct ScriptedEditModel {
    /// Generation losses returned by successive `forward` calls; 1.0 once
    /// drained.
    pub gen_losses: VecDeque<f64>,
    /// Extra rows appended to every predicted row block.
    pub padding_rows: usize,
    pub slot_token: TokenId,
    pub vocab_size: usize,
    /// Stopping score reported by `generate`.
    pub stopping_score: Option<f64>,
    /// `forward` fails once it has been called more than this many times.
    pub fail_after_forward_calls: Option<usize>,
    pub forward_calls: usize,
    pub backward_losses: Vec<f64>,
    pub optimizer_steps: usize,
    pub unfreeze_rates: Vec<f64>,
    pub lambs: Vec<f64>,
    pub restored_forward_calls: Option<usize>,
}

impl Default for ScriptedEditModel {
    fn default() -> Self {
        Self {
            gen_losses: VecDeque::new(),
            padding_rows: 1,
            slot_token: 7,
            vocab_size: 16,
            stopping_score: None,
            fail_after_forward_calls: None,
            forward_calls: 0,
            backward_losses: Vec::new(),
            optimizer_steps: 0,
            unfreeze_rates: Vec::new(),
            lambs: Vec::new(),
            restored_forward_calls: None,
        }
    }
}

fn keep_favoring_row() -> Vec<f64> {
    let mut row = vec![0.0; EDIT_CHANNELS];
    for tag in EditTag::ALL {
        row[tag.channel()] = if tag == EditTag::Keep { 0.4 } else { 0.2 };
    }
    row
}

#[async_trait]
impl EditModel for ScriptedEditModel {
    async fn edit_predict(&self, snapshots: &[SampleSnapshot]) -> Result<Vec<Vec<Vec<f64>>>> {
        Ok(snapshots
            .iter()
            .map(|snapshot| vec![keep_favoring_row(); snapshot.current.len() + 2 + self.padding_rows])
            .collect())
    }

    async fn slot_predict(&self, requests: &[SlotRequest]) -> Result<Vec<Vec<Vec<f64>>>> {
        let slot = self.slot_token as usize;
        if slot == 0 || slot >= self.vocab_size {
            bail!("scripted slot token {slot} is outside the vocabulary");
        }
        let mut row = vec![0.01; self.vocab_size];
        row[slot] = 1.0;
        Ok(requests
            .iter()
            .map(|request| vec![row.clone(); request.slot_count() + self.padding_rows])
            .collect())
    }

    async fn forward(&mut self, batch: &TrainBatch) -> Result<StepLosses> {
        self.forward_calls += 1;
        if let Some(limit) = self.fail_after_forward_calls {
            if self.forward_calls > limit {
                bail!("scripted forward failure after {limit} calls");
            }
        }
        self.lambs.push(batch.lamb);
        let distance: usize = batch
            .snapshots
            .iter()
            .map(|snapshot| edit_distance(&snapshot.current, &snapshot.target))
            .sum();
        Ok(StepLosses {
            gen_loss: self.gen_losses.pop_front().unwrap_or(1.0),
            edit_loss: 0.5,
            score_loss: batch.compute_stopping_score.then_some(0.25),
            reward: -(distance as f64) / batch.snapshots.len().max(1) as f64,
        })
    }

    async fn backward(&mut self, scaled_loss: f64) -> Result<()> {
        self.backward_losses.push(scaled_loss);
        Ok(())
    }

    async fn optimizer_step(&mut self) -> Result<()> {
        self.optimizer_steps += 1;
        Ok(())
    }

    async fn unfreeze(&mut self, learning_rate: f64) -> Result<()> {
        self.unfreeze_rates.push(learning_rate);
        Ok(())
    }

    async fn export_state(&self) -> Result<Value> {
        Ok(json!({
            "forward_calls": self.forward_calls,
            "optimizer_steps": self.optimizer_steps,
        }))
    }

    async fn restore_state(&mut self, state: &Value) -> Result<()> {
        let forward_calls = state
            .get("forward_calls")
            .and_then(Value::as_u64)
            .context("scripted model state is missing 'forward_calls'")?;
        self.restored_forward_calls = Some(usize::try_from(forward_calls)?);
        Ok(())
    }

    /// Drops the last token of every non-trivial query.
    async fn generate(&self, queries: &[GenerationQuery]) -> Result<Vec<GeneratedSequence>> {
        Ok(queries
            .iter()
            .map(|query| {
                let len = query.input_query.len();
                let keep = if len > 1 { len - 1 } else { len };
                let mut edit_tags = vec![EditTag::Keep; len + 2];
                if keep < len {
                    edit_tags[len] = EditTag::Delete;
                }
                GeneratedSequence {
                    sample_index: query.sample_index,
                    input_query: query.input_query.clone(),
                    gen_query: query.input_query[..keep].to_vec(),
                    edit_tags,
                    stopping_score: self.stopping_score,
                }
            })
            .collect())
    }
}
