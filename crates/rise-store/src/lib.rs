//! Sample store abstractions and in-memory backend.

use async_trait::async_trait;
use chrono::Utc;
use rise_types::{
    CacheHistoryEntry, CacheRecord, PlannedEntry, Sample, SampleSnapshot, SamplingStrategy,
    SlotRequest,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

mod phase;
mod snapshot;

pub use phase::{Phase, PhaseGate, PhaseGuard};
pub use snapshot::{
    cache_snapshot_path, load_cache_snapshot, save_cache_snapshot, CacheSnapshot,
    CURRENT_SNAPSHOT_VERSION,
};

/// Result type for sample store operations.
pub type StoreResult<T> = Result<T, SampleStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum SampleStoreError {
    #[error("sample {0} not found")]
    SampleNotFound(usize),
    #[error("sample at position {position} carries index {index}")]
    MisplacedSample { position: usize, index: usize },
    #[error("cache record for sample {0} staged twice in one round")]
    DuplicateRecord(usize),
    #[error("cannot enter {requested} phase while {active:?} phase is active")]
    PhaseConflict {
        requested: Phase,
        active: Option<Phase>,
    },
    #[error("cache updates require the sample phase, guard holds {0}")]
    WrongPhase(Phase),
    #[error("phase guard was issued by another store")]
    ForeignGuard,
    #[error("planned entry for sample {sample_index} expects {expected} positions, found {actual}")]
    PlanShapeMismatch {
        sample_index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("cache snapshot {0} does not exist")]
    SnapshotAbsent(PathBuf),
    #[error("unsupported cache snapshot version {0}")]
    UnsupportedSnapshotVersion(u32),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of committing one round of staged cache records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCommit {
    pub round: u64,
    pub committed: usize,
}

/// Async store contract used by the fold scheduler and cache coordinator.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Gate guarding the train/sample barrier of this store.
    fn phase_gate(&self) -> &PhaseGate;

    async fn sample_count(&self) -> StoreResult<usize>;
    async fn all_indices(&self) -> StoreResult<Vec<usize>>;
    /// Immutable views of the requested samples, in request order.
    async fn snapshots(&self, indices: &[usize]) -> StoreResult<Vec<SampleSnapshot>>;

    /// Stages records for the next commit; nothing is visible until
    /// [`SampleStore::update_cache`].
    async fn add_cache(&self, records: Vec<CacheRecord>) -> StoreResult<usize>;
    async fn update_cache(
        &self,
        guard: &PhaseGuard,
        strategy: SamplingStrategy,
    ) -> StoreResult<CacheCommit>;
    async fn discard_staged(&self) -> StoreResult<usize>;

    /// Builds slot-generation inputs for planned entries.
    async fn load_sample_prob_action(
        &self,
        entries: &[PlannedEntry],
    ) -> StoreResult<Vec<SlotRequest>>;

    async fn export_cache(&self) -> StoreResult<CacheSnapshot>;
    async fn restore_cache(&self, snapshot: CacheSnapshot) -> StoreResult<()>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemorySampleStore {
    inner: RwLock<StoreInner>,
    gate: PhaseGate,
}

#[derive(Debug, Default)]
struct StoreInner {
    samples: Vec<Sample>,
    staged: BTreeMap<usize, CacheRecord>,
    round: u64,
}

impl InMemorySampleStore {
    /// Creates a store; each sample's index must equal its position.
    pub fn new(samples: Vec<Sample>) -> StoreResult<Self> {
        check_positions(&samples)?;
        Ok(Self {
            inner: RwLock::new(StoreInner {
                samples,
                ..StoreInner::default()
            }),
            gate: PhaseGate::new(),
        })
    }

    /// Creates a store from `(input, output)` query pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u32>, Vec<u32>)>,
    {
        let samples = pairs
            .into_iter()
            .enumerate()
            .map(|(index, (input, output))| Sample::new(index, input, output))
            .collect();
        Self {
            inner: RwLock::new(StoreInner {
                samples,
                ..StoreInner::default()
            }),
            gate: PhaseGate::new(),
        }
    }

    pub async fn staged_count(&self) -> usize {
        self.inner.read().await.staged.len()
    }

    pub async fn round(&self) -> u64 {
        self.inner.read().await.round
    }
}

fn check_positions(samples: &[Sample]) -> StoreResult<()> {
    for (position, sample) in samples.iter().enumerate() {
        if sample.index != position {
            return Err(SampleStoreError::MisplacedSample {
                position,
                index: sample.index,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    fn phase_gate(&self) -> &PhaseGate {
        &self.gate
    }

    async fn sample_count(&self) -> StoreResult<usize> {
        Ok(self.inner.read().await.samples.len())
    }

    async fn all_indices(&self) -> StoreResult<Vec<usize>> {
        let inner = self.inner.read().await;
        Ok(inner.samples.iter().map(|sample| sample.index).collect())
    }

    async fn snapshots(&self, indices: &[usize]) -> StoreResult<Vec<SampleSnapshot>> {
        let inner = self.inner.read().await;
        indices
            .iter()
            .map(|index| {
                inner
                    .samples
                    .get(*index)
                    .map(|sample| sample.snapshot(inner.round))
                    .ok_or(SampleStoreError::SampleNotFound(*index))
            })
            .collect()
    }

    async fn add_cache(&self, records: Vec<CacheRecord>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut seen = std::collections::BTreeSet::new();
        for record in &records {
            if record.sample_index >= inner.samples.len() {
                return Err(SampleStoreError::SampleNotFound(record.sample_index));
            }
            if inner.staged.contains_key(&record.sample_index) || !seen.insert(record.sample_index)
            {
                return Err(SampleStoreError::DuplicateRecord(record.sample_index));
            }
        }
        let staged = records.len();
        for record in records {
            inner.staged.insert(record.sample_index, record);
        }
        Ok(staged)
    }

    #[tracing::instrument(skip_all, fields(strategy = %strategy))]
    async fn update_cache(
        &self,
        guard: &PhaseGuard,
        strategy: SamplingStrategy,
    ) -> StoreResult<CacheCommit> {
        if !self.gate.issued(guard) {
            return Err(SampleStoreError::ForeignGuard);
        }
        if guard.phase() != Phase::Sample {
            return Err(SampleStoreError::WrongPhase(guard.phase()));
        }

        let mut inner = self.inner.write().await;
        inner.round += 1;
        let round = inner.round;
        let staged = std::mem::take(&mut inner.staged);
        let committed_at = Utc::now();
        let committed = staged.len();
        for (index, record) in staged {
            // add_cache rejected unknown indices and restore_cache clears staging.
            let Some(sample) = inner.samples.get_mut(index) else {
                continue;
            };
            sample.current_output_query = record.new_query.into();
            sample.history.push(CacheHistoryEntry {
                round,
                strategy,
                edits: record.edits,
                committed_at,
            });
        }
        tracing::debug!(round, committed, "committed cache round");
        Ok(CacheCommit { round, committed })
    }

    async fn discard_staged(&self) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let discarded = inner.staged.len();
        inner.staged.clear();
        Ok(discarded)
    }

    async fn load_sample_prob_action(
        &self,
        entries: &[PlannedEntry],
    ) -> StoreResult<Vec<SlotRequest>> {
        let inner = self.inner.read().await;
        entries
            .iter()
            .map(|entry| {
                let sample = inner
                    .samples
                    .get(entry.sample_index)
                    .ok_or(SampleStoreError::SampleNotFound(entry.sample_index))?;
                let expected = sample.current_output_query.len() + 2;
                for actual in [entry.extended_input.len(), entry.plan.len()] {
                    if actual != expected {
                        return Err(SampleStoreError::PlanShapeMismatch {
                            sample_index: entry.sample_index,
                            expected,
                            actual,
                        });
                    }
                }
                Ok(SlotRequest {
                    sample_index: entry.sample_index,
                    extended_input: entry.extended_input.clone(),
                    plan: entry.plan.clone(),
                })
            })
            .collect()
    }

    async fn export_cache(&self) -> StoreResult<CacheSnapshot> {
        let inner = self.inner.read().await;
        Ok(CacheSnapshot::new(inner.round, inner.samples.clone()))
    }

    async fn restore_cache(&self, snapshot: CacheSnapshot) -> StoreResult<()> {
        check_positions(&snapshot.samples)?;
        let mut inner = self.inner.write().await;
        inner.samples = snapshot.samples;
        inner.round = snapshot.round;
        inner.staged.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemorySampleStore, Phase, SampleStore, SampleStoreError};
    use rise_types::{
        CacheRecord, EditAction, EditTag, MergedAction, PlannedEdit, PlannedEntry,
        SamplingStrategy,
    };

    fn append_record(sample_index: usize, new_query: Vec<u32>) -> CacheRecord {
        let edits = MergedAction::from_spans(vec![
            rise_types::ActionSpan::unit(0, &EditAction::Keep),
            rise_types::ActionSpan::unit(1, &EditAction::Insert(vec![3])),
        ])
        .expect("edits");
        CacheRecord {
            edits,
            new_query,
            sample_index,
        }
    }

    fn store() -> InMemorySampleStore {
        InMemorySampleStore::from_pairs([
            (vec![], vec![3]),
            (vec![4], vec![4, 5]),
            (vec![6, 7], vec![6]),
        ])
    }

    #[tokio::test]
    async fn snapshots_follow_request_order() {
        let store = store();
        assert_eq!(store.sample_count().await.expect("count"), 3);
        assert_eq!(store.all_indices().await.expect("indices"), vec![0, 1, 2]);

        let snapshots = store.snapshots(&[2, 0]).await.expect("snapshots");
        assert_eq!(snapshots[0].index, 2);
        assert_eq!(&*snapshots[0].current, &[6, 7]);
        assert_eq!(snapshots[1].index, 0);

        let error = store.snapshots(&[5]).await.expect_err("missing");
        assert!(matches!(error, SampleStoreError::SampleNotFound(5)));
    }

    #[tokio::test]
    async fn staged_records_stay_invisible_until_commit() {
        let store = store();
        store
            .add_cache(vec![append_record(0, vec![3])])
            .await
            .expect("stage");

        let before = store.snapshots(&[0]).await.expect("snapshot");
        assert!(before[0].current.is_empty());

        let guard = store.phase_gate().try_enter(Phase::Sample).expect("sample phase");
        let commit = store
            .update_cache(&guard, SamplingStrategy::Rise)
            .await
            .expect("commit");
        assert_eq!(commit.round, 1);
        assert_eq!(commit.committed, 1);
        drop(guard);

        let after = store.snapshots(&[0]).await.expect("snapshot");
        assert_eq!(&*after[0].current, &[3]);
        assert_eq!(after[0].round, 1);
        assert_eq!(store.staged_count().await, 0);

        let exported = store.export_cache().await.expect("export");
        assert_eq!(exported.samples[0].history.len(), 1);
        assert_eq!(exported.samples[0].history[0].strategy, SamplingStrategy::Rise);
        // Samples without a staged record are left exactly as they were.
        for (index, current) in [(1, vec![4]), (2, vec![6, 7])] {
            let sample = exported
                .samples
                .iter()
                .find(|sample| sample.index == index)
                .expect("sample");
            assert_eq!(&*sample.current_output_query, current.as_slice());
            assert!(sample.history.is_empty());
        }
    }

    #[tokio::test]
    async fn commit_requires_sample_guard_from_same_store() {
        let store = store();
        let train = store.phase_gate().try_enter(Phase::Train).expect("train phase");
        let error = store
            .update_cache(&train, SamplingStrategy::Rise)
            .await
            .expect_err("wrong phase");
        assert!(matches!(error, SampleStoreError::WrongPhase(Phase::Train)));
        drop(train);

        let other = InMemorySampleStore::default();
        let foreign = other.phase_gate().try_enter(Phase::Sample).expect("sample");
        let error = store
            .update_cache(&foreign, SamplingStrategy::Rise)
            .await
            .expect_err("foreign guard");
        assert!(matches!(error, SampleStoreError::ForeignGuard));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_records_are_rejected_without_staging() {
        let store = store();
        let error = store
            .add_cache(vec![append_record(1, vec![4, 5]), append_record(1, vec![4])])
            .await
            .expect_err("duplicate");
        assert!(matches!(error, SampleStoreError::DuplicateRecord(1)));
        assert_eq!(store.staged_count().await, 0);

        let error = store
            .add_cache(vec![append_record(9, vec![])])
            .await
            .expect_err("unknown");
        assert!(matches!(error, SampleStoreError::SampleNotFound(9)));

        store
            .add_cache(vec![append_record(1, vec![4, 5])])
            .await
            .expect("stage");
        assert_eq!(store.discard_staged().await.expect("discard"), 1);
        assert_eq!(store.staged_count().await, 0);
    }

    #[tokio::test]
    async fn slot_requests_check_plan_shape() {
        let store = store();
        let plan = vec![
            PlannedEdit::new(EditTag::Keep),
            PlannedEdit::new(EditTag::Keep),
            PlannedEdit::new(EditTag::Insert),
        ];
        let requests = store
            .load_sample_prob_action(&[PlannedEntry {
                plan: plan.clone(),
                extended_input: vec![100, 4, 101],
                sample_index: 1,
            }])
            .await
            .expect("requests");
        assert_eq!(requests[0].slot_count(), 1);

        let error = store
            .load_sample_prob_action(&[PlannedEntry {
                plan,
                extended_input: vec![100, 101],
                sample_index: 0,
            }])
            .await
            .expect_err("shape");
        assert!(matches!(
            error,
            SampleStoreError::PlanShapeMismatch {
                sample_index: 0,
                expected: 2,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn restore_replaces_samples_and_clears_staging() {
        let store = store();
        let mut snapshot = store.export_cache().await.expect("export");
        snapshot.round = 7;
        snapshot.samples[2].current_output_query = vec![6].into();

        store
            .add_cache(vec![append_record(0, vec![3])])
            .await
            .expect("stage");
        store.restore_cache(snapshot).await.expect("restore");

        assert_eq!(store.round().await, 7);
        assert_eq!(store.staged_count().await, 0);
        let restored = store.snapshots(&[2]).await.expect("snapshot");
        assert_eq!(&*restored[0].current, &[6]);
    }
}
