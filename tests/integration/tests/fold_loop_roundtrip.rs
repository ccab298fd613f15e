use std::path::Path;
use std::sync::Arc;

use rise_store::{load_cache_snapshot, InMemorySampleStore, Phase, SampleStore, SampleStoreError};
use rise_trainer::fixtures::ScriptedEditModel;
use rise_trainer::{
    load_fold_checkpoint, EditGenerator, FoldScheduler, GenerationRecord, InMemoryTelemetry,
    JsonlTelemetryWriter, RlTrainerConfig, TelemetryEvent,
};
use rise_types::SamplingStrategy;
use serde_json::json;

fn corpus(count: u32) -> Vec<(Vec<u32>, Vec<u32>)> {
    (0..count)
        .map(|index| {
            let base = 20 + index * 3;
            (
                vec![base, base + 1, base + 2],
                vec![base, base + 9, base + 2, base + 5],
            )
        })
        .collect()
}

fn config(root: &Path, overrides: serde_json::Value) -> RlTrainerConfig {
    let mut raw = json!({
        "batch_size": 2,
        "train_fold": 4,
        "sample_fold": 4,
        "rl_epoch": 2,
        "rl_begin_epoch": 1,
        "candidates_per_pair": 3,
        "seed": 11,
        "run_id": "e2e",
        "checkpoint_dir": root.join("checkpoints").display().to_string(),
        "cache_dir": root.join("cache").display().to_string(),
    });
    if let (Some(base), Some(extra)) = (raw.as_object_mut(), overrides.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    RlTrainerConfig::from_json(&raw).expect("config")
}

#[tokio::test]
async fn rise_run_converges_every_sample_and_persists_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let telemetry_path = temp.path().join("telemetry.jsonl");
    let store = Arc::new(InMemorySampleStore::from_pairs(corpus(8)));
    let mut scheduler = FoldScheduler::new(
        config(temp.path(), json!({})),
        ScriptedEditModel::default(),
        store.clone(),
        JsonlTelemetryWriter::open(&telemetry_path).expect("telemetry"),
    )
    .expect("scheduler");

    let summary = scheduler.run().await.expect("run");

    let sampled_folds: Vec<u64> = summary
        .folds
        .iter()
        .filter(|report| report.sampling.is_some())
        .map(|report| report.fold)
        .collect();
    assert_eq!(sampled_folds, vec![5, 6, 7, 8]);
    assert_eq!(summary.sampling.failures, 0);
    assert_eq!(summary.sampling.draws, 3 * summary.sampling.pairs);

    // The four sampling windows of the second epoch cover the whole corpus.
    let indices = store.all_indices().await.expect("indices");
    for snapshot in store.snapshots(&indices).await.expect("snapshots") {
        assert_eq!(snapshot.current, snapshot.target);
    }

    let checkpoint = load_fold_checkpoint(&summary.checkpoints[1]).expect("checkpoint");
    assert_eq!(checkpoint.epoch, 2);
    assert_eq!(checkpoint.fold, 8);
    assert_eq!(checkpoint.lamb, 1.0);
    assert_eq!(checkpoint.model_state["forward_calls"], json!(8));

    let snapshot = load_cache_snapshot(&summary.cache_snapshots[0]).expect("cache snapshot");
    assert_eq!(snapshot.round, 4);
    assert!(snapshot
        .samples
        .iter()
        .flat_map(|sample| sample.history.iter())
        .all(|entry| entry.strategy == SamplingStrategy::Rise));

    let raw = std::fs::read_to_string(&telemetry_path).expect("telemetry log");
    let events: Vec<TelemetryEvent> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("event"))
        .collect();
    let gen_steps: Vec<u64> = events
        .iter()
        .filter(|event| event.tag == "gen_loss")
        .map(|event| event.step)
        .collect();
    assert_eq!(gen_steps, vec![1, 2]);
    assert_eq!(
        events
            .iter()
            .filter(|event| event.tag == "mean_edit_distance")
            .count(),
        4
    );
}

#[tokio::test]
async fn multinomial_run_keeps_target_lengths_after_bootstrap() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(InMemorySampleStore::from_pairs(corpus(6)));
    let mut scheduler = FoldScheduler::new(
        config(
            temp.path(),
            json!({ "sampling_strategy": "multinomial", "rl_begin_epoch": 0, "rl_epoch": 1 }),
        ),
        ScriptedEditModel::default(),
        store.clone(),
        InMemoryTelemetry::new(),
    )
    .expect("scheduler");

    let summary = scheduler.run().await.expect("run");
    assert!(summary.bootstrap.is_some());
    assert!(summary.folds.iter().all(|report| report.sampling.is_some()));
    assert!(summary.cache_snapshots[0].ends_with("cache_iter_1.multinomial.json"));

    let exported = store.export_cache().await.expect("export");
    for sample in exported.samples {
        assert_eq!(sample.current_output_query.len(), sample.output_query.len());
        assert!(sample
            .history
            .iter()
            .all(|entry| entry.strategy == SamplingStrategy::Multinomial));
    }
}

#[tokio::test]
async fn resumed_run_continues_from_saved_epoch_and_dumps_generations() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut first = FoldScheduler::new(
        config(temp.path(), json!({ "rl_begin_epoch": 0, "rl_epoch": 1 })),
        ScriptedEditModel::default(),
        Arc::new(InMemorySampleStore::from_pairs(corpus(4))),
        InMemoryTelemetry::new(),
    )
    .expect("scheduler");
    first.run().await.expect("first run");

    let store = Arc::new(InMemorySampleStore::from_pairs(corpus(4)));
    let resumed_config = config(
        temp.path(),
        json!({ "rl_begin_epoch": 0, "rl_epoch": 2, "load_epoch": 1, "tune_epoch": 2 }),
    );
    let mut resumed = FoldScheduler::new(
        resumed_config.clone(),
        ScriptedEditModel::default(),
        store.clone(),
        InMemoryTelemetry::new(),
    )
    .expect("scheduler");
    let summary = resumed.run().await.expect("resumed run");

    assert_eq!(summary.resumed_from, Some(1));
    assert_eq!(
        summary.folds.iter().map(|report| report.fold).collect::<Vec<_>>(),
        vec![5, 6, 7, 8]
    );
    // Unfreezes only once epoch 2 closes.
    assert_eq!(resumed.model().unfreeze_rates.len(), 1);
    assert_eq!(store.round().await, 8);

    let exported = store.export_cache().await.expect("export");
    let dump = temp.path().join("generated/eval.json");
    let records = EditGenerator::from_config(&resumed_config)
        .generate_mld(resumed.model(), &exported.samples, &dump)
        .await
        .expect("generate");
    assert_eq!(records.len(), 4);
    let decoded: Vec<GenerationRecord> =
        serde_json::from_str(&std::fs::read_to_string(&dump).expect("read")).expect("decode");
    assert_eq!(decoded[0].gen_queries.len(), resumed_config.max_gen_times);
}

#[tokio::test]
async fn held_phase_guard_blocks_the_fold_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(InMemorySampleStore::from_pairs(corpus(4)));
    let _held = store
        .phase_gate()
        .try_enter(Phase::Sample)
        .expect("sample guard");

    let error = FoldScheduler::new(
        config(temp.path(), json!({})),
        ScriptedEditModel::default(),
        store.clone(),
        InMemoryTelemetry::new(),
    )
    .expect("scheduler")
    .run()
    .await
    .expect_err("phase conflict");
    assert!(matches!(
        error.downcast_ref::<SampleStoreError>(),
        Some(SampleStoreError::PhaseConflict {
            requested: Phase::Train,
            active: Some(Phase::Sample),
        })
    ));
}
