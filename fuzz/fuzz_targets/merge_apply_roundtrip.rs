#![no_main]

use libfuzzer_sys::fuzz_target;
use rise_align::{merge_spans, EditProbabilityMatrix, SequenceAligner};
use rise_types::{extend_with_boundaries, strip_boundaries};

const BOS: u32 = 101;
const EOS: u32 = 102;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let rest = &rest[..rest.len().min(64)];
    let split = usize::from(split) % (rest.len() + 1);
    // Small alphabet keeps KEEP moves reachable.
    let seq_a: Vec<u32> = rest[..split].iter().map(|byte| u32::from(byte % 8)).collect();
    let seq_b: Vec<u32> = rest[split..].iter().map(|byte| u32::from(byte % 8)).collect();

    let aligner = SequenceAligner::default();
    let probabilities = EditProbabilityMatrix::uniform(seq_a.len() + 2);
    let matrix = aligner
        .align(&seq_a, &seq_b, &probabilities)
        .expect("uniform rows always align");
    let merged = rise_align::ActionSampler::new(1)
        .and_then(|sampler| sampler.greedy_candidate(&matrix))
        .expect("greedy path merges");

    let extended = extend_with_boundaries(BOS, &seq_a, EOS);
    let applied = merged.apply(&extended).expect("merged action applies");
    assert_eq!(strip_boundaries(applied), seq_b);

    let remerged = merge_spans(merged.clone().into_spans()).expect("re-merge");
    assert_eq!(remerged, merged);
});
