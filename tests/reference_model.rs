//! Reference Model Tests
//!
//! Property-based checks of the reference decoder stack: incremental steps
//! against full-sequence passes, and beam output against teacher forcing.

use proptest::prelude::*;
use s2s_decode::inference::StepHarness;
use s2s_decode::model::{
    LayerNorm, ReferenceLayer, SinusoidalPositions, TableEmbedder, TiedClassifier,
};
use s2s_decode::{decode, DecodeConfig, DecoderModel, EncoderMemory};

// ============================================================================
// Helpers
// ============================================================================

const D_MODEL: usize = 8;
const VOCAB: usize = 12;
const SRC_LEN: usize = 5;

type RefModel = DecoderModel<ReferenceLayer, TableEmbedder, SinusoidalPositions, TiedClassifier>;

fn create_model(n_layers: usize, seed: u64) -> RefModel {
    let embedder = TableEmbedder::seeded(VOCAB, D_MODEL, seed);
    let classifier = TiedClassifier::from_embedder(&embedder);
    let layers = (0..n_layers)
        .map(|l| ReferenceLayer::seeded(D_MODEL, D_MODEL * 2, seed + 100 + l as u64))
        .collect();
    DecoderModel::new(layers, embedder, SinusoidalPositions::default(), classifier)
        .and_then(|model| model.with_input_norm(LayerNorm::new(D_MODEL)))
        .expect("model")
}

fn create_memory(batch: usize, n_layers: usize, seed: u64) -> EncoderMemory {
    let phase = seed as f32 * 0.17;
    let outputs = (0..n_layers)
        .map(|l| {
            (0..batch * SRC_LEN * D_MODEL)
                .map(|i| ((i + 13 * l) as f32 * 0.29 + phase).sin())
                .collect()
        })
        .collect();
    let hidden = (0..n_layers)
        .map(|l| {
            (0..batch * D_MODEL)
                .map(|i| ((i + 7 * l) as f32 * 0.43 + phase).cos() * 0.5)
                .collect()
        })
        .collect();
    EncoderMemory::new(batch, SRC_LEN, D_MODEL, outputs, hidden).expect("memory")
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Incremental decoding reproduces the full-sequence pass position by position
    #[test]
    fn incremental_matches_full_sequence(
        targets in prop::collection::vec(0u32..VOCAB as u32, 1..6),
        n_layers in 1usize..4,
        seed in 0u64..1000,
    ) {
        let model = create_model(n_layers, seed);
        let mem = create_memory(1, n_layers, seed);
        let harness = StepHarness::new(&model, &mem).expect("harness");

        let full = model.forward(&mem, 0, &targets).expect("forward");

        let mut caches = None;
        for pos in 0..targets.len() {
            let tokens = (pos > 0).then(|| &targets[pos - 1..pos]);
            let (log_probs, next) = harness.step(caches.take(), tokens, pos).expect("step");
            caches = Some(next);
            for (v, value) in log_probs.row(0).iter().enumerate() {
                prop_assert!((value - full[pos * VOCAB + v]).abs() < 1e-3);
            }
        }
    }

    /// Every reported beam scores the same under teacher forcing
    #[test]
    fn beam_scores_match_teacher_forcing(
        beam_width in 2usize..5,
        batch in 1usize..3,
        seed in 0u64..1000,
    ) {
        let model = create_model(2, seed);
        let mem = create_memory(batch, 2, seed);
        let config = DecodeConfig::default()
            .with_beam_width(beam_width)
            .with_max_len(6)
            .with_return_all(true)
            .with_stop_token(u32::MAX);

        let output = decode(&model, &mem, &config).expect("decode");
        prop_assert_eq!(output.beams.len(), batch);
        for (b, beam) in output.beams.iter().enumerate() {
            prop_assert_eq!(beam.len(), beam_width);
            for hyp in beam {
                let expected = model.score_sequence(&mem, b, &hyp.tokens).expect("score");
                prop_assert!((hyp.score - expected).abs() < 1e-3);
            }
        }
    }

    /// Repeated calls produce identical sequences and scores
    #[test]
    fn decode_is_deterministic(
        beam_width in 1usize..4,
        length_penalty in 0.0f32..1.5,
        seed in 0u64..1000,
    ) {
        let model = create_model(1, seed);
        let mem = create_memory(2, 1, seed);
        let config = DecodeConfig::default()
            .with_beam_width(beam_width)
            .with_max_len(5)
            .with_length_penalty(length_penalty)
            .with_stop_token(seed as u32 % VOCAB as u32);

        let first = decode(&model, &mem, &config).expect("first");
        let second = decode(&model, &mem, &config).expect("second");
        prop_assert_eq!(first, second);
    }
}

// ============================================================================
// Padding
// ============================================================================

#[test]
fn test_padded_source_positions_are_ignored() {
    let model = create_model(2, 3);
    let mask = vec![false, false, false, true, true];

    let clean = create_memory(1, 2, 3)
        .with_pad_mask(mask.clone())
        .expect("mask");

    // Same memory with garbage in the padded positions
    let phase = 3.0_f32 * 0.17;
    let outputs = (0..2)
        .map(|l| {
            (0..SRC_LEN * D_MODEL)
                .map(|i| {
                    if i / D_MODEL >= 3 {
                        1000.0
                    } else {
                        ((i + 13 * l) as f32 * 0.29 + phase).sin()
                    }
                })
                .collect()
        })
        .collect();
    let hidden = (0..2)
        .map(|l| {
            (0..D_MODEL)
                .map(|i| ((i + 7 * l) as f32 * 0.43 + phase).cos() * 0.5)
                .collect()
        })
        .collect();
    let noisy = EncoderMemory::new(1, SRC_LEN, D_MODEL, outputs, hidden)
        .expect("memory")
        .with_pad_mask(mask)
        .expect("mask");

    let config = DecodeConfig::default().with_beam_width(3).with_max_len(6);
    let a = decode(&model, &clean, &config).expect("clean");
    let b = decode(&model, &noisy, &config).expect("noisy");
    assert_eq!(a.best_sequences(), b.best_sequences());
}
