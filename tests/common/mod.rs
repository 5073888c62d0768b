//! Scripted collaborators for decode scenario tests
//!
//! The layer cache is the lane's own token history, recovered from the query
//! unit at every step, and the classifier scores whatever history the layer
//! hands it. A cache that drifts away from its hypothesis therefore changes
//! the scores the decoder sees.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use s2s_decode::{
    Classifier, DecodeError, DecodeResult, DecoderModel, Embedder, EncoderMemory, LayerMemory,
    LayerStep, PositionEncoder,
};

pub const PAD: u32 = 0;
pub const SOS: u32 = 1;
pub const EOS: u32 = 2;
pub const A: u32 = 3;
pub const B: u32 = 4;
pub const VOCAB: usize = 5;

/// Model width; also bounds the history a layer can encode
pub const WIDTH: usize = 16;
const SCALE: f32 = 4.0;

/// One-hot-ish embedding: the token id in slot 0
pub struct TokenEmbedder;

impl Embedder for TokenEmbedder {
    fn dim(&self) -> usize {
        WIDTH
    }

    fn start(&self) -> Vec<f32> {
        let mut unit = vec![0.0; WIDTH];
        unit[0] = -1.0;
        unit
    }

    fn embed(&self, token: u32) -> DecodeResult<Vec<f32>> {
        if token as usize >= VOCAB {
            return Err(DecodeError::Model(format!("token {token} out of range")));
        }
        let mut unit = vec![0.0; WIDTH];
        unit[0] = token as f32;
        Ok(unit)
    }
}

pub struct ZeroPositions;

impl PositionEncoder for ZeroPositions {
    fn encode(&self, _step: usize, dim: usize) -> Vec<f32> {
        vec![0.0; dim]
    }
}

fn decode_token(unit: &[f32]) -> Option<u32> {
    let value = unit[0] / SCALE;
    (value >= 0.0).then(|| value.round() as u32)
}

fn encode_history(history: &[u32]) -> DecodeResult<Vec<f32>> {
    if history.len() >= WIDTH {
        return Err(DecodeError::Model("history too long to encode".into()));
    }
    let mut out = vec![-1.0; WIDTH];
    out[0] = history.len() as f32;
    for (slot, &token) in out[1..].iter_mut().zip(history) {
        *slot = token as f32;
    }
    Ok(out)
}

/// Layer whose cache is the token history of its lane
pub struct HistoryLayer;

impl LayerStep for HistoryLayer {
    type Cache = Vec<u32>;

    fn forward(
        &self,
        _memory: LayerMemory<'_>,
        input: &[f32],
        _tgt_mask: Option<&[f32]>,
    ) -> DecodeResult<Vec<f32>> {
        let mut history = Vec::new();
        let mut out = Vec::with_capacity(input.len());
        for unit in input.chunks_exact(WIDTH) {
            if let Some(token) = decode_token(unit) {
                history.push(token);
            }
            out.extend(encode_history(&history)?);
        }
        Ok(out)
    }

    fn step(
        &self,
        _memory: LayerMemory<'_>,
        cache: Option<Self::Cache>,
        query: &[f32],
        concat_query: bool,
    ) -> DecodeResult<(Vec<f32>, Self::Cache)> {
        let mut history = cache.unwrap_or_default();
        if concat_query {
            if let Some(token) = decode_token(query) {
                history.push(token);
            }
        }
        Ok((encode_history(&history)?, history))
    }
}

pub type Script = Box<dyn Fn(&[u32]) -> Vec<f32> + Send + Sync>;

/// Classifier that scores the history encoded by [`HistoryLayer`]
pub struct ScriptedClassifier {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for ScriptedClassifier {
    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn log_probs(&self, hidden: &[f32]) -> DecodeResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let len = hidden[0] as usize;
        let history: Vec<u32> = hidden[1..=len].iter().map(|&v| v as u32).collect();
        Ok((self.script)(&history))
    }
}

pub type ScriptedModel =
    DecoderModel<HistoryLayer, TokenEmbedder, ZeroPositions, ScriptedClassifier>;

pub fn scripted_model<F>(script: F) -> ScriptedModel
where
    F: Fn(&[u32]) -> Vec<f32> + Send + Sync + 'static,
{
    let classifier = ScriptedClassifier {
        script: Box::new(script),
        calls: AtomicUsize::new(0),
    };
    DecoderModel::new(vec![HistoryLayer], TokenEmbedder, ZeroPositions, classifier)
        .expect("scripted model")
}

pub fn memory(batch: usize) -> EncoderMemory {
    EncoderMemory::new(
        batch,
        1,
        WIDTH,
        vec![vec![0.0; batch * WIDTH]],
        vec![vec![0.0; batch * WIDTH]],
    )
    .expect("memory")
}

/// Log-prob row with the given entries and -10 elsewhere
pub fn row(entries: &[(u32, f32)]) -> Vec<f32> {
    let mut out = vec![-10.0; VOCAB];
    for &(token, log_prob) in entries {
        out[token as usize] = log_prob;
    }
    out
}

/// Deterministic, history-dependent scores in (-3.01, -0.01]
pub fn hashed_script(history: &[u32]) -> Vec<f32> {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &token in history {
        h ^= u64::from(token) + 1;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    (0..VOCAB as u64)
        .map(|v| {
            let x = h.wrapping_add(v.wrapping_mul(0x9e37_79b9_7f4a_7c15));
            let x = (x ^ (x >> 29)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            -((x >> 40) as f32 / (1_u64 << 24) as f32) * 3.0 - 0.01
        })
        .collect()
}

/// Score of `tokens` under `script`, stopping after the first EOS
pub fn replay_score(script: impl Fn(&[u32]) -> Vec<f32>, tokens: &[u32]) -> f32 {
    let mut score = 0.0_f32;
    for (i, &token) in tokens.iter().enumerate() {
        score += script(&tokens[..i])[token as usize];
        if token == EOS {
            break;
        }
    }
    score
}
