//! Decoder model surface
//!
//! The decoding engine treats the transformer internals as collaborators. This
//! module defines their contracts and the [`DecoderModel`] that bundles one
//! [`LayerStep`] per depth level with an [`Embedder`], a [`PositionEncoder`]
//! and a [`Classifier`].
//!
//! # Input unit
//!
//! Every decoder position starts from
//! `embed(token) * sqrt(d_model) + position(step)`, passed through the
//! optional input norm; at step 0 the embedder's start-of-sequence vector
//! stands in for a token embedding.
//!
//! # Modes
//!
//! - Full-sequence: [`DecoderModel::forward`] runs every layer over a whole
//!   target prefix under a causal mask (teacher forcing, scoring).
//! - Incremental: [`LayerStep::step`] consumes a single query unit and threads
//!   an opaque per-layer cache. The decoders in [`crate::inference`] only use
//!   this mode.

mod attention;
mod embedding;
mod layers;

pub use attention::{causal_mask, scaled_dot_product_attention, LinearWeights};
pub use embedding::{SinusoidalPositions, TableEmbedder, TiedClassifier};
pub use layers::{FeedForward, LayerNorm, ReferenceCache, ReferenceLayer};

use crate::error::{DecodeError, DecodeResult};

// ============================================================================
// Collaborator contracts
// ============================================================================

/// One decoder depth level
///
/// Implementations own the layout of their cache; the decoder only moves it
/// between steps and reorders it across lanes.
pub trait LayerStep: Send + Sync {
    /// Opaque incremental state for a single lane
    type Cache: Clone + Send + Sync;

    /// Full-sequence pass over `input` (seq_len x d_model)
    ///
    /// `tgt_mask` is an additive (seq_len x seq_len) mask, `-inf` for blocked
    /// positions.
    fn forward(
        &self,
        memory: LayerMemory<'_>,
        input: &[f32],
        tgt_mask: Option<&[f32]>,
    ) -> DecodeResult<Vec<f32>>;

    /// Incremental pass for one query unit (d_model)
    ///
    /// `cache` is `None` on the first step. When `concat_query` is set the
    /// query is appended to the cache before self-attention reads it. Returns
    /// the layer output and the extended cache.
    fn step(
        &self,
        memory: LayerMemory<'_>,
        cache: Option<Self::Cache>,
        query: &[f32],
        concat_query: bool,
    ) -> DecodeResult<(Vec<f32>, Self::Cache)>;
}

/// Token embedding table
pub trait Embedder: Send + Sync {
    /// Embedding width (d_model)
    fn dim(&self) -> usize;

    /// Start-of-sequence vector consumed at step 0
    fn start(&self) -> Vec<f32>;

    /// Embedding for a token id
    ///
    /// # Errors
    /// Returns [`DecodeError::Model`] if the token is outside the table
    fn embed(&self, token: u32) -> DecodeResult<Vec<f32>>;
}

/// Positional encoding added to the scaled embedding
pub trait PositionEncoder: Send + Sync {
    /// Position vector of width `dim` for decoder step `step`
    fn encode(&self, step: usize, dim: usize) -> Vec<f32>;
}

/// Output projection to log-probabilities
pub trait Classifier: Send + Sync {
    /// Number of vocabulary entries in each output row
    fn vocab_size(&self) -> usize;

    /// Log-probabilities (already log-softmaxed) for one hidden vector
    fn log_probs(&self, hidden: &[f32]) -> DecodeResult<Vec<f32>>;
}

// ============================================================================
// Encoder memory
// ============================================================================

/// Per-layer view of the encoder representation for one batch element
#[derive(Debug, Clone, Copy)]
pub struct LayerMemory<'a> {
    /// Encoder output (src_len x d_model)
    pub output: &'a [f32],
    /// Encoder hidden memo (d_model)
    pub hidden: &'a [f32],
    /// Source padding mask (src_len), `true` marks padding
    pub pad_mask: Option<&'a [bool]>,
    /// Source length
    pub src_len: usize,
}

/// Pre-computed encoder representation for a batch
///
/// Holds one output buffer and one hidden memo per decoder layer. Beam lanes
/// index into it by batch element; it is never repeated per beam.
#[derive(Debug, Clone)]
pub struct EncoderMemory {
    batch_size: usize,
    src_len: usize,
    d_model: usize,
    /// Per layer: batch x src_len x d_model
    outputs: Vec<Vec<f32>>,
    /// Per layer: batch x d_model
    hidden: Vec<Vec<f32>>,
    /// batch x src_len
    pad_mask: Option<Vec<bool>>,
}

impl EncoderMemory {
    /// Create encoder memory, validating every per-layer buffer
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] on an empty batch, an empty
    /// source, mismatched layer counts or buffers of the wrong size
    pub fn new(
        batch_size: usize,
        src_len: usize,
        d_model: usize,
        outputs: Vec<Vec<f32>>,
        hidden: Vec<Vec<f32>>,
    ) -> DecodeResult<Self> {
        if batch_size == 0 {
            return Err(DecodeError::InvalidShape("empty batch".into()));
        }
        if src_len == 0 || d_model == 0 {
            return Err(DecodeError::InvalidShape(format!(
                "src_len ({src_len}) and d_model ({d_model}) must be non-zero"
            )));
        }
        if outputs.len() != hidden.len() {
            return Err(DecodeError::InvalidShape(format!(
                "{} encoder outputs but {} hidden memos",
                outputs.len(),
                hidden.len()
            )));
        }

        let output_len = batch_size * src_len * d_model;
        let hidden_len = batch_size * d_model;
        for (layer, (out, memo)) in outputs.iter().zip(hidden.iter()).enumerate() {
            if out.len() != output_len {
                return Err(DecodeError::InvalidShape(format!(
                    "layer {layer} encoder output has {} values, expected {output_len}",
                    out.len()
                )));
            }
            if memo.len() != hidden_len {
                return Err(DecodeError::InvalidShape(format!(
                    "layer {layer} hidden memo has {} values, expected {hidden_len}",
                    memo.len()
                )));
            }
        }

        Ok(Self {
            batch_size,
            src_len,
            d_model,
            outputs,
            hidden,
            pad_mask: None,
        })
    }

    /// Attach a source padding mask (batch x src_len, `true` = padding)
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] if the mask length is wrong
    pub fn with_pad_mask(mut self, pad_mask: Vec<bool>) -> DecodeResult<Self> {
        let expected = self.batch_size * self.src_len;
        if pad_mask.len() != expected {
            return Err(DecodeError::InvalidShape(format!(
                "pad mask has {} entries, expected {expected}",
                pad_mask.len()
            )));
        }
        self.pad_mask = Some(pad_mask);
        Ok(self)
    }

    /// Batch size
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Source length
    #[must_use]
    pub const fn src_len(&self) -> usize {
        self.src_len
    }

    /// Model width
    #[must_use]
    pub const fn d_model(&self) -> usize {
        self.d_model
    }

    /// Number of per-layer buffers
    #[must_use]
    pub fn n_layers(&self) -> usize {
        self.outputs.len()
    }

    /// View of layer `layer` for batch element `batch`
    ///
    /// Callers index within the validated shape; `layer < n_layers()` and
    /// `batch < batch_size()`.
    #[must_use]
    pub fn layer(&self, layer: usize, batch: usize) -> LayerMemory<'_> {
        let out_stride = self.src_len * self.d_model;
        let out_start = batch * out_stride;
        let hid_start = batch * self.d_model;
        let pad_mask = self.pad_mask.as_deref().map(|mask| {
            let start = batch * self.src_len;
            &mask[start..start + self.src_len]
        });

        LayerMemory {
            output: &self.outputs[layer][out_start..out_start + out_stride],
            hidden: &self.hidden[layer][hid_start..hid_start + self.d_model],
            pad_mask,
            src_len: self.src_len,
        }
    }
}

// ============================================================================
// Decoder model
// ============================================================================

/// Decoder stack plus its embedding, position and output collaborators
#[derive(Debug, Clone)]
pub struct DecoderModel<L, E, P, K> {
    layers: Vec<L>,
    embedder: E,
    positions: P,
    classifier: K,
    embed_scale: f32,
    /// Applied to every input unit before the first layer
    input_norm: Option<LayerNorm>,
}

impl<L, E, P, K> DecoderModel<L, E, P, K>
where
    L: LayerStep,
    E: Embedder,
    P: PositionEncoder,
    K: Classifier,
{
    /// Assemble a decoder model
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] for an empty layer stack, a zero
    /// embedding width or an empty vocabulary
    pub fn new(layers: Vec<L>, embedder: E, positions: P, classifier: K) -> DecodeResult<Self> {
        if layers.is_empty() {
            return Err(DecodeError::InvalidShape("decoder has no layers".into()));
        }
        if embedder.dim() == 0 {
            return Err(DecodeError::InvalidShape("embedding width is zero".into()));
        }
        if classifier.vocab_size() == 0 {
            return Err(DecodeError::InvalidShape("vocabulary is empty".into()));
        }

        let embed_scale = (embedder.dim() as f32).sqrt();
        Ok(Self {
            layers,
            embedder,
            positions,
            classifier,
            embed_scale,
            input_norm: None,
        })
    }

    /// Normalize every input unit before it enters the layer stack
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] if the norm width is not the
    /// model width
    pub fn with_input_norm(mut self, norm: LayerNorm) -> DecodeResult<Self> {
        if norm.normalized_shape != self.d_model()
            || norm.weight.len() != self.d_model()
            || norm.bias.len() != self.d_model()
        {
            return Err(DecodeError::InvalidShape(format!(
                "input norm width {} does not match model width {}",
                norm.normalized_shape,
                self.d_model()
            )));
        }
        self.input_norm = Some(norm);
        Ok(self)
    }

    /// Decoder depth
    #[must_use]
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Model width
    #[must_use]
    pub fn d_model(&self) -> usize {
        self.embedder.dim()
    }

    /// Vocabulary size of the classifier
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.classifier.vocab_size()
    }

    /// Layer stack in depth order
    #[must_use]
    pub fn layers(&self) -> &[L] {
        &self.layers
    }

    /// Output projection
    #[must_use]
    pub fn classifier(&self) -> &K {
        &self.classifier
    }

    /// Check that `memory` was produced for this decoder
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] if the per-layer count or the
    /// model width differ
    pub fn check_memory(&self, memory: &EncoderMemory) -> DecodeResult<()> {
        if memory.n_layers() != self.n_layers() {
            return Err(DecodeError::InvalidShape(format!(
                "encoder memory has {} layers, decoder depth is {}",
                memory.n_layers(),
                self.n_layers()
            )));
        }
        if memory.d_model() != self.d_model() {
            return Err(DecodeError::InvalidShape(format!(
                "encoder width {} does not match decoder width {}",
                memory.d_model(),
                self.d_model()
            )));
        }
        Ok(())
    }

    /// Scaled embedding plus position for one decoder position
    ///
    /// `token = None` selects the start-of-sequence vector.
    ///
    /// # Errors
    /// Returns an error if the embedder rejects the token, or
    /// [`DecodeError::InvalidShape`] if the embedding or position vector is
    /// not `d_model` wide
    pub fn input_unit(&self, token: Option<u32>, step: usize) -> DecodeResult<Vec<f32>> {
        let dim = self.d_model();
        let mut unit = match token {
            Some(token) => self.embedder.embed(token)?,
            None => self.embedder.start(),
        };
        if unit.len() != dim {
            return Err(DecodeError::InvalidShape(format!(
                "embedding has {} values, expected {dim}",
                unit.len()
            )));
        }

        let position = self.positions.encode(step, dim);
        if position.len() != dim {
            return Err(DecodeError::InvalidShape(format!(
                "position encoding has {} values, expected {dim}",
                position.len()
            )));
        }
        for (u, p) in unit.iter_mut().zip(position.iter()) {
            *u = *u * self.embed_scale + p;
        }

        match &self.input_norm {
            Some(norm) => norm.forward(&unit),
            None => Ok(unit),
        }
    }

    /// Project one hidden vector to a checked log-probability row
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] for a row of the wrong width and
    /// [`DecodeError::Numeric`] if it contains NaN or `+inf`
    pub fn project(&self, hidden: &[f32]) -> DecodeResult<Vec<f32>> {
        let row = self.classifier.log_probs(hidden)?;
        let vocab = self.vocab_size();
        if row.len() != vocab {
            return Err(DecodeError::InvalidShape(format!(
                "classifier returned {} log-probs, vocabulary is {vocab}",
                row.len()
            )));
        }
        if let Some(bad) = row.iter().position(|v| v.is_nan() || *v == f32::INFINITY) {
            return Err(DecodeError::Numeric(format!(
                "classifier produced {} for token {bad}",
                row[bad]
            )));
        }
        Ok(row)
    }

    /// Full-sequence pass for one batch element (teacher forcing)
    ///
    /// Position `i` consumes the start vector when `i == 0` and `targets[i-1]`
    /// otherwise, so row `i` of the result scores `targets[i]`.
    ///
    /// # Returns
    /// Log-probabilities (targets.len() x vocab_size)
    ///
    /// # Errors
    /// Returns an error for an empty target, an out-of-range batch index or
    /// any collaborator failure
    pub fn forward(
        &self,
        memory: &EncoderMemory,
        batch: usize,
        targets: &[u32],
    ) -> DecodeResult<Vec<f32>> {
        self.check_memory(memory)?;
        if targets.is_empty() {
            return Err(DecodeError::InvalidShape("empty target sequence".into()));
        }
        if batch >= memory.batch_size() {
            return Err(DecodeError::InvalidShape(format!(
                "batch index {batch} out of range {}",
                memory.batch_size()
            )));
        }

        let seq_len = targets.len();
        let mut x = Vec::with_capacity(seq_len * self.d_model());
        for pos in 0..seq_len {
            let token = if pos == 0 { None } else { Some(targets[pos - 1]) };
            x.extend(self.input_unit(token, pos)?);
        }

        let mask = causal_mask(seq_len);
        for (depth, layer) in self.layers.iter().enumerate() {
            x = layer.forward(memory.layer(depth, batch), &x, Some(&mask))?;
        }

        let mut log_probs = Vec::with_capacity(seq_len * self.vocab_size());
        for hidden in x.chunks_exact(self.d_model()) {
            log_probs.extend(self.project(hidden)?);
        }
        Ok(log_probs)
    }

    /// Total log-probability of `targets` under teacher forcing
    ///
    /// # Errors
    /// Same conditions as [`DecoderModel::forward`], plus a target outside
    /// the vocabulary
    pub fn score_sequence(
        &self,
        memory: &EncoderMemory,
        batch: usize,
        targets: &[u32],
    ) -> DecodeResult<f32> {
        let vocab = self.vocab_size();
        let log_probs = self.forward(memory, batch, targets)?;
        targets
            .iter()
            .zip(log_probs.chunks_exact(vocab))
            .try_fold(0.0_f32, |acc, (&token, row)| {
                row.get(token as usize).map(|lp| acc + lp).ok_or_else(|| {
                    DecodeError::Model(format!("token {token} out of vocabulary range {vocab}"))
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // EncoderMemory Tests
    // =========================================================================

    fn memory(batch: usize, src_len: usize, d_model: usize, layers: usize) -> EncoderMemory {
        let outputs = (0..layers)
            .map(|l| {
                (0..batch * src_len * d_model)
                    .map(|i| (l * 1000 + i) as f32)
                    .collect()
            })
            .collect();
        let hidden = (0..layers)
            .map(|l| (0..batch * d_model).map(|i| (l * 100 + i) as f32).collect())
            .collect();
        EncoderMemory::new(batch, src_len, d_model, outputs, hidden).expect("valid memory")
    }

    #[test]
    fn test_memory_rejects_empty_batch() {
        let err = EncoderMemory::new(0, 3, 4, vec![vec![]], vec![vec![]]);
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));
    }

    #[test]
    fn test_memory_rejects_layer_count_mismatch() {
        let err = EncoderMemory::new(1, 2, 2, vec![vec![0.0; 4]], vec![]);
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));
    }

    #[test]
    fn test_memory_rejects_wrong_buffer_size() {
        let err = EncoderMemory::new(2, 2, 2, vec![vec![0.0; 7]], vec![vec![0.0; 4]]);
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));

        let err = EncoderMemory::new(2, 2, 2, vec![vec![0.0; 8]], vec![vec![0.0; 3]]);
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));
    }

    #[test]
    fn test_memory_layer_view_slices_batch() {
        let mem = memory(2, 3, 2, 2);
        let view = mem.layer(1, 1);
        assert_eq!(view.output.len(), 6);
        assert_eq!(view.hidden.len(), 2);
        assert!((view.output[0] - 1006.0).abs() < f32::EPSILON);
        assert!((view.hidden[0] - 102.0).abs() < f32::EPSILON);
        assert!(view.pad_mask.is_none());
        assert_eq!(view.src_len, 3);
    }

    #[test]
    fn test_memory_pad_mask() {
        let mem = memory(2, 2, 2, 1)
            .with_pad_mask(vec![false, false, false, true])
            .expect("valid mask");
        assert_eq!(mem.layer(0, 1).pad_mask, Some(&[false, true][..]));

        let err = memory(2, 2, 2, 1).with_pad_mask(vec![false; 3]);
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));
    }

    // =========================================================================
    // DecoderModel Tests
    // =========================================================================

    fn reference_model(
        d_model: usize,
        vocab: usize,
        layers: usize,
    ) -> DecoderModel<ReferenceLayer, TableEmbedder, SinusoidalPositions, TiedClassifier> {
        let embedder = TableEmbedder::seeded(vocab, d_model, 7);
        let classifier = TiedClassifier::from_embedder(&embedder);
        let layers = (0..layers)
            .map(|l| ReferenceLayer::seeded(d_model, d_model * 2, 11 + l as u64))
            .collect();
        DecoderModel::new(layers, embedder, SinusoidalPositions::default(), classifier)
            .expect("valid model")
    }

    #[test]
    fn test_model_rejects_empty_stack() {
        let embedder = TableEmbedder::seeded(5, 4, 1);
        let classifier = TiedClassifier::from_embedder(&embedder);
        let err = DecoderModel::<ReferenceLayer, _, _, _>::new(
            vec![],
            embedder,
            SinusoidalPositions::default(),
            classifier,
        );
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));
    }

    #[test]
    fn test_check_memory_depth_mismatch() {
        let model = reference_model(4, 6, 2);
        let err = model.check_memory(&memory(1, 3, 4, 3));
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));
        assert!(model.check_memory(&memory(1, 3, 4, 2)).is_ok());
    }

    #[test]
    fn test_input_unit_scales_embedding() {
        let model = reference_model(4, 6, 1);
        let unit = model.input_unit(Some(3), 0).expect("unit");
        let raw = TableEmbedder::seeded(6, 4, 7).embed(3).expect("embed");
        let pos = SinusoidalPositions::default().encode(0, 4);
        for d in 0..4 {
            assert!((unit[d] - (raw[d] * 2.0 + pos[d])).abs() < 1e-5);
        }
    }

    #[derive(Debug)]
    struct ShortPositions;

    impl PositionEncoder for ShortPositions {
        fn encode(&self, _step: usize, dim: usize) -> Vec<f32> {
            vec![0.0; dim - 1]
        }
    }

    #[test]
    fn test_input_unit_rejects_short_position_encoding() {
        let embedder = TableEmbedder::seeded(6, 4, 7);
        let classifier = TiedClassifier::from_embedder(&embedder);
        let model = DecoderModel::new(
            vec![ReferenceLayer::seeded(4, 8, 11)],
            embedder,
            ShortPositions,
            classifier,
        )
        .expect("valid model");
        assert!(matches!(
            model.input_unit(Some(3), 0),
            Err(DecodeError::InvalidShape(_))
        ));
        assert!(matches!(
            model.input_unit(None, 0),
            Err(DecodeError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_input_norm_normalizes_unit() {
        let model = reference_model(4, 6, 1)
            .with_input_norm(LayerNorm::new(4))
            .expect("norm");
        let unit = model.input_unit(Some(3), 2).expect("unit");
        let mean: f32 = unit.iter().sum::<f32>() / 4.0;
        let variance: f32 = unit.iter().map(|u| (u - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((variance - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_input_norm_width_checked() {
        let err = reference_model(4, 6, 1).with_input_norm(LayerNorm::new(3));
        assert!(matches!(err, Err(DecodeError::InvalidShape(_))));
    }

    #[test]
    fn test_input_norm_applies_to_both_modes() {
        let model = reference_model(4, 6, 2)
            .with_input_norm(LayerNorm::new(4))
            .expect("norm");
        let mem = memory(1, 3, 4, 2);
        let targets = [3, 5];
        let full = model.forward(&mem, 0, &targets).expect("forward");

        let mut caches: Vec<Option<ReferenceCache>> = vec![None, None];
        for (pos, expected) in full.chunks_exact(6).enumerate() {
            let token = (pos > 0).then(|| targets[pos - 1]);
            let mut x = model.input_unit(token, pos).expect("unit");
            for (depth, layer) in model.layers().iter().enumerate() {
                let (out, cache) = layer
                    .step(mem.layer(depth, 0), caches[depth].take(), &x, true)
                    .expect("step");
                caches[depth] = Some(cache);
                x = out;
            }
            let row = model.project(&x).expect("project");
            for (a, b) in row.iter().zip(expected) {
                assert!((a - b).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_input_unit_rejects_unknown_token() {
        let model = reference_model(4, 6, 1);
        assert!(matches!(
            model.input_unit(Some(99), 1),
            Err(DecodeError::Model(_))
        ));
    }

    #[test]
    fn test_forward_shape_and_normalization() {
        let model = reference_model(4, 6, 2);
        let mem = memory(1, 3, 4, 2);
        let log_probs = model.forward(&mem, 0, &[3, 4, 2]).expect("forward");
        assert_eq!(log_probs.len(), 3 * 6);
        for row in log_probs.chunks_exact(6) {
            let total: f32 = row.iter().map(|lp| lp.exp()).sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_score_sequence_is_sum_of_rows() {
        let model = reference_model(4, 6, 1);
        let mem = memory(1, 3, 4, 1);
        let targets = [3, 5, 2];
        let log_probs = model.forward(&mem, 0, &targets).expect("forward");
        let expected: f32 = targets
            .iter()
            .enumerate()
            .map(|(i, &t)| log_probs[i * 6 + t as usize])
            .sum();
        let score = model.score_sequence(&mem, 0, &targets).expect("score");
        assert!((score - expected).abs() < 1e-5);
        assert!(score <= 0.0);
    }

    #[test]
    fn test_forward_rejects_bad_batch_and_empty_target() {
        let model = reference_model(4, 6, 1);
        let mem = memory(1, 3, 4, 1);
        assert!(matches!(
            model.forward(&mem, 1, &[3]),
            Err(DecodeError::InvalidShape(_))
        ));
        assert!(matches!(
            model.forward(&mem, 0, &[]),
            Err(DecodeError::InvalidShape(_))
        ));
    }
}
