//! Reference decoder layer
//!
//! A small single-head implementation of [`LayerStep`] used by the tests and
//! benchmarks. Each layer first combines its query with the encoder hidden
//! memo for that layer, then runs:
//!
//! 1. Self-attention over the combined units seen so far (+ residual, norm)
//! 2. Cross-attention over the padded encoder output (+ residual, norm)
//! 3. Position-wise feed-forward with its own pre-norm and residual
//!
//! The incremental cache is the sequence of combined units, so one step only
//! appends a single row.

use super::attention::{padding_mask, scaled_dot_product_attention, LinearWeights};
use super::{LayerMemory, LayerStep};
use crate::error::{DecodeError, DecodeResult};

/// Layer normalization
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Scale parameter (gamma)
    pub weight: Vec<f32>,
    /// Shift parameter (beta)
    pub bias: Vec<f32>,
    /// Normalized dimension
    pub normalized_shape: usize,
    /// Epsilon for numerical stability
    pub eps: f32,
}

impl LayerNorm {
    /// Create new layer normalization
    #[must_use]
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            weight: vec![1.0; normalized_shape],
            bias: vec![0.0; normalized_shape],
            normalized_shape,
            eps: 1e-6,
        }
    }

    /// Apply layer normalization to every row of `input`
    pub fn forward(&self, input: &[f32]) -> DecodeResult<Vec<f32>> {
        if input.len() % self.normalized_shape != 0 {
            return Err(DecodeError::Model(
                "input size mismatch for layer norm".into(),
            ));
        }

        let n = self.normalized_shape as f32;
        let mut output = Vec::with_capacity(input.len());

        for row in input.chunks_exact(self.normalized_shape) {
            let mean: f32 = row.iter().sum::<f32>() / n;
            let variance: f32 = row.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / n;
            let inv_std = 1.0 / (variance + self.eps).sqrt();

            for ((&x, w), b) in row.iter().zip(&self.weight).zip(&self.bias) {
                output.push((x - mean) * inv_std * w + b);
            }
        }

        Ok(output)
    }
}

/// Position-wise feed-forward block: x + fc2(relu(fc1(norm(x))))
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Pre-norm
    pub norm: LayerNorm,
    /// Up projection (d_model -> d_ff)
    pub fc1: LinearWeights,
    /// Down projection (d_ff -> d_model)
    pub fc2: LinearWeights,
}

impl FeedForward {
    /// Create a feed-forward block with deterministic weights
    #[must_use]
    pub fn seeded(d_model: usize, d_ff: usize, seed: u64) -> Self {
        Self {
            norm: LayerNorm::new(d_model),
            fc1: LinearWeights::seeded(d_model, d_ff, seed),
            fc2: LinearWeights::seeded(d_ff, d_model, seed.wrapping_add(1)),
        }
    }

    /// Apply the block to every row of `x`
    pub fn forward(&self, x: &[f32]) -> DecodeResult<Vec<f32>> {
        let normed = self.norm.forward(x)?;
        let mut hidden = self.fc1.forward(&normed)?;
        for h in &mut hidden {
            *h = h.max(0.0);
        }
        let out = self.fc2.forward(&hidden)?;
        Ok(x.iter().zip(out.iter()).map(|(a, b)| a + b).collect())
    }
}

/// Cached combined units of one lane (len x d_model)
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCache {
    units: Vec<f32>,
    d_model: usize,
}

impl ReferenceCache {
    /// Number of cached positions
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len() / self.d_model
    }

    /// Check if no position is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Raw cached rows
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.units
    }
}

/// Single-head reference decoder layer
#[derive(Debug, Clone)]
pub struct ReferenceLayer {
    d_model: usize,
    /// Combines [query; hidden memo] into a residual update (2*d_model -> d_model)
    pub combine: LinearWeights,
    /// Self-attention projections (Q, K, V, O)
    pub self_attn: [LinearWeights; 4],
    /// Norm after self-attention
    pub ln1: LayerNorm,
    /// Cross-attention projections (Q, K, V, O)
    pub cross_attn: [LinearWeights; 4],
    /// Norm after cross-attention
    pub ln2: LayerNorm,
    /// Feed-forward block
    pub ffn: FeedForward,
}

impl ReferenceLayer {
    /// Create a layer with deterministic weights
    #[must_use]
    pub fn seeded(d_model: usize, d_ff: usize, seed: u64) -> Self {
        let base = seed.wrapping_mul(16);
        let proj = |offset: u64| LinearWeights::seeded(d_model, d_model, base.wrapping_add(offset));
        Self {
            d_model,
            combine: LinearWeights::seeded(2 * d_model, d_model, base),
            self_attn: [proj(1), proj(2), proj(3), proj(4)],
            ln1: LayerNorm::new(d_model),
            cross_attn: [proj(5), proj(6), proj(7), proj(8)],
            ln2: LayerNorm::new(d_model),
            ffn: FeedForward::seeded(d_model, d_ff, base.wrapping_add(9)),
        }
    }

    /// Model width
    #[must_use]
    pub const fn d_model(&self) -> usize {
        self.d_model
    }

    /// Residue-combine each row of `x` with the layer's hidden memo
    fn combine_rows(&self, x: &[f32], hidden: &[f32]) -> DecodeResult<Vec<f32>> {
        if hidden.len() != self.d_model {
            return Err(DecodeError::Model(format!(
                "hidden memo has {} values, expected {}",
                hidden.len(),
                self.d_model
            )));
        }
        let mut joined = Vec::with_capacity(x.len() * 2);
        for row in x.chunks_exact(self.d_model) {
            joined.extend_from_slice(row);
            joined.extend_from_slice(hidden);
        }
        let update = self.combine.forward(&joined)?;
        Ok(x.iter().zip(update.iter()).map(|(a, b)| a + b).collect())
    }

    fn attend(
        proj: &[LinearWeights; 4],
        query: &[f32],
        context: &[f32],
        d_model: usize,
        mask: Option<&[f32]>,
    ) -> DecodeResult<Vec<f32>> {
        let q = proj[0].forward(query)?;
        let k = proj[1].forward(context)?;
        let v = proj[2].forward(context)?;
        let attn = scaled_dot_product_attention(&q, &k, &v, d_model, mask)?;
        proj[3].forward(&attn)
    }

    /// Everything after self-attention: norm, cross-attention, norm, FFN
    fn finish(&self, memory: LayerMemory<'_>, context: Vec<f32>) -> DecodeResult<Vec<f32>> {
        let q_len = context.len() / self.d_model;
        let normed = self.ln1.forward(&context)?;

        let src_mask = memory.pad_mask.map(|pad| padding_mask(pad, q_len));
        let cross = Self::attend(
            &self.cross_attn,
            &normed,
            memory.output,
            self.d_model,
            src_mask.as_deref(),
        )?;
        let summed: Vec<f32> = cross.iter().zip(normed.iter()).map(|(a, b)| a + b).collect();
        let normed = self.ln2.forward(&summed)?;

        self.ffn.forward(&normed)
    }
}

impl LayerStep for ReferenceLayer {
    type Cache = ReferenceCache;

    fn forward(
        &self,
        memory: LayerMemory<'_>,
        input: &[f32],
        tgt_mask: Option<&[f32]>,
    ) -> DecodeResult<Vec<f32>> {
        if input.is_empty() || input.len() % self.d_model != 0 {
            return Err(DecodeError::Model(format!(
                "layer input of {} values is not a multiple of {}",
                input.len(),
                self.d_model
            )));
        }

        let units = self.combine_rows(input, memory.hidden)?;
        let attn = Self::attend(&self.self_attn, &units, &units, self.d_model, tgt_mask)?;
        let context = attn.iter().zip(units.iter()).map(|(a, b)| a + b).collect();
        self.finish(memory, context)
    }

    fn step(
        &self,
        memory: LayerMemory<'_>,
        cache: Option<Self::Cache>,
        query: &[f32],
        concat_query: bool,
    ) -> DecodeResult<(Vec<f32>, Self::Cache)> {
        if query.len() != self.d_model {
            return Err(DecodeError::Model(format!(
                "query unit has {} values, expected {}",
                query.len(),
                self.d_model
            )));
        }

        let unit = self.combine_rows(query, memory.hidden)?;
        let states = match (cache, concat_query) {
            (Some(mut cache), true) => {
                cache.units.extend_from_slice(&unit);
                cache
            }
            (None, true) => ReferenceCache {
                units: unit.clone(),
                d_model: self.d_model,
            },
            (Some(cache), false) => cache,
            (None, false) => {
                return Err(DecodeError::Model(
                    "no cached states and query is not concatenated".into(),
                ))
            }
        };

        let attn = Self::attend(&self.self_attn, &unit, &states.units, self.d_model, None)?;
        let context = attn.iter().zip(unit.iter()).map(|(a, b)| a + b).collect();
        let output = self.finish(memory, context)?;
        Ok((output, states))
    }
}
