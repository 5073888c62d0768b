//! Attention primitives for the reference layer
//!
//! Attention(Q, K, V) = softmax(QK^T / sqrt(d_k) + mask) V
//!
//! # References
//!
//! - Vaswani et al. (2017): "Attention Is All You Need"

use crate::error::{DecodeError, DecodeResult};

/// Linear projection weights
#[derive(Debug, Clone)]
pub struct LinearWeights {
    /// Weight matrix (out_features x in_features) row-major
    pub weight: Vec<f32>,
    /// Bias vector (out_features)
    pub bias: Vec<f32>,
    /// Input features
    pub in_features: usize,
    /// Output features
    pub out_features: usize,
}

impl LinearWeights {
    /// Create zero-initialized linear weights
    #[must_use]
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: vec![0.0; out_features * in_features],
            bias: vec![0.0; out_features],
            in_features,
            out_features,
        }
    }

    /// Deterministic weights scaled by `1/sqrt(in_features)`
    ///
    /// Useful for tests and benchmarks where real checkpoints are not needed.
    #[must_use]
    pub fn seeded(in_features: usize, out_features: usize, seed: u64) -> Self {
        let scale = 1.0 / (in_features as f32).sqrt();
        let phase = (seed % 1024) as f32 * 1.37;
        let weight = (0..out_features * in_features)
            .map(|i| ((i as f32 + 1.0) * 0.618_034 + phase).sin() * scale)
            .collect();
        let bias = (0..out_features)
            .map(|i| ((i as f32 + 1.0) * 0.414_214 + phase).cos() * 0.01)
            .collect();
        Self {
            weight,
            bias,
            in_features,
            out_features,
        }
    }

    /// Set weight values from a slice
    pub fn set_weight(&mut self, values: &[f32]) {
        let len = values.len().min(self.weight.len());
        self.weight[..len].copy_from_slice(&values[..len]);
    }

    /// Set bias values from a slice
    pub fn set_bias(&mut self, values: &[f32]) {
        let len = values.len().min(self.bias.len());
        self.bias[..len].copy_from_slice(&values[..len]);
    }

    /// Apply linear projection row by row: y = xW^T + b
    ///
    /// # Arguments
    /// * `input` - Input tensor (rows x in_features) flattened
    ///
    /// # Returns
    /// Output tensor (rows x out_features) flattened
    pub fn forward(&self, input: &[f32]) -> DecodeResult<Vec<f32>> {
        if input.len() % self.in_features != 0 {
            return Err(DecodeError::Model(format!(
                "linear input of {} values is not a multiple of {}",
                input.len(),
                self.in_features
            )));
        }

        let rows = input.len() / self.in_features;
        let mut output = Vec::with_capacity(rows * self.out_features);

        for row in input.chunks_exact(self.in_features) {
            for o in 0..self.out_features {
                let w = &self.weight[o * self.in_features..(o + 1) * self.in_features];
                let dot: f32 = row.iter().zip(w.iter()).map(|(x, w)| x * w).sum();
                output.push(dot + self.bias[o]);
            }
        }

        Ok(output)
    }
}

/// Single-head scaled dot-product attention
///
/// # Arguments
/// * `query` - Query tensor (q_len x d)
/// * `key` - Key tensor (kv_len x d)
/// * `value` - Value tensor (kv_len x d)
/// * `d` - Head width
/// * `mask` - Optional additive mask (q_len x kv_len), -inf for masked positions
///
/// # Returns
/// Attention output (q_len x d)
pub fn scaled_dot_product_attention(
    query: &[f32],
    key: &[f32],
    value: &[f32],
    d: usize,
    mask: Option<&[f32]>,
) -> DecodeResult<Vec<f32>> {
    if d == 0 || query.len() % d != 0 {
        return Err(DecodeError::Model("query size mismatch".into()));
    }
    if key.len() % d != 0 || key.len() != value.len() {
        return Err(DecodeError::Model("key/value size mismatch".into()));
    }

    let q_len = query.len() / d;
    let kv_len = key.len() / d;
    let scale = 1.0 / (d as f32).sqrt();

    if let Some(m) = mask {
        if m.len() != q_len * kv_len {
            return Err(DecodeError::Model("mask size mismatch".into()));
        }
    }

    let mut output = vec![0.0_f32; q_len * d];
    let mut scores = vec![0.0_f32; kv_len];

    for q_idx in 0..q_len {
        let q = &query[q_idx * d..(q_idx + 1) * d];
        for (k_idx, k) in key.chunks_exact(d).enumerate() {
            let dot: f32 = q.iter().zip(k.iter()).map(|(a, b)| a * b).sum();
            let bias = mask.map_or(0.0, |m| m[q_idx * kv_len + k_idx]);
            scores[k_idx] = dot * scale + bias;
        }

        // Softmax over key dimension
        let max_score = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        if max_score == f32::NEG_INFINITY {
            // Every key masked: contributes nothing
            continue;
        }
        let mut sum = 0.0_f32;
        for s in &mut scores {
            *s = (*s - max_score).exp();
            sum += *s;
        }
        let inv_sum = 1.0 / sum;

        let out = &mut output[q_idx * d..(q_idx + 1) * d];
        for (weight, v) in scores.iter().zip(value.chunks_exact(d)) {
            let w = weight * inv_sum;
            for (o, x) in out.iter_mut().zip(v.iter()) {
                *o += w * x;
            }
        }
    }

    Ok(output)
}

/// Create a causal attention mask
///
/// Position i can only attend to positions <= i.
#[must_use]
pub fn causal_mask(seq_len: usize) -> Vec<f32> {
    let mut mask = vec![0.0_f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    mask
}

/// Expand a source padding mask to an additive (q_len x src_len) mask
#[must_use]
pub(crate) fn padding_mask(pad: &[bool], q_len: usize) -> Vec<f32> {
    let row: Vec<f32> = pad
        .iter()
        .map(|&is_pad| if is_pad { f32::NEG_INFINITY } else { 0.0 })
        .collect();
    row.repeat(q_len)
}
