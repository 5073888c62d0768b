//! Embedding, positional encoding and output projection
//!
//! Concrete [`Embedder`], [`PositionEncoder`] and [`Classifier`] collaborators.
//! The classifier shares the embedding table (weight tying) and returns
//! log-softmax rows.

use super::attention::LinearWeights;
use super::{Classifier, Embedder, PositionEncoder};
use crate::error::{DecodeError, DecodeResult};

/// Token embedding table with a learned start-of-sequence vector
#[derive(Debug, Clone)]
pub struct TableEmbedder {
    /// Embeddings (n_vocab x d_model)
    table: Vec<f32>,
    /// Start-of-sequence vector (d_model)
    start: Vec<f32>,
    n_vocab: usize,
    d_model: usize,
}

impl TableEmbedder {
    /// Create an embedder from a loaded table
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] if the table or start vector do
    /// not match `d_model`
    pub fn new(table: Vec<f32>, start: Vec<f32>, d_model: usize) -> DecodeResult<Self> {
        if d_model == 0 || table.len() % d_model != 0 || start.len() != d_model {
            return Err(DecodeError::InvalidShape(format!(
                "embedding table of {} values / start of {} values do not fit d_model {d_model}",
                table.len(),
                start.len()
            )));
        }
        Ok(Self {
            n_vocab: table.len() / d_model,
            table,
            start,
            d_model,
        })
    }

    /// Deterministic table for tests and benchmarks
    #[must_use]
    pub fn seeded(n_vocab: usize, d_model: usize, seed: u64) -> Self {
        let linear = LinearWeights::seeded(d_model, n_vocab, seed);
        let start = LinearWeights::seeded(d_model, 1, seed.wrapping_add(1)).weight;
        Self {
            table: linear.weight,
            start,
            n_vocab,
            d_model,
        }
    }

    /// Vocabulary size
    #[must_use]
    pub const fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    /// Raw table (n_vocab x d_model)
    #[must_use]
    pub fn table(&self) -> &[f32] {
        &self.table
    }
}

impl Embedder for TableEmbedder {
    fn dim(&self) -> usize {
        self.d_model
    }

    fn start(&self) -> Vec<f32> {
        self.start.clone()
    }

    fn embed(&self, token: u32) -> DecodeResult<Vec<f32>> {
        let idx = token as usize;
        if idx >= self.n_vocab {
            return Err(DecodeError::Model(format!(
                "token {token} out of vocabulary range {}",
                self.n_vocab
            )));
        }
        let start = idx * self.d_model;
        Ok(self.table[start..start + self.d_model].to_vec())
    }
}

/// Fixed sinusoidal positions (Vaswani et al.)
#[derive(Debug, Clone, Copy)]
pub struct SinusoidalPositions {
    /// Wavelength base
    pub base: f32,
}

impl Default for SinusoidalPositions {
    fn default() -> Self {
        Self { base: 10000.0 }
    }
}

impl PositionEncoder for SinusoidalPositions {
    fn encode(&self, step: usize, dim: usize) -> Vec<f32> {
        let pos = step as f32;
        (0..dim)
            .map(|i| {
                let pair = (i / 2 * 2) as f32;
                let angle = pos / self.base.powf(pair / dim as f32);
                if i % 2 == 0 {
                    angle.sin()
                } else {
                    angle.cos()
                }
            })
            .collect()
    }
}

/// Output projection sharing the embedding table, followed by log-softmax
#[derive(Debug, Clone)]
pub struct TiedClassifier {
    /// Projection (n_vocab x d_model)
    weight: Vec<f32>,
    n_vocab: usize,
    d_model: usize,
}

impl TiedClassifier {
    /// Tie the projection to an embedder's table
    #[must_use]
    pub fn from_embedder(embedder: &TableEmbedder) -> Self {
        Self {
            weight: embedder.table().to_vec(),
            n_vocab: embedder.n_vocab(),
            d_model: embedder.dim(),
        }
    }
}

impl Classifier for TiedClassifier {
    fn vocab_size(&self) -> usize {
        self.n_vocab
    }

    fn log_probs(&self, hidden: &[f32]) -> DecodeResult<Vec<f32>> {
        if hidden.len() != self.d_model {
            return Err(DecodeError::Model(format!(
                "classifier input has {} values, expected {}",
                hidden.len(),
                self.d_model
            )));
        }
        let logits: Vec<f32> = self
            .weight
            .chunks_exact(self.d_model)
            .map(|row| row.iter().zip(hidden.iter()).map(|(w, x)| w * x).sum())
            .collect();
        Ok(log_softmax(&logits))
    }
}

/// Compute log softmax of logits
pub(crate) fn log_softmax(logits: &[f32]) -> Vec<f32> {
    // Find max for numerical stability
    let max_val = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let log_sum_exp = logits
        .iter()
        .map(|&x| (x - max_val).exp())
        .sum::<f32>()
        .ln()
        + max_val;

    logits.iter().map(|&x| x - log_sum_exp).collect()
}
