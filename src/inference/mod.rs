//! Inference engine
//!
//! Incremental decoding on top of a [`DecoderModel`] and pre-computed
//! [`EncoderMemory`].
//!
//! # Modules
//!
//! - [`beam`] - Beam search with length penalty and two stop policies
//! - [`greedy`] - Fast greedy decoding
//! - [`harness`] - One cache-threaded step for every lane
//! - [`lanes`] - Lane and candidate index arithmetic
//!
//! # Example
//!
//! ```rust,ignore
//! use s2s_decode::{decode, DecodeConfig};
//!
//! let config = DecodeConfig::default().with_beam_width(4).with_length_penalty(0.6);
//! let output = decode(&model, &memory, &config)?;
//! let best: Vec<Vec<u32>> = output.best_sequences();
//! ```

pub mod beam;
mod cache;
pub mod greedy;
pub mod harness;
pub mod lanes;
mod penalty;

pub use beam::{BeamDecoder, BeamFrontier, StopPolicy};
pub use cache::CacheSet;
pub use greedy::GreedyDecoder;
pub use harness::{LogProbs, StepHarness};
pub use penalty::LengthPenalty;

use crate::error::{DecodeError, DecodeResult};
use crate::model::{Classifier, DecoderModel, Embedder, EncoderMemory, LayerStep, PositionEncoder};

/// Stop token used when none is configured
pub const DEFAULT_STOP_TOKEN: u32 = 2;

/// Token slots reserved per lane history up front; longer histories grow
pub(crate) const HISTORY_RESERVE: usize = 64;

/// Decoding configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecodeConfig {
    /// Hypotheses kept per batch element (1 = greedy)
    pub beam_width: usize,
    /// Maximum tokens to generate
    pub max_len: usize,
    /// Length penalty coefficient (0.0 = off)
    pub length_penalty: f32,
    /// Report the whole ranked beam instead of only the best hypothesis
    pub return_all: bool,
    /// Normalize by the length penalty before pruning rather than after
    pub clip_beam: bool,
    /// Token that finishes a hypothesis
    pub stop_token: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            max_len: 512,
            length_penalty: 0.0,
            return_all: false,
            clip_beam: false,
            stop_token: DEFAULT_STOP_TOKEN,
        }
    }
}

impl DecodeConfig {
    /// Set beam width
    #[must_use]
    pub const fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.beam_width = beam_width;
        self
    }

    /// Set maximum tokens
    #[must_use]
    pub const fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Set length penalty
    #[must_use]
    pub const fn with_length_penalty(mut self, length_penalty: f32) -> Self {
        self.length_penalty = length_penalty;
        self
    }

    /// Report every beam
    #[must_use]
    pub const fn with_return_all(mut self, return_all: bool) -> Self {
        self.return_all = return_all;
        self
    }

    /// Normalize before pruning
    #[must_use]
    pub const fn with_clip_beam(mut self, clip_beam: bool) -> Self {
        self.clip_beam = clip_beam;
        self
    }

    /// Set stop token
    #[must_use]
    pub const fn with_stop_token(mut self, stop_token: u32) -> Self {
        self.stop_token = stop_token;
        self
    }

    /// Check parameter ranges
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidConfig`] for a zero beam width or
    /// `max_len`, or a negative or non-finite length penalty
    pub fn validate(&self) -> DecodeResult<()> {
        if self.beam_width == 0 {
            return Err(DecodeError::InvalidConfig("beam_width must be >= 1".into()));
        }
        if self.max_len == 0 {
            return Err(DecodeError::InvalidConfig("max_len must be >= 1".into()));
        }
        if !self.length_penalty.is_finite() || self.length_penalty < 0.0 {
            return Err(DecodeError::InvalidConfig(format!(
                "length_penalty must be finite and >= 0, got {}",
                self.length_penalty
            )));
        }
        Ok(())
    }
}

/// A decoded hypothesis
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hypothesis {
    /// Token sequence, ending at the first stop token if one was emitted
    pub tokens: Vec<u32>,
    /// Cumulative log-probability, length-normalized when a penalty is on
    pub score: f32,
    /// Whether the hypothesis emitted the stop token
    pub finished: bool,
}

impl Hypothesis {
    /// Build from a lane history, dropping tokens fed after the stop token
    #[must_use]
    pub fn from_history(history: &[u32], score: f32, finished: bool, stop_token: u32) -> Self {
        let end = history
            .iter()
            .position(|&t| t == stop_token)
            .map_or(history.len(), |pos| pos + 1);
        Self {
            tokens: history[..end].to_vec(),
            score,
            finished,
        }
    }
}

/// Result of a decode call
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecodeOutput {
    /// Per batch element, hypotheses ranked best first
    pub beams: Vec<Vec<Hypothesis>>,
    /// Decoder steps run
    pub steps: usize,
}

impl DecodeOutput {
    /// Number of batch elements
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.beams.len()
    }

    /// Best hypothesis of a batch element
    #[must_use]
    pub fn best(&self, batch: usize) -> Option<&Hypothesis> {
        self.beams.get(batch).and_then(|beam| beam.first())
    }

    /// Best token sequence of every batch element
    #[must_use]
    pub fn best_sequences(&self) -> Vec<Vec<u32>> {
        self.beams
            .iter()
            .filter_map(|beam| beam.first().map(|h| h.tokens.clone()))
            .collect()
    }

    /// Consume the output, keeping the best hypothesis per batch element
    #[must_use]
    pub fn into_best(self) -> Vec<Hypothesis> {
        self.beams
            .into_iter()
            .filter_map(|beam| beam.into_iter().next())
            .collect()
    }
}

/// Decode every batch element of `memory`
///
/// Dispatches to [`GreedyDecoder`] for `beam_width == 1` (the length penalty
/// has no effect on a single path) and to [`BeamDecoder`] otherwise.
///
/// # Errors
/// Returns [`DecodeError::InvalidConfig`] or [`DecodeError::InvalidShape`]
/// before any step runs, and any error raised during decoding
pub fn decode<L, E, P, K>(
    model: &DecoderModel<L, E, P, K>,
    memory: &EncoderMemory,
    config: &DecodeConfig,
) -> DecodeResult<DecodeOutput>
where
    L: LayerStep,
    E: Embedder,
    P: PositionEncoder,
    K: Classifier,
{
    let _guard = trace_enter!("decode", beam_width = config.beam_width, max_len = config.max_len);

    config.validate()?;
    if config.beam_width > model.vocab_size() {
        return Err(DecodeError::InvalidConfig(format!(
            "beam_width {} exceeds vocabulary size {}",
            config.beam_width,
            model.vocab_size()
        )));
    }
    let harness = StepHarness::new(model, memory)?;

    if config.beam_width == 1 {
        GreedyDecoder::from_config(config).decode(&harness)
    } else {
        BeamDecoder::from_config(config).decode(&harness)
    }
}
