//! Greedy decoding
//!
//! Fast, memory-efficient greedy token selection.
//!
//! # Algorithm
//!
//! At each step every lane takes the argmax of its log-probabilities. A lane
//! is DONE the first time it emits the stop token; it keeps being fed (its
//! score no longer changes) until every lane of the batch is DONE or
//! `max_len` tokens have been produced.
//!
//! # Example
//!
//! ```rust,ignore
//! use s2s_decode::inference::{GreedyDecoder, StepHarness};
//!
//! let harness = StepHarness::new(&model, &memory)?;
//! let output = GreedyDecoder::new(128).decode(&harness)?;
//! ```

use super::harness::{accumulate, argmax, StepHarness};
use super::{DecodeConfig, DecodeOutput, Hypothesis, DEFAULT_STOP_TOKEN, HISTORY_RESERVE};
use crate::error::{DecodeError, DecodeResult};
use crate::model::{Classifier, Embedder, LayerStep, PositionEncoder};

/// Greedy decoder for token generation
///
/// Simple argmax selection at each step, one lane per batch element.
#[derive(Debug, Clone)]
pub struct GreedyDecoder {
    /// Maximum tokens to generate
    max_len: usize,
    /// Token that finishes a lane
    stop_token: u32,
}

impl GreedyDecoder {
    /// Create a new greedy decoder
    #[must_use]
    pub const fn new(max_len: usize) -> Self {
        Self {
            max_len,
            stop_token: DEFAULT_STOP_TOKEN,
        }
    }

    /// Greedy decoder for a call configuration (beam settings are ignored)
    #[must_use]
    pub const fn from_config(config: &DecodeConfig) -> Self {
        Self {
            max_len: config.max_len,
            stop_token: config.stop_token,
        }
    }

    /// Set the stop token
    #[must_use]
    pub const fn with_stop_token(mut self, stop_token: u32) -> Self {
        self.stop_token = stop_token;
        self
    }

    /// Get maximum tokens
    #[must_use]
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Get stop token
    #[must_use]
    pub const fn stop_token(&self) -> u32 {
        self.stop_token
    }

    /// Run greedy decoding over every batch element of the harness
    ///
    /// # Returns
    /// One hypothesis per batch element, ending at its first stop token
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidConfig`] for `max_len == 0`, and any
    /// error raised by a step
    pub fn decode<L, E, P, K>(&self, harness: &StepHarness<'_, L, E, P, K>) -> DecodeResult<DecodeOutput>
    where
        L: LayerStep,
        E: Embedder,
        P: PositionEncoder,
        K: Classifier,
    {
        if self.max_len == 0 {
            return Err(DecodeError::InvalidConfig("max_len must be >= 1".into()));
        }
        let _guard = trace_enter!("greedy_decode", max_len = self.max_len);

        let n_lanes = harness.batch_size();
        let mut histories = Vec::new();
        histories.try_reserve_exact(n_lanes)?;
        for _ in 0..n_lanes {
            let mut history = Vec::new();
            history.try_reserve_exact(self.max_len.min(HISTORY_RESERVE))?;
            histories.push(history);
        }
        let mut scores = vec![0.0_f32; n_lanes];
        let mut done = vec![false; n_lanes];
        let mut last_tokens: Vec<u32> = Vec::with_capacity(n_lanes);

        let mut caches = None;
        let mut steps = 0;
        while steps < self.max_len {
            let tokens = (steps > 0).then_some(last_tokens.as_slice());
            let (log_probs, next) = harness.step(caches.take(), tokens, steps)?;
            caches = Some(next);

            let mut chosen = Vec::with_capacity(n_lanes);
            for (lane, history) in histories.iter_mut().enumerate() {
                let (token, log_prob) = argmax(log_probs.row(lane));
                let token = token as u32;
                if !done[lane] {
                    scores[lane] = accumulate(scores[lane], log_prob, lane)?;
                }
                done[lane] |= token == self.stop_token;
                history.push(token);
                chosen.push(token);
            }
            last_tokens = chosen;
            steps += 1;

            if done.iter().all(|&d| d) {
                trace_event!(steps, "greedy: all lanes done");
                break;
            }
        }

        let beams = histories
            .iter()
            .zip(scores.iter().zip(done.iter()))
            .map(|(history, (&score, &finished))| {
                vec![Hypothesis::from_history(
                    history,
                    score,
                    finished,
                    self.stop_token,
                )]
            })
            .collect();

        Ok(DecodeOutput { beams, steps })
    }
}

impl Default for GreedyDecoder {
    fn default() -> Self {
        Self::new(DecodeConfig::default().max_len)
    }
}
