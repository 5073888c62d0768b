//! Beam search decoding
//!
//! Higher quality decoding with configurable beam width.
//!
//! # Algorithm
//!
//! Step 0 runs one lane per batch element and its top `beam_width` tokens
//! seed the beam; the step-0 caches are widened to `batch * beam_width`
//! lanes. Every later step:
//!
//! 1. Each lane proposes its own top `beam_width` tokens, so a batch element
//!    has a pool of `beam_width^2` candidates laid out parent-major
//! 2. Candidate score is the parent's raw score plus the log-probability,
//!    masked to zero when the parent is DONE. A DONE parent therefore
//!    proposes `beam_width` candidates with its own unchanged score; they are
//!    kept as duplicates
//! 3. With a length penalty, not-DONE lanes take the multiplier for this
//!    step; DONE lanes keep the one frozen when they finished
//! 4. Candidates are ranked by raw score, or by `raw / multiplier` when
//!    `clip_beam` is set and the penalty is on
//! 5. The best `beam_width` candidates per batch element become the new
//!    beam; histories, flags, multipliers and layer caches are gathered by
//!    the resolved parent lanes before the new tokens are appended
//!
//! The loop ends at `max_len` or when the [`StopPolicy`] holds. With a
//! penalty and no clipping the final beam is re-ranked by `raw / multiplier`.
//!
//! # Example
//!
//! ```rust,ignore
//! use s2s_decode::inference::{BeamDecoder, StepHarness};
//!
//! let harness = StepHarness::new(&model, &memory)?;
//! let output = BeamDecoder::new(4, 128).with_length_penalty(0.6).decode(&harness)?;
//! ```

use super::cache::gather;
use super::harness::{accumulate, top_k, LogProbs, StepHarness};
use super::lanes::{global_lane, repeat_lanes, resolve_parent};
use super::penalty::LengthPenalty;
use super::{DecodeConfig, DecodeOutput, Hypothesis, DEFAULT_STOP_TOKEN, HISTORY_RESERVE};
use crate::error::{DecodeError, DecodeResult};
use crate::model::{Classifier, Embedder, LayerStep, PositionEncoder};

/// Early-stopping predicate checked after every step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Stop once the best hypothesis of every batch element is DONE
    AllRankZeroDone,
    /// Stop only once every lane is DONE
    AllLanesDone,
}

impl StopPolicy {
    /// Policy for a call
    ///
    /// A length penalty keeps every lane running so the multipliers stay in
    /// step; so does `return_all`, since lower-ranked beams are reported.
    #[must_use]
    pub const fn select(length_penalty: bool, return_all: bool) -> Self {
        if length_penalty || return_all {
            Self::AllLanesDone
        } else {
            Self::AllRankZeroDone
        }
    }

    /// Whether decoding can stop with this frontier
    #[must_use]
    pub fn is_satisfied(self, frontier: &BeamFrontier) -> bool {
        match self {
            Self::AllRankZeroDone => (0..frontier.batch_size())
                .all(|batch| frontier.is_done(global_lane(batch, 0, frontier.beam_width))),
            Self::AllLanesDone => frontier.done.iter().all(|&d| d),
        }
    }
}

/// All hypotheses of one decode call, lane-major
#[derive(Debug, Clone)]
pub struct BeamFrontier {
    beam_width: usize,
    /// Token history per lane
    tokens: Vec<Vec<u32>>,
    /// Ranking score per lane
    scores: Vec<f32>,
    /// Unnormalized cumulative log-probability per lane
    raw: Vec<f32>,
    done: Vec<bool>,
    /// Length-penalty multiplier per lane, present when the penalty is on
    multipliers: Option<Vec<f32>>,
}

impl BeamFrontier {
    /// Seed the beam from step-0 log-probabilities (one row per batch element)
    fn start(
        log_probs: &LogProbs,
        beam_width: usize,
        stop_token: u32,
        penalty: bool,
        max_len: usize,
    ) -> DecodeResult<Self> {
        let n_lanes = log_probs.n_lanes() * beam_width;
        let mut tokens = Vec::new();
        tokens.try_reserve_exact(n_lanes)?;
        let mut raw = Vec::new();
        raw.try_reserve_exact(n_lanes)?;
        let mut done = Vec::new();
        done.try_reserve_exact(n_lanes)?;

        for batch in 0..log_probs.n_lanes() {
            for (token, log_prob) in top_k(log_probs.row(batch), beam_width) {
                let token = token as u32;
                let mut history = Vec::new();
                history.try_reserve_exact(max_len.min(HISTORY_RESERVE))?;
                history.push(token);
                raw.push(accumulate(0.0, log_prob, tokens.len())?);
                done.push(token == stop_token);
                tokens.push(history);
            }
        }

        Ok(Self {
            beam_width,
            tokens,
            scores: raw.clone(),
            raw,
            done,
            multipliers: penalty.then(|| vec![1.0; n_lanes]),
        })
    }

    /// Beam width
    #[must_use]
    pub const fn beam_width(&self) -> usize {
        self.beam_width
    }

    /// Number of lanes (`batch_size * beam_width`)
    #[must_use]
    pub fn n_lanes(&self) -> usize {
        self.tokens.len()
    }

    /// Number of batch elements
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.n_lanes() / self.beam_width
    }

    /// Full token history of `lane`, including tokens fed after it finished
    #[must_use]
    pub fn tokens(&self, lane: usize) -> &[u32] {
        &self.tokens[lane]
    }

    /// Ranking score of `lane`
    #[must_use]
    pub fn score(&self, lane: usize) -> f32 {
        self.scores[lane]
    }

    /// Cumulative log-probability of `lane`
    #[must_use]
    pub fn raw_score(&self, lane: usize) -> f32 {
        self.raw[lane]
    }

    /// Whether `lane` has emitted the stop token
    #[must_use]
    pub fn is_done(&self, lane: usize) -> bool {
        self.done[lane]
    }

    /// Length-penalty multiplier of `lane`, if the penalty is on
    #[must_use]
    pub fn multiplier(&self, lane: usize) -> Option<f32> {
        self.multipliers.as_ref().map(|m| m[lane])
    }

    /// Number of DONE lanes
    #[must_use]
    pub fn done_count(&self) -> usize {
        self.done.iter().filter(|&&d| d).count()
    }

    /// Newest token of every lane, fed to the next step
    fn last_tokens(&self) -> Vec<u32> {
        self.tokens.iter().filter_map(|h| h.last().copied()).collect()
    }

    /// Reorder every per-lane buffer so new lane `i` is old lane `parents[i]`
    fn gather(self, parents: &[usize]) -> DecodeResult<Self> {
        Ok(Self {
            beam_width: self.beam_width,
            tokens: gather(self.tokens, parents)?,
            scores: gather(self.scores, parents)?,
            raw: gather(self.raw, parents)?,
            done: gather(self.done, parents)?,
            multipliers: self.multipliers.map(|m| gather(m, parents)).transpose()?,
        })
    }

    /// Final re-rank of each batch element's beam by `raw / multiplier`
    fn rerank_by_penalty(self) -> DecodeResult<Self> {
        let Some(multipliers) = self.multipliers.as_deref() else {
            return Ok(self);
        };
        let normalized: Vec<f32> = self
            .raw
            .iter()
            .zip(multipliers)
            .map(|(raw, m)| raw / m)
            .collect();

        let bw = self.beam_width;
        let mut order = Vec::new();
        order.try_reserve_exact(self.n_lanes())?;
        for batch in 0..self.batch_size() {
            let offset = global_lane(batch, 0, bw);
            order.extend(
                top_k(&normalized[offset..offset + bw], bw)
                    .into_iter()
                    .map(|(beam, _)| offset + beam),
            );
        }

        let mut reranked = self.gather(&order)?;
        reranked.scores = gather(normalized, &order)?;
        Ok(reranked)
    }
}

/// Candidate pool of one step, lane-major: index `lane * beam_width + rank`
///
/// Lives for exactly one step.
#[derive(Debug)]
struct Expansion {
    tokens: Vec<u32>,
    raw: Vec<f32>,
    ranked: Vec<f32>,
    multipliers: Option<Vec<f32>>,
}

/// Beam search decoder for token generation
///
/// Explores multiple hypotheses in parallel for better results.
#[derive(Debug, Clone)]
pub struct BeamDecoder {
    /// Hypotheses kept per batch element
    beam_width: usize,
    /// Maximum tokens to generate
    max_len: usize,
    /// Length penalty coefficient (0.0 = off)
    length_penalty: f32,
    /// Report every beam instead of only rank 0
    return_all: bool,
    /// Rank candidates by penalized score during pruning
    clip_beam: bool,
    /// Token that finishes a lane
    stop_token: u32,
}

impl BeamDecoder {
    /// Create a new beam search decoder
    ///
    /// # Arguments
    /// * `beam_width` - Hypotheses kept per batch element
    /// * `max_len` - Maximum tokens to generate
    #[must_use]
    pub const fn new(beam_width: usize, max_len: usize) -> Self {
        Self {
            beam_width,
            max_len,
            length_penalty: 0.0,
            return_all: false,
            clip_beam: false,
            stop_token: DEFAULT_STOP_TOKEN,
        }
    }

    /// Beam decoder for a call configuration
    #[must_use]
    pub const fn from_config(config: &DecodeConfig) -> Self {
        Self {
            beam_width: config.beam_width,
            max_len: config.max_len,
            length_penalty: config.length_penalty,
            return_all: config.return_all,
            clip_beam: config.clip_beam,
            stop_token: config.stop_token,
        }
    }

    /// Set length penalty (higher values favor longer sequences)
    #[must_use]
    pub const fn with_length_penalty(mut self, length_penalty: f32) -> Self {
        self.length_penalty = length_penalty;
        self
    }

    /// Report the whole ranked beam
    #[must_use]
    pub const fn with_return_all(mut self, return_all: bool) -> Self {
        self.return_all = return_all;
        self
    }

    /// Normalize candidates by the length penalty before pruning
    #[must_use]
    pub const fn with_clip_beam(mut self, clip_beam: bool) -> Self {
        self.clip_beam = clip_beam;
        self
    }

    /// Set the stop token
    #[must_use]
    pub const fn with_stop_token(mut self, stop_token: u32) -> Self {
        self.stop_token = stop_token;
        self
    }

    /// Get beam width
    #[must_use]
    pub const fn beam_width(&self) -> usize {
        self.beam_width
    }

    /// Get maximum tokens
    #[must_use]
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Get length penalty
    #[must_use]
    pub const fn length_penalty(&self) -> f32 {
        self.length_penalty
    }

    /// Get stop policy
    #[must_use]
    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy::select(self.length_penalty > 0.0, self.return_all)
    }

    /// Check parameters against a vocabulary size
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidConfig`] for a zero beam width or
    /// `max_len`, a negative or non-finite penalty, or a beam wider than the
    /// vocabulary
    pub fn validate(&self, vocab_size: usize) -> DecodeResult<()> {
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
        if self.beam_width > vocab_size {
            return Err(DecodeError::InvalidConfig(format!(
                "beam_width {} exceeds vocabulary size {vocab_size}",
                self.beam_width
            )));
        }
        Ok(())
    }

    /// Run beam search over every batch element of the harness
    ///
    /// # Returns
    /// Per batch element the ranked beam when `return_all` is set, otherwise
    /// only the rank-0 hypothesis
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidConfig`] for invalid parameters, and any
    /// error raised by a step
    pub fn decode<L, E, P, K>(&self, harness: &StepHarness<'_, L, E, P, K>) -> DecodeResult<DecodeOutput>
    where
        L: LayerStep,
        E: Embedder,
        P: PositionEncoder,
        K: Classifier,
    {
        self.decode_observed(harness, |_, _| {})
    }

    /// Run beam search, handing the frontier to `observe` after every step
    ///
    /// `observe` sees the beam after selection and before the final re-rank.
    ///
    /// # Errors
    /// Same conditions as [`BeamDecoder::decode`]
    pub fn decode_observed<L, E, P, K, F>(
        &self,
        harness: &StepHarness<'_, L, E, P, K>,
        mut observe: F,
    ) -> DecodeResult<DecodeOutput>
    where
        L: LayerStep,
        E: Embedder,
        P: PositionEncoder,
        K: Classifier,
        F: FnMut(usize, &BeamFrontier),
    {
        self.validate(harness.vocab_size())?;
        let penalty = LengthPenalty::new(self.length_penalty);
        let policy = self.stop_policy();
        let batch_size = harness.batch_size();
        let _guard = trace_enter!(
            "beam_decode",
            beam_width = self.beam_width,
            lanes = batch_size * self.beam_width
        );

        let (log_probs, caches) = harness.step(None, None, 0)?;
        let mut frontier = BeamFrontier::start(
            &log_probs,
            self.beam_width,
            self.stop_token,
            penalty.is_some(),
            self.max_len,
        )?;
        let mut caches = caches.reorder(&repeat_lanes(batch_size, self.beam_width))?;
        observe(0, &frontier);

        let mut steps = 1;
        while steps < self.max_len && !policy.is_satisfied(&frontier) {
            let tokens = frontier.last_tokens();
            let (log_probs, next) = harness.step(Some(caches), Some(tokens.as_slice()), steps)?;
            let expansion = self.expand(&frontier, &log_probs, penalty, steps)?;
            let (selected, parents) = self.select(frontier, expansion)?;
            frontier = selected;
            caches = next.reorder(&parents)?;

            observe(steps, &frontier);
            trace_event!(step = steps, done = frontier.done_count(), "beam step");
            steps += 1;
        }
        trace_event!(
            steps,
            early_stop = policy.is_satisfied(&frontier),
            "beam finished"
        );

        if !self.clip_beam {
            frontier = frontier.rerank_by_penalty()?;
        }
        Ok(self.collect(&frontier, steps))
    }

    /// Build the candidate pool for `step`
    fn expand(
        &self,
        frontier: &BeamFrontier,
        log_probs: &LogProbs,
        penalty: Option<LengthPenalty>,
        step: usize,
    ) -> DecodeResult<Expansion> {
        let bw = self.beam_width;
        let n_lanes = frontier.n_lanes();
        if log_probs.n_lanes() != n_lanes {
            return Err(DecodeError::InvalidShape(format!(
                "{} log-prob rows for {n_lanes} lanes",
                log_probs.n_lanes()
            )));
        }

        // DONE lanes keep their frozen multiplier
        let multipliers = match (penalty, frontier.multipliers.as_deref()) {
            (Some(penalty), Some(prev)) => Some(
                prev.iter()
                    .zip(frontier.done.iter())
                    .map(|(&m, &done)| if done { m } else { penalty.multiplier(step) })
                    .collect::<Vec<f32>>(),
            ),
            _ => None,
        };

        let pool = n_lanes * bw;
        let mut tokens = Vec::new();
        tokens.try_reserve_exact(pool)?;
        let mut raw = Vec::new();
        raw.try_reserve_exact(pool)?;
        let mut ranked = Vec::new();
        ranked.try_reserve_exact(pool)?;

        for lane in 0..n_lanes {
            let done = frontier.done[lane];
            let parent_raw = frontier.raw[lane];
            let divisor = match (&multipliers, self.clip_beam) {
                (Some(m), true) => Some(m[lane]),
                _ => None,
            };

            for (token, log_prob) in top_k(log_probs.row(lane), bw) {
                let value = accumulate(parent_raw, if done { 0.0 } else { log_prob }, lane)?;
                tokens.push(token as u32);
                raw.push(value);
                ranked.push(divisor.map_or(value, |m| value / m));
            }
        }

        Ok(Expansion {
            tokens,
            raw,
            ranked,
            multipliers,
        })
    }

    /// Prune each batch element's pool to the beam and gather the frontier
    ///
    /// # Returns
    /// The new frontier and the parent lane of every new lane
    fn select(
        &self,
        frontier: BeamFrontier,
        expansion: Expansion,
    ) -> DecodeResult<(BeamFrontier, Vec<usize>)> {
        let bw = self.beam_width;
        let n_lanes = frontier.n_lanes();
        let pool_width = bw * bw;

        let mut parents = Vec::new();
        parents.try_reserve_exact(n_lanes)?;
        let mut new_tokens = Vec::new();
        new_tokens.try_reserve_exact(n_lanes)?;
        let mut raw = Vec::new();
        raw.try_reserve_exact(n_lanes)?;
        let mut scores = Vec::new();
        scores.try_reserve_exact(n_lanes)?;

        for batch in 0..frontier.batch_size() {
            let offset = batch * pool_width;
            for (flat, value) in top_k(&expansion.ranked[offset..offset + pool_width], bw) {
                let candidate = offset + flat;
                parents.push(resolve_parent(batch, flat, bw));
                new_tokens.push(expansion.tokens[candidate]);
                raw.push(expansion.raw[candidate]);
                scores.push(value);
            }
        }

        let mut tokens = gather(frontier.tokens, &parents)?;
        let mut done = gather(frontier.done, &parents)?;
        let multipliers = expansion
            .multipliers
            .map(|m| gather(m, &parents))
            .transpose()?;

        for ((history, finished), &token) in tokens.iter_mut().zip(done.iter_mut()).zip(&new_tokens) {
            history.push(token);
            *finished |= token == self.stop_token;
        }

        let selected = BeamFrontier {
            beam_width: frontier.beam_width,
            tokens,
            scores,
            raw,
            done,
            multipliers,
        };
        Ok((selected, parents))
    }

    /// Report rank 0, or every beam with `return_all`
    fn collect(&self, frontier: &BeamFrontier, steps: usize) -> DecodeOutput {
        let keep = if self.return_all { self.beam_width } else { 1 };
        let beams = (0..frontier.batch_size())
            .map(|batch| {
                (0..keep)
                    .map(|beam| {
                        let lane = global_lane(batch, beam, self.beam_width);
                        Hypothesis::from_history(
                            frontier.tokens(lane),
                            frontier.score(lane),
                            frontier.is_done(lane),
                            self.stop_token,
                        )
                    })
                    .collect()
            })
            .collect();
        DecodeOutput { beams, steps }
    }
}

impl Default for BeamDecoder {
    fn default() -> Self {
        Self::new(5, DecodeConfig::default().max_len)
    }
}
