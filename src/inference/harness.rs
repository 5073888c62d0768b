//! Single decoding step
//!
//! [`StepHarness`] advances every lane of a call by one position:
//!
//! 1. Build the input unit: `embed(token) * sqrt(d_model) + position(step)`,
//!    or the start vector when no token is given (step 0)
//! 2. Run the layer stack in depth order, threading each layer's own cache
//! 3. Project the last layer's output to log-probabilities
//!
//! Lanes are independent within a step and run through
//! [`crate::parallel::parallel_try_map_owned`].

use crate::error::{DecodeError, DecodeResult};
use crate::inference::cache::CacheSet;
use crate::model::{Classifier, DecoderModel, Embedder, EncoderMemory, LayerStep, PositionEncoder};
use crate::parallel::parallel_try_map_owned;

/// Log-probability rows for every lane of one step (n_lanes x vocab)
#[derive(Debug, Clone)]
pub struct LogProbs {
    data: Vec<f32>,
    vocab: usize,
}

impl LogProbs {
    /// Assemble from per-lane rows of equal width
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] if a row has the wrong width
    pub fn from_rows(rows: Vec<Vec<f32>>, vocab: usize) -> DecodeResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(rows.len() * vocab)?;
        for (lane, row) in rows.into_iter().enumerate() {
            if row.len() != vocab {
                return Err(DecodeError::InvalidShape(format!(
                    "lane {lane} has {} log-probs, expected {vocab}",
                    row.len()
                )));
            }
            data.extend(row);
        }
        Ok(Self { data, vocab })
    }

    /// Number of lanes
    #[must_use]
    pub fn n_lanes(&self) -> usize {
        self.data.len() / self.vocab
    }

    /// Vocabulary size
    #[must_use]
    pub const fn vocab_size(&self) -> usize {
        self.vocab
    }

    /// Row for `lane`
    #[must_use]
    pub fn row(&self, lane: usize) -> &[f32] {
        &self.data[lane * self.vocab..(lane + 1) * self.vocab]
    }
}

/// Index and value of the largest entry, first occurrence on ties
#[must_use]
pub fn argmax(values: &[f32]) -> (usize, f32) {
    let mut max_idx = 0;
    let mut max_val = f32::NEG_INFINITY;

    for (idx, &val) in values.iter().enumerate() {
        if val > max_val {
            max_val = val;
            max_idx = idx;
        }
    }

    (max_idx, max_val)
}

/// Add a log-probability to a running score, rejecting NaN and `+inf`
///
/// # Errors
/// Returns [`DecodeError::Numeric`] if the sum is not a valid log score
pub(crate) fn accumulate(score: f32, log_prob: f32, lane: usize) -> DecodeResult<f32> {
    let sum = score + log_prob;
    if sum.is_nan() || sum == f32::INFINITY {
        return Err(DecodeError::Numeric(format!(
            "lane {lane}: score {score} + log-prob {log_prob} = {sum}"
        )));
    }
    Ok(sum)
}

/// Top `k` entries by value, descending
///
/// Stable: equal values keep their original order, so the first occurrence
/// wins a tie. Runs in O(len * k), which suits the small `k` of a beam.
#[must_use]
pub fn top_k(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    if k == 0 {
        return Vec::new();
    }

    let mut best: Vec<(usize, f32)> = Vec::with_capacity(k + 1);
    for (idx, &val) in values.iter().enumerate() {
        if best.len() == k && best.last().is_some_and(|&(_, worst)| val <= worst) {
            continue;
        }
        let pos = best
            .iter()
            .position(|&(_, kept)| val > kept)
            .unwrap_or(best.len());
        best.insert(pos, (idx, val));
        best.truncate(k);
    }
    best
}

/// Drives one decoding step for all lanes of a call
#[derive(Debug)]
pub struct StepHarness<'a, L, E, P, K> {
    model: &'a DecoderModel<L, E, P, K>,
    memory: &'a EncoderMemory,
}

impl<'a, L, E, P, K> StepHarness<'a, L, E, P, K>
where
    L: LayerStep,
    E: Embedder,
    P: PositionEncoder,
    K: Classifier,
{
    /// Bind a model to the encoder memory of one call
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] if the memory does not match the
    /// decoder depth or width
    pub fn new(model: &'a DecoderModel<L, E, P, K>, memory: &'a EncoderMemory) -> DecodeResult<Self> {
        model.check_memory(memory)?;
        Ok(Self { model, memory })
    }

    /// Batch size of the bound memory
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.memory.batch_size()
    }

    /// Vocabulary size of the model
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Decoder depth
    #[must_use]
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Advance every lane by one position
    ///
    /// With `tokens = None` each batch element gets one lane fed the start
    /// vector. Otherwise there is one lane per token and the lane count must
    /// be a multiple of the batch size; lane `i` reads encoder memory of
    /// batch element `i / (n_lanes / batch_size)`.
    ///
    /// # Returns
    /// Log-probabilities per lane and the extended cache set
    ///
    /// # Errors
    /// Returns an error on lane/cache shape mismatches or any collaborator
    /// failure; the step is abandoned as a whole
    pub fn step(
        &self,
        caches: Option<CacheSet<L::Cache>>,
        tokens: Option<&[u32]>,
        step_index: usize,
    ) -> DecodeResult<(LogProbs, CacheSet<L::Cache>)> {
        let _guard = trace_enter!("decode_step", step = step_index);

        let batch_size = self.batch_size();
        let depth = self.n_layers();
        let n_lanes = tokens.map_or(batch_size, <[u32]>::len);
        if n_lanes == 0 || n_lanes % batch_size != 0 {
            return Err(DecodeError::InvalidShape(format!(
                "{n_lanes} lanes cannot be split across batch of {batch_size}"
            )));
        }
        let lanes_per_batch = n_lanes / batch_size;

        let lane_caches: Vec<Option<Vec<L::Cache>>> = match caches {
            Some(set) => {
                if set.n_lanes() != n_lanes || set.depth() != depth {
                    return Err(DecodeError::InvalidShape(format!(
                        "cache set is {} lanes x {} layers, step needs {n_lanes} x {depth}",
                        set.n_lanes(),
                        set.depth()
                    )));
                }
                set.into_lanes().into_iter().map(Some).collect()
            }
            None => (0..n_lanes).map(|_| None).collect(),
        };

        let work: Vec<(Option<u32>, Option<Vec<L::Cache>>)> = lane_caches
            .into_iter()
            .enumerate()
            .map(|(lane, cache)| (tokens.map(|t| t[lane]), cache))
            .collect();

        let results = parallel_try_map_owned(work, |lane, (token, cache)| {
            self.run_lane(lane / lanes_per_batch, token, cache, step_index)
        })?;

        let mut rows = Vec::new();
        rows.try_reserve_exact(n_lanes)?;
        let mut lanes = Vec::new();
        lanes.try_reserve_exact(n_lanes)?;
        for (row, lane_cache) in results {
            rows.push(row);
            lanes.push(lane_cache);
        }

        Ok((
            LogProbs::from_rows(rows, self.vocab_size())?,
            CacheSet::from_lanes(lanes, depth)?,
        ))
    }

    /// Embed, run every layer with its own cache, and project one lane
    fn run_lane(
        &self,
        batch: usize,
        token: Option<u32>,
        cache: Option<Vec<L::Cache>>,
        step_index: usize,
    ) -> DecodeResult<(Vec<f32>, Vec<L::Cache>)> {
        let mut x = self.model.input_unit(token, step_index)?;
        let mut prior = cache.map(Vec::into_iter);
        let mut updated = Vec::with_capacity(self.n_layers());

        for (depth, layer) in self.model.layers().iter().enumerate() {
            let layer_cache = prior.as_mut().and_then(Iterator::next);
            let (out, next) = layer.step(self.memory.layer(depth, batch), layer_cache, &x, true)?;
            x = out;
            updated.push(next);
        }

        Ok((self.model.project(&x)?, updated))
    }
}
