//! Lane and candidate index arithmetic
//!
//! A lane is one hypothesis slot addressed by `(batch, beam)` and flattened to
//! `batch * beam_width + beam`. During expansion every lane proposes
//! `beam_width` candidates, so a batch element's candidate pool is laid out as
//! `parent_beam * beam_width + vocab_rank`.

/// Flattened lane index for `(batch, beam)`
#[must_use]
pub const fn global_lane(batch: usize, beam: usize, beam_width: usize) -> usize {
    batch * beam_width + beam
}

/// Batch element that owns `lane`
#[must_use]
pub const fn lane_batch(lane: usize, beam_width: usize) -> usize {
    lane / beam_width
}

/// Split a flat candidate index into `(parent_beam, vocab_rank)`
#[must_use]
pub const fn split_candidate(flat: usize, beam_width: usize) -> (usize, usize) {
    (flat / beam_width, flat % beam_width)
}

/// Global lane of the parent that proposed candidate `flat` in `batch`'s pool
#[must_use]
pub const fn resolve_parent(batch: usize, flat: usize, beam_width: usize) -> usize {
    let (parent_beam, _) = split_candidate(flat, beam_width);
    global_lane(batch, parent_beam, beam_width)
}

/// Permutation that repeats each of `batch_size` lanes `beam_width` times
///
/// Used to widen step-0 state (one lane per batch element) into a full beam.
#[must_use]
pub fn repeat_lanes(batch_size: usize, beam_width: usize) -> Vec<usize> {
    (0..batch_size * beam_width)
        .map(|lane| lane_batch(lane, beam_width))
        .collect()
}
