//! Per-call layer cache set
//!
//! One opaque cache handle per (lane, layer depth). The set is created by the
//! first decoding step, threaded through every later step, and reordered in
//! lockstep with the beam so that cache lane `i` always belongs to hypothesis
//! lane `i`. Nothing outside the owning [`crate::model::LayerStep`] looks
//! inside a handle.

use crate::error::{DecodeError, DecodeResult};

/// Layer caches for every lane of one decode call
#[derive(Debug, Clone)]
pub struct CacheSet<C> {
    /// lanes[lane][depth]
    lanes: Vec<Vec<C>>,
    depth: usize,
}

impl<C: Clone> CacheSet<C> {
    /// Build a set from per-lane handles, each holding one entry per layer
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidShape`] if any lane has the wrong depth
    pub fn from_lanes(lanes: Vec<Vec<C>>, depth: usize) -> DecodeResult<Self> {
        if let Some((lane, handles)) = lanes.iter().enumerate().find(|(_, h)| h.len() != depth) {
            return Err(DecodeError::InvalidShape(format!(
                "cache lane {lane} has {} layers, expected {depth}",
                handles.len()
            )));
        }
        Ok(Self { lanes, depth })
    }

    /// Number of lanes
    #[must_use]
    pub fn n_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Number of layers per lane
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Handle for `(lane, layer)`
    #[must_use]
    pub fn get(&self, lane: usize, layer: usize) -> Option<&C> {
        self.lanes.get(lane).and_then(|handles| handles.get(layer))
    }

    /// Reorder lanes so new lane `i` holds old lane `parents[i]`
    ///
    /// # Errors
    /// Returns an error if a parent index is out of range or the new lane
    /// buffer cannot be allocated
    pub fn reorder(self, parents: &[usize]) -> DecodeResult<Self> {
        let depth = self.depth;
        let lanes = gather(self.lanes, parents)?;
        Ok(Self { lanes, depth })
    }

    /// Hand the per-lane handles back to the caller
    #[must_use]
    pub fn into_lanes(self) -> Vec<Vec<C>> {
        self.lanes
    }
}

/// Gather `items` by `parents`, moving each source on its last use
///
/// A parent selected `n` times is cloned `n - 1` times; unselected lanes are
/// dropped.
pub(crate) fn gather<T: Clone>(items: Vec<T>, parents: &[usize]) -> DecodeResult<Vec<T>> {
    let n_items = items.len();
    let mut remaining = vec![0_usize; n_items];
    for &parent in parents {
        let slot = remaining.get_mut(parent).ok_or_else(|| {
            DecodeError::InvalidShape(format!("parent lane {parent} out of range {n_items}"))
        })?;
        *slot += 1;
    }

    let mut sources: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut gathered = Vec::new();
    gathered.try_reserve_exact(parents.len())?;

    for &parent in parents {
        remaining[parent] -= 1;
        let item = if remaining[parent] == 0 {
            sources[parent].take()
        } else {
            sources[parent].clone()
        };
        // Counts guarantee the source is still present here
        let item = item.ok_or_else(|| {
            DecodeError::InvalidShape(format!("parent lane {parent} consumed twice"))
        })?;
        gathered.push(item);
    }

    Ok(gathered)
}
