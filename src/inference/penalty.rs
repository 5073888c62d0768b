//! Length penalty
//!
//! GNMT-style normalization (Wu et al., 2016). A hypothesis that has produced
//! `step + 1` tokens is scored as `raw / lpv(step)` with
//!
//! ```text
//! lpv(step) = (step + 6)^alpha / 6^alpha
//! ```
//!
//! A coefficient of zero disables the penalty entirely rather than evaluating
//! the formula to 1.

/// Length-penalty multiplier source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthPenalty {
    alpha: f32,
    base: f32,
}

impl LengthPenalty {
    /// Penalty for coefficient `alpha`, or `None` when the penalty is off
    #[must_use]
    pub fn new(alpha: f32) -> Option<Self> {
        (alpha > 0.0).then(|| Self {
            alpha,
            base: 6.0_f32.powf(alpha),
        })
    }

    /// Coefficient
    #[must_use]
    pub const fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Multiplier for a hypothesis whose newest token was produced at `step`
    #[must_use]
    pub fn multiplier(&self, step: usize) -> f32 {
        (step as f32 + 6.0).powf(self.alpha) / self.base
    }
}
