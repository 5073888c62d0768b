//! # s2s-decode
//!
//! Incremental decoding engine for encoder-decoder sequence models.
//!
//! ## Overview
//!
//! Given a pre-computed encoder representation, the engine produces output
//! token sequences by repeated, cache-threaded single-step expansion:
//!
//! - Greedy decoding (argmax per step)
//! - Beam search with GNMT-style length penalty, `clip_beam` pruning and two
//!   early-stopping policies
//! - Teacher-forced full-sequence scoring with the same layer stack
//!
//! The transformer internals are collaborators behind the traits in
//! [`model`]; [`model::ReferenceLayer`] and friends provide a runnable
//! single-head stack.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use s2s_decode::{decode, DecodeConfig, DecoderModel, EncoderMemory};
//!
//! let model = DecoderModel::new(layers, embedder, positions, classifier)?;
//! let memory = EncoderMemory::new(batch, src_len, d_model, outputs, hidden)?;
//! let config = DecodeConfig::default().with_beam_width(4).with_max_len(128);
//! let sequences = decode(&model, &memory, &config)?.best_sequences();
//! ```
//!
//! ## Features
//!
//! - `parallel`: run the lanes of a step on the rayon pool
//! - `tracing`: DEBUG spans and events via `tracing`
//! - `serde`: serialize configs and outputs

#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]

#[macro_use]
pub mod trace;

pub mod error;
pub mod inference;
pub mod model;
/// Lane-parallel execution with a sequential fallback
pub mod parallel;

pub use error::{DecodeError, DecodeResult};
pub use inference::{
    decode, BeamDecoder, DecodeConfig, DecodeOutput, GreedyDecoder, Hypothesis, StepHarness,
    StopPolicy, DEFAULT_STOP_TOKEN,
};
pub use model::{
    Classifier, DecoderModel, Embedder, EncoderMemory, LayerMemory, LayerStep, PositionEncoder,
};
