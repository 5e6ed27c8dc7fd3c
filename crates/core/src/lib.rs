//! # stager-core — The Model
//!
//! The two-stage sleep-staging network:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`encoder`] | `ConvEncoder` — pretrained grayscale trunk, frozen at load |
//! | [`model`] | `SleepStager` — per-frame features → LSTM → class logits |
//!
//! Everything goes through `candle-core`/`candle-nn`; forward passes are
//! deterministic and hold no state between calls apart from weights.

pub mod encoder;
pub mod model;

pub use encoder::ConvEncoder;
pub use model::SleepStager;
