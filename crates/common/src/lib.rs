//! # stager-common — Shared Primitives
//!
//! Types and utilities shared across the workspace:
//!
//! * **[`SleepStagerConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`Manifest`]** / **[`split_patients`]** — patient list & seeded split.
//! * **[`SleepSeqDataset`]** / **[`BatchLoader`]** — frame sequences & batching.
//! * **[`sequence_batch_to_tensors`]** — decoded batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::SleepStagerConfig;
pub use data::{
    decode_pool, load_manifest, sequence_batch_to_tensors, split_patients, BatchLoader,
    FrameTransform, Manifest, Patient, PatientSplit, SleepSeqDataset,
};
