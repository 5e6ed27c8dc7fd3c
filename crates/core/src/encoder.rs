//! Convolutional frame encoder.
//!
//! A grayscale-input trunk of stride-2 convolutions with a global average
//! pool, plus the linear classification layer it was pretrained with. After
//! loading, the classification layer is bypassed and the trunk serves as a
//! frozen feature extractor ([`ConvEncoder::forward_features`]).

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

use stager_common::SleepStagerConfig;

/// Grayscale image classifier used as the frame-level feature extractor.
///
/// Input: `(batch, 1, image_size, image_size)`. The pretraining checkpoint
/// schema is one 7×7 stride-2 stem, one 3×3 stride-2 conv per remaining
/// trunk stage, and a `feature_dim → num_classes` linear head.
pub struct ConvEncoder {
    stem: Conv2d,
    stages: Vec<Conv2d>,
    fc: Linear,
    feature_dim: usize,
}

impl ConvEncoder {
    /// Build the encoder from a `VarBuilder`. Used for pretraining and for
    /// hydrating from a pretrained checkpoint; shape mismatches between the
    /// backing tensors and the declared architecture surface here.
    pub fn new(vb: VarBuilder, config: &SleepStagerConfig) -> Result<Self> {
        let channels = &config.encoder_channels;
        let Some(&stem_out) = channels.first() else {
            candle_core::bail!("encoder_channels must not be empty");
        };
        let stem = conv2d(
            1,
            stem_out,
            7,
            Conv2dConfig {
                stride: 2,
                padding: 3,
                ..Default::default()
            },
            vb.pp("stem"),
        )?;
        let mut stages = Vec::with_capacity(channels.len() - 1);
        let mut in_channels = stem_out;
        for (i, &out_channels) in channels.iter().enumerate().skip(1) {
            stages.push(conv2d(
                in_channels,
                out_channels,
                3,
                Conv2dConfig {
                    stride: 2,
                    padding: 1,
                    ..Default::default()
                },
                vb.pp(format!("stage{i}")),
            )?);
            in_channels = out_channels;
        }
        let fc = linear(in_channels, config.num_classes(), vb.pp("fc"))?;
        Ok(Self {
            stem,
            stages,
            fc,
            feature_dim: in_channels,
        })
    }

    /// Load the pretrained checkpoint as a frozen encoder.
    ///
    /// Weights come in as plain tensors (not `Var`s), so no gradient ever
    /// flows to them. Fatal if the file is unreadable or its shapes do not
    /// match the declared architecture.
    pub fn load_pretrained(
        path: &Path,
        config: &SleepStagerConfig,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("read pretrained encoder {}", path.display()))?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(vb, config).with_context(|| {
            format!(
                "pretrained encoder {} does not match the declared architecture",
                path.display()
            )
        })
    }

    /// Pooled feature vector `(batch, feature_dim)`, bypassing the
    /// classification layer.
    pub fn forward_features(&self, frames: &Tensor) -> Result<Tensor> {
        let mut x = self.stem.forward(frames)?.relu()?;
        for stage in &self.stages {
            x = stage.forward(&x)?.relu()?;
        }
        // Global average pool over the spatial dims.
        x.flatten_from(2)?.mean(D::Minus1)
    }

    /// Class logits through the pretraining head `(batch, num_classes)`.
    pub fn forward(&self, frames: &Tensor) -> Result<Tensor> {
        self.fc.forward(&self.forward_features(frames)?)
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// All encoder tensors under their checkpoint-schema names
    /// (`stem.*`, `stage<i>.*`, `fc.*`).
    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = vec![("stem.weight".to_string(), self.stem.weight().clone())];
        if let Some(bias) = self.stem.bias() {
            out.push(("stem.bias".to_string(), bias.clone()));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            out.push((format!("stage{}.weight", i + 1), stage.weight().clone()));
            if let Some(bias) = stage.bias() {
                out.push((format!("stage{}.bias", i + 1), bias.clone()));
            }
        }
        out.push(("fc.weight".to_string(), self.fc.weight().clone()));
        if let Some(bias) = self.fc.bias() {
            out.push(("fc.bias".to_string(), bias.clone()));
        }
        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
