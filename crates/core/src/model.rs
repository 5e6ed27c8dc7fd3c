//! Sequence classifier: frozen encoder → LSTM → class logits.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use stager_common::SleepStagerConfig;

use crate::encoder::ConvEncoder;

/// Two-stage sleep stager.
///
/// Each frame of a sequence passes independently through the frozen encoder;
/// the resulting feature vectors feed an LSTM whose final hidden state is
/// projected to per-stage logits. Only the LSTM and the head hold trainable
/// parameters — the encoder is a separate, frozen reference.
pub struct SleepStager {
    encoder: ConvEncoder,
    lstm: LSTM,
    head: Linear,
    seq_len: usize,
}

impl SleepStager {
    /// `vb` supplies the trainable parameters (LSTM + head); the encoder is
    /// taken as-is and never registered with the caller's `VarMap`.
    pub fn new(
        encoder: ConvEncoder,
        vb: VarBuilder,
        config: &SleepStagerConfig,
    ) -> Result<Self> {
        let lstm = lstm(
            encoder.feature_dim(),
            config.lstm_hidden_size,
            LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        let head = linear(config.lstm_hidden_size, config.num_classes(), vb.pp("head"))?;
        Ok(Self {
            encoder,
            lstm,
            head,
            seq_len: config.seq_len,
        })
    }

    /// `(batch, seq_len, 1, image_size, image_size)` → `(batch, num_classes)`
    /// unnormalised logits.
    pub fn forward(&self, frames: &Tensor) -> Result<Tensor> {
        let (_batch, steps, _chans, _h, _w) = frames.dims5()?;
        if steps != self.seq_len {
            candle_core::bail!(
                "expected sequences of {} frames, got {steps}",
                self.seq_len
            );
        }
        let mut features = Vec::with_capacity(steps);
        for step in 0..steps {
            let frame = frames.narrow(1, step, 1)?.squeeze(1)?;
            features.push(self.encoder.forward_features(&frame)?.unsqueeze(1)?);
        }
        let sequence = Tensor::cat(&features, 1)?;
        let states = self.lstm.seq(&sequence)?;
        let Some(last) = states.last() else {
            candle_core::bail!("empty frame sequence");
        };
        self.head.forward(last.h())
    }

    /// Rebuild the full model (frozen encoder and head) from one committed
    /// checkpoint file.
    pub fn from_checkpoint(
        path: &Path,
        config: &SleepStagerConfig,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let encoder = ConvEncoder::new(vb.pp("encoder"), config).with_context(|| {
            format!(
                "checkpoint {} does not match the declared architecture",
                path.display()
            )
        })?;
        Ok(Self::new(encoder, vb, config)?)
    }

    /// Snapshot of the full model parameters: frozen encoder tensors under
    /// `encoder.*` plus the trainable vars from `varmap`.
    pub fn checkpoint_tensors(&self, varmap: &VarMap) -> HashMap<String, Tensor> {
        let mut tensors: HashMap<String, Tensor> = self
            .encoder
            .named_tensors()
            .into_iter()
            .map(|(name, tensor)| (format!("encoder.{name}"), tensor))
            .collect();
        for (name, var) in varmap.data().lock().unwrap().iter() {
            tensors.insert(name.clone(), var.as_tensor().clone());
        }
        tensors
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
