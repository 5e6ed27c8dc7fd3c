//! Model configuration for the sleep stager.
//!
//! Serialised as JSON next to the checkpoints. Every field has a default so a
//! minimal `{}` JSON produces a working (if small) model, and configs written
//! by older versions keep loading.

use serde::{Deserialize, Serialize};

/// Hyper-parameters for the encoder + LSTM sequence classifier.
///
/// Stored alongside weights for reproducible reload. Backwards-compatible:
/// missing fields fall back to their `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepStagerConfig {
    /// Side length frames are resized to before entering the encoder.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// Number of consecutive frames grouped into one training example.
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    /// Sleep stage names, in label-index order.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    /// Output channels of each stride-2 stage of the convolutional trunk.
    /// The last entry is the encoder feature dimension.
    #[serde(default = "default_encoder_channels")]
    pub encoder_channels: Vec<usize>,
    /// Hidden size of the LSTM sequence head.
    #[serde(default = "default_lstm_hidden_size")]
    pub lstm_hidden_size: usize,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_image_size() -> usize {
    224
}
fn default_seq_len() -> usize {
    5
}
fn default_labels() -> Vec<String> {
    ["Wake", "N1", "N2", "N3", "REM"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_encoder_channels() -> Vec<usize> {
    vec![64, 128, 256, 512]
}
fn default_lstm_hidden_size() -> usize {
    256
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for SleepStagerConfig {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
            seq_len: default_seq_len(),
            labels: default_labels(),
            encoder_channels: default_encoder_channels(),
            lstm_hidden_size: default_lstm_hidden_size(),
        }
    }
}

impl SleepStagerConfig {
    /// Number of sleep-stage classes.
    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Encoder feature dimension (channels of the last trunk stage).
    pub fn feature_dim(&self) -> usize {
        self.encoder_channels.last().copied().unwrap_or(0)
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
