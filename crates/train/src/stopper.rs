//! Early stopping on validation loss, with best-checkpoint persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Tensor;

/// Monitors validation loss across epochs.
///
/// On improvement (beyond `min_delta`) the full model state handed in by the
/// trainer is committed to the checkpoint path and the patience counter
/// resets; otherwise the counter increments, and reaching `patience` raises
/// the stop flag.
///
/// The checkpoint is the only durable artifact this type mutates. Writes go
/// through a temp file and a rename, so a crash mid-write never leaves a
/// corrupt best-model file.
pub struct EarlyStopping {
    path: PathBuf,
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    counter: usize,
    stop: bool,
}

impl EarlyStopping {
    pub fn new(path: impl Into<PathBuf>, patience: usize, min_delta: f64) -> Self {
        Self {
            path: path.into(),
            patience: patience.max(1),
            min_delta,
            best: None,
            counter: 0,
            stop: false,
        }
    }

    /// Feed one epoch's validation loss together with the current full-model
    /// snapshot. Saves on improvement, counts otherwise; check
    /// [`Self::should_stop`] afterwards.
    pub fn observe(&mut self, val_loss: f64, state: &HashMap<String, Tensor>) -> Result<()> {
        let improved = match self.best {
            None => true,
            Some(best) => val_loss < best - self.min_delta,
        };
        if improved {
            self.commit(state)
                .with_context(|| format!("save checkpoint {}", self.path.display()))?;
            tracing::info!(
                val_loss = format!("{val_loss:.6}"),
                previous = self.best.map(|b| format!("{b:.6}")),
                "validation loss improved, checkpoint saved"
            );
            self.best = Some(val_loss);
            self.counter = 0;
        } else {
            self.counter += 1;
            tracing::debug!(
                counter = self.counter,
                patience = self.patience,
                "validation loss did not improve"
            );
            if self.counter >= self.patience {
                self.stop = true;
            }
        }
        Ok(())
    }

    fn commit(&self, state: &HashMap<String, Tensor>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        candle_core::safetensors::save(state, &tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Whether training should halt.
    pub fn should_stop(&self) -> bool {
        self.stop
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.path
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn model_state() -> HashMap<String, Tensor> {
        HashMap::from([(
            "w".to_string(),
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        )])
    }

    #[test]
    fn decreasing_losses_never_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let state = model_state();
        let mut stopper = EarlyStopping::new(tmp.path().join("best.safetensors"), 3, 0.0);
        for i in 0..10 {
            stopper.observe(1.0 - i as f64 * 0.05, &state).unwrap();
            assert!(!stopper.should_stop());
        }
        assert!(stopper.checkpoint_path().exists());
    }

    #[test]
    fn constant_losses_stop_exactly_after_patience() {
        let tmp = tempfile::tempdir().unwrap();
        let state = model_state();
        let patience = 3;
        let mut stopper = EarlyStopping::new(tmp.path().join("best.safetensors"), patience, 0.0);
        // First observation saves and sets the baseline.
        stopper.observe(0.5, &state).unwrap();
        assert!(!stopper.should_stop());
        // The next `patience − 1` constant values only count.
        for _ in 0..patience - 1 {
            stopper.observe(0.5, &state).unwrap();
            assert!(!stopper.should_stop());
        }
        // (patience + 1)-th call overall trips the flag.
        stopper.observe(0.5, &state).unwrap();
        assert!(stopper.should_stop());
    }

    #[test]
    fn improvement_resets_the_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let state = model_state();
        let mut stopper = EarlyStopping::new(tmp.path().join("best.safetensors"), 2, 0.0);
        stopper.observe(1.0, &state).unwrap();
        stopper.observe(1.0, &state).unwrap();
        stopper.observe(0.5, &state).unwrap();
        stopper.observe(0.5, &state).unwrap();
        assert!(!stopper.should_stop());
        stopper.observe(0.5, &state).unwrap();
        assert!(stopper.should_stop());
        assert_eq!(stopper.best_loss(), Some(0.5));
    }

    #[test]
    fn commit_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let state = model_state();
        let path = tmp.path().join("best.safetensors");
        let mut stopper = EarlyStopping::new(&path, 2, 0.0);
        stopper.observe(1.0, &state).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let entries = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
