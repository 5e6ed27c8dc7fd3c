//! Label-smoothed cross-entropy.

use candle_core::{Result, Tensor};
use candle_nn::{loss, ops};

/// Cross-entropy against a smoothed target distribution.
///
/// The true class receives probability `(1 − ε) + ε/K`, every other class
/// `ε/K`. Equivalent to `(1 − ε)·NLL + (ε/K)·Σ_c(−log p_c)`, mean-reduced
/// over the batch. With `ε = 0` this is exactly standard cross-entropy.
pub fn cross_entropy_label_smoothing(
    logits: &Tensor,
    targets: &Tensor,
    smoothing: f64,
    num_classes: usize,
) -> Result<Tensor> {
    if smoothing <= 0.0 {
        return loss::cross_entropy(logits, targets);
    }
    let log_probs = ops::log_softmax(logits, 1)?;
    let nll = loss::nll(&log_probs, targets)?;
    let sum_log = log_probs.sum(1)?;
    let neg_sum_mean = (sum_log.neg()?.mean_all()?.to_scalar::<f32>()?) as f64;
    let s = smoothing;
    let k = num_classes as f64;
    nll.affine(1.0 - s, s / k * neg_sum_mean)
}

// ── Tests ───────────────────────────────────────────────────────────────────
