//! Trainer: encapsulates the full epoch loop.
//!
//! Decouples the compute graph (forward + loss) from the optimisation step
//! (backward, SGD, schedule advance) and from the stopping policy. At every
//! epoch boundary the trainable state is rehydrated from the committed best
//! checkpoint, so the model always enters an epoch at its best-known state.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use stager_common::{decode_pool, BatchLoader, SleepSeqDataset, SleepStagerConfig};
use stager_core::{ConvEncoder, SleepStager};

use crate::loss::cross_entropy_label_smoothing;
use crate::optim::{ParamsSgdMomentum, SgdMomentum};
use crate::scheduler::CosineWarmRestarts;
use crate::stopper::EarlyStopping;

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub t_mult: usize,
    pub momentum: f64,
    pub weight_decay: f64,
    pub label_smoothing: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub num_workers: usize,
    pub seed: u64,
    pub checkpoint_path: PathBuf,
}

/// Per-epoch summary, normalised by dataset size.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_accuracy: f64,
    pub train_loss: f64,
    pub valid_accuracy: f64,
    pub valid_loss: f64,
    pub lr: f64,
}

// ── Execution strategy ──────────────────────────────────────────────────────

/// Uniform forward-and-loss interface over one- or multi-device execution.
///
/// The trainer performs exactly one logical optimiser step per batch through
/// this seam and accumulates correct/loss counters deterministically; a
/// replicated implementation would average gradients before handing the loss
/// back. Only [`SingleDevice`] is provided here.
pub trait ExecutionStrategy {
    fn device(&self) -> &Device;

    /// Forward one batch and return `(mean loss, correct predictions)`.
    fn forward_loss(
        &self,
        model: &SleepStager,
        frames: &Tensor,
        labels: &Tensor,
        smoothing: f64,
        num_classes: usize,
    ) -> candle_core::Result<(Tensor, usize)>;
}

/// Plain single-device execution.
pub struct SingleDevice {
    device: Device,
}

impl SingleDevice {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl ExecutionStrategy for SingleDevice {
    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_loss(
        &self,
        model: &SleepStager,
        frames: &Tensor,
        labels: &Tensor,
        smoothing: f64,
        num_classes: usize,
    ) -> candle_core::Result<(Tensor, usize)> {
        let logits = model.forward(frames)?;
        let loss = cross_entropy_label_smoothing(&logits, labels, smoothing, num_classes)?;
        let predictions = logits.argmax(D::Minus1)?;
        let correct = predictions
            .eq(labels)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()? as usize;
        Ok((loss, correct))
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, schedule, and stopper.
///
/// The encoder stays a frozen reference inside the model; only the LSTM and
/// the classification head live in the trainable [`VarMap`].
pub struct Trainer {
    model: SleepStager,
    varmap: VarMap,
    optimizer: SgdMomentum,
    scheduler: CosineWarmRestarts,
    stopper: EarlyStopping,
    strategy: SingleDevice,
    config: TrainerConfig,
    num_classes: usize,
}

impl Trainer {
    /// Construct a new Trainer around a frozen encoder. Builds the trainable
    /// head from scratch.
    pub fn new(
        encoder: ConvEncoder,
        model_config: &SleepStagerConfig,
        config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SleepStager::new(encoder, vb, model_config)?;

        let optimizer = SgdMomentum::new(
            varmap.all_vars(),
            ParamsSgdMomentum {
                lr: config.lr,
                momentum: config.momentum,
                weight_decay: config.weight_decay,
            },
        )?;
        let scheduler =
            CosineWarmRestarts::new(config.lr, config.lr_min, config.epochs + 1, config.t_mult);
        let stopper = EarlyStopping::new(
            config.checkpoint_path.clone(),
            config.patience,
            config.min_delta,
        );

        Ok(Self {
            model,
            varmap,
            optimizer,
            scheduler,
            stopper,
            strategy: SingleDevice::new(device),
            config,
            num_classes: model_config.num_classes(),
        })
    }

    /// Run the epoch loop until the epoch budget or an early-stop signal.
    ///
    /// Returns the per-epoch history; early stopping is a normal exit, not
    /// an error.
    pub fn fit(
        &mut self,
        train_ds: &SleepSeqDataset,
        valid_ds: &SleepSeqDataset,
    ) -> anyhow::Result<Vec<EpochMetrics>> {
        if train_ds.is_empty() || valid_ds.is_empty() {
            anyhow::bail!("train and validation datasets must be non-empty");
        }
        let pool = decode_pool(self.config.num_workers)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut history = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            let lr = self.scheduler.current_lr();
            self.optimizer.set_learning_rate(lr);

            let (train_correct, train_loss_sum) = self.train_pass(train_ds, &pool, &mut rng)?;
            let (valid_correct, valid_loss_sum) = self.valid_pass(valid_ds, &pool)?;

            let metrics = EpochMetrics {
                epoch,
                train_accuracy: train_correct as f64 / train_ds.len() as f64,
                train_loss: train_loss_sum / train_ds.len() as f64,
                valid_accuracy: valid_correct as f64 / valid_ds.len() as f64,
                valid_loss: valid_loss_sum / valid_ds.len() as f64,
                lr,
            };

            self.scheduler.advance();

            tracing::info!(
                epoch,
                epochs = self.config.epochs,
                train_acc = format!("{:.4}", metrics.train_accuracy),
                train_loss = format!("{:.6}", metrics.train_loss),
                valid_acc = format!("{:.4}", metrics.valid_accuracy),
                valid_loss = format!("{:.6}", metrics.valid_loss),
                lr = format!("{lr:.2e}"),
                "epoch complete"
            );

            let snapshot = self.model.checkpoint_tensors(&self.varmap);
            self.stopper.observe(metrics.valid_loss, &snapshot)?;
            history.push(metrics);

            if self.stopper.should_stop() {
                tracing::info!(epoch, "early stopping: validation loss stalled");
                break;
            }

            // Hydrate from the committed best state before the next epoch.
            // Deliberately unconditional: also runs right after an improving
            // epoch, reloading what was just saved. Only the trainable vars
            // are restored; the encoder copies in the file stay untouched.
            let best = self.stopper.checkpoint_path().to_path_buf();
            self.varmap
                .load(&best)
                .with_context(|| format!("reload best checkpoint {}", best.display()))?;
        }

        Ok(history)
    }

    fn train_pass(
        &mut self,
        dataset: &SleepSeqDataset,
        pool: &rayon::ThreadPool,
        rng: &mut StdRng,
    ) -> anyhow::Result<(usize, f64)> {
        let mut loader = BatchLoader::shuffled(
            dataset,
            self.config.batch_size,
            pool,
            self.strategy.device(),
            rng,
        );
        let mut correct = 0usize;
        let mut loss_sum = 0.0f64;
        while let Some((frames, labels)) = loader.next_batch()? {
            let batch = frames.dim(0)?;
            let (loss, batch_correct) = self.strategy.forward_loss(
                &self.model,
                &frames,
                &labels,
                self.config.label_smoothing,
                self.num_classes,
            )?;
            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;
            correct += batch_correct;
            loss_sum += loss.to_scalar::<f32>()? as f64 * batch as f64;
        }
        Ok((correct, loss_sum))
    }

    fn valid_pass(
        &self,
        dataset: &SleepSeqDataset,
        pool: &rayon::ThreadPool,
    ) -> anyhow::Result<(usize, f64)> {
        let mut loader = BatchLoader::sequential(
            dataset,
            self.config.batch_size,
            pool,
            self.strategy.device(),
        );
        let mut correct = 0usize;
        let mut loss_sum = 0.0f64;
        while let Some((frames, labels)) = loader.next_batch()? {
            let batch = frames.dim(0)?;
            let (loss, batch_correct) = self.strategy.forward_loss(
                &self.model,
                &frames,
                &labels,
                self.config.label_smoothing,
                self.num_classes,
            )?;
            correct += batch_correct;
            loss_sum += loss.to_scalar::<f32>()? as f64 * batch as f64;
        }
        Ok((correct, loss_sum))
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.stopper.best_loss()
    }
}
