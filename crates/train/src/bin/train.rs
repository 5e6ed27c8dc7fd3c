//! CLI for training the LSTM sequence head over a frozen PSG encoder.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use candle_core::Device;
use clap::Parser;

use stager_common::{load_manifest, split_patients, FrameTransform, SleepSeqDataset, SleepStagerConfig};
use stager_core::ConvEncoder;
use stager_train::{Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "stager-train",
    about = "Train the sleep-stage sequence classifier from a pretrained encoder"
)]
struct Args {
    /// Model config JSON; created with defaults when missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Root directory of per-patient frame directories.
    #[arg(long, default_value = "data/PSG")]
    data_path: PathBuf,
    /// Dataset manifest with the "Patient" list.
    #[arg(long, default_value = "data/PSG.json")]
    manifest: PathBuf,
    /// Directory holding the pretrained encoder and the output checkpoint.
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    /// Pretrained encoder safetensors; defaults to
    /// `<checkpoint_dir>/encoder_<image_size>_fold<folds>.safetensors`.
    #[arg(long)]
    encoder: Option<PathBuf>,
    /// Append-only log file; stderr when unset.
    #[arg(long)]
    log_path: Option<PathBuf>,
    #[arg(long, default_value = "1")]
    batch_size: usize,
    #[arg(long, default_value = "10")]
    epochs: usize,
    #[arg(long, default_value = "0.1")]
    lr: f64,
    #[arg(long, default_value = "1e-4")]
    lr_min: f64,
    #[arg(long, default_value = "2")]
    t_mult: usize,
    #[arg(long, default_value = "0.9")]
    momentum: f64,
    #[arg(long, default_value = "1e-5")]
    weight_decay: f64,
    #[arg(long, default_value = "0.1")]
    label_smoothing: f64,
    #[arg(long, default_value = "7")]
    patience: usize,
    #[arg(long, default_value = "0.0")]
    min_delta: f64,
    #[arg(long, default_value = "8")]
    num_workers: usize,
    #[arg(long, default_value = "777")]
    seed: u64,
    /// Cross-validation fold count; used in checkpoint file naming.
    #[arg(long, default_value = "5")]
    folds: usize,
    #[arg(long, default_value = "0.1")]
    test_fraction: f64,
    #[arg(long, default_value = "0.11")]
    valid_fraction: f64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_path.as_deref())?;

    // Load or create the model config.
    let model_config = if args.config.exists() {
        SleepStagerConfig::load(&args.config)?
    } else {
        let default = SleepStagerConfig::default();
        default.save(&args.config)?;
        tracing::info!(path = %args.config.display(), "created default model config");
        default
    };

    let device = Device::cuda_if_available(0)?;

    let manifest = load_manifest(&args.manifest)?;
    let split = split_patients(
        &manifest.patients,
        args.test_fraction,
        args.valid_fraction,
        args.seed,
    )?;
    tracing::info!(
        train = split.train.len(),
        valid = split.valid.len(),
        test = split.test.len(),
        "patient split"
    );

    let transform = FrameTransform {
        image_size: model_config.image_size,
    };
    let train_ds = SleepSeqDataset::new(
        &split.train,
        &args.data_path,
        &model_config.labels,
        model_config.seq_len,
        transform.clone(),
    )?;
    let valid_ds = SleepSeqDataset::new(
        &split.valid,
        &args.data_path,
        &model_config.labels,
        model_config.seq_len,
        transform,
    )?;
    tracing::info!(
        train_samples = train_ds.len(),
        valid_samples = valid_ds.len(),
        "sequence datasets ready"
    );

    let encoder_path = args.encoder.clone().unwrap_or_else(|| {
        args.checkpoint_dir.join(format!(
            "encoder_{}_fold{}.safetensors",
            model_config.image_size, args.folds
        ))
    });
    let encoder = ConvEncoder::load_pretrained(&encoder_path, &model_config, &device)?;
    tracing::info!(path = %encoder_path.display(), "loaded frozen encoder");

    let checkpoint_path = args.checkpoint_dir.join(format!(
        "lstm_{}_fold{}.safetensors",
        model_config.image_size, args.folds
    ));
    let trainer_config = TrainerConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        lr: args.lr,
        lr_min: args.lr_min,
        t_mult: args.t_mult,
        momentum: args.momentum,
        weight_decay: args.weight_decay,
        label_smoothing: args.label_smoothing,
        patience: args.patience,
        min_delta: args.min_delta,
        num_workers: args.num_workers,
        seed: args.seed,
        checkpoint_path: checkpoint_path.clone(),
    };

    let mut trainer = Trainer::new(encoder, &model_config, trainer_config, device)?;
    let history = trainer.fit(&train_ds, &valid_ds)?;

    tracing::info!(
        epochs_run = history.len(),
        best_valid_loss = trainer.best_loss().map(|l| format!("{l:.6}")),
        checkpoint = %checkpoint_path.display(),
        "training done"
    );
    Ok(())
}

fn init_logging(log_path: Option<&Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
