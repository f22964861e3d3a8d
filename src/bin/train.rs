//! 学習バイナリ
//!
//! クラスごとのディレクトリに分かれた画像から分類器を2段階で学習し、
//! モデルアーカイブとクラスカタログを保存します。

#![recursion_limit = "256"]

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ecovision_lib::ml::{train_model, BackboneWeights, EpochStats, TrainingReport, TrainingRequest};
use ecovision_lib::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the waste classifier on a class-per-directory image tree")]
struct TrainArgs {
    /// Dataset root (one subdirectory per class).
    data_dir: PathBuf,
    /// Configuration file (defaults are used when it does not exist).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Override the model archive output path.
    #[arg(long)]
    model_out: Option<PathBuf>,
    /// Override the class catalog output path.
    #[arg(long)]
    catalog_out: Option<PathBuf>,
    /// Start from randomly initialised backbone weights instead of the pretrained record.
    #[arg(long)]
    untrained_backbone: bool,
    /// Write the per-epoch history as CSV.
    #[arg(long)]
    history: Option<PathBuf>,
    /// Force the CPU backend regardless of the configuration.
    #[arg(long)]
    cpu: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_request(args: &TrainArgs, config: &AppConfig) -> TrainingRequest {
    let backbone = if args.untrained_backbone {
        tracing::warn!("training from an untrained backbone");
        BackboneWeights::Untrained
    } else {
        config.model.backbone_weights()
    };
    TrainingRequest {
        data_dir: args.data_dir.clone(),
        model_path: args
            .model_out
            .clone()
            .unwrap_or_else(|| config.model.model_path.clone()),
        catalog_path: args
            .catalog_out
            .clone()
            .unwrap_or_else(|| config.model.catalog_path.clone()),
        classifier: config.model.classifier_template(),
        backbone,
        training: config.training.clone(),
        augmentation: config.augmentation.clone(),
    }
}

fn log_epoch(stats: &EpochStats) {
    tracing::info!(
        "[{}] epoch {}: train_loss={:.4} train_acc={:.3} val_loss={:.4} val_acc={:.3}",
        stats.phase,
        stats.epoch,
        stats.train_loss,
        stats.train_accuracy,
        stats.val_loss,
        stats.val_accuracy
    );
}

fn run<B: AutodiffBackend>(request: &TrainingRequest, device: B::Device) -> Result<TrainingReport> {
    train_model::<B, _>(request, &device, log_epoch).with_context(|| {
        format!("training on {} failed", request.data_dir.display())
    })
}

fn main() -> Result<()> {
    init_tracing();
    let args = TrainArgs::parse();

    let config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let request = build_request(&args, &config);
    let device_type = if args.cpu { DeviceType::Cpu } else { config.device_type };

    let report = match device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run::<Autodiff<burn_wgpu::Wgpu>>(&request, burn_wgpu::WgpuDevice::default())?,
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("built without the wgpu feature, falling back to {}", DeviceType::Cpu);
            run::<Autodiff<NdArray>>(&request, NdArrayDevice::Cpu)?
        }
        DeviceType::Cpu => run::<Autodiff<NdArray>>(&request, NdArrayDevice::Cpu)?,
    };

    if let Some(path) = &args.history {
        report
            .history
            .write_csv(path)
            .with_context(|| format!("failed to write history {}", path.display()))?;
        tracing::info!("wrote training history to {}", path.display());
    }

    println!("classes: {}", report.catalog.names().join(", "));
    if let Some(last) = report.history.epochs().last() {
        println!(
            "final [{}] epoch {}: val_loss={:.4} val_acc={:.3}",
            last.phase, last.epoch, last.val_loss, last.val_accuracy
        );
    }
    println!("model:   {}", report.model_path.display());
    println!("catalog: {}", report.catalog_path.display());
    Ok(())
}
