//! 評価バイナリ
//!
//! 保存済みモデルでラベル付き画像ディレクトリを推論し、分類レポートを表示します。

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ecovision_lib::ml::{evaluate_directory, ClassificationReport, InferenceEngine};
use ecovision_lib::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "evaluate", about = "Report per-class precision/recall/F1 on a labelled image tree")]
struct EvalArgs {
    /// Dataset root (one subdirectory per class, names must exist in the model catalog).
    data_dir: PathBuf,
    /// Configuration file (defaults are used when it does not exist).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Override the model archive path.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Override the class catalog path.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Images per inference batch.
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    /// Force the CPU backend regardless of the configuration.
    #[arg(long)]
    cpu: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run<B: Backend>(args: &EvalArgs, config: &AppConfig, device: B::Device) -> Result<ClassificationReport> {
    let model_path = args.model.as_ref().unwrap_or(&config.model.model_path);
    let catalog_path = args.catalog.as_ref().unwrap_or(&config.model.catalog_path);

    let engine = InferenceEngine::<B>::load(model_path, catalog_path, &device)
        .with_context(|| format!("failed to load model {}", model_path.display()))?;
    tracing::info!("{}", engine.metadata().summary());

    evaluate_directory(&engine, &args.data_dir, args.batch_size)
        .with_context(|| format!("evaluation of {} failed", args.data_dir.display()))
}

fn main() -> Result<()> {
    init_tracing();
    let args = EvalArgs::parse();

    let config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let device_type = if args.cpu { DeviceType::Cpu } else { config.device_type };

    let report = match device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run::<burn_wgpu::Wgpu>(&args, &config, burn_wgpu::WgpuDevice::default())?,
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("built without the wgpu feature, falling back to {}", DeviceType::Cpu);
            run::<NdArray>(&args, &config, NdArrayDevice::Cpu)?
        }
        DeviceType::Cpu => run::<NdArray>(&args, &config, NdArrayDevice::Cpu)?,
    };

    println!("{report}");
    Ok(())
}
