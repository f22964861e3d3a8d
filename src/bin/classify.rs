//! 分類バイナリ
//!
//! 画像を分類して確信度ゲートを通し、確定ラベルの分別先を表示します。
//! 確信度が低い場合は `--choose` か標準入力で上位2候補から選びます。
//! `--progress` を指定すると報酬イベントを適用して進捗ファイルを更新します。

use anyhow::{bail, Context, Result};
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, ValueEnum};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use ecovision_lib::bin_rules::{BinRules, DisposalDecision};
use ecovision_lib::gate::{ConfidenceGate, FinalLabel, GateDecision, HumanChoice, PendingChoice};
use ecovision_lib::ml::InferenceEngine;
use ecovision_lib::model::{AppConfig, DeviceType};
use ecovision_lib::rewards::{RewardEngine, RewardEvent, UserProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ChoiceArg {
    First,
    Second,
}

impl From<ChoiceArg> for HumanChoice {
    fn from(choice: ChoiceArg) -> Self {
        match choice {
            ChoiceArg::First => HumanChoice::First,
            ChoiceArg::Second => HumanChoice::Second,
        }
    }
}

/// 確定後にユーザーが取った行動
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ActionArg {
    Dispose,
    Donate,
}

#[derive(Parser, Debug)]
#[command(name = "classify", about = "Classify waste images and show where they go")]
struct ClassifyArgs {
    /// Image files to classify.
    #[arg(required = true)]
    images: Vec<PathBuf>,
    /// Configuration file (defaults are used when it does not exist).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Override the model archive path.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Override the class catalog path.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Answer for low-confidence predictions (otherwise asked on stdin).
    #[arg(long, value_enum)]
    choose: Option<ChoiceArg>,
    /// Replace the finalized label with this class.
    #[arg(long)]
    correct: Option<String>,
    /// User progress file to update with reward points.
    #[arg(long)]
    progress: Option<PathBuf>,
    /// What was done with the item (rewarded when --progress is given).
    #[arg(long, value_enum, default_value_t = ActionArg::Dispose)]
    action: ActionArg,
    /// Force the CPU backend regardless of the configuration.
    #[arg(long)]
    cpu: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn ask_on_stdin(pending: &PendingChoice) -> Result<HumanChoice> {
    if !std::io::stdin().is_terminal() {
        bail!("low-confidence prediction needs --choose first|second");
    }
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!(
            "Not sure. 1) {} ({:.1}%)  2) {} ({:.1}%)  > ",
            pending.first().label,
            pending.first().probability * 100.0,
            pending.second().label,
            pending.second().probability * 100.0
        );
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            bail!("no choice given");
        }
        match line.trim() {
            "1" => return Ok(HumanChoice::First),
            "2" => return Ok(HumanChoice::Second),
            other => println!("please answer 1 or 2 (got {other:?})"),
        }
    }
}

fn finalize(decision: GateDecision, preset: Option<ChoiceArg>) -> Result<FinalLabel> {
    match decision {
        GateDecision::AutoAccept(label) => Ok(label),
        GateDecision::NeedsHumanChoice(pending) => {
            let choice = match preset {
                Some(choice) => choice.into(),
                None => ask_on_stdin(&pending)?,
            };
            Ok(pending.choose(choice))
        }
    }
}

fn load_progress(path: &Path) -> Result<UserProgress> {
    if !path.exists() {
        return Ok(UserProgress::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn save_progress(path: &Path, progress: &UserProgress) -> Result<()> {
    let json = serde_json::to_string_pretty(progress)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn run<B: Backend>(args: &ClassifyArgs, config: &AppConfig, device: B::Device) -> Result<()> {
    let model_path = args.model.as_ref().unwrap_or(&config.model.model_path);
    let catalog_path = args.catalog.as_ref().unwrap_or(&config.model.catalog_path);
    let engine = InferenceEngine::<B>::load(model_path, catalog_path, &device)
        .with_context(|| format!("failed to load model {}", model_path.display()))?;

    let gate = ConfidenceGate::new(config.inference.confidence_threshold)?;
    let rules = BinRules::load_or_default(config.inference.bin_rules_path.as_deref())?;
    let rewards = RewardEngine::default();
    let mut progress = match &args.progress {
        Some(path) => Some(load_progress(path)?),
        None => None,
    };

    for path in &args.images {
        let ranked = engine
            .classify_path(path)
            .with_context(|| format!("failed to classify {}", path.display()))?;
        let mut label = finalize(gate.decide(ranked), args.choose)?;
        if let Some(class_name) = &args.correct {
            label = label.correct(engine.catalog(), class_name)?;
        }
        let decision = DisposalDecision::resolve(label, &rules);

        let confidence = decision
            .label
            .confidence()
            .map(|p| format!("{:.1}%", p * 100.0))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}: {} ({}, {:?}) -> {}",
            path.display(),
            decision.label.label(),
            confidence,
            decision.label.source(),
            decision.bin
        );

        if let Some(current) = progress.take() {
            let confirmed = rewards.apply(&current, RewardEvent::PredictionConfirmed(&decision.label));
            let action = match args.action {
                ActionArg::Dispose => RewardEvent::Disposed(&decision),
                ActionArg::Donate => RewardEvent::DonatedOrSold(&decision),
            };
            progress = Some(rewards.apply(&confirmed, action));
        }
    }

    if let (Some(path), Some(progress)) = (&args.progress, &progress) {
        save_progress(path, progress)?;
        let badges: Vec<&str> = progress.badges.iter().map(|b| b.name()).collect();
        println!(
            "points: {}  avatar: {}  badges: [{}]",
            progress.points,
            progress.avatar().name(),
            badges.join(", ")
        );
        if let Some((stage, remaining)) = progress.next_stage() {
            println!("{remaining} points to {}", stage.name());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let args = ClassifyArgs::parse();

    let config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let device_type = if args.cpu { DeviceType::Cpu } else { config.device_type };

    match device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run::<burn_wgpu::Wgpu>(&args, &config, burn_wgpu::WgpuDevice::default()),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("built without the wgpu feature, falling back to {}", DeviceType::Cpu);
            run::<NdArray>(&args, &config, NdArrayDevice::Cpu)
        }
        DeviceType::Cpu => run::<NdArray>(&args, &config, NdArrayDevice::Cpu),
    }
}
