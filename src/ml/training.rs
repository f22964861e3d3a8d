//! 2段階の転移学習
//!
//! 1. HeadOnly: バックボーン全体を凍結し、分類ヘッドのみ学習
//! 2. FineTune: バックボーン先頭 `frozen_layers` 層以外を解凍して低い学習率で微調整
//!
//! どちらの段階もクラス重み付きクロスエントロピーで学習し、検証損失で早期終了します。

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        activation::log_softmax,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_dataset::Dataset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EcoVisionError, Result};
use crate::ml::augment::{AugmentationConfig, Augmenter};
use crate::ml::backbone::{BackboneWeights, BACKBONE_LAYERS};
use crate::ml::class_weights::ClassWeightTable;
use crate::ml::dataset::{load_split, DatasetSplit, DecodeFailures, ImageBatch, ImageBatcher};
use crate::ml::ml_model::{ClassifierConfig, Mode, Normalization, Preprocessor, WasteClassifier};
use crate::model::{save_model_with_catalog, ClassCatalog, ModelMetadata};

/// 学習設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// HeadOnly 段階の最大エポック数
    pub phase1_epochs: usize,
    /// FineTune 段階の最大エポック数
    pub phase2_epochs: usize,
    pub phase1_learning_rate: f64,
    /// `phase1_learning_rate / 10` 以下であること
    pub phase2_learning_rate: f64,
    /// FineTune 段階でも凍結したままにするバックボーン先頭レイヤー数
    pub frozen_layers: usize,
    pub batch_size: usize,
    /// 分割とバッチ順のシード
    pub seed: u64,
    pub validation_fraction: f32,
    /// データローダーのワーカー数
    pub num_workers: usize,
    /// 検証損失が改善しないエポックの許容数（None で早期終了なし）
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            phase1_epochs: 10,
            phase2_epochs: 10,
            phase1_learning_rate: 1e-3,
            phase2_learning_rate: 1e-5,
            frozen_layers: 12,
            batch_size: 16,
            seed: 42,
            validation_fraction: 0.2,
            num_workers: 2,
            early_stopping_patience: Some(3),
        }
    }
}

impl TrainingConfig {
    /// 学習開始前の設定検証
    pub fn validate(&self) -> Result<()> {
        let lr_ok = |lr: f64| lr.is_finite() && lr > 0.0;
        if !lr_ok(self.phase1_learning_rate) || !lr_ok(self.phase2_learning_rate) {
            return Err(EcoVisionError::Config(format!(
                "learning rates must be positive (phase1 {}, phase2 {})",
                self.phase1_learning_rate, self.phase2_learning_rate
            )));
        }
        // 浮動小数点の丸めで 1e-4 と 1e-3 / 10 が不一致にならないよう相対誤差を許容
        let ceiling = self.phase1_learning_rate / 10.0;
        if self.phase2_learning_rate > ceiling * (1.0 + 1e-9) {
            return Err(EcoVisionError::Config(format!(
                "phase2_learning_rate ({}) must be at most phase1_learning_rate / 10 ({})",
                self.phase2_learning_rate, ceiling
            )));
        }
        if self.batch_size == 0 {
            return Err(EcoVisionError::Config("batch_size must be at least 1".into()));
        }
        if self.frozen_layers > BACKBONE_LAYERS {
            return Err(EcoVisionError::Config(format!(
                "frozen_layers ({}) exceeds the {} backbone layers",
                self.frozen_layers, BACKBONE_LAYERS
            )));
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(EcoVisionError::Config(format!(
                "validation_fraction must be in (0, 1), got {}",
                self.validation_fraction
            )));
        }
        if self.early_stopping_patience == Some(0) {
            return Err(EcoVisionError::Config(
                "early_stopping_patience must be at least 1 (use null to disable)".into(),
            ));
        }
        Ok(())
    }
}

/// 学習段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    HeadOnly,
    FineTune,
}

impl Phase {
    pub fn learning_rate(self, config: &TrainingConfig) -> f64 {
        match self {
            Phase::HeadOnly => config.phase1_learning_rate,
            Phase::FineTune => config.phase2_learning_rate,
        }
    }

    pub fn max_epochs(self, config: &TrainingConfig) -> usize {
        match self {
            Phase::HeadOnly => config.phase1_epochs,
            Phase::FineTune => config.phase2_epochs,
        }
    }

    /// この段階のバックボーン学習可否
    pub fn trainability(self, config: &TrainingConfig, num_layers: usize) -> Trainability {
        match self {
            Phase::HeadOnly => Trainability::head_only(num_layers),
            Phase::FineTune => Trainability::fine_tune(num_layers, config.frozen_layers),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::HeadOnly => write!(f, "head-only"),
            Phase::FineTune => write!(f, "fine-tune"),
        }
    }
}

/// 学習器の状態遷移 HeadOnly -> FineTune -> Finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Running(Phase),
    Finished,
}

impl TrainerState {
    pub fn start() -> Self {
        TrainerState::Running(Phase::HeadOnly)
    }

    /// HeadOnly の終了（エポック上限・早期終了のどちらでも）は無条件で FineTune へ進む
    pub fn next(self) -> Self {
        match self {
            TrainerState::Running(Phase::HeadOnly) => TrainerState::Running(Phase::FineTune),
            TrainerState::Running(Phase::FineTune) | TrainerState::Finished => {
                TrainerState::Finished
            }
        }
    }
}

/// バックボーンの各レイヤーが学習対象かどうか
///
/// 凍結レイヤーは常に先頭からの連続した範囲です。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trainability {
    trainable: Vec<bool>,
}

impl Trainability {
    /// すべて凍結
    pub fn head_only(num_layers: usize) -> Self {
        Self {
            trainable: vec![false; num_layers],
        }
    }

    /// 先頭 `frozen` 層のみ凍結
    pub fn fine_tune(num_layers: usize, frozen: usize) -> Self {
        let frozen = frozen.min(num_layers);
        Self {
            trainable: (0..num_layers).map(|i| i >= frozen).collect(),
        }
    }

    pub fn is_trainable(&self, layer: usize) -> bool {
        self.trainable.get(layer).copied().unwrap_or(false)
    }

    pub fn frozen_prefix_len(&self) -> usize {
        self.trainable.iter().take_while(|t| !**t).count()
    }

    pub fn num_layers(&self) -> usize {
        self.trainable.len()
    }

    pub fn flags(&self) -> &[bool] {
        &self.trainable
    }
}

/// 1エポック分の学習結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub phase: Phase,
    /// 段階内での通し番号（1始まり）
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// 学習履歴
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    epochs: Vec<EpochStats>,
}

impl TrainingHistory {
    pub fn push(&mut self, stats: EpochStats) {
        self.epochs.push(stats);
    }

    pub fn epochs(&self) -> &[EpochStats] {
        &self.epochs
    }

    /// 指定段階で実際に走ったエポック数
    pub fn epochs_in(&self, phase: Phase) -> usize {
        self.epochs.iter().filter(|s| s.phase == phase).count()
    }

    /// CSV出力（phase,epoch,train_loss,train_accuracy,val_loss,val_accuracy）
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| EcoVisionError::io(parent, e))?;
        }
        let mut writer = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
        for stats in &self.epochs {
            writer.serialize(stats)?;
        }
        writer.flush().map_err(|e| EcoVisionError::io(path, e))?;
        Ok(())
    }
}

/// 学習結果
#[derive(Debug)]
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: WasteClassifier<B>,
    pub history: TrainingHistory,
}

/// 平均クロスエントロピー（`weights` 指定時はサンプルごとに `w[y]` を掛ける）
///
/// `mean_i( w[y_i] * -log softmax(z_i)[y_i] )`
pub fn cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    weights: Option<Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let [batch_size, _] = logits.dims();
    let log_probs = log_softmax(logits, 1);
    let picked = log_probs
        .gather(1, targets.clone().reshape([batch_size, 1]))
        .reshape([batch_size]);
    let losses = picked.neg();
    match weights {
        Some(weights) => (losses * weights.select(0, targets)).mean(),
        None => losses.mean(),
    }
}

/// 正解数
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    let predicted = logits.argmax(1).reshape([batch_size]);
    let correct: i64 = predicted.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// 損失と正解率の集計
#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl Accumulator {
    fn add(&mut self, batch_loss: f32, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss as f64 * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    fn loss(&self) -> f64 {
        if self.seen == 0 {
            f64::NAN
        } else {
            self.loss_sum / self.seen as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.correct as f64 / self.seen as f64
        }
    }
}

/// 検証損失の早期終了判定（最良重みを保持）
struct EarlyStopping<M> {
    patience: Option<usize>,
    best_loss: f64,
    best: Option<M>,
    stale_epochs: usize,
}

impl<M: Clone> EarlyStopping<M> {
    fn new(patience: Option<usize>) -> Self {
        Self {
            patience,
            best_loss: f64::INFINITY,
            best: None,
            stale_epochs: 0,
        }
    }

    /// 改善を記録し、打ち切るべきなら true
    fn observe(&mut self, val_loss: f64, model: &M) -> bool {
        let Some(patience) = self.patience else {
            return false;
        };
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best = Some(model.clone());
            self.stale_epochs = 0;
            false
        } else {
            self.stale_epochs += 1;
            self.stale_epochs >= patience
        }
    }

    fn into_best(self) -> Option<M> {
        self.best
    }
}

/// 2段階学習器
pub struct TwoPhaseTrainer<B: AutodiffBackend> {
    config: TrainingConfig,
    preprocessor: Preprocessor,
    augmenter: Option<Augmenter>,
    device: B::Device,
}

type Loader<B> = Arc<dyn DataLoader<B, ImageBatch<B>>>;

impl<B: AutodiffBackend> TwoPhaseTrainer<B> {
    pub fn new(config: TrainingConfig, preprocessor: Preprocessor, device: B::Device) -> Self {
        Self {
            config,
            preprocessor,
            augmenter: None,
            device,
        }
    }

    /// 学習バッチにのみ適用するデータ拡張
    pub fn with_augmentation(mut self, augmentation: AugmentationConfig) -> Self {
        self.augmenter = Some(Augmenter::new(augmentation));
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// 両段階を通して学習する
    ///
    /// `on_epoch` はエポックごとに呼ばれます。
    pub fn fit<F>(
        &self,
        model: WasteClassifier<B>,
        split: &DatasetSplit,
        class_weights: &ClassWeightTable,
        mut on_epoch: F,
    ) -> Result<TrainingOutcome<B>>
    where
        F: FnMut(&EpochStats),
    {
        self.config.validate()?;
        if split.validation.is_empty() {
            return Err(EcoVisionError::Config(format!(
                "validation subset is empty ({} training samples); add images or raise validation_fraction",
                split.train.len()
            )));
        }
        if class_weights.len() != model.num_classes() {
            return Err(EcoVisionError::Config(format!(
                "{} class weights for a model with {} outputs",
                class_weights.len(),
                model.num_classes()
            )));
        }

        let mut train_batcher = ImageBatcher::<B>::new(self.device.clone(), self.preprocessor);
        if let Some(augmenter) = &self.augmenter {
            train_batcher = train_batcher.with_augmenter(augmenter.clone());
        }
        let train_failures = train_batcher.failures();
        // 分割は確定済み。ここでのシャッフルはバッチ順のみ
        let train_loader: Loader<B> = DataLoaderBuilder::new(train_batcher)
            .batch_size(self.config.batch_size)
            .shuffle(self.config.seed)
            .num_workers(self.config.num_workers)
            .build(split.train.clone());

        let valid_batcher =
            ImageBatcher::<B::InnerBackend>::new(self.device.clone(), self.preprocessor);
        let valid_failures = valid_batcher.failures();
        let valid_loader: Loader<B::InnerBackend> = DataLoaderBuilder::new(valid_batcher)
            .batch_size(self.config.batch_size)
            .num_workers(self.config.num_workers)
            .build(split.validation.clone());

        let weights = class_weights.to_tensor::<B>(&self.device);
        let num_layers = model.num_backbone_layers();

        let mut model = model;
        let mut history = TrainingHistory::default();
        let mut state = TrainerState::start();

        while let TrainerState::Running(phase) = state {
            let trainability = phase.trainability(&self.config, num_layers);
            let lr = phase.learning_rate(&self.config);
            tracing::info!(
                "=== {} phase: up to {} epochs, lr {}, {} of {} backbone layers frozen ===",
                phase,
                phase.max_epochs(&self.config),
                lr,
                trainability.frozen_prefix_len(),
                num_layers
            );

            model = self.run_phase(
                phase,
                model,
                &trainability,
                &weights,
                (&train_loader, &train_failures),
                (&valid_loader, &valid_failures),
                &mut history,
                &mut on_epoch,
            )?;
            state = state.next();
        }

        Ok(TrainingOutcome { model, history })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase<F>(
        &self,
        phase: Phase,
        mut model: WasteClassifier<B>,
        trainability: &Trainability,
        weights: &Tensor<B, 1>,
        (train_loader, train_failures): (&Loader<B>, &DecodeFailures),
        (valid_loader, valid_failures): (&Loader<B::InnerBackend>, &DecodeFailures),
        history: &mut TrainingHistory,
        on_epoch: &mut F,
    ) -> Result<WasteClassifier<B>>
    where
        F: FnMut(&EpochStats),
    {
        // 段階ごとに新しい Adam 状態
        let mut optim = AdamConfig::new().init();
        let lr = phase.learning_rate(&self.config);
        let mut early_stopping = EarlyStopping::new(self.config.early_stopping_patience);

        for epoch in 1..=phase.max_epochs(&self.config) {
            let mut train = Accumulator::default();

            for (batch_idx, batch) in train_loader.iter().enumerate() {
                if batch.is_empty() {
                    continue;
                }
                let batch_size = batch.len();
                let logits = model.forward_training(batch.images, trainability);
                let correct = count_correct(logits.clone().detach(), batch.targets.clone());
                let loss = cross_entropy(logits, batch.targets, Some(weights.clone()));

                let loss_value: f32 = loss.clone().into_scalar().elem();
                if !loss_value.is_finite() {
                    return Err(EcoVisionError::TrainingDivergence {
                        phase: phase.to_string(),
                        epoch,
                        batch: batch_idx + 1,
                        loss: loss_value,
                    });
                }

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);
                train.add(loss_value, correct, batch_size);
            }
            train_failures.check()?;

            let valid = self.validate_epoch(&model.valid(), valid_loader)?;
            valid_failures.check()?;

            let stats = EpochStats {
                phase,
                epoch,
                train_loss: train.loss(),
                train_accuracy: train.accuracy(),
                val_loss: valid.loss(),
                val_accuracy: valid.accuracy(),
            };
            tracing::info!(
                "[{}] epoch {}/{}: loss {:.4} acc {:.3} | val_loss {:.4} val_acc {:.3}",
                phase,
                epoch,
                phase.max_epochs(&self.config),
                stats.train_loss,
                stats.train_accuracy,
                stats.val_loss,
                stats.val_accuracy
            );
            on_epoch(&stats);
            history.push(stats);

            if early_stopping.observe(valid.loss(), &model) {
                tracing::info!("[{}] early stopping after epoch {}", phase, epoch);
                break;
            }
        }

        if let Some(best) = early_stopping.into_best() {
            tracing::debug!("[{}] restoring best weights", phase);
            model = best;
        }
        Ok(model)
    }

    fn validate_epoch(
        &self,
        model: &WasteClassifier<B::InnerBackend>,
        loader: &Loader<B::InnerBackend>,
    ) -> Result<Accumulator> {
        let mut acc = Accumulator::default();
        for batch in loader.iter() {
            if batch.is_empty() {
                continue;
            }
            let batch_size = batch.len();
            let logits = model.forward(batch.images, Mode::Inference);
            let correct = count_correct(logits.clone(), batch.targets.clone());
            // 検証損失は重みなし
            let loss: f32 = cross_entropy(logits, batch.targets, None).into_scalar().elem();
            acc.add(loss, correct, batch_size);
        }
        Ok(acc)
    }
}

/// 学習パイプラインの入出力先と設定
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub data_dir: PathBuf,
    pub model_path: PathBuf,
    pub catalog_path: PathBuf,
    pub classifier: ClassifierTemplate,
    pub backbone: BackboneWeights,
    pub training: TrainingConfig,
    pub augmentation: AugmentationConfig,
}

/// クラス数以外のモデル設定（クラス数はデータセットから決まる）
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierTemplate {
    pub image_size: usize,
    pub width_multiplier: f64,
    pub hidden_units: usize,
    pub dropout: f64,
    pub normalization: Normalization,
}

impl ClassifierTemplate {
    pub fn with_classes(&self, num_classes: usize) -> ClassifierConfig {
        ClassifierConfig::new(num_classes)
            .with_image_size(self.image_size)
            .with_width_multiplier(self.width_multiplier)
            .with_hidden_units(self.hidden_units)
            .with_dropout(self.dropout)
    }

    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor::new(self.image_size, self.normalization)
    }
}

/// 学習パイプラインの結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub catalog: ClassCatalog,
    pub class_weights: ClassWeightTable,
    pub history: TrainingHistory,
    pub model_path: PathBuf,
    pub catalog_path: PathBuf,
}

/// データセット読み込みから保存までの学習パイプライン
///
/// 設定検証 -> 走査・分割 -> クラス重み -> モデル構築 -> 2段階学習 -> 保存
pub fn train_model<B, F>(
    request: &TrainingRequest,
    device: &B::Device,
    on_epoch: F,
) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    F: FnMut(&EpochStats),
{
    request.training.validate()?;

    let split = load_split(
        &request.data_dir,
        request.training.validation_fraction,
        request.training.seed,
    )?;
    let class_weights = ClassWeightTable::from_labels(&split.train_labels(), &split.catalog)?;
    for (idx, name) in split.catalog.iter().enumerate() {
        tracing::info!(
            "  class weight {}: {:.3} ({} training images)",
            name,
            class_weights.as_slice()[idx],
            class_weights.counts()[idx]
        );
    }

    let classifier_config = request.classifier.with_classes(split.catalog.len());
    let model = classifier_config.build::<B>(&request.backbone, device)?;

    let trainer = TwoPhaseTrainer::<B>::new(
        request.training.clone(),
        request.classifier.preprocessor(),
        device.clone(),
    )
    .with_augmentation(request.augmentation.clone());
    let outcome = trainer.fit(model, &split, &class_weights, on_epoch)?;

    let metadata = ModelMetadata::new(
        classifier_config,
        request.classifier.normalization,
        &split.catalog,
        outcome.history.epochs_in(Phase::HeadOnly),
        outcome.history.epochs_in(Phase::FineTune),
    );
    save_model_with_catalog(
        &request.model_path,
        &request.catalog_path,
        &metadata,
        &split.catalog,
        outcome.model.valid(),
    )?;
    tracing::info!(
        "saved model to {} and class catalog to {}",
        request.model_path.display(),
        request.catalog_path.display()
    );

    Ok(TrainingReport {
        catalog: split.catalog,
        class_weights,
        history: outcome.history,
        model_path: request.model_path.clone(),
        catalog_path: request.catalog_path.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::write_image_tree;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_template() -> ClassifierTemplate {
        ClassifierTemplate {
            image_size: 32,
            width_multiplier: 0.35,
            hidden_units: 8,
            dropout: 0.4,
            normalization: Normalization::ImageNet,
        }
    }

    fn tiny_training() -> TrainingConfig {
        TrainingConfig {
            phase1_epochs: 2,
            phase2_epochs: 1,
            batch_size: 4,
            num_workers: 0,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn phase2_learning_rate_must_be_ten_times_smaller() {
        let config = TrainingConfig {
            phase1_learning_rate: 1e-3,
            phase2_learning_rate: 1e-3,
            ..TrainingConfig::default()
        };
        assert!(matches!(config.validate(), Err(EcoVisionError::Config(_))));

        let boundary = TrainingConfig {
            phase1_learning_rate: 1e-3,
            phase2_learning_rate: 1e-4,
            ..TrainingConfig::default()
        };
        assert!(boundary.validate().is_ok());
    }

    #[test]
    fn too_many_frozen_layers_is_config_error() {
        let config = TrainingConfig {
            frozen_layers: BACKBONE_LAYERS + 1,
            ..TrainingConfig::default()
        };
        assert!(matches!(config.validate(), Err(EcoVisionError::Config(_))));
    }

    #[test]
    fn head_only_freezes_every_backbone_layer() {
        let flags = Phase::HeadOnly.trainability(&TrainingConfig::default(), BACKBONE_LAYERS);
        assert!(flags.flags().iter().all(|t| !t));
        assert_eq!(flags.frozen_prefix_len(), BACKBONE_LAYERS);
    }

    #[test]
    fn fine_tune_unfreezes_layers_after_the_prefix() {
        let config = TrainingConfig {
            frozen_layers: 5,
            ..TrainingConfig::default()
        };
        let flags = Phase::FineTune.trainability(&config, 8);
        assert_eq!(
            flags.flags(),
            &[false, false, false, false, false, true, true, true]
        );
        assert_eq!(flags.frozen_prefix_len(), 5);
        assert!(!flags.is_trainable(4));
        assert!(flags.is_trainable(5));
        assert!(!flags.is_trainable(8));
    }

    #[test]
    fn state_machine_visits_both_phases_once() {
        let mut state = TrainerState::start();
        let mut visited = Vec::new();
        while let TrainerState::Running(phase) = state {
            visited.push(phase);
            state = state.next();
        }
        assert_eq!(visited, vec![Phase::HeadOnly, Phase::FineTune]);
        assert_eq!(state.next(), TrainerState::Finished);
    }

    #[test]
    fn weighted_loss_scales_per_sample() {
        let device = Default::default();
        // 一様なロジット: -log softmax = ln(2)
        let logits = Tensor::<NdArray<f32>, 2>::zeros([2, 2], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([0, 1], &device);
        let weights = Tensor::<NdArray<f32>, 1>::from_floats([0.5, 1.5], &device);

        let plain: f32 = cross_entropy(logits.clone(), targets.clone(), None)
            .into_scalar()
            .elem();
        let weighted: f32 = cross_entropy(logits, targets, Some(weights))
            .into_scalar()
            .elem();
        let ln2 = std::f32::consts::LN_2;
        assert!((plain - ln2).abs() < 1e-5);
        assert!((weighted - ln2).abs() < 1e-5);
    }

    #[test]
    fn weighted_loss_uses_the_target_class_weight() {
        let device = Default::default();
        let logits = Tensor::<NdArray<f32>, 2>::zeros([1, 2], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([1], &device);
        let weights = Tensor::<NdArray<f32>, 1>::from_floats([0.5, 2.0], &device);
        let loss: f32 = cross_entropy(logits, targets, Some(weights))
            .into_scalar()
            .elem();
        assert!((loss - 2.0 * std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn history_csv_has_expected_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let mut history = TrainingHistory::default();
        history.push(EpochStats {
            phase: Phase::HeadOnly,
            epoch: 1,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss: 0.9,
            val_accuracy: 0.6,
        });
        history.push(EpochStats {
            phase: Phase::FineTune,
            epoch: 1,
            train_loss: 0.5,
            train_accuracy: 0.8,
            val_loss: 0.7,
            val_accuracy: 0.7,
        });
        history.write_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("phase,epoch,train_loss,train_accuracy,val_loss,val_accuracy")
        );
        assert!(lines.next().unwrap().starts_with("head_only,1,"));
        assert!(lines.next().unwrap().starts_with("fine_tune,1,"));
        assert_eq!(history.epochs_in(Phase::HeadOnly), 1);
    }

    #[test]
    fn early_stopping_keeps_the_best_snapshot() {
        let mut stopping = EarlyStopping::new(Some(2));
        assert!(!stopping.observe(1.0, &"first"));
        assert!(!stopping.observe(0.5, &"best"));
        assert!(!stopping.observe(0.7, &"worse"));
        assert!(stopping.observe(0.6, &"still worse"));
        assert_eq!(stopping.into_best(), Some("best"));
    }

    #[test]
    fn disabled_early_stopping_never_stops() {
        let mut stopping = EarlyStopping::new(None);
        for _ in 0..10 {
            assert!(!stopping.observe(1.0, &()));
        }
        assert_eq!(stopping.into_best(), None);
    }

    #[test]
    fn fit_runs_both_phases_and_reports_every_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("glass", 6), ("metal", 6)], 24);
        let split = load_split(dir.path(), 0.25, 42).unwrap();
        let weights = ClassWeightTable::from_labels(&split.train_labels(), &split.catalog).unwrap();

        let device = Default::default();
        let template = tiny_template();
        let model = template
            .with_classes(split.catalog.len())
            .build::<TestBackend>(&BackboneWeights::Untrained, &device)
            .unwrap();

        let config = TrainingConfig {
            early_stopping_patience: None,
            ..tiny_training()
        };
        let trainer = TwoPhaseTrainer::<TestBackend>::new(config, template.preprocessor(), device)
            .with_augmentation(AugmentationConfig::default());

        let mut seen = Vec::new();
        let outcome = trainer
            .fit(model, &split, &weights, |stats| {
                seen.push((stats.phase, stats.epoch))
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                (Phase::HeadOnly, 1),
                (Phase::HeadOnly, 2),
                (Phase::FineTune, 1)
            ]
        );
        assert_eq!(outcome.history.epochs().len(), 3);
        for stats in outcome.history.epochs() {
            assert!(stats.train_loss.is_finite());
            assert!(stats.val_loss.is_finite());
            assert!((0.0..=1.0).contains(&stats.val_accuracy));
        }
        assert_eq!(outcome.model.num_classes(), 2);
    }

    #[test]
    fn exploding_learning_rate_stops_with_divergence() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("glass", 6), ("metal", 6)], 24);
        let split = load_split(dir.path(), 0.25, 42).unwrap();
        let weights = ClassWeightTable::from_labels(&split.train_labels(), &split.catalog).unwrap();

        let device = Default::default();
        let template = tiny_template();
        let model = template
            .with_classes(split.catalog.len())
            .build::<TestBackend>(&BackboneWeights::Untrained, &device)
            .unwrap();

        let config = TrainingConfig {
            phase1_learning_rate: 1e30,
            phase2_learning_rate: 1e29,
            early_stopping_patience: None,
            ..tiny_training()
        };
        let trainer = TwoPhaseTrainer::<TestBackend>::new(config, template.preprocessor(), device)
            .with_augmentation(AugmentationConfig::disabled());

        let mut epochs = 0;
        let err = trainer
            .fit(model, &split, &weights, |_| epochs += 1)
            .unwrap_err();
        match err {
            EcoVisionError::TrainingDivergence { phase, loss, .. } => {
                assert_eq!(phase, Phase::HeadOnly.to_string());
                assert!(!loss.is_finite());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(epochs, 0);
    }

    #[test]
    fn train_model_writes_both_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_image_tree(&data, &[("a", 5), ("b", 5)], 24);

        let request = TrainingRequest {
            data_dir: data,
            model_path: dir.path().join("models").join("waste_classifier.tar.gz"),
            catalog_path: dir.path().join("models").join("class_names.json"),
            classifier: tiny_template(),
            backbone: BackboneWeights::Untrained,
            training: TrainingConfig {
                phase1_epochs: 1,
                ..tiny_training()
            },
            augmentation: AugmentationConfig::disabled(),
        };
        let device = Default::default();
        let report = train_model::<TestBackend, _>(&request, &device, |_| {}).unwrap();

        assert!(report.model_path.exists());
        assert!(report.catalog_path.exists());
        assert_eq!(report.catalog.names(), &["a", "b"]);
        assert_eq!(ClassCatalog::load(&report.catalog_path).unwrap(), report.catalog);
    }

    #[test]
    fn invalid_learning_rates_fail_before_reading_data() {
        let request = TrainingRequest {
            data_dir: PathBuf::from("/definitely/not/here"),
            model_path: PathBuf::from("unused.tar.gz"),
            catalog_path: PathBuf::from("unused.json"),
            classifier: tiny_template(),
            backbone: BackboneWeights::Untrained,
            training: TrainingConfig {
                phase2_learning_rate: 1e-3,
                ..TrainingConfig::default()
            },
            augmentation: AugmentationConfig::disabled(),
        };
        let device = Default::default();
        let err = train_model::<TestBackend, _>(&request, &device, |_| {}).unwrap_err();
        assert!(matches!(err, EcoVisionError::Config(_)));
    }
}
