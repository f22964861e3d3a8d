//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデル構造・学習・データ拡張・推論の設定をJSON形式で保存・読み込みします。
//! 省略されたフィールドはデフォルト値で補います。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EcoVisionError, Result};
use crate::gate::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::ml::augment::AugmentationConfig;
use crate::ml::backbone::{BackboneWeights, PRETRAINED_INPUT_SIZES};
use crate::ml::ml_model::{Normalization, IMAGE_SIZE};
use crate::ml::training::{ClassifierTemplate, TrainingConfig};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// 学習済みモデル（tar.gz）のパス
    pub model_path: PathBuf,
    /// クラスカタログ（JSON配列）のパス
    pub catalog_path: PathBuf,
    /// 事前学習済みバックボーン（burn の .mpk レコード）のパス
    pub pretrained_weights: PathBuf,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バックボーンの幅乗数
    pub width_multiplier: f64,
    /// 全結合層のユニット数
    pub hidden_units: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 事前学習済み重みに合わせた画素正規化
    pub normalization: Normalization,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/waste_classifier.tar.gz"),
            catalog_path: PathBuf::from("models/class_names.json"),
            pretrained_weights: PathBuf::from("models/mobilenet_v2.mpk"),
            image_size: IMAGE_SIZE,
            width_multiplier: 1.0,
            hidden_units: 128,
            dropout: 0.4,
            normalization: Normalization::default(),
        }
    }
}

impl ModelSettings {
    pub fn classifier_template(&self) -> ClassifierTemplate {
        ClassifierTemplate {
            image_size: self.image_size,
            width_multiplier: self.width_multiplier,
            hidden_units: self.hidden_units,
            dropout: self.dropout,
            normalization: self.normalization,
        }
    }

    /// 事前学習済みバックボーン（未学習の指定は呼び出し側が明示的に行う）
    pub fn backbone_weights(&self) -> BackboneWeights {
        BackboneWeights::Pretrained(self.pretrained_weights.clone())
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceSettings {
    /// 自動確定する最小確信度
    pub confidence_threshold: f32,
    /// 分別ルール表（JSONオブジェクト）のパス。None なら組み込み表
    pub bin_rules_path: Option<PathBuf>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            bin_rules_path: None,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingConfig,
    /// データ拡張設定
    pub augmentation: AugmentationConfig,
    /// 推論設定
    pub inference: InferenceSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| EcoVisionError::io(path, e))?;
        let config: AppConfig =
            serde_json::from_str(&content).map_err(|e| EcoVisionError::json(path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定を読み込む。ファイルが存在しない場合はデフォルト設定を返す
    ///
    /// 存在するのに読めない・壊れている場合はエラーです。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            tracing::info!("loaded config from {}", path.display());
            Ok(config)
        } else {
            tracing::info!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).map_err(|e| EcoVisionError::json(path, e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| EcoVisionError::io(parent, e))?;
        }
        fs::write(path, content).map_err(|e| EcoVisionError::io(path, e))?;
        tracing::info!("saved config to {}", path.display());
        Ok(())
    }

    /// 設定値の整合性チェック
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;

        let model = &self.model;
        if !PRETRAINED_INPUT_SIZES.contains(&model.image_size) {
            return Err(EcoVisionError::Config(format!(
                "image_size {} is not one of the pretrained input sizes {:?}",
                model.image_size, PRETRAINED_INPUT_SIZES
            )));
        }
        if !(model.width_multiplier > 0.0) {
            return Err(EcoVisionError::Config(format!(
                "width_multiplier must be positive, got {}",
                model.width_multiplier
            )));
        }
        if model.hidden_units == 0 {
            return Err(EcoVisionError::Config("hidden_units must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(EcoVisionError::Config(format!(
                "dropout must be in [0, 1), got {}",
                model.dropout
            )));
        }

        let tau = self.inference.confidence_threshold;
        if !(tau > 0.0 && tau <= 1.0) {
            return Err(EcoVisionError::Config(format!(
                "confidence_threshold must be in (0, 1], got {tau}"
            )));
        }

        let aug = &self.augmentation;
        for (name, p) in [
            ("flip_horizontal_prob", aug.flip_horizontal_prob),
            ("rotation_prob", aug.rotation_prob),
            ("zoom_prob", aug.zoom_prob),
            ("contrast_prob", aug.contrast_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(EcoVisionError::Config(format!(
                    "augmentation {name} must be in [0, 1], got {p}"
                )));
            }
        }
        if !(0.0..1.0).contains(&aug.max_zoom) || !(0.0..1.0).contains(&aug.max_contrast) {
            return Err(EcoVisionError::Config(
                "augmentation max_zoom and max_contrast must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("device: {}", self.device_type);
        tracing::info!(
            "model: {} (catalog {}), input {}x{}, width x{}, hidden {}, dropout {}, {:?}",
            self.model.model_path.display(),
            self.model.catalog_path.display(),
            self.model.image_size,
            self.model.image_size,
            self.model.width_multiplier,
            self.model.hidden_units,
            self.model.dropout,
            self.model.normalization
        );
        tracing::info!(
            "training: epochs {}+{}, lr {} -> {}, frozen {}, batch {}, seed {}",
            self.training.phase1_epochs,
            self.training.phase2_epochs,
            self.training.phase1_learning_rate,
            self.training.phase2_learning_rate,
            self.training.frozen_layers,
            self.training.batch_size,
            self.training.seed
        );
        tracing::info!(
            "inference: threshold {}",
            self.inference.confidence_threshold
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.training.phase1_epochs, 10);
        assert_eq!(config.training.frozen_layers, 12);
        assert!((config.inference.confidence_threshold - 0.65).abs() < 1e-6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_preprocessing_matches_keras_mobilenet_weights() {
        let settings = ModelSettings::default();
        assert_eq!(settings.normalization, Normalization::Symmetric);
        let pre = settings.classifier_template().preprocessor();
        assert_eq!(pre.normalization, Normalization::Symmetric);
        assert_eq!(pre.normalization.apply(0, 0), -1.0);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn partial_file_falls_back_to_field_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"device_type": "Cpu", "training": {"batch_size": 4}}"#)
                .unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.training.phase2_learning_rate, 1e-5);
        assert_eq!(config.model, ModelSettings::default());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.json");
        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.inference.confidence_threshold = 0.8;
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_gives_defaults_but_broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(AppConfig::load_or_default(&path).unwrap(), AppConfig::default());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            AppConfig::load_or_default(&path),
            Err(EcoVisionError::Json { .. })
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.model.image_size = 100;
        assert!(matches!(config.validate(), Err(EcoVisionError::Config(_))));

        let mut config = AppConfig::default();
        config.training.phase2_learning_rate = 5e-4;
        assert!(matches!(config.validate(), Err(EcoVisionError::Config(_))));

        let mut config = AppConfig::default();
        config.inference.confidence_threshold = 0.0;
        assert!(matches!(config.validate(), Err(EcoVisionError::Config(_))));
    }
}
