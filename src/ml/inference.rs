//! モデル推論機能
//!
//! 学習済みモデル（tar.gz）とクラスカタログ（class_names.json）を読み込み、
//! 画像ごとのクラス確率と上位候補を返します。読み込み後は読み取り専用で、
//! 推論に乱数は使いません。

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;
use std::path::Path;

use crate::error::{EcoVisionError, ModelLoadError, Result};
use crate::gate::{Candidate, RankedPrediction};
use crate::ml::ml_model::{Mode, Preprocessor, WasteClassifier};
use crate::model::model_storage::{decode_model, load_model_archive};
use crate::model::{ClassCatalog, ModelMetadata};

/// クラスごとの確率（カタログ順、合計1）
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionVector {
    probabilities: Vec<f32>,
}

impl PredictionVector {
    pub fn new(probabilities: Vec<f32>) -> Self {
        Self { probabilities }
    }

    pub fn probabilities(&self) -> &[f32] {
        &self.probabilities
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// 確率の降順に並べたクラスインデックス（同率はインデックスの小さい順）
    pub fn ranked_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.probabilities.len()).collect();
        // 安定ソートなので同率はカタログ順のまま
        indices.sort_by(|&a, &b| self.probabilities[b].total_cmp(&self.probabilities[a]));
        indices
    }

    /// 上位 `k` 候補
    pub fn top_k(&self, k: usize, catalog: &ClassCatalog) -> Vec<Candidate> {
        self.ranked_indices()
            .into_iter()
            .take(k)
            .filter_map(|index| {
                catalog.name(index).map(|label| Candidate {
                    label: label.to_string(),
                    index,
                    probability: self.probabilities[index],
                })
            })
            .collect()
    }

    /// 上位2候補
    pub fn rank(&self, catalog: &ClassCatalog) -> Result<RankedPrediction> {
        let mut top = self.top_k(2, catalog).into_iter();
        match (top.next(), top.next()) {
            (Some(top1), Some(top2)) => Ok(RankedPrediction { top1, top2 }),
            _ => Err(EcoVisionError::Tensor(format!(
                "need at least two classes to rank, got {} probabilities for {} catalog entries",
                self.len(),
                catalog.len()
            ))),
        }
    }
}

/// 推論エンジン
#[derive(Debug)]
pub struct InferenceEngine<B: Backend> {
    model: WasteClassifier<B>,
    catalog: ClassCatalog,
    metadata: ModelMetadata,
    preprocessor: Preprocessor,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルとカタログを読み込んで推論エンジンを初期化
    ///
    /// カタログは学習時に保存したファイルをそのまま使い、
    /// モデル出力幅やモデルに同梱されたカタログと一致しなければ拒否します。
    pub fn load(model_path: &Path, catalog_path: &Path, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_archive(model_path)?;
        let catalog = ClassCatalog::load(catalog_path)?;
        tracing::info!("model metadata: {}", metadata.summary());

        let model = metadata.classifier.init::<B>(device);
        let model = decode_model(model, model_binary, model_path, device)?;

        let model_width = model.num_classes();
        if catalog.len() != model_width {
            return Err(ModelLoadError::WidthMismatch {
                catalog: catalog_path.to_path_buf(),
                catalog_len: catalog.len(),
                model_width,
            }
            .into());
        }
        if catalog.names() != metadata.class_names.as_slice() {
            return Err(ModelLoadError::CatalogMismatch {
                catalog: catalog_path.to_path_buf(),
                model: model_path.to_path_buf(),
            }
            .into());
        }

        let preprocessor = Preprocessor::new(metadata.image_size(), metadata.normalization);
        tracing::info!(
            "loaded {} ({} classes)",
            model_path.display(),
            catalog.len()
        );

        Ok(Self {
            model,
            catalog,
            metadata,
            preprocessor,
            device: device.clone(),
        })
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn preprocessor(&self) -> Preprocessor {
        self.preprocessor
    }

    pub fn model(&self) -> &WasteClassifier<B> {
        &self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// 複数画像の確率をまとめて計算
    pub fn predict_batch(&self, images: &[DynamicImage]) -> Result<Vec<PredictionVector>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let size = self.preprocessor.image_size;
        let mut pixels = Vec::with_capacity(images.len() * self.preprocessor.tensor_len());
        for image in images {
            pixels.extend(self.preprocessor.prepare(image));
        }

        let input = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([images.len(), 3, size, size]);
        self.probabilities(input)
    }

    /// 前処理済みバッチ [batch, 3, size, size] の確率
    pub fn probabilities(&self, input: Tensor<B, 4>) -> Result<Vec<PredictionVector>> {
        let num_classes = self.catalog.len();
        let values = self
            .model
            .forward_probabilities(input, Mode::Inference)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| EcoVisionError::Tensor(format!("cannot read probabilities: {e:?}")))?;

        Ok(values
            .chunks(num_classes)
            .map(|row| PredictionVector::new(row.to_vec()))
            .collect())
    }

    /// 単一画像のクラス確率
    pub fn predict(&self, image: &DynamicImage) -> Result<PredictionVector> {
        self.predict_batch(std::slice::from_ref(image))?
            .into_iter()
            .next()
            .ok_or_else(|| EcoVisionError::Tensor("empty prediction batch".into()))
    }

    /// 単一画像の上位2候補
    pub fn classify(&self, image: &DynamicImage) -> Result<RankedPrediction> {
        self.predict(image)?.rank(&self.catalog)
    }

    /// 画像ファイルを読み込んで分類
    pub fn classify_path(&self, path: &Path) -> Result<RankedPrediction> {
        let image = image::open(path)?;
        self.classify(&image)
    }
}
