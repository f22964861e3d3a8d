//! 機械学習モデルの共通定義
//!
//! MobileNetV2 バックボーンと分類ヘッドからなる廃棄物分類モデル、
//! および学習・推論で共通の前処理を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    tensor::{activation::softmax, backend::AutodiffBackend, backend::Backend, Tensor},
};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::ml::backbone::{BackboneWeights, MobileNetV2, MobileNetV2Config};
use crate::ml::training::Trainability;

/// 画像サイズ（MobileNetV2 の事前学習解像度）
pub const IMAGE_SIZE: usize = 224;

/// ImageNetの平均と標準偏差
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 順伝播のモード
///
/// Dropout は `Training` のときだけ有効です。
/// `Inference` は非Autodiffバックエンド（`valid()`）上で使い、BatchNorm を移動統計で動かします。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// 画素値の正規化方式（バックボーンの重みが学習された方式に合わせる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Normalization {
    /// チャネルごとの ImageNet 平均・標準偏差（torchvision 形式）
    ImageNet,
    /// x / 127.5 - 1 で [-1, 1] へ（Keras MobileNetV2 形式、配布している重みはこちら）
    #[default]
    Symmetric,
}

impl Normalization {
    #[inline]
    pub fn apply(self, channel: usize, value: u8) -> f32 {
        match self {
            Normalization::ImageNet => {
                let v = value as f32 / 255.0;
                (v - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]
            }
            Normalization::Symmetric => value as f32 / 127.5 - 1.0,
        }
    }
}

/// 学習と推論で共通の前処理
///
/// リサイズ方針: アスペクト比を保たずに image_size x image_size へ引き伸ばす（Triangle フィルタ）。
/// 出力は RGB 順・(C, H, W) 順で平坦化した正規化済みデータです。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocessor {
    pub image_size: usize,
    pub normalization: Normalization,
}

impl Preprocessor {
    pub fn new(image_size: usize, normalization: Normalization) -> Self {
        Self {
            image_size,
            normalization,
        }
    }

    /// RGBへ変換して引き伸ばしリサイズ
    pub fn resize(&self, image: &DynamicImage) -> RgbImage {
        let size = self.image_size as u32;
        let rgb = image.to_rgb8();
        if rgb.dimensions() == (size, size) {
            return rgb;
        }
        image::imageops::resize(&rgb, size, size, FilterType::Triangle)
    }

    /// リサイズ済み画像を (C, H, W) の正規化データへ
    pub fn normalize(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let mut data = Vec::with_capacity(3 * (width * height) as usize);
        for channel in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let pixel = image.get_pixel(x, y);
                    data.push(self.normalization.apply(channel, pixel[channel]));
                }
            }
        }
        data
    }

    pub fn prepare(&self, image: &DynamicImage) -> Vec<f32> {
        self.normalize(&self.resize(image))
    }

    pub fn tensor_len(&self) -> usize {
        3 * self.image_size * self.image_size
    }
}

/// モデル設定
#[derive(Config, Debug, PartialEq)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// バックボーンの幅乗数
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// 全結合層のユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
    /// ドロップアウト率
    #[config(default = 0.4)]
    pub dropout: f64,
}

impl ClassifierConfig {
    pub fn backbone(&self) -> MobileNetV2Config {
        MobileNetV2Config::new().with_width_multiplier(self.width_multiplier)
    }

    /// ランダム初期化でモデルを構築
    pub fn init<B: Backend>(&self, device: &B::Device) -> WasteClassifier<B> {
        self.assemble(self.backbone().init(device), device)
    }

    /// バックボーンの重みを指定してモデルを構築
    ///
    /// 事前学習済み重みの読み込みに失敗した場合はエラーを返し、部分的なモデルは作りません。
    pub fn build<B: Backend>(
        &self,
        weights: &BackboneWeights,
        device: &B::Device,
    ) -> crate::error::Result<WasteClassifier<B>> {
        let backbone = match weights {
            BackboneWeights::Pretrained(path) => {
                let backbone = self
                    .backbone()
                    .load_pretrained(path, self.image_size, device)?;
                tracing::info!("loaded pretrained backbone from {}", path.display());
                backbone
            }
            BackboneWeights::Untrained => {
                tracing::warn!("building classifier with an untrained backbone");
                self.backbone().init(device)
            }
        };
        Ok(self.assemble(backbone, device))
    }

    fn assemble<B: Backend>(&self, backbone: MobileNetV2<B>, device: &B::Device) -> WasteClassifier<B> {
        let features = self.backbone().out_channels();

        tracing::debug!(
            "classifier: input {0}x{0}, features {1}, hidden {2}, classes {3}, dropout {4}",
            self.image_size,
            features,
            self.hidden_units,
            self.num_classes,
            self.dropout
        );

        WasteClassifier {
            backbone,
            norm: BatchNormConfig::new(features).init(device),
            fc1: LinearConfig::new(features, self.hidden_units).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 廃棄物分類モデル
///
/// # アーキテクチャ
/// - MobileNetV2 特徴抽出器
/// - Global Average Pooling
/// - BatchNorm
/// - FC: features -> hidden + ReLU
/// - Dropout（学習時のみ）
/// - FC: hidden -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct WasteClassifier<B: Backend> {
    backbone: MobileNetV2<B>,
    norm: BatchNorm<B>,
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> WasteClassifier<B> {
    /// 特徴マップから分類ロジットを計算
    fn head_forward(&self, features: Tensor<B, 4>, mode: Mode) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();

        // Global Average Pooling
        let x = features.mean_dim(3).mean_dim(2);
        let x = self.norm.forward(x).reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = match mode {
            Mode::Training => self.dropout.forward(x),
            Mode::Inference => x,
        };

        self.fc2.forward(x)
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>, mode: Mode) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head_forward(features, mode)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn forward_probabilities(&self, images: Tensor<B, 4>, mode: Mode) -> Tensor<B, 2> {
        softmax(self.forward(images, mode), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.fc2.weight.dims()[1]
    }

    /// 凍結単位となるバックボーンのレイヤー数
    pub fn num_backbone_layers(&self) -> usize {
        self.backbone.num_layers()
    }
}

impl<B: AutodiffBackend> WasteClassifier<B> {
    /// 学習用の順伝播
    ///
    /// `trainability` で凍結されたバックボーンの先頭レイヤーには勾配が流れません。
    pub fn forward_training(&self, images: Tensor<B, 4>, trainability: &Trainability) -> Tensor<B, 2> {
        let features = self
            .backbone
            .forward_partially_frozen(images, trainability.frozen_prefix_len());
        self.head_forward(features, Mode::Training)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::AutodiffModule;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config(num_classes: usize) -> ClassifierConfig {
        ClassifierConfig::new(num_classes)
            .with_image_size(32)
            .with_width_multiplier(0.35)
            .with_hidden_units(16)
    }

    #[test]
    fn imagenet_normalization_of_known_pixel() {
        let value = Normalization::ImageNet.apply(0, 255);
        assert!((value - (1.0 - 0.485) / 0.229).abs() < 1e-6);
        assert_eq!(Normalization::Symmetric.apply(1, 0), -1.0);
        assert!((Normalization::Symmetric.apply(2, 255) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn preprocess_stretches_and_lays_out_chw() {
        let mut img = RgbImage::new(40, 10);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb([255, 0, 0]);
        }
        let pre = Preprocessor::new(8, Normalization::Symmetric);
        let data = pre.prepare(&DynamicImage::ImageRgb8(img));

        assert_eq!(data.len(), pre.tensor_len());
        // 赤チャネルが先頭の H*W 要素
        assert!(data[..64].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(data[64..].iter().all(|v| (*v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn probabilities_have_one_entry_per_class_and_sum_to_one() {
        let device = Default::default();
        let config = small_config(5);
        let model = config.init::<TestBackend>(&device);
        assert_eq!(model.num_classes(), 5);

        let images = Tensor::<TestBackend, 4>::random(
            [3, 3, 32, 32],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let probs = model.forward_probabilities(images, Mode::Inference);
        assert_eq!(probs.dims(), [3, 5]);

        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn inference_mode_is_deterministic() {
        let device = Default::default();
        let model = small_config(3).init::<Autodiff<TestBackend>>(&device).valid();

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let first = model
            .forward_probabilities(images.clone(), Mode::Inference)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let second = model
            .forward_probabilities(images, Mode::Inference)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn untrained_build_has_requested_width() {
        let device = Default::default();
        let model = small_config(4)
            .build::<TestBackend>(&BackboneWeights::Untrained, &device)
            .unwrap();
        assert_eq!(model.num_classes(), 4);
    }
}
