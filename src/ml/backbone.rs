//! MobileNetV2 特徴抽出器
//!
//! 事前学習済みの重みを読み込み、画像から空間特徴マップを出力します。
//!
//! # レイヤー構成（凍結の単位）
//! - 0: stem (Conv 3x3 stride 2 + BN + ReLU6)
//! - 1..=17: Inverted Residual ブロック
//! - 18: 最終 Conv 1x1 + BN + ReLU6
//!
//! 出力: [batch, last_channels, size/32, size/32]

use burn::{
    config::Config,
    module::{AutodiffModule, Module, ModuleVisitor, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use std::path::{Path, PathBuf};

use crate::error::EcoVisionError;

/// 事前学習済み重みが対応する入力解像度
pub const PRETRAINED_INPUT_SIZES: [usize; 5] = [96, 128, 160, 192, 224];

/// 凍結単位となるレイヤー数（stem + 17ブロック + 最終Conv）
pub const BACKBONE_LAYERS: usize = 19;

/// (expand ratio t, 出力チャネル c, 繰り返し n, stride s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// バックボーンの重みの入手元
#[derive(Debug, Clone, PartialEq)]
pub enum BackboneWeights {
    /// burn の named MessagePack レコード (.mpk)
    Pretrained(PathBuf),
    /// ランダム初期化（テスト・実験用。フォールバックとしては使わない）
    Untrained,
}

#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// 幅乗数
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

/// チャネル数を divisor の倍数へ丸める（10%以上は減らさない）
fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor_f = divisor as f64;
    let rounded = ((value + divisor_f / 2.0) / divisor_f).floor() as usize * divisor;
    let rounded = rounded.max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    }
}

impl MobileNetV2Config {
    /// 最終特徴マップのチャネル数
    pub fn out_channels(&self) -> usize {
        make_divisible(1280.0 * self.width_multiplier.max(1.0), 8)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let mut in_channels = make_divisible(32.0 * self.width_multiplier, 8);
        let stem = ConvNormActivation::new([3, in_channels], 3, 2, 1, device);

        let mut blocks = Vec::new();
        for (expand_ratio, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(channels as f64 * self.width_multiplier, 8);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    expand_ratio,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let last = ConvNormActivation::new([in_channels, self.out_channels()], 1, 1, 0, device);

        MobileNetV2 {
            stem,
            blocks,
            last,
        }
    }

    /// 事前学習済み重みを読み込んだバックボーンを構築
    ///
    /// 重みファイルが無い・レイヤー構成が合わない・入力解像度が非対応の場合は
    /// `PretrainedWeights` エラーで中断します。
    pub fn load_pretrained<B: Backend>(
        &self,
        path: &Path,
        input_size: usize,
        device: &B::Device,
    ) -> crate::error::Result<MobileNetV2<B>> {
        if !PRETRAINED_INPUT_SIZES.contains(&input_size) {
            return Err(EcoVisionError::PretrainedWeights {
                path: path.to_path_buf(),
                reason: format!(
                    "incompatible input shape {input_size}x{input_size}x3 (supported sizes: {:?})",
                    PRETRAINED_INPUT_SIZES
                ),
            });
        }

        // レコーダーは拡張子 .mpk を付与して読み込む
        let record_path = path.with_extension("mpk");
        if !record_path.exists() {
            return Err(EcoVisionError::PretrainedWeights {
                path: record_path,
                reason: "file not found".to_string(),
            });
        }

        let template = self.init::<B>(device);
        let expected = parameter_shapes::<B, _>(&template);

        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let backbone = template
            .load_file(record_path.clone(), &recorder, device)
            .map_err(|e| EcoVisionError::PretrainedWeights {
                path: record_path.clone(),
                reason: e.to_string(),
            })?;

        check_parameter_shapes::<B, _>(&expected, &backbone).map_err(|reason| {
            EcoVisionError::PretrainedWeights {
                path: record_path,
                reason: format!(
                    "layer structure does not match width x{}: {reason}",
                    self.width_multiplier
                ),
            }
        })?;
        Ok(backbone)
    }
}

/// 浮動小数パラメータの形状を走査順に集める
#[derive(Default)]
struct ParamShapes {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.shapes.push(param.lazy_shape().dims);
    }
}

/// モジュールの全パラメータ形状（遅延初期化は発生させない）
pub(crate) fn parameter_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut visitor = ParamShapes::default();
    module.visit(&mut visitor);
    visitor.shapes
}

/// 読み込んだモジュールの形状が期待値と一致するか
///
/// レコードの読み込み自体は形状を検証しないため、構築直後に比較します。
/// 不一致なら最初に食い違ったパラメータを説明する文字列を返します。
pub(crate) fn check_parameter_shapes<B: Backend, M: Module<B>>(
    expected: &[Vec<usize>],
    loaded: &M,
) -> Result<(), String> {
    let actual = parameter_shapes::<B, _>(loaded);
    if actual.len() != expected.len() {
        return Err(format!(
            "expected {} parameter tensors, found {}",
            expected.len(),
            actual.len()
        ));
    }
    match expected
        .iter()
        .zip(&actual)
        .position(|(want, got)| want != got)
    {
        Some(index) => Err(format!(
            "parameter #{index} has shape {:?}, expected {:?}",
            actual[index], expected[index]
        )),
        None => Ok(()),
    }
}

/// Conv + BatchNorm + ReLU6
#[derive(Module, Debug)]
pub struct ConvNormActivation<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> ConvNormActivation<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        padding: usize,
        device: &B::Device,
    ) -> Self {
        Self::grouped(channels, kernel, stride, padding, 1, device)
    }

    fn grouped(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        padding: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        x.clamp(0.0, 6.0)
    }
}

/// 線形射影（Conv 1x1 + BatchNorm、活性化なし）
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    fn new(channels: [usize; 2], device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new(channels, [1, 1]).with_bias(false).init(device),
            norm: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// Inverted Residual ブロック（expand → depthwise → project）
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvNormActivation<B>>,
    depthwise: ConvNormActivation<B>,
    project: ConvNorm<B>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expand_ratio: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = (expand_ratio != 1)
            .then(|| ConvNormActivation::new([in_channels, hidden], 1, 1, 0, device));

        Self {
            expand,
            depthwise: ConvNormActivation::grouped([hidden, hidden], 3, stride, 1, hidden, device),
            project: ConvNorm::new([hidden, out_channels], device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.project.forward(x);

        // stride 1 かつ入出力チャネルが同じときだけ形状が一致する
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvNormActivation<B>,
    blocks: Vec<InvertedResidual<B>>,
    last: ConvNormActivation<B>,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn num_layers(&self) -> usize {
        self.blocks.len() + 2
    }

    fn layer_forward(&self, index: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match index {
            0 => self.stem.forward(x),
            i if i <= self.blocks.len() => self.blocks[i - 1].forward(x),
            _ => self.last.forward(x),
        }
    }

    /// 順伝播（全レイヤー）
    ///
    /// # 引数
    /// - `images`: [batch, 3, size, size]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        (0..self.num_layers()).fold(images, |x, i| self.layer_forward(i, x))
    }
}

impl<B: AutodiffBackend> MobileNetV2<B> {
    /// 先頭 `frozen` レイヤーを勾配なし・推論モードで実行し、残りを学習モードで実行
    ///
    /// 凍結レイヤーは内部バックエンド上で計算されるため、勾配が流れず
    /// BatchNorm の移動統計も更新されません。
    pub fn forward_partially_frozen(&self, images: Tensor<B, 4>, frozen: usize) -> Tensor<B, 4> {
        let frozen = frozen.min(self.num_layers());
        if frozen == 0 {
            return self.forward(images);
        }

        let mut inner = images.inner();
        for index in 0..frozen {
            inner = match index {
                0 => self.stem.valid().forward(inner),
                i if i <= self.blocks.len() => self.blocks[i - 1].valid().forward(inner),
                _ => self.last.valid().forward(inner),
            };
        }

        let x = Tensor::from_inner(inner);
        (frozen..self.num_layers()).fold(x, |x, i| self.layer_forward(i, x))
    }
}
