//! 学習用データ拡張
//!
//! 水平反転・回転・ズーム・コントラストをそれぞれ独立した確率で適用します。
//! 状態を持たず（乱数生成器は呼び出し側から受け取る）、ラベルには触れません。
//! 学習バッチにのみ適用し、検証・推論では使いません。

use image::{Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// データ拡張の設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AugmentationConfig {
    /// 水平反転の確率
    pub flip_horizontal_prob: f32,
    /// 回転の確率
    pub rotation_prob: f32,
    /// 最大回転角（度、±）
    pub max_rotation_degrees: f32,
    /// ズームの確率
    pub zoom_prob: f32,
    /// 最大ズーム率（±、0.1 = 90%〜110%）
    pub max_zoom: f32,
    /// コントラスト調整の確率
    pub contrast_prob: f32,
    /// 最大コントラスト変化（±）
    pub max_contrast: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            flip_horizontal_prob: 0.5,
            rotation_prob: 0.5,
            max_rotation_degrees: 15.0,
            zoom_prob: 0.5,
            max_zoom: 0.1,
            contrast_prob: 0.5,
            max_contrast: 0.1,
        }
    }
}

impl AugmentationConfig {
    /// すべて無効
    pub fn disabled() -> Self {
        Self {
            flip_horizontal_prob: 0.0,
            rotation_prob: 0.0,
            max_rotation_degrees: 0.0,
            zoom_prob: 0.0,
            max_zoom: 0.0,
            contrast_prob: 0.0,
            max_contrast: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

fn chance<R: Rng + ?Sized>(rng: &mut R, prob: f32) -> bool {
    prob > 0.0 && rng.gen::<f32>() < prob
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, magnitude: f32) -> f32 {
    if magnitude > 0.0 {
        rng.gen_range(-magnitude..=magnitude)
    } else {
        0.0
    }
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// リサイズ済み画像に拡張を適用（サイズは変わらない）
    pub fn apply<R: Rng + ?Sized>(&self, image: RgbImage, rng: &mut R) -> RgbImage {
        let cfg = &self.config;
        let mut image = image;

        if chance(rng, cfg.flip_horizontal_prob) {
            image::imageops::flip_horizontal_in_place(&mut image);
        }

        let angle = if chance(rng, cfg.rotation_prob) {
            symmetric(rng, cfg.max_rotation_degrees).to_radians()
        } else {
            0.0
        };
        let scale = if chance(rng, cfg.zoom_prob) {
            1.0 + symmetric(rng, cfg.max_zoom)
        } else {
            1.0
        };
        if angle != 0.0 || scale != 1.0 {
            image = warp_affine(&image, angle, scale);
        }

        if chance(rng, cfg.contrast_prob) {
            let factor = 1.0 + symmetric(rng, cfg.max_contrast);
            adjust_contrast(&mut image, factor);
        }

        image
    }
}

/// 画像中心まわりの回転＋拡大縮小（逆写像・端はクランプ・双線形補間）
fn warp_affine(src: &RgbImage, angle: f32, scale: f32) -> RgbImage {
    let (width, height) = src.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = angle.sin_cos();

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        // 出力座標 -> 入力座標
        let sx = (cos * dx + sin * dy) / scale + cx;
        let sy = (-sin * dx + cos * dy) / scale + cy;
        sample_bilinear(src, sx, sy)
    })
}

fn sample_bilinear(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = src.dimensions();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = src.get_pixel(x0, y0);
    let p10 = src.get_pixel(x1, y0);
    let p01 = src.get_pixel(x0, y1);
    let p11 = src.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// チャネルごとの平均を保ったままコントラストを変える
fn adjust_contrast(image: &mut RgbImage, factor: f32) {
    let pixel_count = (image.width() * image.height()).max(1) as f32;
    let mut mean = [0f32; 3];
    for pixel in image.pixels() {
        for c in 0..3 {
            mean[c] += pixel[c] as f32;
        }
    }
    for m in &mut mean {
        *m /= pixel_count;
    }

    for pixel in image.pixels_mut() {
        for c in 0..3 {
            let v = (pixel[c] as f32 - mean[c]) * factor + mean[c];
            pixel[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}
