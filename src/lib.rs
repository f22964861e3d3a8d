//! 家庭ごみ画像の分類と分別ガイド
//!
//! - `ml`: データセット読み込み、MobileNetV2 転移学習、推論、評価
//! - `model`: 設定、クラスカタログ、モデルの永続化
//! - `gate`: 確信度ゲート（低確信度は人が選ぶまで確定しない）
//! - `bin_rules`: 確定ラベルから分別先を引く
//! - `rewards`: ポイントとバッジ

pub mod bin_rules;
pub mod error;
pub mod gate;
pub mod ml;
pub mod model;
pub mod rewards;

pub use error::{DatasetError, EcoVisionError, ModelLoadError, Result};
