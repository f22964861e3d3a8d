//! モデルメタデータの定義
//!
//! tar.gz形式のモデルファイルに `metadata.json` として同梱されます。
//! 推論時はこの内容だけでモデルを再構築できる必要があります。

use serde::{Deserialize, Serialize};

use crate::error::{EcoVisionError, Result};
use crate::ml::ml_model::{ClassifierConfig, Normalization};
use crate::model::ClassCatalog;

/// メタデータ形式のバージョン
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// モデル構造（クラス数・入力サイズ・幅乗数・ヘッド構成）
    pub classifier: ClassifierConfig,

    /// 学習時の画素正規化方式
    pub normalization: Normalization,

    /// 学習時のクラスカタログ（出力インデックス順）
    ///
    /// 別ファイルの `class_names.json` と一致しなければ読み込みを拒否します。
    pub class_names: Vec<String>,

    /// HeadOnly 段階で実際に学習したエポック数
    pub phase1_epochs: usize,

    /// FineTune 段階で実際に学習したエポック数
    pub phase2_epochs: usize,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    pub fn new(
        classifier: ClassifierConfig,
        normalization: Normalization,
        catalog: &ClassCatalog,
        phase1_epochs: usize,
        phase2_epochs: usize,
    ) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            classifier,
            normalization,
            class_names: catalog.names().to_vec(),
            phase1_epochs,
            phase2_epochs,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn image_size(&self) -> usize {
        self.classifier.image_size
    }

    /// 同梱されたクラスカタログ
    pub fn catalog(&self) -> ClassCatalog {
        ClassCatalog::from_ordered(self.class_names.clone())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EcoVisionError::json("metadata.json", e))
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EcoVisionError::json("metadata.json", e))
    }

    /// ログ出力用の要約
    pub fn summary(&self) -> String {
        format!(
            "{} classes, input {}x{}, width x{}, {:?} normalization, epochs {}+{}, trained at {}",
            self.class_names.len(),
            self.image_size(),
            self.image_size(),
            self.classifier.width_multiplier,
            self.normalization,
            self.phase1_epochs,
            self.phase2_epochs,
            self.trained_at
        )
    }
}
