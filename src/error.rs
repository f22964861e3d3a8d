//! エラー定義
//!
//! データセット読み込み・学習・成果物の読み込みで発生するエラーを型として定義します。
//! どのエラーも致命的で、代替モデルや代替クラスへのフォールバックは行いません。

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EcoVisionError>;

/// データセット（クラスごとのディレクトリツリー）の読み込みエラー
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset root {path} does not exist")]
    MissingRoot { path: PathBuf },
    #[error("cannot read dataset directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset root {path} contains {found} class directories (at least 2 required)")]
    TooFewClasses { path: PathBuf, found: usize },
    #[error("class directory '{class}' ({path}) contains no images")]
    EmptyClass { class: String, path: PathBuf },
    #[error("cannot decode image {path}: {source}")]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{count} image(s) failed to decode during training, first: {first}")]
    BatchDecode { count: usize, first: PathBuf },
    #[error("validation fraction must be in (0, 1), got {fraction}")]
    InvalidSplit { fraction: f32 },
}

/// 学習済みモデル・クラスカタログの読み込みエラー
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("{kind} not found at {path}")]
    MissingArtifact { kind: &'static str, path: PathBuf },
    #[error("model artifact {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(
        "class catalog {catalog} has {catalog_len} entries but the model outputs {model_width} classes"
    )]
    WidthMismatch {
        catalog: PathBuf,
        catalog_len: usize,
        model_width: usize,
    },
    #[error("class catalog {catalog} does not match the catalog embedded in {model}")]
    CatalogMismatch { catalog: PathBuf, model: PathBuf },
}

/// パイプライン全体のエラー
#[derive(Debug, Error)]
pub enum EcoVisionError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("no training samples after the split for class(es): {}", classes.join(", "))]
    InsufficientData { classes: Vec<String> },
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error("pretrained backbone weights unavailable at {path}: {reason}")]
    PretrainedWeights { path: PathBuf, reason: String },
    #[error("training diverged in {phase} phase (epoch {epoch}, batch {batch}): loss = {loss}")]
    TrainingDivergence {
        phase: String,
        epoch: usize,
        batch: usize,
        loss: f32,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown class '{0}'")]
    UnknownClass(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("record error: {0}")]
    Record(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("tensor data error: {0}")]
    Tensor(String),
}

impl EcoVisionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}
