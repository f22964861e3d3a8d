//! クラスカタログ
//!
//! クラス名の並び順がモデル出力層のインデックスと一対一で対応します。
//! 学習時にディレクトリ名をソートして一度だけ作成し、JSON配列として保存します。
//! 推論時はファイルからそのまま読み込み、ディレクトリを再走査して作り直してはいけません。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EcoVisionError, ModelLoadError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassCatalog {
    names: Vec<String>,
}

impl ClassCatalog {
    /// ディレクトリ名からカタログを作成（ソートして正規順序にする）
    pub fn from_directory_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    /// 既に正規順序になっているクラス名列からカタログを作成
    pub fn from_ordered(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EcoVisionError::json("<class catalog>", e))
    }

    /// JSON配列ファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ModelLoadError::MissingArtifact {
                kind: "class catalog",
                path: path.to_path_buf(),
            }
            .into());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| EcoVisionError::io(path, e))?;
        let catalog: ClassCatalog =
            serde_json::from_str(&content).map_err(|e| ModelLoadError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("class catalog is not a JSON array of strings: {e}"),
            })?;
        if catalog.is_empty() {
            return Err(ModelLoadError::Corrupt {
                path: path.to_path_buf(),
                reason: "class catalog is empty".to_string(),
            }
            .into());
        }
        Ok(catalog)
    }
}
