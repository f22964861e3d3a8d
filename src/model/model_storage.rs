//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（モデル構造、正規化方式、クラスカタログなど）
//! - model.bin       - モデルの重み（BinBytesRecorder、f32精度）
//!
//! クラスカタログは別途 `class_names.json` としても保存します。
//! どちらのファイルも同じディレクトリの一時ファイルに書いてからリネームするため、
//! 読み込み側が書きかけのファイルを見ることはありません。

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tar::{Archive, Builder};

use crate::error::{EcoVisionError, ModelLoadError, Result};
use crate::ml::backbone::{check_parameter_shapes, parameter_shapes};
use crate::ml::ml_model::WasteClassifier;
use crate::model::model_metadata::ModelMetadata;
use crate::model::ClassCatalog;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

type Precision = FullPrecisionSettings;

fn corrupt(path: &Path, reason: impl Into<String>) -> EcoVisionError {
    ModelLoadError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

/// 同じディレクトリの一時ファイルに書き込んでから置き換える
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut tempfile::NamedTempFile) -> Result<()>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| EcoVisionError::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| EcoVisionError::io(parent, e))?;
    write(&mut tmp)?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| EcoVisionError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| EcoVisionError::io(path, e.error))?;
    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)
}

/// メタデータと共にモデルをTar.gz形式で保存
pub fn save_model_archive(path: &Path, metadata: &ModelMetadata, model_binary: &[u8]) -> Result<()> {
    let json = metadata.to_json_string()?;

    write_atomic(path, |tmp| {
        let tmp_path = tmp.path().to_path_buf();
        let io_err = |e: std::io::Error| EcoVisionError::io(tmp_path.clone(), e);
        let encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
        let mut builder = Builder::new(encoder);
        append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).map_err(io_err)?;
        append_entry(&mut builder, MODEL_ENTRY, model_binary).map_err(io_err)?;
        builder.into_inner().and_then(|gz| gz.finish()).map_err(io_err)?;
        Ok(())
    })
}

/// Tar.gzからメタデータとモデルバイナリを読み込む
pub fn load_model_archive(path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    if !path.exists() {
        return Err(ModelLoadError::MissingArtifact {
            kind: "model artifact",
            path: path.to_path_buf(),
        }
        .into());
    }
    let file = File::open(path).map_err(|e| EcoVisionError::io(path, e))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut metadata: Option<ModelMetadata> = None;
    let mut model_binary: Option<Vec<u8>> = None;

    let entries = archive
        .entries()
        .map_err(|e| corrupt(path, format!("not a tar.gz archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(path, format!("unreadable entry: {e}")))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(path, format!("bad entry name: {e}")))?
            .to_string_lossy()
            .into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json = String::new();
                entry
                    .read_to_string(&mut json)
                    .map_err(|e| corrupt(path, format!("unreadable {METADATA_ENTRY}: {e}")))?;
                let parsed = ModelMetadata::from_json_string(&json)
                    .map_err(|e| corrupt(path, format!("invalid {METADATA_ENTRY}: {e}")))?;
                metadata = Some(parsed);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| corrupt(path, format!("unreadable {MODEL_ENTRY}: {e}")))?;
                model_binary = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata, model_binary) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(corrupt(path, format!("{METADATA_ENTRY} not found in archive"))),
        (_, None) => Err(corrupt(path, format!("{MODEL_ENTRY} not found in archive"))),
    }
}

/// Tar.gzからメタデータのみ読み込む
pub fn load_metadata(path: &Path) -> Result<ModelMetadata> {
    load_model_archive(path).map(|(metadata, _)| metadata)
}

/// モデルの重みをバイト列へ（f32精度）
pub fn encode_model<B: Backend>(model: WasteClassifier<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<Precision>::default()
        .record(model.into_record(), ())
        .map_err(|e| EcoVisionError::Record(format!("failed to encode model weights: {e:?}")))
}

/// バイト列から重みを復元
pub fn decode_model<B: Backend>(
    model: WasteClassifier<B>,
    model_binary: Vec<u8>,
    path: &Path,
    device: &B::Device,
) -> Result<WasteClassifier<B>> {
    let expected = parameter_shapes::<B, _>(&model);
    let record = BinBytesRecorder::<Precision>::default()
        .load(model_binary, device)
        .map_err(|e| corrupt(path, format!("model weights do not match the stored config: {e:?}")))?;
    let model = model.load_record(record);
    check_parameter_shapes::<B, _>(&expected, &model)
        .map_err(|reason| corrupt(path, format!("model weights do not match the stored config: {reason}")))?;
    Ok(model)
}

/// モデルアーティファクトとクラスカタログを保存
///
/// メタデータに同梱するカタログと別ファイルのカタログは同一でなければなりません。
pub fn save_model_with_catalog<B: Backend>(
    model_path: &Path,
    catalog_path: &Path,
    metadata: &ModelMetadata,
    catalog: &ClassCatalog,
    model: WasteClassifier<B>,
) -> Result<()> {
    if metadata.class_names.as_slice() != catalog.names() {
        return Err(EcoVisionError::Config(
            "metadata class names differ from the catalog being saved".into(),
        ));
    }
    if model.num_classes() != catalog.len() {
        return Err(EcoVisionError::Config(format!(
            "model outputs {} classes but the catalog has {}",
            model.num_classes(),
            catalog.len()
        )));
    }

    let model_binary = encode_model(model)?;
    tracing::debug!(
        "model weights: {} bytes ({:.2} MB)",
        model_binary.len(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    save_model_archive(model_path, metadata, &model_binary)?;

    let catalog_json = catalog.to_json_string()?;
    write_atomic(catalog_path, |tmp| {
        tmp.write_all(catalog_json.as_bytes())
            .map_err(|e| EcoVisionError::io(tmp.path().to_path_buf(), e))
    })
}
