//! 学習データセット
//!
//! クラスごとのディレクトリツリーを走査してクラスカタログを作成し、
//! 固定シードで学習用と検証用に分割します。画像はパスのみ保持し、
//! バッチ作成時にデコード・リサイズ・正規化します。

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor},
};
use burn_dataset::Dataset;
use rand::{seq::SliceRandom, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{DatasetError, Result};
use crate::ml::augment::Augmenter;
use crate::ml::ml_model::Preprocessor;
use crate::model::ClassCatalog;

/// 読み込み対象の拡張子
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

/// データセットアイテム（画像パスとクラスIDのみ保持）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleRef {
    pub path: PathBuf,
    pub label: usize,
}

/// 走査結果（分割前）
#[derive(Debug, Clone)]
pub struct ScannedDataset {
    pub catalog: ClassCatalog,
    pub samples: Vec<SampleRef>,
}

/// 学習用・検証用に分割したデータセット
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub catalog: ClassCatalog,
    pub train: ImageFolderDataset,
    pub validation: ImageFolderDataset,
}

impl DatasetSplit {
    /// 学習用サブセットの実際のラベル列
    pub fn train_labels(&self) -> Vec<usize> {
        self.train.labels()
    }
}

/// 分割後のサブセット（シャッフル済みサンプル列のインデックス範囲を参照）
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    samples: Arc<[SampleRef]>,
    start_idx: usize,
    end_idx: usize,
}

impl ImageFolderDataset {
    pub fn samples(&self) -> &[SampleRef] {
        &self.samples[self.start_idx..self.end_idx]
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples().iter().map(|s| s.label).collect()
    }
}

impl Dataset<SampleRef> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<SampleRef> {
        self.samples().get(index).cloned()
    }

    fn len(&self) -> usize {
        self.end_idx - self.start_idx
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

fn read_dir_sorted(dir: &Path) -> std::result::Result<Vec<PathBuf>, DatasetError> {
    let unreadable = |source| DatasetError::Unreadable {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(unreadable)? {
        paths.push(entry.map_err(unreadable)?.path());
    }
    paths.sort();
    Ok(paths)
}

/// クラスディレクトリ配下の画像を再帰的に収集
fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> std::result::Result<(), DatasetError> {
    for path in read_dir_sorted(dir)? {
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if path.is_file() && is_image_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// ディレクトリから学習データを走査する
///
/// 直下のサブディレクトリ名をソートしたものがクラスカタログになります。
pub fn scan_directory(root: &Path) -> Result<ScannedDataset> {
    if !root.is_dir() {
        return Err(DatasetError::MissingRoot {
            path: root.to_path_buf(),
        }
        .into());
    }

    let class_dirs: Vec<PathBuf> = read_dir_sorted(root)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect();
    let catalog = ClassCatalog::from_directory_names(
        class_dirs
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())),
    );

    if catalog.len() < 2 {
        return Err(DatasetError::TooFewClasses {
            path: root.to_path_buf(),
            found: catalog.len(),
        }
        .into());
    }

    let mut samples = Vec::new();
    for (class_id, class_name) in catalog.iter().enumerate() {
        let class_dir = root.join(class_name);
        let mut images = Vec::new();
        collect_images(&class_dir, &mut images)?;

        if images.is_empty() {
            return Err(DatasetError::EmptyClass {
                class: class_name.to_string(),
                path: class_dir,
            }
            .into());
        }

        // ヘッダーのみ読み込んでデコード可能か確認
        for path in &images {
            image::image_dimensions(path).map_err(|source| DatasetError::UnreadableImage {
                path: path.clone(),
                source,
            })?;
        }

        tracing::info!("  class {}: {} ({} images)", class_id, class_name, images.len());
        samples.extend(images.into_iter().map(|path| SampleRef {
            path,
            label: class_id,
        }));
    }

    tracing::info!(
        "loaded {} samples from {} classes under {}",
        samples.len(),
        catalog.len(),
        root.display()
    );

    Ok(ScannedDataset { catalog, samples })
}

impl ScannedDataset {
    /// データセットを学習用と検証用に分割
    ///
    /// サンプル列全体をシードで一度だけシャッフルし、末尾 `floor(n * validation_fraction)` 件を検証用にします。
    /// 同じシード・同じディレクトリ内容なら同じ分割になります。
    pub fn split(self, validation_fraction: f32, seed: u64) -> Result<DatasetSplit> {
        if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
            return Err(DatasetError::InvalidSplit {
                fraction: validation_fraction,
            }
            .into());
        }

        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total_len = samples.len();
        let val_len = (total_len as f64 * validation_fraction as f64) as usize;
        let train_len = total_len - val_len;
        let samples: Arc<[SampleRef]> = samples.into();

        let train = ImageFolderDataset {
            samples: samples.clone(),
            start_idx: 0,
            end_idx: train_len,
        };
        let validation = ImageFolderDataset {
            samples,
            start_idx: train_len,
            end_idx: total_len,
        };

        tracing::info!(
            "split (seed {}): {} training / {} validation",
            seed,
            train.len(),
            validation.len()
        );

        Ok(DatasetSplit {
            catalog: self.catalog,
            train,
            validation,
        })
    }
}

/// ディレクトリを走査して分割する
pub fn load_split(root: &Path, validation_fraction: f32, seed: u64) -> Result<DatasetSplit> {
    scan_directory(root)?.split(validation_fraction, seed)
}

/// バッチ作成中にデコードできなかった画像の記録先
///
/// データローダーのワーカースレッドから書き込まれ、エポック終了時に学習ループが確認します。
#[derive(Clone, Debug, Default)]
pub struct DecodeFailures {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl DecodeFailures {
    fn push(&self, path: PathBuf) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.push(path);
        }
    }

    /// 記録された失敗があればエラーとして返し、記録を空にする
    pub fn check(&self) -> std::result::Result<(), DatasetError> {
        let mut paths = match self.paths.lock() {
            Ok(paths) => paths,
            Err(poisoned) => poisoned.into_inner(),
        };
        if paths.is_empty() {
            return Ok(());
        }
        let count = paths.len();
        let first = paths[0].clone();
        paths.clear();
        Err(DatasetError::BatchDecode { count, first })
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// バッチャー
///
/// 学習用は `augmenter` を持ち、検証用・評価用は持ちません。
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    preprocessor: Preprocessor,
    augmenter: Option<Augmenter>,
    failures: DecodeFailures,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, preprocessor: Preprocessor) -> Self {
        Self {
            device,
            preprocessor,
            augmenter: None,
            failures: DecodeFailures::default(),
        }
    }

    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    pub fn failures(&self) -> DecodeFailures {
        self.failures.clone()
    }

    fn load_sample(&self, item: &SampleRef) -> image::ImageResult<Vec<f32>> {
        let image = image::open(&item.path)?;
        let resized = self.preprocessor.resize(&image);
        let resized = match &self.augmenter {
            Some(augmenter) => augmenter.apply(resized, &mut rand::thread_rng()),
            None => resized,
        };
        Ok(self.preprocessor.normalize(&resized))
    }
}

impl<B: Backend> Batcher<B, SampleRef, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<SampleRef>, _device: &B::Device) -> ImageBatch<B> {
        let size = self.preprocessor.image_size;
        let mut all_pixels = Vec::with_capacity(items.len() * self.preprocessor.tensor_len());
        let mut targets = Vec::with_capacity(items.len());

        for item in items {
            match self.load_sample(&item) {
                Ok(data) => {
                    all_pixels.extend_from_slice(&data);
                    targets.push(item.label as i64);
                }
                Err(e) => {
                    tracing::error!("failed to decode {}: {}", item.path.display(), e);
                    self.failures.push(item.path);
                }
            }
        }

        let batch_size = targets.len();
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::EcoVisionError;
    use crate::ml::ml_model::Normalization;
    use burn_ndarray::NdArray;

    /// テスト用の画像ツリーを作成（クラスごとに色を変える）
    pub(crate) fn write_image_tree(root: &Path, classes: &[(&str, usize)], size: u32) {
        for (class_id, (name, count)) in classes.iter().enumerate() {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let shade = (40 * class_id as u32 + 3 * i as u32).min(255) as u8;
                let img = image::RgbImage::from_fn(size, size, |x, _| {
                    image::Rgb([shade, (x * 7) as u8, 255 - shade])
                });
                img.save(dir.join(format!("img_{i:03}.png"))).unwrap();
            }
        }
    }

    #[test]
    fn catalog_is_sorted_directory_names() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("plastic", 2), ("battery", 2), ("glass", 2)], 8);

        let scanned = scan_directory(dir.path()).unwrap();
        assert_eq!(scanned.catalog.names(), &["battery", "glass", "plastic"]);
        assert_eq!(scanned.samples.len(), 6);
        assert!(scanned.samples[..2].iter().all(|s| s.label == 0));
    }

    #[test]
    fn nested_images_are_found_and_other_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("a", 1), ("b", 1)], 8);
        let nested = dir.path().join("a").join("more");
        std::fs::create_dir_all(&nested).unwrap();
        image::RgbImage::new(8, 8).save(nested.join("deep.png")).unwrap();
        std::fs::write(dir.path().join("a").join("notes.txt"), "x").unwrap();

        let scanned = scan_directory(dir.path()).unwrap();
        assert_eq!(scanned.samples.iter().filter(|s| s.label == 0).count(), 2);
    }

    #[test]
    fn split_is_deterministic_for_the_same_seed() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("a", 10), ("b", 10), ("c", 5)], 8);

        let first = load_split(dir.path(), 0.2, 42).unwrap();
        let second = load_split(dir.path(), 0.2, 42).unwrap();

        assert_eq!(first.train.samples(), second.train.samples());
        assert_eq!(first.validation.samples(), second.validation.samples());
        assert_eq!(first.validation.len(), 5);
        assert_eq!(first.train.len(), 20);
    }

    #[test]
    fn split_partitions_every_sample_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("a", 7), ("b", 6)], 8);

        let split = load_split(dir.path(), 0.2, 7).unwrap();
        let mut all: Vec<PathBuf> = split
            .train
            .samples()
            .iter()
            .chain(split.validation.samples())
            .map(|s| s.path.clone())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 13);
    }

    #[test]
    fn empty_class_directory_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("a", 3)], 8);
        std::fs::create_dir_all(dir.path().join("b")).unwrap();

        let err = scan_directory(dir.path()).unwrap_err();
        match err {
            EcoVisionError::Dataset(DatasetError::EmptyClass { class, .. }) => {
                assert_eq!(class, "b")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_root_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_directory(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(
            err,
            EcoVisionError::Dataset(DatasetError::MissingRoot { .. })
        ));
    }

    #[test]
    fn corrupt_image_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("a", 1), ("b", 1)], 8);
        std::fs::write(dir.path().join("b").join("broken.png"), b"not a png").unwrap();

        let err = scan_directory(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            EcoVisionError::Dataset(DatasetError::UnreadableImage { .. })
        ));
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("a", 2), ("b", 2)], 8);
        let err = load_split(dir.path(), 1.0, 42).unwrap_err();
        assert!(matches!(
            err,
            EcoVisionError::Dataset(DatasetError::InvalidSplit { .. })
        ));
    }

    #[test]
    fn batcher_produces_chw_batches() {
        let dir = tempfile::tempdir().unwrap();
        write_image_tree(dir.path(), &[("a", 2), ("b", 1)], 20);
        let scanned = scan_directory(dir.path()).unwrap();

        let device = Default::default();
        let batcher = ImageBatcher::<NdArray<f32>>::new(
            device,
            Preprocessor::new(16, Normalization::ImageNet),
        );
        let batch = batcher.batch(scanned.samples.clone(), &device);
        assert_eq!(batch.images.dims(), [3, 3, 16, 16]);
        assert_eq!(batch.len(), 3);
        assert!(batcher.failures().check().is_ok());
    }

    #[test]
    fn batcher_records_decode_failures_instead_of_zero_filling() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"garbage").unwrap();

        let device = Default::default();
        let batcher = ImageBatcher::<NdArray<f32>>::new(
            device,
            Preprocessor::new(8, Normalization::ImageNet),
        );
        let batch = batcher.batch(
            vec![SampleRef {
                path: broken,
                label: 0,
            }],
            &device,
        );
        assert!(batch.is_empty());
        assert!(matches!(
            batcher.failures().check(),
            Err(DatasetError::BatchDecode { count: 1, .. })
        ));
        assert!(batcher.failures().check().is_ok());
    }
}
