//! 評価
//!
//! ラベル付き画像に対して推論モードのモデルを実行し、混同行列と
//! クラスごとの precision / recall / F1 / support を集計します。

use burn::{data::dataloader::batcher::Batcher, tensor::backend::Backend};
use std::fmt;
use std::path::Path;

use crate::error::{EcoVisionError, Result};
use crate::ml::dataset::{scan_directory, ImageBatcher, SampleRef};
use crate::ml::inference::InferenceEngine;
use crate::model::ClassCatalog;

/// 混同行列（行 = 正解、列 = 予測）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn record(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.counts[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual * self.num_classes + predicted]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|c| self.get(c, c)).sum()
    }

    /// 正解が `class` のサンプル数
    pub fn support(&self, class: usize) -> usize {
        (0..self.num_classes).map(|p| self.get(class, p)).sum()
    }

    /// `class` と予測されたサンプル数
    pub fn predicted(&self, class: usize) -> usize {
        (0..self.num_classes).map(|a| self.get(a, class)).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AverageMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 分類レポート
///
/// 予測0件のクラスの precision、正解0件のクラスの recall は 0 として扱います。
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AverageMetrics,
    pub weighted_avg: AverageMetrics,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ClassificationReport {
    pub fn from_confusion(matrix: &ConfusionMatrix, catalog: &ClassCatalog) -> Self {
        let classes: Vec<ClassMetrics> = (0..matrix.num_classes())
            .map(|c| {
                let tp = matrix.get(c, c);
                let precision = ratio(tp, matrix.predicted(c));
                let recall = ratio(tp, matrix.support(c));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label: catalog.name(c).unwrap_or("?").to_string(),
                    precision,
                    recall,
                    f1,
                    support: matrix.support(c),
                }
            })
            .collect();

        let total = matrix.total();
        let n = classes.len().max(1) as f64;
        let macro_avg = AverageMetrics {
            precision: classes.iter().map(|m| m.precision).sum::<f64>() / n,
            recall: classes.iter().map(|m| m.recall).sum::<f64>() / n,
            f1: classes.iter().map(|m| m.f1).sum::<f64>() / n,
            support: total,
        };
        let weighted = |f: fn(&ClassMetrics) -> f64| {
            if total == 0 {
                0.0
            } else {
                classes.iter().map(|m| f(m) * m.support as f64).sum::<f64>() / total as f64
            }
        };
        let weighted_avg = AverageMetrics {
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1: weighted(|m| m.f1),
            support: total,
        };

        Self {
            accuracy: ratio(matrix.correct(), total),
            classes,
            macro_avg,
            weighted_avg,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|m| m.label.len())
            .max()
            .unwrap_or(0)
            .max("weighted avg".len());

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for m in &self.classes {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                m.label, m.precision, m.recall, m.f1, m.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        for (name, avg) in [("macro avg", self.macro_avg), ("weighted avg", self.weighted_avg)] {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name, avg.precision, avg.recall, avg.f1, avg.support
            )?;
        }
        Ok(())
    }
}

/// ラベル付きサンプルをバッチ推論して混同行列を作る
///
/// ラベルはエンジンのカタログのインデックスであること。
pub fn evaluate_samples<B: Backend>(
    engine: &InferenceEngine<B>,
    samples: &[SampleRef],
    batch_size: usize,
) -> Result<ConfusionMatrix> {
    let batcher = ImageBatcher::<B>::new(engine.device().clone(), engine.preprocessor());
    let failures = batcher.failures();
    let mut matrix = ConfusionMatrix::new(engine.catalog().len());

    for chunk in samples.chunks(batch_size.max(1)) {
        let batch = batcher.batch(chunk.to_vec(), engine.device());
        failures.check()?;
        let predictions = engine.probabilities(batch.images)?;
        for (sample, prediction) in chunk.iter().zip(&predictions) {
            if let Some(&top) = prediction.ranked_indices().first() {
                matrix.record(sample.label, top);
            }
        }
    }
    Ok(matrix)
}

/// クラスごとのディレクトリツリーを評価する
///
/// ディレクトリ名はモデルのカタログで引き直します（カタログにないクラスはエラー）。
pub fn evaluate_directory<B: Backend>(
    engine: &InferenceEngine<B>,
    root: &Path,
    batch_size: usize,
) -> Result<ClassificationReport> {
    let scanned = scan_directory(root)?;
    let catalog = engine.catalog();

    let mut remap = Vec::with_capacity(scanned.catalog.len());
    for name in scanned.catalog.iter() {
        let index = catalog
            .index_of(name)
            .ok_or_else(|| EcoVisionError::UnknownClass(name.to_string()))?;
        remap.push(index);
    }
    let samples: Vec<SampleRef> = scanned
        .samples
        .into_iter()
        .map(|s| SampleRef {
            label: remap[s.label],
            path: s.path,
        })
        .collect();

    tracing::info!("evaluating {} images under {}", samples.len(), root.display());
    let matrix = evaluate_samples(engine, &samples, batch_size)?;
    Ok(ClassificationReport::from_confusion(&matrix, catalog))
}
