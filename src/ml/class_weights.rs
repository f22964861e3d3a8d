//! クラス不均衡補正の重み
//!
//! 学習用サブセットの実際のラベル分布から逆頻度重みを計算します。
//! `weight_c = total / (num_classes * count_c)`

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{EcoVisionError, Result};
use crate::model::ClassCatalog;

#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeightTable {
    weights: Vec<f32>,
    counts: Vec<usize>,
}

impl ClassWeightTable {
    /// 学習用ラベル列から重みを計算
    ///
    /// 学習用サブセットに1枚も含まれないクラスがあれば、そのクラス名をすべて列挙してエラーにします。
    pub fn from_labels(labels: &[usize], catalog: &ClassCatalog) -> Result<Self> {
        let num_classes = catalog.len();
        let mut counts = vec![0usize; num_classes];
        for &label in labels {
            match counts.get_mut(label) {
                Some(count) => *count += 1,
                None => {
                    return Err(EcoVisionError::Config(format!(
                        "label {label} is outside the class catalog ({num_classes} classes)"
                    )))
                }
            }
        }

        let missing: Vec<String> = counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .filter_map(|(idx, _)| catalog.name(idx).map(str::to_string))
            .collect();
        if !missing.is_empty() {
            return Err(EcoVisionError::InsufficientData { classes: missing });
        }

        let total = labels.len() as f64;
        let weights = counts
            .iter()
            .map(|&count| (total / (num_classes as f64 * count as f64)) as f32)
            .collect();

        Ok(Self { weights, counts })
    }

    pub fn weight(&self, class_idx: usize) -> Option<f32> {
        self.weights.get(class_idx).copied()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.weights
    }

    /// クラスごとの学習サンプル数
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_floats(self.weights.as_slice(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(names: &[&str]) -> ClassCatalog {
        ClassCatalog::from_ordered(names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn inverse_frequency_for_two_to_one_imbalance() {
        let mut labels = vec![0; 100];
        labels.extend(vec![1; 50]);
        let table = ClassWeightTable::from_labels(&labels, &catalog(&["A", "B"])).unwrap();

        assert!((table.weight(0).unwrap() - 0.75).abs() < 1e-6);
        assert!((table.weight(1).unwrap() - 1.5).abs() < 1e-6);
        assert_eq!(table.counts(), &[100, 50]);
    }

    #[test]
    fn four_class_split_weights_minorities_double() {
        let mut labels = vec![0; 100];
        labels.extend(vec![1; 100]);
        labels.extend(vec![2; 50]);
        labels.extend(vec![3; 50]);
        let table =
            ClassWeightTable::from_labels(&labels, &catalog(&["A", "B", "C", "D"])).unwrap();

        let expected = [0.75, 0.75, 1.5, 1.5];
        for (weight, want) in table.as_slice().iter().zip(expected) {
            assert!((weight - want).abs() < 1e-6, "{weight} != {want}");
        }
        assert_eq!(table.counts(), &[100, 100, 50, 50]);
    }

    #[test]
    fn balanced_classes_get_unit_weight() {
        let labels = [0, 1, 2, 0, 1, 2];
        let table = ClassWeightTable::from_labels(&labels, &catalog(&["a", "b", "c"])).unwrap();
        assert!(table.as_slice().iter().all(|w| (w - 1.0).abs() < 1e-6));
    }

    #[test]
    fn missing_classes_are_listed_by_name() {
        let labels = [0, 0, 2];
        let err = ClassWeightTable::from_labels(&labels, &catalog(&["a", "b", "c", "d"]))
            .unwrap_err();
        match err {
            EcoVisionError::InsufficientData { classes } => {
                assert_eq!(classes, vec!["b".to_string(), "d".to_string()])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
