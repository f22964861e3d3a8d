//! 分別ルール
//!
//! 確定したクラス名から捨てる先（ビン）を引く静的な対応表です。
//! 表にないクラスは "Manual Disposal Required" になります。

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EcoVisionError, Result};
use crate::gate::FinalLabel;

/// 対応表にないクラスの分別先
pub const MANUAL_DISPOSAL: &str = "Manual Disposal Required";

const BLUE_BIN: &str = "Blue Bin (Recycling)";
const GREEN_BIN: &str = "Green Bin (Organics)";
const BLACK_BIN: &str = "Black Bin (Garbage)";
const HAZARDOUS_DEPOT: &str = "Household Hazardous Waste Depot";

/// 組み込みの対応表
const DEFAULT_RULES: &[(&str, &str)] = &[
    ("aluminum_cans", BLUE_BIN),
    ("batteries", HAZARDOUS_DEPOT),
    ("cardboard", BLUE_BIN),
    ("ceramics", BLACK_BIN),
    ("chemical_containers", HAZARDOUS_DEPOT),
    ("clothes", MANUAL_DISPOSAL),
    ("diapers", BLACK_BIN),
    ("e_waste", HAZARDOUS_DEPOT),
    ("food_waste", GREEN_BIN),
    ("glass_bottles", BLUE_BIN),
    ("light_bulbs", HAZARDOUS_DEPOT),
    ("paper", BLUE_BIN),
    ("plastic_bags", BLACK_BIN),
    ("plastic_bottles", BLUE_BIN),
    ("shoes", MANUAL_DISPOSAL),
    ("styrofoam", BLACK_BIN),
    ("tin_cans", BLUE_BIN),
    ("yard_waste", GREEN_BIN),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinRules {
    rules: BTreeMap<String, String>,
}

impl Default for BinRules {
    fn default() -> Self {
        Self::from_pairs(DEFAULT_RULES.iter().copied())
    }
}

impl BinRules {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            rules: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// JSONオブジェクト `{ "class": "bin" }` から読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EcoVisionError::io(path, e))?;
        let rules: BTreeMap<String, String> =
            serde_json::from_str(&content).map_err(|e| EcoVisionError::json(path, e))?;
        tracing::info!("loaded {} bin rules from {}", rules.len(), path.display());
        Ok(Self { rules })
    }

    /// 指定があればファイルから、なければ組み込み表
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn bin_for(&self, class_name: &str) -> &str {
        self.rules
            .get(class_name)
            .map(String::as_str)
            .unwrap_or(MANUAL_DISPOSAL)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// 確定ラベルと分別先
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisposalDecision {
    pub label: FinalLabel,
    pub bin: String,
}

impl DisposalDecision {
    pub fn resolve(label: FinalLabel, rules: &BinRules) -> Self {
        let bin = rules.bin_for(label.label()).to_string();
        Self { label, bin }
    }

    pub fn is_manual(&self) -> bool {
        self.bin == MANUAL_DISPOSAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{Candidate, ConfidenceGate, GateDecision, RankedPrediction};

    fn final_label(name: &str) -> FinalLabel {
        let ranked = RankedPrediction {
            top1: Candidate {
                label: name.into(),
                index: 0,
                probability: 0.9,
            },
            top2: Candidate {
                label: "other".into(),
                index: 1,
                probability: 0.1,
            },
        };
        match ConfidenceGate::default().decide(ranked) {
            GateDecision::AutoAccept(label) => label,
            GateDecision::NeedsHumanChoice(_) => unreachable!(),
        }
    }

    #[test]
    fn known_class_resolves_to_its_bin() {
        let decision = DisposalDecision::resolve(final_label("batteries"), &BinRules::default());
        assert_eq!(decision.bin, HAZARDOUS_DEPOT);
        assert!(!decision.is_manual());
    }

    #[test]
    fn unknown_class_resolves_to_manual_disposal() {
        let decision = DisposalDecision::resolve(final_label("mystery"), &BinRules::default());
        assert_eq!(decision.bin, MANUAL_DISPOSAL);
        assert!(decision.is_manual());
    }

    #[test]
    fn rules_load_from_json_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bins.json");
        std::fs::write(&path, r#"{"glass": "Blue", "food": "Green"}"#).unwrap();

        let rules = BinRules::load_or_default(Some(&path)).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.bin_for("food"), "Green");
        assert_eq!(rules.bin_for("batteries"), MANUAL_DISPOSAL);
    }

    #[test]
    fn non_object_rules_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bins.json");
        std::fs::write(&path, r#"["glass"]"#).unwrap();
        assert!(matches!(
            BinRules::load(&path),
            Err(EcoVisionError::Json { .. })
        ));
    }
}
