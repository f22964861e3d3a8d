//! 確信度ゲート
//!
//! 上位1位の確率がしきい値以上なら自動確定し、未満なら上位2候補から人が選ぶまで確定しません。
//! `FinalLabel` はこのモジュール経由でしか作れないため、
//! 未確定の予測が分別ルールや報酬計算に渡ることはありません。

use serde::Serialize;

use crate::error::{EcoVisionError, Result};
use crate::model::ClassCatalog;

/// 自動確定の最小確信度
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.65;

/// 分類候補
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub label: String,
    pub index: usize,
    pub probability: f32,
}

/// 上位2候補（確率の降順）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPrediction {
    pub top1: Candidate,
    pub top2: Candidate,
}

/// 最終ラベルの確定経路
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// しきい値以上で自動確定
    AutoAccepted,
    /// 低確信度のため人が上位2候補から選択
    HumanChosen,
    /// 確定後に人が訂正
    HumanCorrected,
}

/// ゲートを通過したラベル
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalLabel {
    label: String,
    index: usize,
    /// モデルが付けた確率（訂正された場合は None）
    confidence: Option<f32>,
    source: LabelSource,
}

impl FinalLabel {
    fn from_candidate(candidate: Candidate, source: LabelSource) -> Self {
        Self {
            label: candidate.label,
            index: candidate.index,
            confidence: Some(candidate.probability),
            source,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    pub fn source(&self) -> LabelSource {
        self.source
    }

    /// ユーザーによる訂正（カタログ内の任意のクラスへ）
    ///
    /// 同じクラスを指定した場合は変更しません。
    pub fn correct(self, catalog: &ClassCatalog, class_name: &str) -> Result<FinalLabel> {
        let index = catalog
            .index_of(class_name)
            .ok_or_else(|| EcoVisionError::UnknownClass(class_name.to_string()))?;
        if index == self.index {
            return Ok(self);
        }
        tracing::info!("label corrected: {} -> {}", self.label, class_name);
        Ok(FinalLabel {
            label: class_name.to_string(),
            index,
            confidence: None,
            source: LabelSource::HumanCorrected,
        })
    }
}

/// 低確信度時の人の選択
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanChoice {
    First,
    Second,
}

/// 人の選択待ちの予測
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChoice {
    ranked: RankedPrediction,
}

impl PendingChoice {
    pub fn first(&self) -> &Candidate {
        &self.ranked.top1
    }

    pub fn second(&self) -> &Candidate {
        &self.ranked.top2
    }

    /// 選択して確定する
    pub fn choose(self, choice: HumanChoice) -> FinalLabel {
        let candidate = match choice {
            HumanChoice::First => self.ranked.top1,
            HumanChoice::Second => self.ranked.top2,
        };
        FinalLabel::from_candidate(candidate, LabelSource::HumanChosen)
    }
}

/// ゲートの判定結果
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    AutoAccept(FinalLabel),
    NeedsHumanChoice(PendingChoice),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceGate {
    threshold: f32,
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl ConfidenceGate {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(EcoVisionError::Config(format!(
                "confidence threshold must be in (0, 1], got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// `p1 >= threshold` なら自動確定
    pub fn decide(&self, ranked: RankedPrediction) -> GateDecision {
        if ranked.top1.probability >= self.threshold {
            GateDecision::AutoAccept(FinalLabel::from_candidate(
                ranked.top1,
                LabelSource::AutoAccepted,
            ))
        } else {
            tracing::debug!(
                "low confidence {:.3} < {:.2}: asking between {} and {}",
                ranked.top1.probability,
                self.threshold,
                ranked.top1.label,
                ranked.top2.label
            );
            GateDecision::NeedsHumanChoice(PendingChoice { ranked })
        }
    }
}
