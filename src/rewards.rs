//! 報酬計算
//!
//! ポイント・バッジ・アバター段階を `UserProgress` として明示的に持ち、
//! `RewardEngine::apply` で新しい状態を返します（入力は変更しない）。
//! 報酬イベントは確定ラベルか分別結果を必要とするため、ゲート未通過の予測では発生しません。

use serde::{Deserialize, Serialize};

use crate::bin_rules::DisposalDecision;
use crate::gate::{FinalLabel, LabelSource};

/// バッジ（獲得ポイントのしきい値で解放）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Badge {
    FirstSort,
    Recycler,
    DonationHero,
    ZeroWasteChamp,
}

impl Badge {
    pub const ALL: [Badge; 4] = [
        Badge::FirstSort,
        Badge::Recycler,
        Badge::DonationHero,
        Badge::ZeroWasteChamp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Badge::FirstSort => "First Sort",
            Badge::Recycler => "Recycler",
            Badge::DonationHero => "Donation Hero",
            Badge::ZeroWasteChamp => "Zero Waste Champ",
        }
    }

    pub fn threshold(self) -> u32 {
        match self {
            Badge::FirstSort => 10,
            Badge::Recycler => 50,
            Badge::DonationHero => 100,
            Badge::ZeroWasteChamp => 250,
        }
    }
}

/// アバターの成長段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AvatarStage {
    EcoSeed,
    GreenSprout,
    EarthGuardian,
    EcoVisionary,
}

impl AvatarStage {
    pub const ALL: [AvatarStage; 4] = [
        AvatarStage::EcoSeed,
        AvatarStage::GreenSprout,
        AvatarStage::EarthGuardian,
        AvatarStage::EcoVisionary,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AvatarStage::EcoSeed => "Eco Seed",
            AvatarStage::GreenSprout => "Green Sprout",
            AvatarStage::EarthGuardian => "Earth Guardian",
            AvatarStage::EcoVisionary => "Eco Visionary",
        }
    }

    pub fn min_points(self) -> u32 {
        match self {
            AvatarStage::EcoSeed => 0,
            AvatarStage::GreenSprout => 50,
            AvatarStage::EarthGuardian => 150,
            AvatarStage::EcoVisionary => 300,
        }
    }

    /// 到達済みの最上位段階
    pub fn for_points(points: u32) -> Self {
        Self::ALL
            .into_iter()
            .rev()
            .find(|stage| points >= stage.min_points())
            .unwrap_or(AvatarStage::EcoSeed)
    }

    pub fn next(self) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| *stage > self)
    }
}

/// ユーザーの進捗
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProgress {
    pub points: u32,
    /// 獲得順
    pub badges: Vec<Badge>,
}

impl UserProgress {
    pub fn avatar(&self) -> AvatarStage {
        AvatarStage::for_points(self.points)
    }

    /// 次の段階と、そこまでの残りポイント
    pub fn next_stage(&self) -> Option<(AvatarStage, u32)> {
        self.avatar()
            .next()
            .map(|stage| (stage, stage.min_points() - self.points))
    }

    pub fn has_badge(&self, badge: Badge) -> bool {
        self.badges.contains(&badge)
    }
}

/// 報酬イベント
#[derive(Debug, Clone, Copy)]
pub enum RewardEvent<'a> {
    /// 予測が正しいとユーザーが確認した
    PredictionConfirmed(&'a FinalLabel),
    /// 分別ルールに従って捨てた
    Disposed(&'a DisposalDecision),
    /// 寄付・売却した
    DonatedOrSold(&'a DisposalDecision),
}

/// イベントごとの獲得ポイント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointTable {
    pub confirmed_prediction: u32,
    pub disposal: u32,
    pub donation: u32,
}

impl Default for PointTable {
    fn default() -> Self {
        Self {
            confirmed_prediction: 5,
            disposal: 5,
            donation: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewardEngine {
    points: PointTable,
}

impl RewardEngine {
    pub fn new(points: PointTable) -> Self {
        Self { points }
    }

    /// イベントの獲得ポイント
    ///
    /// 人が訂正したラベルは確認ポイントの対象外です。
    pub fn points_for(&self, event: &RewardEvent<'_>) -> u32 {
        match event {
            RewardEvent::PredictionConfirmed(label) => match label.source() {
                LabelSource::HumanCorrected => 0,
                LabelSource::AutoAccepted | LabelSource::HumanChosen => {
                    self.points.confirmed_prediction
                }
            },
            RewardEvent::Disposed(_) => self.points.disposal,
            RewardEvent::DonatedOrSold(_) => self.points.donation,
        }
    }

    /// イベント適用後の進捗を返す
    pub fn apply(&self, progress: &UserProgress, event: RewardEvent<'_>) -> UserProgress {
        let points = progress.points.saturating_add(self.points_for(&event));
        let mut badges = progress.badges.clone();
        for badge in Badge::ALL {
            if points >= badge.threshold() && !badges.contains(&badge) {
                tracing::info!("badge unlocked: {}", badge.name());
                badges.push(badge);
            }
        }
        UserProgress { points, badges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_rules::BinRules;
    use crate::gate::{Candidate, ConfidenceGate, GateDecision, HumanChoice, RankedPrediction};
    use crate::model::ClassCatalog;

    fn ranked(p1: f32) -> RankedPrediction {
        RankedPrediction {
            top1: Candidate {
                label: "paper".into(),
                index: 1,
                probability: p1,
            },
            top2: Candidate {
                label: "glass".into(),
                index: 0,
                probability: 1.0 - p1,
            },
        }
    }

    fn auto_label() -> FinalLabel {
        match ConfidenceGate::default().decide(ranked(0.9)) {
            GateDecision::AutoAccept(label) => label,
            GateDecision::NeedsHumanChoice(_) => unreachable!(),
        }
    }

    #[test]
    fn confirmed_prediction_and_disposal_add_points() {
        let engine = RewardEngine::default();
        let label = auto_label();
        let decision = DisposalDecision::resolve(label.clone(), &BinRules::default());

        let start = UserProgress::default();
        let after = engine.apply(&start, RewardEvent::PredictionConfirmed(&label));
        let after = engine.apply(&after, RewardEvent::Disposed(&decision));

        assert_eq!(start.points, 0);
        assert_eq!(after.points, 10);
        assert_eq!(after.badges, vec![Badge::FirstSort]);
    }

    #[test]
    fn donation_is_worth_ten() {
        let engine = RewardEngine::default();
        let decision = DisposalDecision::resolve(auto_label(), &BinRules::default());
        let after = engine.apply(&UserProgress::default(), RewardEvent::DonatedOrSold(&decision));
        assert_eq!(after.points, 10);
    }

    #[test]
    fn human_chosen_labels_still_earn_confirmation_points() {
        let GateDecision::NeedsHumanChoice(pending) = ConfidenceGate::default().decide(ranked(0.5))
        else {
            panic!("expected a pending choice");
        };
        let label = pending.choose(HumanChoice::First);
        let engine = RewardEngine::default();
        assert_eq!(engine.points_for(&RewardEvent::PredictionConfirmed(&label)), 5);
    }

    #[test]
    fn corrected_labels_earn_no_confirmation_points() {
        let catalog = ClassCatalog::from_directory_names(["glass", "paper"]);
        let corrected = auto_label().correct(&catalog, "glass").unwrap();
        let engine = RewardEngine::default();
        let after = engine.apply(
            &UserProgress::default(),
            RewardEvent::PredictionConfirmed(&corrected),
        );
        assert_eq!(after.points, 0);
    }

    #[test]
    fn badges_unlock_in_threshold_order_once() {
        let engine = RewardEngine::default();
        let decision = DisposalDecision::resolve(auto_label(), &BinRules::default());
        let mut progress = UserProgress::default();
        for _ in 0..25 {
            progress = engine.apply(&progress, RewardEvent::DonatedOrSold(&decision));
        }
        assert_eq!(progress.points, 250);
        assert_eq!(progress.badges, Badge::ALL.to_vec());
    }

    #[test]
    fn avatar_stage_follows_points() {
        assert_eq!(AvatarStage::for_points(0), AvatarStage::EcoSeed);
        assert_eq!(AvatarStage::for_points(49), AvatarStage::EcoSeed);
        assert_eq!(AvatarStage::for_points(50), AvatarStage::GreenSprout);
        assert_eq!(AvatarStage::for_points(299), AvatarStage::EarthGuardian);
        assert_eq!(AvatarStage::for_points(1000), AvatarStage::EcoVisionary);

        let progress = UserProgress {
            points: 120,
            badges: vec![],
        };
        assert_eq!(progress.next_stage(), Some((AvatarStage::EarthGuardian, 30)));
        assert_eq!(AvatarStage::EcoVisionary.next(), None);
    }

    #[test]
    fn apply_does_not_mutate_input() {
        let engine = RewardEngine::default();
        let label = auto_label();
        let start = UserProgress {
            points: 7,
            badges: vec![],
        };
        let _ = engine.apply(&start, RewardEvent::PredictionConfirmed(&label));
        assert_eq!(start.points, 7);
    }
}
