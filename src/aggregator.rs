//! Decision aggregation: one action per arm per cycle.
//!
//! The sampler recommends a profitability direction; the fatigue detector
//! flags creative decay. This module merges the two into exactly one
//! [`Action`] under a total precedence ordering, so contradictory
//! directives (increase and pause the same arm, say) can never be emitted:
//!
//! ```text
//! kill > fatigue-triggered pause > increase/decrease > refresh > no action
//! ```
//!
//! A fatigued arm escalates from refresh candidacy to pause only when its
//! aggregate fatigue score reaches the configured pause threshold; a single
//! moderately fired rule stays a refresh recommendation even when the arm
//! is otherwise profitable.

use crate::fatigue::FatigueAssessment;
use crate::params::FatigueParams;
use crate::sampler::{Direction, Recommendation};

/// The one mutation (or non-mutation) chosen for an arm this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Action {
    NoAction,
    RefreshCreative,
    DecreaseBudget,
    IncreaseBudget,
    Pause,
    Kill,
}

impl Action {
    /// Whether applying this action mutates platform state.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, Self::NoAction)
    }

    /// Stable lowercase name for dedupe keys and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoAction => "no_action",
            Self::RefreshCreative => "refresh_creative",
            Self::DecreaseBudget => "decrease_budget",
            Self::IncreaseBudget => "increase_budget",
            Self::Pause => "pause",
            Self::Kill => "kill",
        }
    }
}

/// Merge a sampler recommendation and a fatigue assessment into one action.
pub fn aggregate(
    recommendation: &Recommendation,
    fatigue: &FatigueAssessment,
    params: &FatigueParams,
) -> Action {
    if recommendation.direction == Direction::Kill {
        return Action::Kill;
    }
    if fatigue.score >= params.pause_threshold && fatigue.any_triggered() {
        return Action::Pause;
    }
    match recommendation.direction {
        Direction::Increase => Action::IncreaseBudget,
        Direction::Decrease => Action::DecreaseBudget,
        Direction::Kill => Action::Kill,
        Direction::Hold => {
            if fatigue.any_triggered() {
                Action::RefreshCreative
            } else {
                Action::NoAction
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatigue::{FatigueRule, RuleTrigger};

    fn rec(direction: Direction) -> Recommendation {
        Recommendation {
            arm: "a".to_string(),
            sampled_score: 1.0,
            direction,
            notes: Vec::new(),
        }
    }

    fn fatigue(score: f64, rules: &[FatigueRule]) -> FatigueAssessment {
        FatigueAssessment {
            score,
            triggered: rules
                .iter()
                .map(|&rule| RuleTrigger {
                    rule,
                    severity: score,
                })
                .collect(),
        }
    }

    fn params() -> FatigueParams {
        FatigueParams::default()
    }

    #[test]
    fn kill_outranks_everything() {
        let heavy = fatigue(1.0, &[FatigueRule::CtrDecline, FatigueRule::Saturation]);
        assert_eq!(aggregate(&rec(Direction::Kill), &heavy, &params()), Action::Kill);
    }

    #[test]
    fn severe_fatigue_pauses_over_budget_moves() {
        let severe = fatigue(0.9, &[FatigueRule::Saturation]);
        assert_eq!(
            aggregate(&rec(Direction::Increase), &severe, &params()),
            Action::Pause
        );
        assert_eq!(
            aggregate(&rec(Direction::Decrease), &severe, &params()),
            Action::Pause
        );
    }

    #[test]
    fn moderate_fatigue_yields_refresh_not_kill() {
        // One rule at severity 0.5: below the pause threshold, so a held
        // arm becomes a refresh candidate even while profitable.
        let moderate = fatigue(0.5, &[FatigueRule::CtrDecline]);
        assert_eq!(
            aggregate(&rec(Direction::Hold), &moderate, &params()),
            Action::RefreshCreative
        );
    }

    #[test]
    fn budget_moves_outrank_refresh() {
        let moderate = fatigue(0.5, &[FatigueRule::CtrDecline]);
        assert_eq!(
            aggregate(&rec(Direction::Increase), &moderate, &params()),
            Action::IncreaseBudget
        );
        assert_eq!(
            aggregate(&rec(Direction::Decrease), &moderate, &params()),
            Action::DecreaseBudget
        );
    }

    #[test]
    fn quiet_arm_gets_no_action() {
        assert_eq!(
            aggregate(&rec(Direction::Hold), &FatigueAssessment::default(), &params()),
            Action::NoAction
        );
    }

    #[test]
    fn exactly_one_action_per_combination() {
        // The merge is total: every direction × fatigue level resolves.
        let levels = [
            FatigueAssessment::default(),
            fatigue(0.5, &[FatigueRule::Flatline]),
            fatigue(0.95, &[FatigueRule::Flatline]),
        ];
        for direction in [
            Direction::Increase,
            Direction::Decrease,
            Direction::Kill,
            Direction::Hold,
        ] {
            for f in &levels {
                let _ = aggregate(&rec(direction), f, &params());
            }
        }
    }
}
