//! Fatigue detection: creative decay rules, independent of profitability.
//!
//! The detector watches per-period aggregates of an arm's delivery and flags
//! creative decay. It never recommends a profitability action — that
//! privilege belongs to the sampler — it only flags refresh/pause
//! candidacy.
//!
//! Four rules, each evaluated independently over the same rolling window and
//! producing a boolean trigger plus a severity in `[0, 1]`:
//!
//! 1. **CTR decline** — least-squares CTR trend slope at or below a negative
//!    threshold.
//! 2. **Saturation** — impressions-per-unique-reach above a frequency cap
//!    (audience exhaustion).
//! 3. **Cost spike** — latest cost-per-impression deviating above the
//!    window mean by a z-score threshold.
//! 4. **Flatline** — CTR variance below epsilon for N consecutive periods;
//!    a single outlier period resets the run.
//!
//! Severity is the exceedance `1 - threshold/observed` (0 at the threshold,
//! approaching 1 as the signal dwarfs it), so severities are dimensionless
//! and comparable across rules.

use std::collections::VecDeque;

use crate::params::{FatigueAggregation, FatigueParams};

/// Delivery aggregates for one closed period.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeriodStats {
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    /// Distinct users reached, when the telemetry provides it (0 = unknown).
    pub unique_reach: u64,
}

impl PeriodStats {
    /// Click-through rate for the period.
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks.min(self.impressions) as f64 / self.impressions as f64
        }
    }

    /// Cost per impression for the period.
    pub fn cost_per_impression(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.spend / self.impressions as f64
        }
    }

    /// Fold another batch of deliveries into this period.
    pub fn absorb(&mut self, other: PeriodStats) {
        self.impressions = self.impressions.saturating_add(other.impressions);
        self.clicks = self.clicks.saturating_add(other.clicks);
        if other.spend.is_finite() && other.spend > 0.0 {
            self.spend += other.spend;
        }
        self.unique_reach = self.unique_reach.saturating_add(other.unique_reach);
    }
}

/// Rolling window of closed periods plus the flatline run counter.
///
/// This is the per-arm `FatigueState`: everything the rules need, updated
/// incrementally as periods close.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FatigueWindow {
    cap: usize,
    periods: VecDeque<PeriodStats>,
    flatline_run: u32,
}

impl FatigueWindow {
    /// Empty window retaining up to `cap` periods (minimum 1).
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            periods: VecDeque::new(),
            flatline_run: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// Consecutive low-variance periods observed so far.
    pub fn flatline_run(&self) -> u32 {
        self.flatline_run
    }

    /// Iterate over retained periods, oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &PeriodStats> + '_ {
        self.periods.iter()
    }

    /// Close a period: push its aggregates, evicting the oldest past `cap`,
    /// and advance or reset the flatline run.
    pub fn push_period(&mut self, stats: PeriodStats, epsilon: f64) {
        if self.periods.len() == self.cap {
            self.periods.pop_front();
        }
        self.periods.push_back(stats);
        // A run advances only while window-wide CTR variance stays below
        // epsilon; any outlier period resets it.
        if self.periods.len() >= 2 && self.ctr_variance() < epsilon {
            self.flatline_run = self.flatline_run.saturating_add(1);
        } else {
            self.flatline_run = 0;
        }
    }

    /// Least-squares slope of CTR against period index (per period).
    pub fn ctr_slope(&self) -> Option<f64> {
        let n = self.periods.len();
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        let mean_x = (nf - 1.0) / 2.0;
        let mean_y = self.periods.iter().map(PeriodStats::ctr).sum::<f64>() / nf;
        let mut cov = 0.0;
        let mut var_x = 0.0;
        for (i, p) in self.periods.iter().enumerate() {
            let dx = i as f64 - mean_x;
            cov += dx * (p.ctr() - mean_y);
            var_x += dx * dx;
        }
        if var_x <= 0.0 {
            return None;
        }
        Some(cov / var_x)
    }

    /// Population variance of CTR across retained periods.
    pub fn ctr_variance(&self) -> f64 {
        let n = self.periods.len();
        if n < 2 {
            return f64::INFINITY;
        }
        let nf = n as f64;
        let mean = self.periods.iter().map(PeriodStats::ctr).sum::<f64>() / nf;
        self.periods
            .iter()
            .map(|p| {
                let d = p.ctr() - mean;
                d * d
            })
            .sum::<f64>()
            / nf
    }

    /// Window-wide impressions-per-unique-reach, or `None` when reach is
    /// unreported.
    pub fn frequency(&self) -> Option<f64> {
        let impressions: u64 = self.periods.iter().map(|p| p.impressions).sum();
        let reach: u64 = self.periods.iter().map(|p| p.unique_reach).sum();
        if reach == 0 {
            return None;
        }
        Some(impressions as f64 / reach as f64)
    }

    /// Z-score of the latest period's cost-per-impression against the
    /// preceding periods, or `None` with fewer than three periods or a
    /// degenerate baseline.
    pub fn cost_z_score(&self) -> Option<f64> {
        let n = self.periods.len();
        if n < 3 {
            return None;
        }
        let last = self.periods.back()?.cost_per_impression();
        let baseline: Vec<f64> = self
            .periods
            .iter()
            .take(n - 1)
            .map(PeriodStats::cost_per_impression)
            .collect();
        let bn = baseline.len() as f64;
        let mean = baseline.iter().sum::<f64>() / bn;
        let var = baseline.iter().map(|c| (c - mean) * (c - mean)).sum::<f64>() / bn;
        let std = var.sqrt();
        if !(std.is_finite() && std > 1e-12) {
            return None;
        }
        Some((last - mean) / std)
    }
}

/// The decay rules, evaluated in a fixed list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FatigueRule {
    CtrDecline,
    Saturation,
    CostSpike,
    Flatline,
}

/// Every rule, in evaluation order.
pub const ALL_RULES: [FatigueRule; 4] = [
    FatigueRule::CtrDecline,
    FatigueRule::Saturation,
    FatigueRule::CostSpike,
    FatigueRule::Flatline,
];

/// A fired rule with its severity.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuleTrigger {
    pub rule: FatigueRule,
    /// Exceedance severity in `[0, 1]`: 0 at the threshold, approaching 1
    /// as the signal dwarfs it.
    pub severity: f64,
}

/// Aggregate fatigue output for one arm.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FatigueAssessment {
    /// Combined score in `[0, 1]` per the configured aggregation.
    pub score: f64,
    pub triggered: Vec<RuleTrigger>,
}

impl FatigueAssessment {
    /// Whether any rule fired.
    pub fn any_triggered(&self) -> bool {
        !self.triggered.is_empty()
    }

    /// Whether a specific rule fired.
    pub fn is_triggered(&self, rule: FatigueRule) -> bool {
        self.triggered.iter().any(|t| t.rule == rule)
    }
}

/// Evaluate every rule over `window` and aggregate the severities.
///
/// Windows with fewer than `min_periods` closed periods trigger nothing —
/// insufficient data is a hold, not a failure.
pub fn assess(window: &FatigueWindow, params: &FatigueParams) -> FatigueAssessment {
    if window.len() < params.min_periods.max(1) {
        return FatigueAssessment::default();
    }
    let triggered: Vec<RuleTrigger> = ALL_RULES
        .iter()
        .filter_map(|&rule| evaluate_rule(rule, window, params))
        .collect();
    let score = match params.aggregation {
        FatigueAggregation::Max => triggered
            .iter()
            .map(|t| t.severity)
            .fold(0.0, f64::max),
        FatigueAggregation::WeightedSum {
            ctr_decline,
            saturation,
            cost_spike,
            flatline,
        } => triggered
            .iter()
            .map(|t| {
                let w = match t.rule {
                    FatigueRule::CtrDecline => ctr_decline,
                    FatigueRule::Saturation => saturation,
                    FatigueRule::CostSpike => cost_spike,
                    FatigueRule::Flatline => flatline,
                };
                w * t.severity
            })
            .sum::<f64>()
            .clamp(0.0, 1.0),
    };
    FatigueAssessment { score, triggered }
}

fn evaluate_rule(
    rule: FatigueRule,
    window: &FatigueWindow,
    params: &FatigueParams,
) -> Option<RuleTrigger> {
    let severity = match rule {
        FatigueRule::CtrDecline => {
            let slope = window.ctr_slope()?;
            if slope > params.ctr_slope_threshold {
                return None;
            }
            exceedance(slope.abs(), params.ctr_slope_threshold.abs())
        }
        FatigueRule::Saturation => {
            let freq = window.frequency()?;
            if freq <= params.saturation_frequency_cap {
                return None;
            }
            exceedance(freq, params.saturation_frequency_cap)
        }
        FatigueRule::CostSpike => {
            let z = window.cost_z_score()?;
            if z < params.cost_spike_z {
                return None;
            }
            exceedance(z, params.cost_spike_z)
        }
        FatigueRule::Flatline => {
            let run = window.flatline_run();
            if run < params.flatline_periods {
                return None;
            }
            exceedance(f64::from(run), f64::from(params.flatline_periods))
        }
    };
    Some(RuleTrigger { rule, severity })
}

/// `1 - threshold/observed`, clamped to `[0, 1]`.
fn exceedance(observed: f64, threshold: f64) -> f64 {
    if !(observed.is_finite() && threshold.is_finite()) || observed <= 0.0 {
        return 0.0;
    }
    (1.0 - threshold / observed).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period(impressions: u64, clicks: u64, spend: f64, reach: u64) -> PeriodStats {
        PeriodStats {
            impressions,
            clicks,
            spend,
            unique_reach: reach,
        }
    }

    fn params() -> FatigueParams {
        FatigueParams::default()
    }

    /// Window with a steadily declining CTR: 2.0% dropping 0.2pp per period.
    fn declining_window(n: usize) -> FatigueWindow {
        let mut w = FatigueWindow::new(14);
        for i in 0..n {
            let clicks = 200u64.saturating_sub(20 * i as u64);
            w.push_period(period(10_000, clicks, 50.0, 5_000), params().flatline_epsilon);
        }
        w
    }

    #[test]
    fn too_few_periods_triggers_nothing() {
        let mut w = FatigueWindow::new(14);
        w.push_period(period(10_000, 10, 50.0, 5_000), 1e-8);
        let a = assess(&w, &params());
        assert!(!a.any_triggered());
        assert_eq!(a.score, 0.0);
    }

    #[test]
    fn ctr_decline_fires_on_steep_negative_slope() {
        let w = declining_window(6);
        let a = assess(&w, &params());
        assert!(a.is_triggered(FatigueRule::CtrDecline));
        let t = a
            .triggered
            .iter()
            .find(|t| t.rule == FatigueRule::CtrDecline)
            .unwrap();
        // Slope −0.002/period against a −0.001 threshold → severity 0.5.
        assert!((t.severity - 0.5).abs() < 0.05, "severity={}", t.severity);
    }

    #[test]
    fn ctr_decline_quiet_on_flat_delivery() {
        let mut w = FatigueWindow::new(14);
        for _ in 0..6 {
            w.push_period(period(10_000, 150, 50.0, 5_000), 1e-8);
        }
        let a = assess(&w, &params());
        assert!(!a.is_triggered(FatigueRule::CtrDecline));
    }

    #[test]
    fn saturation_fires_above_frequency_cap() {
        let mut w = FatigueWindow::new(14);
        for _ in 0..4 {
            // 10k impressions over 2k uniques = frequency 5.0 > cap 3.5.
            w.push_period(period(10_000, 150, 50.0, 2_000), 1e-8);
        }
        let a = assess(&w, &params());
        assert!(a.is_triggered(FatigueRule::Saturation));
    }

    #[test]
    fn saturation_skipped_without_reach_data() {
        let mut w = FatigueWindow::new(14);
        for _ in 0..4 {
            w.push_period(period(10_000, 150, 50.0, 0), 1e-8);
        }
        let a = assess(&w, &params());
        assert!(!a.is_triggered(FatigueRule::Saturation));
    }

    #[test]
    fn cost_spike_fires_on_deviating_last_period() {
        let mut w = FatigueWindow::new(14);
        // Stable-but-noisy CPI baseline, then a spike.
        for i in 0..6 {
            let spend = 50.0 + if i % 2 == 0 { 1.0 } else { -1.0 };
            w.push_period(period(10_000, 150, spend, 5_000), 1e-8);
        }
        w.push_period(period(10_000, 150, 120.0, 5_000), 1e-8);
        let a = assess(&w, &params());
        assert!(a.is_triggered(FatigueRule::CostSpike));
    }

    #[test]
    fn flatline_fires_after_n_consecutive_quiet_periods() {
        let p = params();
        let mut w = FatigueWindow::new(14);
        // Identical periods → zero CTR variance from the second push on.
        for _ in 0..4 {
            w.push_period(period(10_000, 150, 50.0, 5_000), p.flatline_epsilon);
        }
        assert!(w.flatline_run() >= p.flatline_periods);
        let a = assess(&w, &p);
        assert!(a.is_triggered(FatigueRule::Flatline));
    }

    #[test]
    fn flatline_outlier_resets_the_run() {
        let p = params();
        let mut w = FatigueWindow::new(14);
        for _ in 0..3 {
            w.push_period(period(10_000, 150, 50.0, 5_000), p.flatline_epsilon);
        }
        let run_before = w.flatline_run();
        assert!(run_before > 0);
        // One outlier period: CTR jumps from 1.5% to 5%.
        w.push_period(period(10_000, 500, 50.0, 5_000), p.flatline_epsilon);
        assert_eq!(w.flatline_run(), 0);
        let a = assess(&w, &p);
        assert!(!a.is_triggered(FatigueRule::Flatline));
    }

    #[test]
    fn max_aggregation_takes_worst_severity() {
        let w = declining_window(8);
        let a = assess(&w, &params());
        let worst = a
            .triggered
            .iter()
            .map(|t| t.severity)
            .fold(0.0, f64::max);
        assert!((a.score - worst).abs() < 1e-12);
    }

    #[test]
    fn weighted_sum_aggregation_clamps_to_one() {
        let mut p = params();
        p.aggregation = FatigueAggregation::WeightedSum {
            ctr_decline: 5.0,
            saturation: 5.0,
            cost_spike: 5.0,
            flatline: 5.0,
        };
        let mut w = FatigueWindow::new(14);
        for i in 0..8 {
            let clicks = 400u64.saturating_sub(50 * i as u64);
            w.push_period(period(10_000, clicks, 50.0, 1_000), p.flatline_epsilon);
        }
        let a = assess(&w, &p);
        assert!(a.any_triggered());
        assert!(a.score <= 1.0);
    }

    #[test]
    fn detector_ignores_profitability_entirely() {
        // Same delivery shape, wildly different spend/revenue economics —
        // spend only matters through cost-per-impression trend.
        let mut cheap = FatigueWindow::new(14);
        let mut dear = FatigueWindow::new(14);
        for i in 0..6 {
            let clicks = 200u64.saturating_sub(20 * i as u64);
            cheap.push_period(period(10_000, clicks, 1.0, 5_000), 1e-8);
            dear.push_period(period(10_000, clicks, 900.0, 5_000), 1e-8);
        }
        let a = assess(&cheap, &params());
        let b = assess(&dear, &params());
        assert_eq!(
            a.is_triggered(FatigueRule::CtrDecline),
            b.is_triggered(FatigueRule::CtrDecline)
        );
    }
}
