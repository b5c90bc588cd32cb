//! Tunable parameters for the decision core.
//!
//! Everything a model version can tune lives here: attribution and grace
//! windows, prior shapes, profitability thresholds, fatigue rule thresholds,
//! winner-index behavior, and queue/retry knobs. [`ModelParams`] is the
//! immutable payload of a registry version — components receive it by
//! reference from the active snapshot and never mutate it.
//!
//! Defaults follow the source material: a seven-day attribution window, a
//! two-day ignorance zone, and a break-even return-on-spend threshold of 1.0.
//! All of them are tunable via the registry; nothing reads these constants
//! directly at a decision site.

use chrono::Duration;

use crate::errors::CoreError;

/// Sampler tunables: windows, priors, thresholds, ranking fractions.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SamplerParams {
    /// Hours after spend during which revenue attribution is still settling.
    pub attribution_window_hours: f64,
    /// Hours after launch during which no kill/increase/decrease may fire.
    pub ignorance_zone_hours: f64,
    /// Return-on-spend below which an arm is unprofitable (1.0 = break-even).
    pub roas_threshold: f64,
    /// Reference click-through rate used to normalize CTR-based scores so
    /// they are commensurate with ROAS-based scores (1.0 = at reference).
    pub ctr_reference: f64,
    /// Minimum impressions before kill/decrease decisions are permitted.
    pub min_sample_size: u64,
    /// Fraction of ranked arms eligible for budget increase.
    pub top_fraction: f64,
    /// Fraction of ranked arms eligible for decrease/kill evaluation.
    pub bottom_fraction: f64,
    /// Z-score for posterior confidence bounds (1.96 ≈ 95% two-sided).
    pub ucb_z: f64,
    /// Uninformative CTR prior (Beta alpha).
    pub ctr_alpha0: f64,
    /// Uninformative CTR prior (Beta beta).
    pub ctr_beta0: f64,
    /// Uninformative ROAS prior (Gamma shape).
    pub roas_shape0: f64,
    /// Uninformative ROAS prior (Gamma rate, in spend units).
    pub roas_rate0: f64,
    /// Currency amount treated as one revenue count in the Gamma posterior.
    pub revenue_unit: f64,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            attribution_window_hours: 168.0,
            ignorance_zone_hours: 48.0,
            roas_threshold: 1.0,
            ctr_reference: 0.01,
            min_sample_size: 1_000,
            top_fraction: 0.25,
            bottom_fraction: 0.25,
            ucb_z: 1.96,
            ctr_alpha0: 1.0,
            ctr_beta0: 1.0,
            roas_shape0: 1.0,
            roas_rate0: 1.0,
            revenue_unit: 1.0,
        }
    }
}

impl SamplerParams {
    /// Attribution window as a duration.
    pub fn attribution_window(&self) -> Duration {
        hours(self.attribution_window_hours)
    }

    /// Ignorance zone as a duration.
    pub fn ignorance_zone(&self) -> Duration {
        hours(self.ignorance_zone_hours)
    }
}

/// How triggered fatigue rule severities combine into one score.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FatigueAggregation {
    /// Score = max severity among triggered rules.
    #[default]
    Max,
    /// Score = weighted sum of triggered severities, clamped to `[0, 1]`.
    WeightedSum {
        ctr_decline: f64,
        saturation: f64,
        cost_spike: f64,
        flatline: f64,
    },
}

/// Fatigue detector tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FatigueParams {
    /// Length of one aggregation period, in hours (24 = daily periods).
    pub period_hours: f64,
    /// Number of periods retained in the rolling window.
    pub window_periods: usize,
    /// Minimum periods before any rule may fire.
    pub min_periods: usize,
    /// CTR trend slope (per period) at or below which decline triggers.
    /// Negative: e.g. `-0.001` = losing 0.1pp of CTR per period.
    pub ctr_slope_threshold: f64,
    /// Impressions-per-unique-reach above which saturation triggers.
    pub saturation_frequency_cap: f64,
    /// Z-score of cost-per-impression above its window mean at which the
    /// cost-spike rule triggers.
    pub cost_spike_z: f64,
    /// CTR variance below which a period counts toward a flatline run.
    pub flatline_epsilon: f64,
    /// Consecutive low-variance periods required for flatline to trigger.
    pub flatline_periods: u32,
    /// Aggregation mode for triggered severities.
    pub aggregation: FatigueAggregation,
    /// Aggregate score at or above which the aggregator escalates a fatigued
    /// arm from refresh candidacy to pause.
    pub pause_threshold: f64,
}

impl Default for FatigueParams {
    fn default() -> Self {
        Self {
            period_hours: 24.0,
            window_periods: 14,
            min_periods: 3,
            ctr_slope_threshold: -0.001,
            saturation_frequency_cap: 3.5,
            cost_spike_z: 2.0,
            flatline_epsilon: 1e-8,
            flatline_periods: 3,
            aggregation: FatigueAggregation::Max,
            pause_threshold: 0.75,
        }
    }
}

impl FatigueParams {
    /// Period length as a duration.
    pub fn period(&self) -> Duration {
        hours(self.period_hours)
    }
}

/// Winner pattern index tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WinnerParams {
    /// Neighbors returned by a lookup.
    pub k_neighbors: usize,
    /// Z-score for the graduation rule's lower confidence bound (mirror of
    /// the kill rule's upper-bound bar).
    pub graduation_z: f64,
    /// Minimum impressions before an arm may graduate.
    pub graduation_min_sample: u64,
    /// Equivalent impressions of pseudo-observation mass seeded into a new
    /// arm's posterior from its nearest winners. Real observations swamp
    /// this mass as they accumulate.
    pub prior_equivalent_impressions: f64,
    /// Entries with confidence below this floor may be evicted.
    pub confidence_floor: f64,
    /// Entries older than this horizon may be evicted.
    pub retention_days: f64,
}

impl Default for WinnerParams {
    fn default() -> Self {
        Self {
            k_neighbors: 5,
            graduation_z: 1.96,
            graduation_min_sample: 1_000,
            prior_equivalent_impressions: 200.0,
            confidence_floor: 0.2,
            retention_days: 180.0,
        }
    }
}

impl WinnerParams {
    /// Retention horizon as a duration.
    pub fn retention_horizon(&self) -> Duration {
        hours(self.retention_days * 24.0)
    }
}

/// Execution queue and worker tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueParams {
    /// Minimum pre-call jitter, in milliseconds.
    pub jitter_min_ms: u64,
    /// Maximum pre-call jitter, in milliseconds.
    pub jitter_max_ms: u64,
    /// Attempts before a transient failure becomes terminal.
    pub max_attempts: u32,
    /// Base backoff delay, doubled per attempt.
    pub backoff_base_ms: u64,
    /// Backoff ceiling.
    pub backoff_cap_ms: u64,
    /// Seconds a claim may be held before the sweep requeues it (recovery
    /// for crashed workers; a live claim runs to completion).
    pub claim_ttl_secs: u64,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            jitter_min_ms: 2_000,
            jitter_max_ms: 20_000,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            claim_ttl_secs: 300,
        }
    }
}

impl QueueParams {
    /// Backoff delay before attempt `attempt + 1` (0-based attempt count).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::milliseconds(ms as i64)
    }

    /// Claim time-to-live as a duration.
    pub fn claim_ttl(&self) -> Duration {
        Duration::seconds(self.claim_ttl_secs as i64)
    }
}

/// Complete tunable parameter set — the payload of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelParams {
    pub sampler: SamplerParams,
    pub fatigue: FatigueParams,
    pub winners: WinnerParams,
    pub queue: QueueParams,
}

impl ModelParams {
    /// Validate the parameter set.
    ///
    /// Checks the constraints the decision functions rely on; callers should
    /// validate before registering a version so a bad tuning never becomes
    /// the active snapshot.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut problems: Vec<String> = Vec::new();
        let s = &self.sampler;
        if !(s.attribution_window_hours.is_finite() && s.attribution_window_hours > 0.0) {
            problems.push("attribution_window_hours must be positive".into());
        }
        if !(s.ignorance_zone_hours.is_finite() && s.ignorance_zone_hours >= 0.0) {
            problems.push("ignorance_zone_hours must be non-negative".into());
        }
        if !(s.roas_threshold.is_finite() && s.roas_threshold > 0.0) {
            problems.push("roas_threshold must be positive".into());
        }
        if !(s.ctr_reference.is_finite() && s.ctr_reference > 0.0) {
            problems.push("ctr_reference must be positive".into());
        }
        for (name, v) in [("top_fraction", s.top_fraction), ("bottom_fraction", s.bottom_fraction)] {
            if !(v.is_finite() && (0.0..=1.0).contains(&v)) {
                problems.push(format!("{name} must be in [0, 1]"));
            }
        }
        for (name, v) in [
            ("ctr_alpha0", s.ctr_alpha0),
            ("ctr_beta0", s.ctr_beta0),
            ("roas_shape0", s.roas_shape0),
            ("roas_rate0", s.roas_rate0),
            ("revenue_unit", s.revenue_unit),
        ] {
            if !(v.is_finite() && v > 0.0) {
                problems.push(format!("{name} must be positive"));
            }
        }
        let f = &self.fatigue;
        if !(f.period_hours.is_finite() && f.period_hours > 0.0) {
            problems.push("period_hours must be positive".into());
        }
        if f.window_periods == 0 {
            problems.push("window_periods must be at least 1".into());
        }
        if f.ctr_slope_threshold >= 0.0 || !f.ctr_slope_threshold.is_finite() {
            problems.push("ctr_slope_threshold must be negative".into());
        }
        if !(f.saturation_frequency_cap.is_finite() && f.saturation_frequency_cap > 1.0) {
            problems.push("saturation_frequency_cap must exceed 1.0".into());
        }
        if !(f.flatline_epsilon.is_finite() && f.flatline_epsilon > 0.0) {
            problems.push("flatline_epsilon must be positive".into());
        }
        if f.flatline_periods == 0 {
            problems.push("flatline_periods must be at least 1".into());
        }
        if !(f.pause_threshold.is_finite() && (0.0..=1.0).contains(&f.pause_threshold)) {
            problems.push("pause_threshold must be in [0, 1]".into());
        }
        let w = &self.winners;
        if w.k_neighbors == 0 {
            problems.push("k_neighbors must be at least 1".into());
        }
        if !(w.prior_equivalent_impressions.is_finite() && w.prior_equivalent_impressions >= 0.0) {
            problems.push("prior_equivalent_impressions must be non-negative".into());
        }
        let q = &self.queue;
        if q.jitter_min_ms > q.jitter_max_ms {
            problems.push("jitter_min_ms must not exceed jitter_max_ms".into());
        }
        if q.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidParams {
                details: problems.join("; "),
            })
        }
    }

    /// Flatten the numeric tunables for version comparison.
    ///
    /// Used by the registry's shadow-mode diff; field names are stable.
    pub fn flatten(&self) -> Vec<(&'static str, f64)> {
        let s = &self.sampler;
        let f = &self.fatigue;
        let w = &self.winners;
        let q = &self.queue;
        vec![
            ("sampler.attribution_window_hours", s.attribution_window_hours),
            ("sampler.ignorance_zone_hours", s.ignorance_zone_hours),
            ("sampler.roas_threshold", s.roas_threshold),
            ("sampler.ctr_reference", s.ctr_reference),
            ("sampler.min_sample_size", s.min_sample_size as f64),
            ("sampler.top_fraction", s.top_fraction),
            ("sampler.bottom_fraction", s.bottom_fraction),
            ("sampler.ucb_z", s.ucb_z),
            ("sampler.ctr_alpha0", s.ctr_alpha0),
            ("sampler.ctr_beta0", s.ctr_beta0),
            ("sampler.roas_shape0", s.roas_shape0),
            ("sampler.roas_rate0", s.roas_rate0),
            ("sampler.revenue_unit", s.revenue_unit),
            ("fatigue.period_hours", f.period_hours),
            ("fatigue.window_periods", f.window_periods as f64),
            ("fatigue.min_periods", f.min_periods as f64),
            ("fatigue.ctr_slope_threshold", f.ctr_slope_threshold),
            ("fatigue.saturation_frequency_cap", f.saturation_frequency_cap),
            ("fatigue.cost_spike_z", f.cost_spike_z),
            ("fatigue.flatline_epsilon", f.flatline_epsilon),
            ("fatigue.flatline_periods", f64::from(f.flatline_periods)),
            ("fatigue.pause_threshold", f.pause_threshold),
            ("winners.k_neighbors", w.k_neighbors as f64),
            ("winners.graduation_z", w.graduation_z),
            ("winners.graduation_min_sample", w.graduation_min_sample as f64),
            (
                "winners.prior_equivalent_impressions",
                w.prior_equivalent_impressions,
            ),
            ("winners.confidence_floor", w.confidence_floor),
            ("winners.retention_days", w.retention_days),
            ("queue.jitter_min_ms", q.jitter_min_ms as f64),
            ("queue.jitter_max_ms", q.jitter_max_ms as f64),
            ("queue.max_attempts", f64::from(q.max_attempts)),
            ("queue.backoff_base_ms", q.backoff_base_ms as f64),
            ("queue.backoff_cap_ms", q.backoff_cap_ms as f64),
            ("queue.claim_ttl_secs", q.claim_ttl_secs as f64),
        ]
    }
}

fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.0) as i64)
}
