//! Attribution-lag-aware sampling and ranking.
//!
//! Each decision cycle draws one Monte-Carlo sample from every eligible
//! arm's posterior (a true draw, not the posterior mean), ranks arms by the
//! sampled score, and marks the top fraction as budget-increase candidates
//! and the bottom fraction as decrease/kill candidates.
//!
//! Two mechanisms deal with delayed feedback:
//!
//! - **Mode blending.** While an arm's spend is younger than the
//!   attribution window, revenue has not settled, so the score leans on
//!   click-through propensity as a proxy ("pipeline" mode). The blend
//!   weight `w = min(1, arm_age / attribution_window)` moves linearly to
//!   settled return-on-spend ("direct" mode), so there is no score
//!   discontinuity at the window boundary.
//! - **Ignorance zone.** Inside a grace period after launch no kill,
//!   decrease, or increase may fire, however extreme the early posterior
//!   looks — small samples kill good creatives and anoint lucky ones.
//!
//! The kill decision itself is [`kill_rule`], a standalone function kept
//! separate from the ranking procedure so it can be validated on its own.
//!
//! Recommendations carry typed [`SamplerNote`]s recording which gate fired,
//! so a decision can be replayed from logs.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::params::SamplerParams;
use crate::posterior::ArmPosterior;

/// Recommended direction for one arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    Increase,
    Decrease,
    Kill,
    Hold,
}

/// Audit notes attached to a recommendation.
///
/// Notes are small, typed, and stable; prefer adding variants over changing
/// existing semantics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SamplerNote {
    /// The arm is inside the post-launch grace period; kill/scale decisions
    /// were suppressed.
    IgnoranceZone { elapsed_hours: f64, zone_hours: f64 },
    /// Revenue attribution is still settling; score blends CTR and ROAS.
    PipelineMode { blend_weight: f64 },
    /// The attribution window has elapsed; score is settled ROAS.
    DirectMode,
    /// The arm has no observations; it ranks on its prior and is never
    /// killed.
    UninformativePrior,
    /// Sample too small for decrease/kill eligibility.
    InsufficientSample { impressions: u64, min: u64 },
    /// Ranked in the top fraction (budget-increase candidate).
    RankedTop { rank: usize, of: usize },
    /// Ranked in the bottom fraction (decrease/kill candidate).
    RankedBottom { rank: usize, of: usize },
    /// The kill rule's confidence bar, as evaluated.
    KillBar { roas_upper: f64, threshold: f64 },
}

/// One arm's ranked recommendation for a cycle.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Recommendation {
    pub arm: String,
    /// The Monte-Carlo score this cycle ranked on.
    pub sampled_score: f64,
    pub direction: Direction,
    pub notes: Vec<SamplerNote>,
}

/// Everything the sampler needs to know about one arm.
#[derive(Debug, Clone, Copy)]
pub struct ArmContext<'a> {
    pub arm: &'a str,
    pub posterior: &'a ArmPosterior,
    pub launched_at: DateTime<Utc>,
}

/// Blend weight `w = min(1, age / attribution_window)`, clamped to `[0, 1]`.
#[must_use]
pub fn blend_weight(age: Duration, attribution_window: Duration) -> f64 {
    let window_ms = attribution_window.num_milliseconds();
    if window_ms <= 0 {
        return 1.0;
    }
    let age_ms = age.num_milliseconds().max(0);
    (age_ms as f64 / window_ms as f64).min(1.0)
}

/// The kill rule, kept standalone so it is testable apart from ranking.
///
/// Returns true only when all three hold:
/// (a) the ignorance zone has elapsed,
/// (b) the sample size meets the minimum, and
/// (c) the ROAS posterior's upper confidence bound is below the
///     profitability threshold — i.e. even an optimistic read says the arm
///     cannot pay for itself.
#[must_use]
pub fn kill_rule(
    arm_age: Duration,
    sample_size: u64,
    roas_upper_bound: f64,
    params: &SamplerParams,
) -> bool {
    arm_age >= params.ignorance_zone()
        && sample_size >= params.min_sample_size
        && roas_upper_bound < params.roas_threshold
}

/// Rank all arms for one decision cycle.
///
/// Deterministic for a given `(seed, arms, now)`: each arm's draw comes
/// from an rng keyed by the cycle seed and the arm id, so the outcome does
/// not depend on iteration order. Ties in the sampled score break
/// lexicographically on arm id.
pub fn rank_arms(
    arms: &[ArmContext<'_>],
    now: DateTime<Utc>,
    params: &SamplerParams,
    seed: u64,
) -> Vec<Recommendation> {
    let n = arms.len();
    if n == 0 {
        return Vec::new();
    }

    struct Scored<'a> {
        ctx: ArmContext<'a>,
        score: f64,
        w: f64,
        age: Duration,
    }

    let mut scored: Vec<Scored<'_>> = arms
        .iter()
        .map(|ctx| {
            let age = now - ctx.launched_at;
            let w = blend_weight(age, params.attribution_window());
            let mut rng = StdRng::seed_from_u64(seed ^ stable_hash64(ctx.arm));
            let score = ctx.posterior.sample_blended_score(&mut rng, w, params);
            Scored {
                ctx: *ctx,
                score,
                w,
                age,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.ctx.arm.cmp(b.ctx.arm))
    });

    let top_k = ((params.top_fraction * n as f64).ceil() as usize).min(n);
    let bottom_k = ((params.bottom_fraction * n as f64).ceil() as usize).min(n);

    scored
        .iter()
        .enumerate()
        .map(|(rank, s)| {
            let in_top = rank < top_k;
            let in_bottom = rank >= n - bottom_k;
            recommend(s.ctx, s.score, s.w, s.age, rank, n, in_top, in_bottom, params)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn recommend(
    ctx: ArmContext<'_>,
    score: f64,
    w: f64,
    age: Duration,
    rank: usize,
    of: usize,
    in_top: bool,
    in_bottom: bool,
    params: &SamplerParams,
) -> Recommendation {
    let mut notes: Vec<SamplerNote> = Vec::new();
    let p = ctx.posterior;

    if w < 1.0 {
        notes.push(SamplerNote::PipelineMode { blend_weight: w });
    } else {
        notes.push(SamplerNote::DirectMode);
    }
    if p.events == 0 {
        notes.push(SamplerNote::UninformativePrior);
    }

    let in_ignorance_zone = age < params.ignorance_zone();
    if in_ignorance_zone {
        notes.push(SamplerNote::IgnoranceZone {
            elapsed_hours: age.num_milliseconds() as f64 / 3_600_000.0,
            zone_hours: params.ignorance_zone_hours,
        });
    }
    if in_top {
        notes.push(SamplerNote::RankedTop { rank, of });
    }
    if in_bottom {
        notes.push(SamplerNote::RankedBottom { rank, of });
    }

    let killable = if in_bottom && !in_ignorance_zone && p.events > 0 {
        let upper = p.roas.upper_bound(params.ucb_z);
        if p.impressions >= params.min_sample_size {
            notes.push(SamplerNote::KillBar {
                roas_upper: upper,
                threshold: params.roas_threshold,
            });
        }
        kill_rule(age, p.impressions, upper, params)
    } else {
        false
    };

    let direction = if in_ignorance_zone {
        Direction::Hold
    } else if killable {
        Direction::Kill
    } else if in_top {
        Direction::Increase
    } else if in_bottom {
        if p.impressions >= params.min_sample_size {
            Direction::Decrease
        } else {
            notes.push(SamplerNote::InsufficientSample {
                impressions: p.impressions,
                min: params.min_sample_size,
            });
            Direction::Hold
        }
    } else {
        Direction::Hold
    };

    Recommendation {
        arm: ctx.arm.to_string(),
        sampled_score: score,
        direction,
        notes,
    }
}

/// Deterministic (non-crypto) stable hash: FNV-1a with a SplitMix64
/// finalizer. Used to key per-arm rngs off the cycle seed.
#[must_use]
fn stable_hash64(s: &str) -> u64 {
    let mut h: u64 = 14695981039346656037u64;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(1099511628211u64);
    }
    splitmix64(h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn params() -> SamplerParams {
        SamplerParams::default()
    }

    /// Posterior with the given aggregates absorbed in one batch.
    fn posterior(
        impressions: u64,
        clicks: u64,
        spend: f64,
        revenue: f64,
        p: &SamplerParams,
    ) -> ArmPosterior {
        let mut ap = ArmPosterior::uninformative(p);
        ap.observe(impressions, clicks, spend, revenue, 1.0, p);
        ap
    }

    #[test]
    fn blend_weight_is_continuous_at_window_boundary() {
        let window = Duration::hours(168);
        let just_under = blend_weight(Duration::minutes(168 * 60 - 1), window);
        let at = blend_weight(window, window);
        let over = blend_weight(Duration::hours(500), window);
        assert!(at == 1.0 && over == 1.0);
        assert!((at - just_under).abs() < 1e-4);
    }

    #[test]
    fn kill_rule_requires_all_three_conjuncts() {
        let p = params();
        let old = Duration::days(10);
        let young = Duration::hours(12);
        // All three hold.
        assert!(kill_rule(old, 5_000, 0.6, &p));
        // Ignorance zone not elapsed.
        assert!(!kill_rule(young, 5_000, 0.6, &p));
        // Sample too small.
        assert!(!kill_rule(old, 100, 0.6, &p));
        // Upper bound clears the threshold: plausibly profitable.
        assert!(!kill_rule(old, 5_000, 1.4, &p));
    }

    #[test]
    fn no_kill_or_decrease_inside_ignorance_zone() {
        let p = params();
        // Terrible, well-sampled arm launched twelve hours ago.
        let ap = posterior(50_000, 10, 5_000.0, 10.0, &p);
        let arms = [ArmContext {
            arm: "young",
            posterior: &ap,
            launched_at: t0() - Duration::hours(12),
        }];
        let recs = rank_arms(&arms, t0(), &p, 1);
        assert_eq!(recs[0].direction, Direction::Hold);
        assert!(recs[0]
            .notes
            .iter()
            .any(|n| matches!(n, SamplerNote::IgnoranceZone { .. })));
    }

    #[test]
    fn increase_suppressed_inside_ignorance_zone() {
        let p = params();
        // Spectacular early numbers, one day old.
        let ap = posterior(20_000, 2_000, 100.0, 900.0, &p);
        let arms = [ArmContext {
            arm: "lucky",
            posterior: &ap,
            launched_at: t0() - Duration::hours(24),
        }];
        let recs = rank_arms(&arms, t0(), &p, 1);
        assert_eq!(recs[0].direction, Direction::Hold);
    }

    #[test]
    fn aged_unprofitable_arm_is_killed() {
        let p = params();
        // Ten days old, 5k impressions, revenue far below spend.
        let ap = posterior(5_000, 50, 1_000.0, 100.0, &p);
        assert!(ap.roas.upper_bound(p.ucb_z) < p.roas_threshold);
        let arms = [ArmContext {
            arm: "loser",
            posterior: &ap,
            launched_at: t0() - Duration::days(10),
        }];
        let recs = rank_arms(&arms, t0(), &p, 1);
        assert_eq!(recs[0].direction, Direction::Kill);
        assert!(recs[0]
            .notes
            .iter()
            .any(|n| matches!(n, SamplerNote::KillBar { .. })));
    }

    #[test]
    fn zero_observation_arm_is_never_killed() {
        let p = params();
        let ap = ArmPosterior::uninformative(&p);
        let arms = [ArmContext {
            arm: "fresh",
            posterior: &ap,
            launched_at: t0() - Duration::days(30),
        }];
        let recs = rank_arms(&arms, t0(), &p, 7);
        assert_ne!(recs[0].direction, Direction::Kill);
        assert!(recs[0]
            .notes
            .iter()
            .any(|n| matches!(n, SamplerNote::UninformativePrior)));
    }

    #[test]
    fn ranking_is_deterministic_for_a_seed() {
        let p = params();
        let a = posterior(10_000, 120, 500.0, 700.0, &p);
        let b = posterior(10_000, 90, 500.0, 450.0, &p);
        let arms = [
            ArmContext {
                arm: "a",
                posterior: &a,
                launched_at: t0() - Duration::days(9),
            },
            ArmContext {
                arm: "b",
                posterior: &b,
                launched_at: t0() - Duration::days(9),
            },
        ];
        let r1 = rank_arms(&arms, t0(), &p, 42);
        let r2 = rank_arms(&arms, t0(), &p, 42);
        assert_eq!(r1, r2);
    }

    #[test]
    fn ranking_does_not_depend_on_input_order() {
        let p = params();
        let a = posterior(10_000, 120, 500.0, 700.0, &p);
        let b = posterior(10_000, 90, 500.0, 450.0, &p);
        let ctx_a = ArmContext {
            arm: "a",
            posterior: &a,
            launched_at: t0() - Duration::days(9),
        };
        let ctx_b = ArmContext {
            arm: "b",
            posterior: &b,
            launched_at: t0() - Duration::days(9),
        };
        let fwd = rank_arms(&[ctx_a, ctx_b], t0(), &p, 42);
        let rev = rank_arms(&[ctx_b, ctx_a], t0(), &p, 42);
        assert_eq!(fwd, rev);
    }

    #[test]
    fn top_fraction_gets_increase_candidacy() {
        let p = params();
        // Eight arms with steeply graded quality; the best should land an
        // increase, the worst should not land an increase.
        let posteriors: Vec<ArmPosterior> = (0..8)
            .map(|i| {
                posterior(
                    50_000,
                    200 + 400 * i,
                    1_000.0,
                    500.0 + 700.0 * i as f64,
                    &p,
                )
            })
            .collect();
        let names: Vec<String> = (0..8).map(|i| format!("arm{i}")).collect();
        let arms: Vec<ArmContext<'_>> = names
            .iter()
            .zip(posteriors.iter())
            .map(|(name, ap)| ArmContext {
                arm: name,
                posterior: ap,
                launched_at: t0() - Duration::days(14),
            })
            .collect();
        let recs = rank_arms(&arms, t0(), &p, 99);
        assert_eq!(recs.len(), 8);
        // Top-ranked recommendation carries increase candidacy.
        assert_eq!(recs[0].direction, Direction::Increase);
        assert_ne!(recs[7].direction, Direction::Increase);
    }
}
