//! Per-arm belief state under delayed, noisy feedback.
//!
//! Each arm carries two conjugate posteriors:
//!
//! - a Beta distribution over click-through propensity (clicks vs.
//!   impressions), and
//! - a Gamma distribution over revenue-per-spend, treating attributed
//!   revenue as counts of `revenue_unit` with spend as exposure.
//!
//! Updates are incremental and monotone: parameters only accumulate, so the
//! posterior sharpens as observations arrive and never loses information
//! except on an explicit model-version rollover ([`ArmPosterior::reset`]).
//!
//! Attribution lag is handled at the update site: an observation's spend
//! exposure is weighted by its `attribution_confidence`, so spend whose
//! revenue has not yet settled widens the ROAS posterior instead of
//! depressing it.
//!
//! Sampling is true Monte-Carlo (a draw per decision cycle, not the
//! posterior mean) and seedable for reproducible tests, like every
//! stochastic component in this crate.

use rand::rngs::StdRng;
use rand_distr::{Beta, Distribution, Gamma};

use crate::params::SamplerParams;

/// Floor applied to distribution parameters to guard against underflow.
const PARAM_FLOOR: f64 = 1e-9;

/// Beta posterior over click-through propensity.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BetaPosterior {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaPosterior {
    /// Posterior with the given prior pseudo-counts (floored to safe values).
    pub fn new(alpha0: f64, beta0: f64) -> Self {
        Self {
            alpha: floor_param(alpha0),
            beta: floor_param(beta0),
        }
    }

    /// Accumulate a batch of `clicks` out of `impressions`.
    pub fn observe(&mut self, clicks: u64, impressions: u64) {
        let clicks = clicks.min(impressions);
        self.alpha += clicks as f64;
        self.beta += (impressions - clicks) as f64;
    }

    /// Posterior mean.
    pub fn mean(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 { 0.5 } else { self.alpha / denom }
    }

    /// Posterior variance.
    pub fn variance(&self) -> f64 {
        let n = self.alpha + self.beta;
        if n <= 0.0 {
            return 0.25;
        }
        (self.alpha * self.beta) / (n * n * (n + 1.0))
    }

    /// One Monte-Carlo draw. Falls back to the mean if the distribution
    /// cannot be constructed (degenerate parameters).
    pub fn sample(&self, rng: &mut StdRng) -> f64 {
        let (a, b) = (floor_param(self.alpha), floor_param(self.beta));
        match Beta::new(a, b) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.mean(),
        }
    }

    /// Normal-approximation upper confidence bound at z-score `z`.
    pub fn upper_bound(&self, z: f64) -> f64 {
        (self.mean() + z * self.variance().sqrt()).clamp(0.0, 1.0)
    }

    /// Normal-approximation lower confidence bound at z-score `z`.
    pub fn lower_bound(&self, z: f64) -> f64 {
        (self.mean() - z * self.variance().sqrt()).clamp(0.0, 1.0)
    }
}

/// Gamma posterior over revenue-per-spend.
///
/// `shape` accumulates revenue (in revenue units), `rate` accumulates
/// confidence-weighted spend (same units). The posterior mean `shape/rate`
/// is the settled return-on-spend estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoasPosterior {
    pub shape: f64,
    pub rate: f64,
}

impl RoasPosterior {
    /// Posterior with the given prior shape/rate (floored to safe values).
    pub fn new(shape0: f64, rate0: f64) -> Self {
        Self {
            shape: floor_param(shape0),
            rate: floor_param(rate0),
        }
    }

    /// Accumulate attributed revenue against confidence-weighted spend.
    ///
    /// `confidence` in `[0, 1]` discounts the spend exposure: money whose
    /// attribution has not settled contributes little evidence either way.
    pub fn observe(&mut self, revenue: f64, spend: f64, confidence: f64, revenue_unit: f64) {
        let unit = floor_param(revenue_unit);
        let conf = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if revenue.is_finite() && revenue > 0.0 {
            self.shape += revenue / unit;
        }
        if spend.is_finite() && spend > 0.0 {
            self.rate += conf * spend / unit;
        }
    }

    /// Posterior mean return-on-spend.
    pub fn mean(&self) -> f64 {
        self.shape / floor_param(self.rate)
    }

    /// Posterior standard deviation of the rate (`sqrt(shape) / rate`).
    pub fn std_dev(&self) -> f64 {
        self.shape.max(0.0).sqrt() / floor_param(self.rate)
    }

    /// One Monte-Carlo draw. Falls back to the mean on degenerate
    /// parameters.
    pub fn sample(&self, rng: &mut StdRng) -> f64 {
        let shape = floor_param(self.shape);
        let scale = 1.0 / floor_param(self.rate);
        match Gamma::new(shape, scale) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.mean(),
        }
    }

    /// Normal-approximation upper confidence bound at z-score `z`.
    pub fn upper_bound(&self, z: f64) -> f64 {
        (self.mean() + z * self.std_dev()).max(0.0)
    }

    /// Normal-approximation lower confidence bound at z-score `z`.
    pub fn lower_bound(&self, z: f64) -> f64 {
        (self.mean() - z * self.std_dev()).max(0.0)
    }
}

/// Complete belief state for one arm.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArmPosterior {
    pub ctr: BetaPosterior,
    pub roas: RoasPosterior,
    /// Observation batches absorbed (after deduplication).
    pub events: u64,
    /// Real impressions observed (excludes seeded pseudo-mass).
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub revenue: f64,
    /// Equivalent impressions of winner-prior pseudo-mass seeded at launch.
    pub seeded_equivalent: f64,
}

impl ArmPosterior {
    /// Uninformative posterior from the active parameter set.
    pub fn uninformative(params: &SamplerParams) -> Self {
        Self {
            ctr: BetaPosterior::new(params.ctr_alpha0, params.ctr_beta0),
            roas: RoasPosterior::new(params.roas_shape0, params.roas_rate0),
            events: 0,
            impressions: 0,
            clicks: 0,
            spend: 0.0,
            revenue: 0.0,
            seeded_equivalent: 0.0,
        }
    }

    /// Seed informative pseudo-observations from nearest-winner outcomes.
    ///
    /// `prior_ctr` and `prior_roas` are the similarity-weighted means of the
    /// arm's nearest winners; `equivalent_impressions` caps how much weight
    /// the seed carries. Real observations accumulate on top and dominate as
    /// they arrive, so the winners' influence decays without explicit
    /// bookkeeping.
    pub fn seed_winner_prior(
        &mut self,
        prior_ctr: f64,
        prior_roas: f64,
        equivalent_impressions: f64,
        params: &SamplerParams,
    ) {
        if !(equivalent_impressions.is_finite() && equivalent_impressions > 0.0) {
            return;
        }
        let n = equivalent_impressions;
        if prior_ctr.is_finite() && (0.0..=1.0).contains(&prior_ctr) {
            self.ctr.alpha += prior_ctr * n;
            self.ctr.beta += (1.0 - prior_ctr) * n;
        }
        if prior_roas.is_finite() && prior_roas > 0.0 {
            // Pseudo-spend proportional to the seed mass, priced at the
            // reference CTR so the two posteriors carry comparable weight.
            let pseudo_spend = n * params.ctr_reference.max(PARAM_FLOOR);
            self.roas.shape += prior_roas * pseudo_spend / floor_param(params.revenue_unit);
            self.roas.rate += pseudo_spend / floor_param(params.revenue_unit);
        }
        self.seeded_equivalent += n;
    }

    /// Absorb one deduplicated observation batch.
    pub fn observe(
        &mut self,
        impressions: u64,
        clicks: u64,
        spend: f64,
        revenue: f64,
        attribution_confidence: f64,
        params: &SamplerParams,
    ) {
        self.ctr.observe(clicks, impressions);
        self.roas
            .observe(revenue, spend, attribution_confidence, params.revenue_unit);
        self.events += 1;
        self.impressions = self.impressions.saturating_add(impressions);
        self.clicks = self.clicks.saturating_add(clicks.min(impressions));
        if spend.is_finite() && spend > 0.0 {
            self.spend += spend;
        }
        if revenue.is_finite() && revenue > 0.0 {
            self.revenue += revenue;
        }
    }

    /// Reset to the uninformative prior. Only called on model-version
    /// rollover; posteriors are never reset during normal operation.
    pub fn reset(&mut self, params: &SamplerParams) {
        *self = Self::uninformative(params);
    }

    /// CTR-based score draw, normalized so `1.0` means "at the reference
    /// click-through rate".
    pub fn sample_ctr_score(&self, rng: &mut StdRng, params: &SamplerParams) -> f64 {
        self.ctr.sample(rng) / params.ctr_reference.max(PARAM_FLOOR)
    }

    /// ROAS-based score draw, normalized so `1.0` means "at the
    /// profitability threshold".
    pub fn sample_roas_score(&self, rng: &mut StdRng, params: &SamplerParams) -> f64 {
        self.roas.sample(rng) / params.roas_threshold.max(PARAM_FLOOR)
    }

    /// Blended score draw: `(1 - w) * ctr_score + w * roas_score`.
    ///
    /// Linear in `w`, so the score is continuous across the attribution
    /// window boundary (`w -> 1`).
    pub fn sample_blended_score(&self, rng: &mut StdRng, w: f64, params: &SamplerParams) -> f64 {
        let w = if w.is_finite() { w.clamp(0.0, 1.0) } else { 1.0 };
        let ctr_score = self.sample_ctr_score(rng, params);
        let roas_score = self.sample_roas_score(rng, params);
        (1.0 - w) * ctr_score + w * roas_score
    }

    /// Point summary for dashboards and reports.
    pub fn summary(&self, params: &SamplerParams) -> PosteriorSummary {
        PosteriorSummary {
            ctr_mean: self.ctr.mean(),
            ctr_lower: self.ctr.lower_bound(params.ucb_z),
            ctr_upper: self.ctr.upper_bound(params.ucb_z),
            roas_mean: self.roas.mean(),
            roas_lower: self.roas.lower_bound(params.ucb_z),
            roas_upper: self.roas.upper_bound(params.ucb_z),
            events: self.events,
            impressions: self.impressions,
            spend: self.spend,
            revenue: self.revenue,
            seeded_equivalent: self.seeded_equivalent,
        }
    }
}

/// Posterior point summary exposed through the read interface.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PosteriorSummary {
    pub ctr_mean: f64,
    pub ctr_lower: f64,
    pub ctr_upper: f64,
    pub roas_mean: f64,
    pub roas_lower: f64,
    pub roas_upper: f64,
    pub events: u64,
    pub impressions: u64,
    pub spend: f64,
    pub revenue: f64,
    pub seeded_equivalent: f64,
}

fn floor_param(x: f64) -> f64 {
    if x.is_finite() && x > PARAM_FLOOR {
        x
    } else {
        PARAM_FLOOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn beta_update_moves_mean_toward_rate() {
        let mut p = BetaPosterior::new(1.0, 1.0);
        p.observe(10, 1_000);
        assert!((p.mean() - 0.01).abs() < 0.005);
    }

    #[test]
    fn beta_clamps_clicks_to_impressions() {
        let mut p = BetaPosterior::new(1.0, 1.0);
        p.observe(50, 10);
        // 10 successes, 0 failures on top of the prior.
        assert!((p.alpha - 11.0).abs() < 1e-12);
        assert!((p.beta - 1.0).abs() < 1e-12);
    }

    #[test]
    fn roas_mean_converges_to_revenue_over_spend() {
        let mut p = RoasPosterior::new(1.0, 1.0);
        p.observe(3_000.0, 1_000.0, 1.0, 1.0);
        // Prior mass of (1, 1) is negligible against 1000 spend units.
        assert!((p.mean() - 3.0).abs() < 0.05);
    }

    #[test]
    fn low_confidence_spend_keeps_posterior_wide() {
        let mut settled = RoasPosterior::new(1.0, 1.0);
        let mut pending = RoasPosterior::new(1.0, 1.0);
        settled.observe(500.0, 1_000.0, 1.0, 1.0);
        pending.observe(500.0, 1_000.0, 0.1, 1.0);
        assert!(
            pending.std_dev() > settled.std_dev(),
            "unsettled attribution must leave more uncertainty"
        );
        assert!(
            pending.mean() > settled.mean(),
            "unsettled spend must not depress the ROAS estimate"
        );
    }

    #[test]
    fn updates_are_monotone() {
        let params = SamplerParams::default();
        let mut p = ArmPosterior::uninformative(&params);
        let (a0, b0) = (p.ctr.alpha, p.ctr.beta);
        let (s0, r0) = (p.roas.shape, p.roas.rate);
        p.observe(100, 3, 10.0, 5.0, 0.8, &params);
        assert!(p.ctr.alpha >= a0 && p.ctr.beta >= b0);
        assert!(p.roas.shape >= s0 && p.roas.rate >= r0);
    }

    #[test]
    fn zero_observation_arm_samples_finite_scores() {
        let params = SamplerParams::default();
        let p = ArmPosterior::uninformative(&params);
        let mut r = rng();
        for w in [0.0, 0.5, 1.0] {
            let s = p.sample_blended_score(&mut r, w, &params);
            assert!(s.is_finite(), "w={w}: score must be finite, got {s}");
        }
    }

    #[test]
    fn winner_seed_shifts_fresh_posterior() {
        let params = SamplerParams::default();
        let mut seeded = ArmPosterior::uninformative(&params);
        let plain = ArmPosterior::uninformative(&params);
        seeded.seed_winner_prior(0.03, 2.5, 200.0, &params);
        assert!(seeded.ctr.mean() > plain.ctr.mean());
        assert!(seeded.roas.mean() > plain.roas.mean());
        assert!((seeded.seeded_equivalent - 200.0).abs() < 1e-12);
    }

    #[test]
    fn winner_seed_decays_under_real_data() {
        let params = SamplerParams::default();
        let mut p = ArmPosterior::uninformative(&params);
        p.seed_winner_prior(0.05, 3.0, 100.0, &params);
        let seeded_mean = p.ctr.mean();
        // 100k real impressions at 0.5% CTR swamp the 100-impression seed.
        for _ in 0..100 {
            p.observe(1_000, 5, 50.0, 25.0, 1.0, &params);
        }
        assert!((p.ctr.mean() - 0.005).abs() < 0.001);
        assert!(p.ctr.mean() < seeded_mean);
    }

    #[test]
    fn sampling_is_deterministic_given_seed() {
        let params = SamplerParams::default();
        let mut p = ArmPosterior::uninformative(&params);
        p.observe(10_000, 80, 500.0, 700.0, 1.0, &params);
        let mut r1 = StdRng::seed_from_u64(42);
        let mut r2 = StdRng::seed_from_u64(42);
        assert_eq!(
            p.sample_blended_score(&mut r1, 0.4, &params).to_bits(),
            p.sample_blended_score(&mut r2, 0.4, &params).to_bits()
        );
    }

    #[test]
    fn degenerate_parameters_fall_back_to_mean() {
        let p = BetaPosterior {
            alpha: f64::NAN,
            beta: 0.0,
        };
        let mut r = rng();
        assert!(p.sample(&mut r).is_finite());
    }
}
