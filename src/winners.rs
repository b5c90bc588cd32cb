//! Winner pattern index: nearest-neighbor store of graduated arms.
//!
//! When an arm's ROAS posterior crosses the profitability threshold with
//! confidence mirroring the kill rule's bar (lower bound above threshold
//! instead of upper bound below it), the arm *graduates*: its feature
//! embedding and outcome are appended here. Lookups return the k most
//! similar historical winners by cosine similarity, and new arms borrow an
//! informative prior from their nearest winners instead of starting from an
//! uninformative belief.
//!
//! The index is append-only; eviction of stale or low-confidence entries is
//! optional and never breaks correctness, since entries only ever influence
//! priors for new arms.

use chrono::{DateTime, Utc};

use crate::errors::CoreError;
use crate::params::WinnerParams;
use crate::posterior::ArmPosterior;

/// Outcome metadata recorded when an arm graduates.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WinnerOutcome {
    /// Posterior mean click-through rate at graduation.
    pub mean_ctr: f64,
    /// Posterior mean return-on-spend at graduation.
    pub mean_roas: f64,
    /// How settled the estimate was: the fraction of the profitability
    /// margin retained at the lower confidence bound, in `[0, 1]`.
    pub confidence: f64,
}

/// A graduated arm's feature embedding plus its outcome.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WinnerVector {
    pub arm: String,
    pub embedding: Vec<f64>,
    pub outcome: WinnerOutcome,
    pub graduated_at: DateTime<Utc>,
}

/// One lookup hit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WinnerMatch {
    pub arm: String,
    /// Cosine similarity to the query embedding, in `[-1, 1]`.
    pub similarity: f64,
    pub outcome: WinnerOutcome,
}

/// Informative prior derived from nearest winners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeededPrior {
    pub ctr: f64,
    pub roas: f64,
    /// Total positive similarity mass backing the seed.
    pub support: f64,
}

/// Graduation condition: the mirror of the kill rule.
///
/// Returns true only when the sample is large enough **and** the ROAS lower
/// confidence bound clears the profitability threshold — same bar as the
/// kill rule, opposite direction.
#[must_use]
pub fn graduation_rule(
    sample_size: u64,
    min_sample: u64,
    roas_lower_bound: f64,
    roas_threshold: f64,
) -> bool {
    sample_size >= min_sample && roas_lower_bound > roas_threshold
}

/// Append-only nearest-winner store.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WinnerIndex {
    entries: Vec<WinnerVector>,
    /// Embedding dimension, fixed by the first insert.
    dim: Option<usize>,
}

impl WinnerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored winners.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a graduated arm.
    ///
    /// The embedding must be finite, non-zero-norm, and dimensionally
    /// consistent with prior inserts. The graduation condition itself is
    /// checked by [`WinnerIndex::try_graduate`]; direct callers are expected
    /// to have applied it.
    pub fn insert(
        &mut self,
        arm: impl Into<String>,
        embedding: Vec<f64>,
        outcome: WinnerOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let arm = arm.into();
        validate_embedding(&arm, &embedding, self.dim)?;
        self.dim.get_or_insert(embedding.len());
        self.entries.push(WinnerVector {
            arm,
            embedding,
            outcome,
            graduated_at: now,
        });
        Ok(())
    }

    /// Graduate `arm` if its posterior clears the bar; returns whether an
    /// entry was inserted.
    pub fn try_graduate(
        &mut self,
        arm: &str,
        posterior: &ArmPosterior,
        embedding: &[f64],
        roas_threshold: f64,
        params: &WinnerParams,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        if self.entries.iter().any(|e| e.arm == arm) {
            return Ok(false);
        }
        let lower = posterior.roas.lower_bound(params.graduation_z);
        if !graduation_rule(
            posterior.impressions,
            params.graduation_min_sample,
            lower,
            roas_threshold,
        ) {
            return Ok(false);
        }
        let mean = posterior.roas.mean();
        // Fraction of the profitability margin retained at the lower bound.
        let confidence = if mean > roas_threshold {
            ((lower - roas_threshold) / (mean - roas_threshold)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.insert(
            arm,
            embedding.to_vec(),
            WinnerOutcome {
                mean_ctr: posterior.ctr.mean(),
                mean_roas: mean,
                confidence,
            },
            now,
        )?;
        tracing::debug!(arm, mean_roas = mean, confidence, "arm graduated into winner index");
        Ok(true)
    }

    /// Return the `k` most similar winners, ordered by strictly
    /// non-increasing cosine similarity (ties broken by arm id for
    /// determinism).
    ///
    /// Entries whose stored embedding cannot be compared to the query
    /// (dimension drift after eviction/re-insert) are skipped.
    pub fn nearest(&self, embedding: &[f64], k: usize) -> Vec<WinnerMatch> {
        if k == 0 || embedding.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<WinnerMatch> = self
            .entries
            .iter()
            .filter_map(|e| {
                let similarity = cosine_similarity(embedding, &e.embedding)?;
                Some(WinnerMatch {
                    arm: e.arm.clone(),
                    similarity,
                    outcome: e.outcome,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.arm.cmp(&b.arm))
        });
        hits.truncate(k);
        hits
    }

    /// Similarity-weighted prior for a brand-new arm, or `None` when no
    /// winner has positive similarity to the query.
    ///
    /// Only positive-similarity neighbors contribute; an arm dissimilar to
    /// every recorded winner starts uninformative rather than anti-seeded.
    pub fn seed_prior(&self, embedding: &[f64], params: &WinnerParams) -> Option<SeededPrior> {
        let hits = self.nearest(embedding, params.k_neighbors);
        let mut weight = 0.0;
        let mut ctr = 0.0;
        let mut roas = 0.0;
        for h in hits.iter().filter(|h| h.similarity > 0.0) {
            let w = h.similarity * h.outcome.confidence.clamp(0.0, 1.0);
            if w <= 0.0 {
                continue;
            }
            weight += w;
            ctr += w * h.outcome.mean_ctr;
            roas += w * h.outcome.mean_roas;
        }
        if weight <= 0.0 {
            return None;
        }
        Some(SeededPrior {
            ctr: ctr / weight,
            roas: roas / weight,
            support: weight,
        })
    }

    /// Prune entries below the confidence floor or older than the retention
    /// horizon. Returns how many were removed.
    pub fn evict(&mut self, now: DateTime<Utc>, params: &WinnerParams) -> usize {
        let horizon = now - params.retention_horizon();
        let before = self.entries.len();
        self.entries.retain(|e| {
            e.outcome.confidence >= params.confidence_floor && e.graduated_at >= horizon
        });
        before - self.entries.len()
    }
}

/// Cosine similarity, or `None` when either vector has zero norm, a
/// non-finite component, or the lengths differ.
fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        if !(x.is_finite() && y.is_finite()) {
            return None;
        }
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        return None;
    }
    Some((dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0))
}

fn validate_embedding(arm: &str, embedding: &[f64], dim: Option<usize>) -> Result<(), CoreError> {
    if embedding.is_empty() {
        return Err(CoreError::InvalidEmbedding {
            arm: arm.to_string(),
            details: "empty embedding".into(),
        });
    }
    if let Some(d) = dim {
        if embedding.len() != d {
            return Err(CoreError::InvalidEmbedding {
                arm: arm.to_string(),
                details: format!("dimension {} != index dimension {d}", embedding.len()),
            });
        }
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(CoreError::InvalidEmbedding {
            arm: arm.to_string(),
            details: "non-finite component".into(),
        });
    }
    if embedding.iter().all(|&x| x == 0.0) {
        return Err(CoreError::InvalidEmbedding {
            arm: arm.to_string(),
            details: "zero norm".into(),
        });
    }
    Ok(())
}
