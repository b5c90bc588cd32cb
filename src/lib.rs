//! `adloop`: the autonomous decision-and-execution core of an ad-campaign
//! optimizer.
//!
//! You have a set of **arms** (ad creatives / variants) spending real money
//! under delayed, noisy feedback: clicks arrive immediately, attributed
//! revenue settles over days. `adloop` continuously decides how to
//! reallocate budget, pause, kill, or flag creatives for refresh — and
//! applies those decisions against the external ad platform without ever
//! double-applying a mutation or racing against itself.
//!
//! The loop, leaf to root:
//!
//! - Observation events accumulate per arm ([`Engine::ingest`], idempotent
//!   by event id, out-of-order tolerant).
//! - The **sampler** keeps two conjugate posteriors per arm (click-through
//!   propensity and return-on-spend), blends them across the attribution
//!   window, and ranks arms by Monte-Carlo draws ([`rank_arms`],
//!   [`kill_rule`]).
//! - The **winner pattern index** seeds informative priors for new arms
//!   from the most similar historical winners ([`WinnerIndex`]).
//! - The **fatigue detector** independently flags creative decay — CTR
//!   decline, saturation, cost spikes, flatline — regardless of
//!   profitability ([`fatigue::assess`]).
//! - The **aggregator** merges both into exactly one action per arm under a
//!   total precedence ordering ([`aggregate`]).
//! - The **execution queue** persists each action, guarantees at most one
//!   in-flight change per arm via atomic claims, jitters before each
//!   platform call, and retries transient failures with bounded backoff
//!   ([`ExecutionQueue`], [`WorkerPool`]).
//! - The **model registry** versions every tunable and swaps the active
//!   snapshot atomically ([`ModelRegistry`]).
//!
//! **Goals:**
//! - **Deterministic by default**: seeded sampling, stable tie-breaks —
//!   same state + same seed → same decisions.
//! - **Safe under concurrency**: the decision cycle and the worker pool run
//!   independently; per-arm mutation order is total, enforced by the claim
//!   mechanism alone.
//! - **Degrade, don't abort**: statistical trouble on one arm never stops
//!   the cycle for the others.
//!
//! **Non-goals:** creative generation, rendering, dashboards, and storage
//! engines — the queue exposes the row shape a durable backend would
//! persist, but persistence itself lives outside this crate.

use chrono::{DateTime, Utc};

mod errors;
pub use errors::*;

mod params;
pub use params::*;

mod registry;
pub use registry::*;

mod posterior;
pub use posterior::*;

mod sampler;
pub use sampler::*;

mod winners;
pub use winners::*;

pub mod fatigue;
pub use fatigue::{FatigueAssessment, FatigueRule, FatigueWindow, PeriodStats, RuleTrigger};

mod aggregator;
pub use aggregator::*;

mod queue;
pub use queue::*;

mod worker;
pub use worker::*;

mod engine;
pub use engine::*;

/// Lifecycle status of an arm on the ad platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArmStatus {
    Active,
    Paused,
    Killed,
}

/// A biddable unit under optimization: one ad creative / variant.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArmMeta {
    pub arm: String,
    /// Owning campaign.
    pub campaign: String,
    pub launched_at: DateTime<Utc>,
    pub status: ArmStatus,
    /// Feature embedding from the external creative-analysis pipeline,
    /// when available. Used only by the winner pattern index.
    pub embedding: Option<Vec<f64>>,
}

/// An immutable performance event batch for one arm.
///
/// Delivered by the external telemetry collector at any rate; the engine
/// tolerates duplicates (by `event_id`) and out-of-order arrival.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Observation {
    /// Collector-assigned id; the idempotency key for ingestion.
    pub event_id: String,
    pub arm: String,
    pub timestamp: DateTime<Utc>,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    /// Revenue attributed so far.
    pub attributed_revenue: f64,
    /// How much of the eventual revenue has settled, in `[0, 1]`.
    pub attribution_confidence: f64,
    /// Distinct users reached, when the collector reports it (0 = unknown).
    pub unique_reach: u64,
}
