//! The decision engine: periodic cycles over all arms, and the operational
//! surface around them.
//!
//! A cycle loads one consistent parameter snapshot from the registry, rolls
//! fatigue periods forward, checks graduations into the winner index, ranks
//! every active arm through the sampler, merges each ranking with the arm's
//! fatigue assessment, and enqueues the resulting mutations. The execution
//! queue is consulted through `enqueue` itself — an arm with an in-flight
//! change simply has its new proposal rejected, preserving the
//! single-in-flight invariant without the cycle blocking on execution.
//!
//! Statistical problems never abort a cycle: a malformed observation is
//! discarded for its arm, an arm with too little data holds, and every
//! other arm proceeds untouched.
//!
//! The engine is the single writer of posterior and fatigue state; workers
//! share only the queue with it. [`CycleDriver`] runs cycles on a fixed
//! interval on a dedicated thread and accepts manual triggers, so the
//! decision half and the execution half run concurrently without either
//! waiting on the other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use crate::aggregator::{aggregate, Action};
use crate::errors::CoreError;
use crate::fatigue::{assess, FatigueAssessment, FatigueWindow, PeriodStats};
use crate::params::{FatigueParams, ModelParams};
use crate::posterior::{ArmPosterior, PosteriorSummary};
use crate::queue::{ChangeStatus, EnqueueOutcome, ExecutionQueue};
use crate::registry::ModelRegistry;
use crate::sampler::{rank_arms, ArmContext, Recommendation};
use crate::winners::{WinnerIndex, WinnerMatch};
use crate::{ArmMeta, ArmStatus, Observation};

/// What happened to one ingested observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Absorbed into the arm's posterior and fatigue state.
    Absorbed,
    /// An event with this id was already absorbed; nothing changed.
    Duplicate,
    /// The event failed validation and was dropped for this arm only.
    Discarded,
}

/// One arm's merged outcome for a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmDecision {
    pub arm: String,
    pub action: Action,
    pub recommendation: Recommendation,
    pub fatigue: FatigueAssessment,
    /// How the queue received the action (`None` for non-mutations).
    pub enqueue: Option<EnqueueOutcome>,
}

/// Summary of one decision cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub epoch: u64,
    /// Model version the whole cycle ran under.
    pub version_id: u64,
    pub decisions: Vec<ArmDecision>,
    /// Arms that graduated into the winner index this cycle.
    pub graduated: Vec<String>,
    /// Winner entries pruned this cycle.
    pub evicted_winners: usize,
}

/// Read-interface row for dashboards: everything known about one arm.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmReport {
    pub arm: String,
    pub campaign: String,
    pub status: ArmStatus,
    pub launched_at: DateTime<Utc>,
    pub posterior: PosteriorSummary,
    pub fatigue: FatigueAssessment,
    pub nearest_winners: Vec<WinnerMatch>,
}

struct ArmState {
    meta: ArmMeta,
    posterior: ArmPosterior,
    fatigue: FatigueWindow,
    /// Period currently accumulating, keyed by index since launch.
    open_period: Option<(i64, PeriodStats)>,
}

impl ArmState {
    fn period_index(&self, ts: DateTime<Utc>, params: &FatigueParams) -> i64 {
        let period_ms = params.period().num_milliseconds().max(1);
        let elapsed_ms = (ts - self.meta.launched_at).num_milliseconds();
        elapsed_ms.div_euclid(period_ms)
    }

    /// Fold one observation's delivery stats into the period buckets.
    ///
    /// Late (out-of-order) events land in the currently open period — the
    /// trend rules tolerate that imprecision, and closed periods stay
    /// immutable.
    fn record_period(&mut self, obs: &Observation, params: &FatigueParams) {
        let idx = self.period_index(obs.timestamp, params);
        let stats = PeriodStats {
            impressions: obs.impressions,
            clicks: obs.clicks,
            spend: obs.spend,
            unique_reach: obs.unique_reach,
        };
        match &mut self.open_period {
            None => self.open_period = Some((idx, stats)),
            Some((current, agg)) if idx > *current => {
                let closed = *agg;
                self.fatigue.push_period(closed, params.flatline_epsilon);
                self.open_period = Some((idx, stats));
            }
            Some((_, agg)) => agg.absorb(stats),
        }
    }

    /// Close the open period if `now` has moved past it.
    fn roll_periods(&mut self, now: DateTime<Utc>, params: &FatigueParams) {
        if let Some((current, agg)) = self.open_period {
            if self.period_index(now, params) > current {
                self.fatigue.push_period(agg, params.flatline_epsilon);
                self.open_period = None;
            }
        }
    }
}

/// The autonomous decision core.
pub struct Engine {
    registry: Arc<ModelRegistry>,
    queue: Arc<ExecutionQueue>,
    winners: WinnerIndex,
    arms: BTreeMap<String, ArmState>,
    /// Raw observations, retained so posteriors can be re-derived on a
    /// model-version rollover.
    observations: BTreeMap<String, Vec<Observation>>,
    seen_events: std::collections::BTreeSet<String>,
    epoch: u64,
    version_seen: u64,
    seed: u64,
}

impl Engine {
    pub fn new(registry: Arc<ModelRegistry>, queue: Arc<ExecutionQueue>, seed: u64) -> Self {
        let version_seen = registry.active().version_id;
        Self {
            registry,
            queue,
            winners: WinnerIndex::new(),
            arms: BTreeMap::new(),
            observations: BTreeMap::new(),
            seen_events: std::collections::BTreeSet::new(),
            epoch: 0,
            version_seen,
            seed,
        }
    }

    /// Register a new arm under optimization.
    pub fn register_arm(&mut self, meta: ArmMeta) {
        let params = self.registry.active().params;
        let posterior = ArmPosterior::uninformative(&params.sampler);
        let fatigue = FatigueWindow::new(params.fatigue.window_periods);
        let arm = meta.arm.clone();
        self.arms.insert(
            arm,
            ArmState {
                meta,
                posterior,
                fatigue,
                open_period: None,
            },
        );
    }

    /// Attach a feature embedding (from the external creative-analysis
    /// pipeline) and, for a still-fresh arm, seed its posterior from the
    /// nearest historical winners.
    pub fn set_embedding(&mut self, arm: &str, embedding: Vec<f64>) -> Result<(), CoreError> {
        let params = self.registry.active().params;
        let state = self.arms.get_mut(arm).ok_or_else(|| CoreError::UnknownArm {
            arm: arm.to_string(),
        })?;
        if embedding.is_empty() || embedding.iter().any(|x| !x.is_finite()) {
            return Err(CoreError::InvalidEmbedding {
                arm: arm.to_string(),
                details: "empty or non-finite embedding".into(),
            });
        }
        if state.posterior.events == 0 && state.posterior.seeded_equivalent == 0.0 {
            if let Some(seed) = self.winners.seed_prior(&embedding, &params.winners) {
                state.posterior.seed_winner_prior(
                    seed.ctr,
                    seed.roas,
                    params.winners.prior_equivalent_impressions,
                    &params.sampler,
                );
                tracing::debug!(
                    arm,
                    prior_ctr = seed.ctr,
                    prior_roas = seed.roas,
                    "seeded posterior from nearest winners"
                );
            }
        }
        state.meta.embedding = Some(embedding);
        Ok(())
    }

    /// Ingest one observation event, idempotently.
    ///
    /// Duplicate event ids and malformed payloads are absorbed silently
    /// (returning the outcome) — they never abort processing for other
    /// arms.
    pub fn ingest(&mut self, obs: Observation) -> Result<IngestOutcome, CoreError> {
        let params = self.registry.active().params;
        let state = self
            .arms
            .get_mut(&obs.arm)
            .ok_or_else(|| CoreError::UnknownArm {
                arm: obs.arm.clone(),
            })?;
        if self.seen_events.contains(&obs.event_id) {
            return Ok(IngestOutcome::Duplicate);
        }
        if !observation_is_sane(&obs) {
            tracing::debug!(arm = %obs.arm, event = %obs.event_id, "discarding malformed observation");
            return Ok(IngestOutcome::Discarded);
        }
        self.seen_events.insert(obs.event_id.clone());
        state.posterior.observe(
            obs.impressions,
            obs.clicks,
            obs.spend,
            obs.attributed_revenue,
            obs.attribution_confidence,
            &params.sampler,
        );
        state.record_period(&obs, &params.fatigue);
        self.observations
            .entry(obs.arm.clone())
            .or_default()
            .push(obs);
        Ok(IngestOutcome::Absorbed)
    }

    /// Run one decision cycle over every active arm.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let version = self.registry.active();
        let params = version.params;
        if version.version_id != self.version_seen {
            self.rebuild_posteriors(&params);
            self.version_seen = version.version_id;
        }
        self.reconcile_applied();
        self.epoch += 1;
        let epoch = self.epoch;

        for state in self.arms.values_mut() {
            state.roll_periods(now, &params.fatigue);
        }

        let graduated = self.graduate_winners(now, &params);
        let evicted_winners = self.winners.evict(now, &params.winners);

        let active: Vec<&ArmState> = self
            .arms
            .values()
            .filter(|s| s.meta.status == ArmStatus::Active)
            .collect();
        let contexts: Vec<ArmContext<'_>> = active
            .iter()
            .map(|s| ArmContext {
                arm: &s.meta.arm,
                posterior: &s.posterior,
                launched_at: s.meta.launched_at,
            })
            .collect();
        let recommendations = rank_arms(&contexts, now, &params.sampler, self.seed.wrapping_add(epoch));

        let decisions: Vec<ArmDecision> = recommendations
            .into_iter()
            .map(|rec| {
                let state = &self.arms[&rec.arm];
                let fatigue = assess(&state.fatigue, &params.fatigue);
                let action = aggregate(&rec, &fatigue, &params.fatigue);
                let enqueue = if action.is_mutation() {
                    Some(self.queue.enqueue(&rec.arm, action, epoch, now))
                } else {
                    None
                };
                ArmDecision {
                    arm: rec.arm.clone(),
                    action,
                    recommendation: rec,
                    fatigue,
                    enqueue,
                }
            })
            .collect();

        tracing::debug!(
            epoch,
            version = version.version_id,
            arms = decisions.len(),
            mutations = decisions.iter().filter(|d| d.action.is_mutation()).count(),
            "decision cycle complete"
        );
        CycleReport {
            epoch,
            version_id: version.version_id,
            decisions,
            graduated,
            evicted_winners,
        }
    }

    /// Force an immediate decision for one arm (operational trigger).
    ///
    /// Ranks the arm alone, so fraction-based candidacy applies to a field
    /// of one.
    pub fn run_cycle_for(&mut self, arm: &str, now: DateTime<Utc>) -> Result<ArmDecision, CoreError> {
        if !self.arms.contains_key(arm) {
            return Err(CoreError::UnknownArm {
                arm: arm.to_string(),
            });
        }
        let version = self.registry.active();
        let params = version.params;
        self.epoch += 1;
        let epoch = self.epoch;

        let state = self.arms.get_mut(arm).expect("checked above");
        state.roll_periods(now, &params.fatigue);
        let state = &self.arms[arm];
        let ctx = ArmContext {
            arm: &state.meta.arm,
            posterior: &state.posterior,
            launched_at: state.meta.launched_at,
        };
        let rec = rank_arms(&[ctx], now, &params.sampler, self.seed.wrapping_add(epoch))
            .pop()
            .expect("one context yields one recommendation");
        let fatigue = assess(&state.fatigue, &params.fatigue);
        let action = aggregate(&rec, &fatigue, &params.fatigue);
        let enqueue = if action.is_mutation() {
            Some(self.queue.enqueue(arm, action, epoch, now))
        } else {
            None
        };
        Ok(ArmDecision {
            arm: arm.to_string(),
            action,
            recommendation: rec,
            fatigue,
            enqueue,
        })
    }

    /// Compute decisions under a non-active version without enqueueing
    /// anything — shadow-mode evaluation for tuning candidates.
    pub fn shadow_cycle(
        &mut self,
        version_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ArmDecision>, CoreError> {
        let version = self.registry.get(version_id)?;
        let params = version.params;
        for state in self.arms.values_mut() {
            state.roll_periods(now, &params.fatigue);
        }
        let active: Vec<&ArmState> = self
            .arms
            .values()
            .filter(|s| s.meta.status == ArmStatus::Active)
            .collect();
        let contexts: Vec<ArmContext<'_>> = active
            .iter()
            .map(|s| ArmContext {
                arm: &s.meta.arm,
                posterior: &s.posterior,
                launched_at: s.meta.launched_at,
            })
            .collect();
        let recommendations =
            rank_arms(&contexts, now, &params.sampler, self.seed.wrapping_add(self.epoch + 1));
        Ok(recommendations
            .into_iter()
            .map(|rec| {
                let state = &self.arms[&rec.arm];
                let fatigue = assess(&state.fatigue, &params.fatigue);
                let action = aggregate(&rec, &fatigue, &params.fatigue);
                ArmDecision {
                    arm: rec.arm.clone(),
                    action,
                    recommendation: rec,
                    fatigue,
                    enqueue: None,
                }
            })
            .collect())
    }

    /// Dashboard read interface: posterior summary, fatigue flags, and
    /// nearest winners for one arm.
    pub fn report(&self, arm: &str) -> Option<ArmReport> {
        let params = self.registry.active().params;
        let state = self.arms.get(arm)?;
        let nearest_winners = state
            .meta
            .embedding
            .as_deref()
            .map(|e| self.winners.nearest(e, params.winners.k_neighbors))
            .unwrap_or_default();
        Some(ArmReport {
            arm: state.meta.arm.clone(),
            campaign: state.meta.campaign.clone(),
            status: state.meta.status,
            launched_at: state.meta.launched_at,
            posterior: state.posterior.summary(&params.sampler),
            fatigue: assess(&state.fatigue, &params.fatigue),
            nearest_winners,
        })
    }

    /// Current status of an arm.
    pub fn arm_status(&self, arm: &str) -> Option<ArmStatus> {
        self.arms.get(arm).map(|s| s.meta.status)
    }

    /// The winner index, read-only.
    pub fn winners(&self) -> &WinnerIndex {
        &self.winners
    }

    /// Shared handle to the execution queue, for spawning worker pools and
    /// for audit reads.
    pub fn queue_handle(&self) -> Arc<ExecutionQueue> {
        Arc::clone(&self.queue)
    }

    fn graduate_winners(&mut self, now: DateTime<Utc>, params: &ModelParams) -> Vec<String> {
        let mut graduated = Vec::new();
        for state in self.arms.values() {
            if state.meta.status != ArmStatus::Active {
                continue;
            }
            let Some(embedding) = state.meta.embedding.as_deref() else {
                continue;
            };
            match self.winners.try_graduate(
                &state.meta.arm,
                &state.posterior,
                embedding,
                params.sampler.roas_threshold,
                &params.winners,
                now,
            ) {
                Ok(true) => graduated.push(state.meta.arm.clone()),
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(arm = %state.meta.arm, %err, "graduation skipped");
                }
            }
        }
        graduated
    }

    /// Mirror applied mutations into arm statuses so later cycles skip
    /// killed and paused arms. Idempotent over repeated rows.
    fn reconcile_applied(&mut self) {
        for row in self.queue.snapshot() {
            if row.status != ChangeStatus::Applied {
                continue;
            }
            if let Some(state) = self.arms.get_mut(&row.arm) {
                match row.action {
                    Action::Kill => state.meta.status = ArmStatus::Killed,
                    Action::Pause => state.meta.status = ArmStatus::Paused,
                    _ => {}
                }
            }
        }
    }

    /// Re-derive every posterior from retained observations under new prior
    /// parameters — the one sanctioned posterior reset.
    fn rebuild_posteriors(&mut self, params: &ModelParams) {
        tracing::debug!(version = self.version_seen, "model version changed, rebuilding posteriors");
        for (arm, state) in &mut self.arms {
            state.posterior.reset(&params.sampler);
            if let Some(events) = self.observations.get(arm) {
                for obs in events {
                    state.posterior.observe(
                        obs.impressions,
                        obs.clicks,
                        obs.spend,
                        obs.attributed_revenue,
                        obs.attribution_confidence,
                        &params.sampler,
                    );
                }
            }
        }
    }
}

fn observation_is_sane(obs: &Observation) -> bool {
    obs.clicks <= obs.impressions
        && obs.spend.is_finite()
        && obs.spend >= 0.0
        && obs.attributed_revenue.is_finite()
        && obs.attributed_revenue >= 0.0
        && obs.attribution_confidence.is_finite()
        && (0.0..=1.0).contains(&obs.attribution_confidence)
}

/// Runs decision cycles on a fixed interval on its own thread.
///
/// The driver shares the engine behind a mutex with any operational
/// surface; workers never touch the engine, so the only contention is
/// trigger-vs-tick.
pub struct CycleDriver {
    handle: Option<JoinHandle<()>>,
    control: Sender<DriverMessage>,
}

enum DriverMessage {
    TriggerAll,
    Shutdown,
}

impl CycleDriver {
    /// Spawn the cycle thread.
    pub fn spawn(engine: Arc<Mutex<Engine>>, interval: StdDuration) -> Self {
        let (tx, rx) = bounded::<DriverMessage>(16);
        let handle = std::thread::Builder::new()
            .name("adloop-cycle".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(DriverMessage::Shutdown) => return,
                    Ok(DriverMessage::TriggerAll) | Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        engine.lock().run_cycle(Utc::now());
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("spawn cycle thread");
        Self {
            handle: Some(handle),
            control: tx,
        }
    }

    /// Force an immediate cycle over all arms.
    pub fn trigger(&self) {
        let _ = self.control.send(DriverMessage::TriggerAll);
    }

    /// Stop the driver and join its thread.
    pub fn shutdown(mut self) {
        let _ = self.control.send(DriverMessage::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CycleDriver {
    fn drop(&mut self) {
        let _ = self.control.send(DriverMessage::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
