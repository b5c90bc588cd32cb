//! Safe execution queue: durable rows, exclusive claims, bounded retry.
//!
//! Every aggregator action becomes a [`PendingChange`] row in an arena
//! guarded by one mutex — the single place in the system where true mutual
//! exclusion is required. Workers atomically claim one row at a time;
//! claimed rows are skipped by other workers, which is what guarantees
//! **at most one change per arm in flight** at any instant.
//!
//! Lifecycle:
//!
//! ```text
//! Proposed → Claimed → Applying → Applied
//!                          │
//!                          └→ Retrying → (claimed again) …
//!                          └→ Failed          (terminal)
//! Proposed → Cancelled                        (superseded, never ran)
//! ```
//!
//! Terminal rows (`Applied`, `Failed`, `Cancelled`) are never re-claimed.
//!
//! Idempotency: each row carries a dedupe key (`arm:epoch`). When a newer
//! decision for an arm arrives while an older one is still unclaimed, the
//! older row is cancelled rather than both being applied — newest decision
//! wins. Once a row is claimed it runs to completion and is never cancelled
//! mid-flight; recovery for a crashed worker is the claim-TTL sweep, which
//! returns the row to `Proposed`.
//!
//! The arena-of-rows + index-based claim shape generalizes to any
//! exactly-once-in-flight queue regardless of the storage engine behind it;
//! this implementation keeps the arena in memory and exposes the row shape
//! a durable backend would persist.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::aggregator::Action;
use crate::errors::{CoreError, PlatformError};
use crate::params::QueueParams;

/// Contract with the external ad platform.
///
/// `apply` must be idempotent for a given `(arm, action, epoch)` triple: the
/// queue relies on this to make a simulated double-application a no-op.
pub trait AdPlatform: Send + Sync {
    fn apply(&self, arm: &str, action: Action, epoch: u64)
        -> Result<AppliedState, PlatformError>;
}

/// Resulting platform state after a successful application, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppliedState {
    pub resulting_state: String,
}

/// Row lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChangeStatus {
    /// Enqueued, claimable.
    Proposed,
    /// Exclusively held by one worker, not yet applying.
    Claimed,
    /// The worker is inside the platform call.
    Applying,
    /// A transient failure occurred; claimable again after the backoff
    /// deadline.
    Retrying,
    /// Successfully applied. Terminal.
    Applied,
    /// Permanently failed (attempts exhausted or permanent rejection).
    /// Terminal, surfaced to operators.
    Failed,
    /// Superseded by a newer decision before being claimed. Terminal.
    Cancelled,
}

impl ChangeStatus {
    /// Whether the row can never run again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed | Self::Cancelled)
    }

    /// Whether the row is exclusively held by a worker right now.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Claimed | Self::Applying)
    }
}

/// An exclusive hold on a row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Claim {
    /// Monotonically increasing token; stale tokens are rejected.
    pub token: u64,
    pub worker: String,
    /// Past this instant the sweep may requeue the row (crashed worker
    /// recovery).
    pub expires_at: DateTime<Utc>,
}

/// One proposed mutation, as a durable row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PendingChange {
    pub id: u64,
    pub arm: String,
    pub action: Action,
    /// Decision epoch that produced this change.
    pub epoch: u64,
    /// `arm:epoch` — the idempotency key.
    pub dedupe_key: String,
    pub status: ChangeStatus,
    pub claim: Option<Claim>,
    /// Application attempts so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    /// Earliest instant a `Retrying` row may be claimed again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Platform state recorded on success, for audit.
    pub resulting_state: Option<String>,
    /// Last failure message, on `Retrying`/`Failed`.
    pub failure: Option<String>,
}

/// What `enqueue` did with a proposed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was created.
    Enqueued { id: u64 },
    /// A new row was created and an older unclaimed row for the same arm
    /// was cancelled — newest decision wins.
    Superseded { id: u64, cancelled: u64 },
    /// A row with the same dedupe key is already queued; nothing changed.
    Duplicate { id: u64 },
    /// A newer decision is already queued for this arm; the proposal was
    /// dropped.
    RejectedStale { newer_epoch: u64 },
    /// The arm has a claimed/applying change; no new change may be
    /// enqueued until it resolves.
    RejectedInFlight { in_flight_id: u64 },
}

/// A successfully claimed row, as handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedChange {
    pub id: u64,
    pub arm: String,
    pub action: Action,
    pub epoch: u64,
    pub token: u64,
}

/// Disposition of a failed application.
#[derive(Debug, Clone, PartialEq)]
pub enum FailDisposition {
    /// Requeued for another attempt after the backoff deadline.
    Retrying { next_attempt_at: DateTime<Utc> },
    /// Terminally failed and surfaced for operator attention.
    Terminal,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<u64, PendingChange>,
    next_id: u64,
    next_token: u64,
}

/// The claim-and-lock queue.
pub struct ExecutionQueue {
    inner: Mutex<Inner>,
    claimable: Condvar,
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            claimable: Condvar::new(),
        }
    }

    /// Persist one aggregator action as a pending change.
    ///
    /// Semantics (per arm):
    /// - an in-flight (claimed/applying) change rejects the proposal;
    /// - a queued change with a newer epoch rejects the proposal as stale;
    /// - a queued change with the same dedupe key deduplicates;
    /// - a queued change with an older epoch is cancelled and replaced.
    pub fn enqueue(
        &self,
        arm: &str,
        action: Action,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        let mut inner = self.inner.lock();

        let existing = inner
            .rows
            .values()
            .find(|r| r.arm == arm && !r.status.is_terminal())
            .map(|r| (r.id, r.status, r.epoch));

        let cancelled = match existing {
            Some((id, status, _)) if status.is_in_flight() => {
                return EnqueueOutcome::RejectedInFlight { in_flight_id: id };
            }
            Some((_, _, queued_epoch)) if queued_epoch > epoch => {
                return EnqueueOutcome::RejectedStale {
                    newer_epoch: queued_epoch,
                };
            }
            Some((id, _, queued_epoch)) if queued_epoch == epoch => {
                return EnqueueOutcome::Duplicate { id };
            }
            Some((id, _, _)) => {
                let row = inner.rows.get_mut(&id).expect("existing row id");
                row.status = ChangeStatus::Cancelled;
                row.failure = Some("superseded by newer decision".into());
                tracing::debug!(arm, cancelled = id, epoch, "superseded older pending change");
                Some(id)
            }
            None => None,
        };

        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.insert(
            id,
            PendingChange {
                id,
                arm: arm.to_string(),
                action,
                epoch,
                dedupe_key: format!("{arm}:{epoch}"),
                status: ChangeStatus::Proposed,
                claim: None,
                attempts: 0,
                created_at: now,
                applied_at: None,
                next_attempt_at: None,
                resulting_state: None,
                failure: None,
            },
        );
        self.claimable.notify_one();

        match cancelled {
            Some(old) => EnqueueOutcome::Superseded { id, cancelled: old },
            None => EnqueueOutcome::Enqueued { id },
        }
    }

    /// Atomically claim the oldest claimable row, skipping rows held by
    /// other workers. Returns `None` when nothing is claimable right now.
    pub fn claim(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        params: &QueueParams,
    ) -> Option<ClaimedChange> {
        let mut inner = self.inner.lock();
        let id = inner
            .rows
            .values()
            .find(|r| is_claimable(r, now))
            .map(|r| r.id)?;
        inner.next_token += 1;
        let token = inner.next_token;
        let row = inner.rows.get_mut(&id).expect("claimable row id");
        row.status = ChangeStatus::Claimed;
        row.claim = Some(Claim {
            token,
            worker: worker.to_string(),
            expires_at: now + params.claim_ttl(),
        });
        Some(ClaimedChange {
            id: row.id,
            arm: row.arm.clone(),
            action: row.action,
            epoch: row.epoch,
            token,
        })
    }

    /// Transition a claimed row to `Applying` (the worker is about to call
    /// the platform).
    pub fn begin_apply(&self, id: u64, token: u64) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or(CoreError::UnknownChange { id })?;
        verify_claim(row, token)?;
        if row.status != ChangeStatus::Claimed {
            return Err(CoreError::IllegalTransition {
                id,
                details: format!("begin_apply from {:?}", row.status),
            });
        }
        row.status = ChangeStatus::Applying;
        row.attempts = row.attempts.saturating_add(1);
        Ok(())
    }

    /// Record a successful application. Terminal.
    pub fn complete(
        &self,
        id: u64,
        token: u64,
        state: AppliedState,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or(CoreError::UnknownChange { id })?;
        verify_claim(row, token)?;
        if row.status != ChangeStatus::Applying {
            return Err(CoreError::IllegalTransition {
                id,
                details: format!("complete from {:?}", row.status),
            });
        }
        row.status = ChangeStatus::Applied;
        row.applied_at = Some(now);
        row.resulting_state = Some(state.resulting_state);
        row.claim = None;
        row.failure = None;
        Ok(())
    }

    /// Record a failed application.
    ///
    /// Transient failures requeue with exponential backoff until attempts
    /// are exhausted; permanent failures (and exhaustion) are terminal and
    /// surfaced at warn severity.
    pub fn fail(
        &self,
        id: u64,
        token: u64,
        error: &PlatformError,
        now: DateTime<Utc>,
        params: &QueueParams,
    ) -> Result<FailDisposition, CoreError> {
        let mut inner = self.inner.lock();
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or(CoreError::UnknownChange { id })?;
        verify_claim(row, token)?;
        if !row.status.is_in_flight() {
            return Err(CoreError::IllegalTransition {
                id,
                details: format!("fail from {:?}", row.status),
            });
        }
        row.failure = Some(error.to_string());
        row.claim = None;
        if error.is_retryable() && row.attempts < params.max_attempts {
            let next = now + params.backoff(row.attempts.saturating_sub(1));
            row.status = ChangeStatus::Retrying;
            row.next_attempt_at = Some(next);
            tracing::debug!(
                id,
                arm = %row.arm,
                attempts = row.attempts,
                "transient platform failure, will retry"
            );
            self.claimable.notify_one();
            Ok(FailDisposition::Retrying {
                next_attempt_at: next,
            })
        } else {
            row.status = ChangeStatus::Failed;
            tracing::warn!(
                id,
                arm = %row.arm,
                action = row.action.as_str(),
                attempts = row.attempts,
                error = %error,
                "pending change terminally failed"
            );
            Ok(FailDisposition::Terminal)
        }
    }

    /// Requeue rows whose claim expired (worker died mid-flight). Returns
    /// how many were requeued.
    ///
    /// A live worker finishing after expiry will present a token that no
    /// longer matches and receive [`CoreError::DuplicateClaim`] — logged as
    /// a concurrency anomaly, and the row is not mutated twice.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<u64> = inner
            .rows
            .values()
            .filter(|r| {
                r.status.is_in_flight()
                    && r.claim.as_ref().is_some_and(|c| c.expires_at <= now)
            })
            .map(|r| r.id)
            .collect();
        for id in &expired {
            let row = inner.rows.get_mut(id).expect("expired row id");
            tracing::warn!(
                id,
                arm = %row.arm,
                worker = row.claim.as_ref().map(|c| c.worker.clone()).unwrap_or_default(),
                "claim expired, requeueing change"
            );
            row.status = ChangeStatus::Proposed;
            row.claim = None;
        }
        if !expired.is_empty() {
            self.claimable.notify_all();
        }
        expired.len()
    }

    /// Block until a row might be claimable, or the timeout elapses.
    ///
    /// Workers call this between claim attempts; it holds no lock while
    /// parked.
    pub fn wait_for_work(&self, timeout: StdDuration) {
        let mut inner = self.inner.lock();
        let _ = self.claimable.wait_for(&mut inner, timeout);
    }

    /// Whether the arm has a claimed or applying change right now.
    pub fn has_in_flight(&self, arm: &str) -> bool {
        self.inner
            .lock()
            .rows
            .values()
            .any(|r| r.arm == arm && r.status.is_in_flight())
    }

    /// Number of claimed/applying rows for the arm (0 or 1 by invariant).
    pub fn in_flight_count(&self, arm: &str) -> usize {
        self.inner
            .lock()
            .rows
            .values()
            .filter(|r| r.arm == arm && r.status.is_in_flight())
            .count()
    }

    /// Clone of every row, id order. For audit, reports, and tests.
    pub fn snapshot(&self) -> Vec<PendingChange> {
        self.inner.lock().rows.values().cloned().collect()
    }

    /// Clone of one row.
    pub fn get(&self, id: u64) -> Option<PendingChange> {
        self.inner.lock().rows.get(&id).cloned()
    }
}

fn is_claimable(row: &PendingChange, now: DateTime<Utc>) -> bool {
    match row.status {
        ChangeStatus::Proposed => true,
        ChangeStatus::Retrying => row.next_attempt_at.map_or(true, |t| t <= now),
        _ => false,
    }
}

fn verify_claim(row: &PendingChange, token: u64) -> Result<(), CoreError> {
    let held = row.claim.as_ref().map(|c| c.token);
    if held == Some(token) {
        return Ok(());
    }
    tracing::error!(
        id = row.id,
        arm = %row.arm,
        presented = token,
        held = held.unwrap_or(0),
        "claim token mismatch: possible duplicate claim"
    );
    Err(CoreError::DuplicateClaim {
        id: row.id,
        presented: token,
    })
}
