//! Property and invariant tests for the execution queue.

use std::collections::BTreeMap;

use adloop::{
    Action, AdPlatform, AppliedState, ChangeStatus, ClaimedChange, ExecutionQueue, PlatformError,
    QueueParams,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use proptest::prelude::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
}

fn params() -> QueueParams {
    QueueParams {
        jitter_min_ms: 0,
        jitter_max_ms: 0,
        backoff_base_ms: 1_000,
        backoff_cap_ms: 8_000,
        max_attempts: 3,
        claim_ttl_secs: 300,
    }
}

/// Idempotent fake platform: re-applying the same (arm, action, epoch) is a
/// no-op, per the adapter contract.
#[derive(Default)]
struct CountingPlatform {
    applications: Mutex<BTreeMap<(String, String, u64), u64>>,
}

impl CountingPlatform {
    fn effective_mutations(&self) -> u64 {
        self.applications.lock().len() as u64
    }
}

impl AdPlatform for CountingPlatform {
    fn apply(&self, arm: &str, action: Action, epoch: u64) -> Result<AppliedState, PlatformError> {
        let mut m = self.applications.lock();
        let count = m
            .entry((arm.to_string(), action.as_str().to_string(), epoch))
            .or_insert(0);
        // The platform observes repeats but only the first mutates state.
        *count += 1;
        Ok(AppliedState {
            resulting_state: format!("{arm}:{}", action.as_str()),
        })
    }
}

/// Simulated double-claim: a worker claim expires mid-apply, another worker
/// re-applies, and the platform's idempotency keeps state single-mutated.
#[test]
fn double_application_does_not_double_mutate() {
    let q = ExecutionQueue::new();
    let p = params();
    let platform = CountingPlatform::default();
    q.enqueue("a", Action::Pause, 4, t0());

    // Worker 1 claims, starts applying, then stalls past the claim TTL.
    let c1 = q.claim("w1", t0(), &p).unwrap();
    q.begin_apply(c1.id, c1.token).unwrap();
    let first = platform.apply("a", Action::Pause, 4).unwrap();

    let expired = t0() + p.claim_ttl() + Duration::seconds(1);
    assert_eq!(q.sweep_expired(expired), 1);

    // Worker 2 picks the row up and applies the same change again.
    let c2 = q.claim("w2", expired, &p).unwrap();
    q.begin_apply(c2.id, c2.token).unwrap();
    let second = platform.apply("a", Action::Pause, 4).unwrap();
    assert_eq!(first, second);
    q.complete(c2.id, c2.token, second, expired).unwrap();

    // The stalled worker's completion is refused with a duplicate-claim
    // error; the row is not mutated twice.
    let refused = q.complete(c1.id, c1.token, first, expired);
    assert!(refused.is_err());

    assert_eq!(platform.effective_mutations(), 1);
    assert_eq!(q.get(c1.id).unwrap().status, ChangeStatus::Applied);
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue { arm: u8, epoch: u64 },
    Claim { worker: u8 },
    BeginApply { slot: u8 },
    Complete { slot: u8 },
    FailTransient { slot: u8 },
    FailPermanent { slot: u8 },
    StaleComplete { slot: u8 },
    Sweep { advance_secs: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, 1u64..20).prop_map(|(arm, epoch)| Op::Enqueue { arm, epoch }),
        (0u8..3).prop_map(|worker| Op::Claim { worker }),
        (0u8..4).prop_map(|slot| Op::BeginApply { slot }),
        (0u8..4).prop_map(|slot| Op::Complete { slot }),
        (0u8..4).prop_map(|slot| Op::FailTransient { slot }),
        (0u8..4).prop_map(|slot| Op::FailPermanent { slot }),
        (0u8..4).prop_map(|slot| Op::StaleComplete { slot }),
        (0u64..600).prop_map(|advance_secs| Op::Sweep { advance_secs }),
    ]
}

proptest! {
    /// Core safety invariant: under arbitrary interleavings of queue
    /// operations, no arm ever has more than one claimed/applying row, and
    /// terminal rows never change status again.
    #[test]
    fn at_most_one_in_flight_per_arm(ops in proptest::collection::vec(op_strategy(), 1..120)) {
        let q = ExecutionQueue::new();
        let p = params();
        let mut now = t0();
        let mut held: Vec<ClaimedChange> = Vec::new();
        let mut terminal: BTreeMap<u64, ChangeStatus> = BTreeMap::new();

        for op in ops {
            now += Duration::seconds(1);
            match op {
                Op::Enqueue { arm, epoch } => {
                    let _ = q.enqueue(&format!("arm{arm}"), Action::Pause, epoch, now);
                }
                Op::Claim { worker } => {
                    if let Some(c) = q.claim(&format!("w{worker}"), now, &p) {
                        held.push(c);
                    }
                }
                Op::BeginApply { slot } => {
                    if let Some(c) = held.get(slot as usize) {
                        let _ = q.begin_apply(c.id, c.token);
                    }
                }
                Op::Complete { slot } => {
                    if (slot as usize) < held.len() {
                        let c = held.remove(slot as usize);
                        let _ = q.complete(c.id, c.token, AppliedState {
                            resulting_state: "done".into(),
                        }, now);
                    }
                }
                Op::FailTransient { slot } => {
                    if (slot as usize) < held.len() {
                        let c = held.remove(slot as usize);
                        let _ = q.fail(c.id, c.token, &PlatformError::Transient("net".into()), now, &p);
                    }
                }
                Op::FailPermanent { slot } => {
                    if (slot as usize) < held.len() {
                        let c = held.remove(slot as usize);
                        let _ = q.fail(c.id, c.token, &PlatformError::Permanent("no".into()), now, &p);
                    }
                }
                Op::StaleComplete { slot } => {
                    if let Some(c) = held.get(slot as usize) {
                        // A token that was never issued must be refused.
                        let refused = q.complete(c.id, c.token + 10_000, AppliedState {
                            resulting_state: "forged".into(),
                        }, now);
                        prop_assert!(refused.is_err());
                    }
                }
                Op::Sweep { advance_secs } => {
                    now += Duration::seconds(advance_secs as i64);
                    let requeued = q.sweep_expired(now);
                    if requeued > 0 {
                        // Tokens for requeued rows are dead; forget them.
                        held.retain(|c| {
                            q.get(c.id).is_some_and(|r| {
                                r.claim.as_ref().is_some_and(|cl| cl.token == c.token)
                            })
                        });
                    }
                }
            }

            // Invariant: at most one in-flight row per arm.
            let mut in_flight: BTreeMap<String, usize> = BTreeMap::new();
            for row in q.snapshot() {
                if row.status.is_in_flight() {
                    *in_flight.entry(row.arm.clone()).or_insert(0) += 1;
                }
                // Terminal rows stay terminal with the same status.
                if let Some(prev) = terminal.get(&row.id) {
                    prop_assert_eq!(*prev, row.status, "terminal row {} changed", row.id);
                }
                if row.status.is_terminal() {
                    terminal.insert(row.id, row.status);
                }
            }
            for (arm, count) in in_flight {
                prop_assert!(count <= 1, "arm {arm} has {count} in-flight rows");
            }
        }
    }

    /// Newest-decision-wins: after any sequence of same-arm enqueues, at
    /// most one non-terminal row exists and it carries the highest accepted
    /// epoch.
    #[test]
    fn supersession_leaves_single_newest_row(epochs in proptest::collection::vec(1u64..50, 1..30)) {
        let q = ExecutionQueue::new();
        let mut now = t0();
        let mut best: Option<u64> = None;
        for e in epochs {
            now += Duration::seconds(1);
            let _ = q.enqueue("a", Action::Kill, e, now);
            best = Some(best.map_or(e, |b| b.max(e)));
        }
        let live: Vec<_> = q
            .snapshot()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        prop_assert_eq!(live.len(), 1);
        prop_assert_eq!(live[0].epoch, best.unwrap());
    }
}
