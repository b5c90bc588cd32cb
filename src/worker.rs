//! Execution workers: claim, jitter, apply, record.
//!
//! A pool of threads continuously drains the execution queue. Each worker
//! claims one change at a time, waits a randomized jitter delay to spread a
//! burst of simultaneous decisions across time (protecting the platform's
//! rate limiter), applies the change through the [`AdPlatform`] adapter,
//! and records the result.
//!
//! Suspension points — waiting for a claimable row, the jitter delay, the
//! platform round trip — hold no queue lock, so workers never block each
//! other on unrelated arms.
//!
//! Shutdown is cooperative: dropping the pool's sender wakes every worker;
//! a worker holding a claim finishes applying it before exiting (a claimed
//! change always runs to completion).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::params::QueueParams;
use crate::queue::{AdPlatform, ExecutionQueue, FailDisposition};

/// Counters across the pool's lifetime.
#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    retried: AtomicU64,
    failed_terminal: AtomicU64,
}

/// Point-in-time snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainStats {
    pub applied: u64,
    pub retried: u64,
    pub failed_terminal: u64,
}

/// Pool of execution worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Spawn `workers` threads draining `queue` against `platform`.
    ///
    /// `seed` keys each worker's jitter rng, so jitter sequences are
    /// reproducible in tests (set `jitter_min_ms = jitter_max_ms = 0` to
    /// disable the delay entirely).
    pub fn spawn(
        workers: usize,
        queue: Arc<ExecutionQueue>,
        platform: Arc<dyn AdPlatform>,
        params: QueueParams,
        seed: u64,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let counters = Arc::new(Counters::default());
        let handles = (0..workers.max(1))
            .map(|i| {
                let queue = Arc::clone(&queue);
                let platform = Arc::clone(&platform);
                let counters = Arc::clone(&counters);
                let shutdown = shutdown_rx.clone();
                std::thread::Builder::new()
                    .name(format!("adloop-worker-{i}"))
                    .spawn(move || {
                        worker_loop(
                            &format!("worker-{i}"),
                            &queue,
                            platform.as_ref(),
                            &params,
                            seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                            &shutdown,
                            &counters,
                        );
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Self {
            handles,
            shutdown_tx: Some(shutdown_tx),
            counters,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> DrainStats {
        DrainStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed_terminal: self.counters.failed_terminal.load(Ordering::Relaxed),
        }
    }

    /// Signal shutdown and join every worker. In-flight applications run to
    /// completion first.
    pub fn shutdown(mut self) -> DrainStats {
        self.shutdown_tx.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        DrainStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed_terminal: self.counters.failed_terminal.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_tx.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

const IDLE_POLL: StdDuration = StdDuration::from_millis(200);

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    name: &str,
    queue: &ExecutionQueue,
    platform: &dyn AdPlatform,
    params: &QueueParams,
    seed: u64,
    shutdown: &Receiver<()>,
    counters: &Counters,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    loop {
        let stopping = shutdown_requested(shutdown);
        match queue.claim(name, Utc::now(), params) {
            Some(change) => {
                // Jitter before touching the platform. A shutdown signal
                // cuts the delay short, never the application itself.
                let jitter_ms = if params.jitter_max_ms == 0 {
                    0
                } else {
                    rng.random_range(params.jitter_min_ms..=params.jitter_max_ms)
                };
                if jitter_ms > 0 {
                    let _ = shutdown.recv_timeout(StdDuration::from_millis(jitter_ms));
                }

                if let Err(err) = queue.begin_apply(change.id, change.token) {
                    // Structurally unreachable; surfaced by the queue at
                    // error severity. Leave the row for the sweep.
                    tracing::error!(worker = name, id = change.id, %err, "begin_apply refused");
                    continue;
                }
                match platform.apply(&change.arm, change.action, change.epoch) {
                    Ok(state) => {
                        match queue.complete(change.id, change.token, state, Utc::now()) {
                            Ok(()) => {
                                counters.applied.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                tracing::error!(worker = name, id = change.id, %err, "complete refused");
                            }
                        }
                    }
                    Err(platform_err) => {
                        match queue.fail(change.id, change.token, &platform_err, Utc::now(), params)
                        {
                            Ok(FailDisposition::Retrying { .. }) => {
                                counters.retried.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(FailDisposition::Terminal) => {
                                counters.failed_terminal.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                tracing::error!(worker = name, id = change.id, %err, "fail refused");
                            }
                        }
                    }
                }
            }
            None => {
                // Drain-then-exit: a stopping worker leaves only once no
                // row is claimable.
                if stopping {
                    return;
                }
                queue.wait_for_work(IDLE_POLL);
            }
        }
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    matches!(
        shutdown.try_recv(),
        Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected)
    )
}
