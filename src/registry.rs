//! Model registry: immutable parameter snapshots with one active version.
//!
//! New tuning always creates a new version; activation is an atomic pointer
//! swap, never an in-place edit, so an in-flight decision cycle holds one
//! consistent snapshot for its whole run and never observes a half-updated
//! parameter set. Rollback is just re-activating a prior version.
//!
//! Version comparison ([`ModelRegistry::compare`]) diffs the flattened
//! tunables of two versions — the basis for shadow-mode evaluation, where a
//! candidate version's decisions are computed against the same data as the
//! active one without being enqueued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::errors::CoreError;
use crate::params::ModelParams;

/// An immutable snapshot of tunable parameters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelVersion {
    /// Monotonically increasing version id.
    pub version_id: u64,
    /// The parameter set. Never mutated after registration.
    pub params: ModelParams,
    /// When this version was registered.
    pub created_at: DateTime<Utc>,
    /// When this version was last activated, if ever.
    pub activated_at: Option<DateTime<Utc>>,
}

/// One changed tunable between two versions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParamDelta {
    pub field: &'static str,
    pub from: f64,
    pub to: f64,
}

/// Versioned store of [`ModelParams`] with an atomically swapped active
/// snapshot.
pub struct ModelRegistry {
    active: ArcSwap<ModelVersion>,
    history: Mutex<Vec<Arc<ModelVersion>>>,
    next_id: AtomicU64,
}

impl ModelRegistry {
    /// Create a registry whose first version holds `params` and is active.
    ///
    /// Fails if `params` does not validate — an invalid tuning must never
    /// become the active snapshot.
    pub fn new(params: ModelParams, now: DateTime<Utc>) -> Result<Self, CoreError> {
        params.validate()?;
        let v = Arc::new(ModelVersion {
            version_id: 1,
            params,
            created_at: now,
            activated_at: Some(now),
        });
        Ok(Self {
            active: ArcSwap::from(Arc::clone(&v)),
            history: Mutex::new(vec![v]),
            next_id: AtomicU64::new(2),
        })
    }

    /// The currently active snapshot.
    ///
    /// Callers hold the returned `Arc` for the duration of a decision cycle
    /// so every arm in the cycle sees the same parameters.
    pub fn active(&self) -> Arc<ModelVersion> {
        self.active.load_full()
    }

    /// Register a new (inactive) version. Returns its id.
    pub fn register(&self, params: ModelParams, now: DateTime<Utc>) -> Result<u64, CoreError> {
        params.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let v = Arc::new(ModelVersion {
            version_id: id,
            params,
            created_at: now,
            activated_at: None,
        });
        self.history.lock().push(v);
        Ok(id)
    }

    /// Activate a registered version: an atomic pointer swap.
    ///
    /// Re-activating an old version is how rollback works.
    pub fn activate(&self, version_id: u64, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut history = self.history.lock();
        let slot = history
            .iter_mut()
            .find(|v| v.version_id == version_id)
            .ok_or(CoreError::UnknownVersion {
                version: version_id,
            })?;
        // Stamp the activation on a fresh Arc; the snapshot itself stays
        // immutable from the readers' point of view.
        let activated = Arc::new(ModelVersion {
            activated_at: Some(now),
            ..(**slot).clone()
        });
        *slot = Arc::clone(&activated);
        self.active.store(activated);
        tracing::debug!(version = version_id, "model version activated");
        Ok(())
    }

    /// Fetch any registered version by id.
    pub fn get(&self, version_id: u64) -> Result<Arc<ModelVersion>, CoreError> {
        self.history
            .lock()
            .iter()
            .find(|v| v.version_id == version_id)
            .cloned()
            .ok_or(CoreError::UnknownVersion {
                version: version_id,
            })
    }

    /// All registered version ids, oldest first.
    pub fn version_ids(&self) -> Vec<u64> {
        self.history.lock().iter().map(|v| v.version_id).collect()
    }

    /// Diff the tunables of two versions (fields that differ, in stable
    /// field order).
    pub fn compare(&self, a: u64, b: u64) -> Result<Vec<ParamDelta>, CoreError> {
        let va = self.get(a)?;
        let vb = self.get(b)?;
        let fa = va.params.flatten();
        let fb = vb.params.flatten();
        Ok(fa
            .into_iter()
            .zip(fb)
            .filter(|((_, x), (_, y))| x != y)
            .map(|((field, from), (_, to))| ParamDelta { field, from, to })
            .collect())
    }
}
