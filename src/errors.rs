//! Error taxonomy for the decision-and-execution core.
//!
//! Two families:
//!
//! - [`PlatformError`]: failures returned by the external ad platform when a
//!   mutation is applied. `Transient` failures are retried with backoff;
//!   `Permanent` failures mark the change terminally failed and are surfaced
//!   to operators.
//! - [`CoreError`]: misuse of the core itself (invalid parameters, malformed
//!   embeddings, unknown versions, claim-protocol violations).
//!
//! Statistical degradation is deliberately *not* an error: an arm with too
//! little data simply receives a hold/no-action recommendation, and a
//! malformed observation is dropped for that arm without aborting the cycle
//! for the others.

use thiserror::Error;

/// Shared `Result` alias for the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure returned by the external ad platform for an attempted mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Network trouble, rate limiting, or a 5xx-style response. Retried.
    #[error("transient platform failure: {0}")]
    Transient(String),

    /// The platform rejected the mutation outright. Never retried.
    #[error("permanent platform failure: {0}")]
    Permanent(String),
}

impl PlatformError {
    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Top-level error type for core misuse.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A tunable parameter set failed validation.
    #[error("invalid parameters: {details}")]
    InvalidParams { details: String },

    /// An embedding could not be accepted (dimension mismatch, zero norm,
    /// non-finite component).
    #[error("invalid embedding for arm {arm}: {details}")]
    InvalidEmbedding { arm: String, details: String },

    /// A model version id was not found in the registry.
    #[error("unknown model version {version}")]
    UnknownVersion { version: u64 },

    /// A queue operation referenced a row that does not exist.
    #[error("unknown pending change {id}")]
    UnknownChange { id: u64 },

    /// A worker presented a claim token that does not match the row's claim.
    ///
    /// The claim mechanism makes this structurally unreachable; observing it
    /// signals a concurrency-control bug and is logged at error severity by
    /// the queue before this is returned.
    #[error("duplicate claim on change {id}: token {presented} does not hold the claim")]
    DuplicateClaim { id: u64, presented: u64 },

    /// A queue row was driven through an illegal status transition.
    #[error("illegal status transition for change {id}: {details}")]
    IllegalTransition { id: u64, details: String },

    /// An arm referenced by an operation is not registered.
    #[error("unknown arm {arm}")]
    UnknownArm { arm: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable_permanent_is_not() {
        assert!(PlatformError::Transient("rate limited".into()).is_retryable());
        assert!(!PlatformError::Permanent("bad campaign id".into()).is_retryable());
    }
}
