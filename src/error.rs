//! Error taxonomy for the review pipeline.
//!
//! Every job terminates in exactly one of two ways: a completed review or a
//! failed review with a diagnostic. The variants here carry the retry
//! classification that decides which of those a given failure becomes, and
//! when.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// The entitlement gate denied the review. Not a fault: this is a normal
    /// terminal outcome and still produces a failed review record.
    #[error("entitlement limit reached")]
    EntitlementDenied,

    /// The pull request or repository is inaccessible (deleted, token
    /// revoked, permissions changed). Terminal; retrying cannot help.
    #[error("{message}")]
    Retrieval { message: String },

    /// A transient provider failure (timeout, rate limit, 5xx). Retried
    /// within the job attempt budget.
    #[error("transient provider error: {message}")]
    Transient { message: String },

    /// The AI backend failed to produce a review. Retried within the job
    /// attempt budget, then terminal.
    #[error("review generation failed: {message}")]
    Generation { message: String },

    /// Storage failure. Retried by the queue layer; never silently dropped.
    #[error("storage error: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl JobError {
    /// Whether the queue should re-deliver the job after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transient { .. } | JobError::Generation { .. } | JobError::Persistence(_)
        )
    }

    /// Short user-visible diagnostic recorded on the failed review row.
    pub fn diagnostic(&self) -> String {
        match self {
            JobError::Persistence(_) => "internal storage error".to_string(),
            other => other.to_string(),
        }
    }
}
