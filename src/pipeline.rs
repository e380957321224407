//! End-to-end execution of one review job.
//!
//! A worker runs this for every claimed job: entitlement gate, diff and
//! context retrieval, review generation, result sink. Every step is safe to
//! re-run with the same job id, so at-least-once delivery from the queue
//! never produces duplicate reviews or double-counted quota.

use tracing::info;

use crate::context::{self, ContextBudget};
use crate::db::ReviewJob;
use crate::entitlement::{self, GateDecision};
use crate::error::JobError;
use crate::sink;
use crate::AppState;

pub async fn run_review_job(state: &AppState, job: &ReviewJob) -> Result<(), JobError> {
    info!(
        "Processing review job {} for {}#{} at {}",
        job.job_id,
        job.full_name(),
        job.pr_number,
        job.head_sha
    );

    let repo = state
        .store
        .find_repository_by_full_name(job.full_name())
        .await
        .map_err(JobError::Persistence)?
        .ok_or_else(|| JobError::Retrieval {
            message: "repository is not connected".to_string(),
        })?;

    // Re-delivery of a job that already reached a terminal outcome.
    let already_recorded = state
        .store
        .review_exists(repo.id, job.pr_number, job.head_sha.clone())
        .await
        .map_err(JobError::Persistence)?;
    if already_recorded {
        info!(
            "Job {} already has a terminal review for {}#{}, short-circuiting",
            job.job_id,
            job.full_name(),
            job.pr_number
        );
        return Ok(());
    }

    let token = state
        .store
        .access_token(job.user_id.clone())
        .await
        .map_err(JobError::Persistence)?
        .ok_or_else(|| JobError::Retrieval {
            message: "no GitHub access token on file for this user".to_string(),
        })?;

    let decision = entitlement::check_and_consume(
        &state.store,
        &job.job_id,
        &job.user_id,
        repo.id,
        state.config.review_limit,
    )
    .await
    .map_err(JobError::Persistence)?;
    if decision == GateDecision::Denied {
        return Err(JobError::EntitlementDenied);
    }

    let input = context::fetch_review_input(
        state.provider.as_ref(),
        &token,
        &job.owner,
        &job.repo_name,
        job.pr_number,
    )
    .await?;

    let context_files = context::collect_repository_context(
        state.provider.as_ref(),
        &token,
        &job.owner,
        &job.repo_name,
        ContextBudget {
            max_files: state.config.max_context_files,
            max_total_bytes: state.config.max_context_bytes,
        },
    )
    .await?;

    let review_text = state
        .backend
        .generate_review(&input, &context_files)
        .await
        .map_err(|e| JobError::Generation {
            message: e.to_string(),
        })?;

    sink::record_success(state, job, &repo, &token, &input, &review_text).await
}
