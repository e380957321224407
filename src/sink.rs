//! Result sink: every review job ends in exactly one terminal, persisted
//! outcome.
//!
//! The review row is the source of truth; publishing the comment back to the
//! pull request is attempted at most once per job and is allowed to fail. A
//! duplicate comment is worse than a missing one.

use anyhow::Result;
use tracing::{info, warn};

use crate::context::ReviewInput;
use crate::db::{NewReview, RepositoryRecord, ReviewJob, ReviewStatus};
use crate::error::JobError;
use crate::AppState;

/// Marker embedded in every published comment so our own comments are
/// recognizable.
pub const COMMENT_MARKER: &str = "<!-- reviewd -->";

/// Format the branded pull-request comment for a completed review.
pub fn format_review_comment(review_text: &str, head_sha: &str) -> String {
    format!(
        "{}\n\n🤖 **AI Code Review**\n\n{}\n\n---\n*Reviewed commit `{}`.*",
        COMMENT_MARKER, review_text, head_sha
    )
}

/// Persist a completed review and publish it to the pull request.
///
/// If a row already exists for this (repository, PR, head commit) the job is
/// a re-delivery and nothing further happens. Publication is suppressed when
/// a newer job for the same PR has already completed, so an out-of-date
/// review never lands after a fresher one. A publish failure after the row
/// is persisted is logged and the row stands.
pub async fn record_success(
    state: &AppState,
    job: &ReviewJob,
    repo: &RepositoryRecord,
    token: &str,
    input: &ReviewInput,
    review_text: &str,
) -> Result<(), JobError> {
    let inserted = state
        .store
        .insert_review(NewReview {
            repository_id: repo.id,
            pr_number: job.pr_number,
            pr_title: input.title.clone(),
            pr_url: input.pr_url.clone(),
            review_text: review_text.to_string(),
            status: ReviewStatus::Completed,
            head_sha: job.head_sha.clone(),
            job_id: job.job_id.clone(),
        })
        .await
        .map_err(JobError::Persistence)?;

    if !inserted {
        info!(
            "Review for {}#{} at {} already recorded, skipping",
            job.full_name(),
            job.pr_number,
            job.head_sha
        );
        return Ok(());
    }

    let superseded = state
        .store
        .newer_job_completed(
            job.owner.clone(),
            job.repo_name.clone(),
            job.pr_number,
            job.enqueued_at,
        )
        .await
        .map_err(JobError::Persistence)?;
    if superseded {
        info!(
            "Newer review already completed for {}#{}, suppressing comment for {}",
            job.full_name(),
            job.pr_number,
            job.head_sha
        );
        return Ok(());
    }

    let comment = format_review_comment(review_text, &job.head_sha);
    match state
        .provider
        .create_issue_comment(token, &job.owner, &job.repo_name, job.pr_number, &comment)
        .await
    {
        Ok(comment_id) => {
            info!(
                "Published review comment {} on {}#{}",
                comment_id,
                job.full_name(),
                job.pr_number
            );
        }
        Err(e) => {
            // The review row already stands; publishing is attempted once.
            warn!(
                "Failed to publish review comment on {}#{}: {}",
                job.full_name(),
                job.pr_number,
                e
            );
        }
    }

    Ok(())
}

/// Persist a failed review with a short diagnostic. No comment is ever
/// published for a failed job.
pub async fn record_failure(state: &AppState, job: &ReviewJob, diagnostic: &str) -> Result<()> {
    let repo = state
        .store
        .find_repository_by_full_name(job.full_name())
        .await?;

    let Some(repo) = repo else {
        // Nothing to attach the record to; the repository was disconnected
        // while the job was in flight.
        warn!(
            "Dropping failure record for {}#{}: repository no longer registered",
            job.full_name(),
            job.pr_number
        );
        return Ok(());
    };

    let inserted = state
        .store
        .insert_review(NewReview {
            repository_id: repo.id,
            pr_number: job.pr_number,
            pr_title: "Review failed".to_string(),
            pr_url: format!(
                "https://github.com/{}/pull/{}",
                job.full_name(),
                job.pr_number
            ),
            review_text: diagnostic.to_string(),
            status: ReviewStatus::Failed,
            head_sha: job.head_sha.clone(),
            job_id: job.job_id.clone(),
        })
        .await?;

    if inserted {
        info!(
            "Recorded failed review for {}#{}: {}",
            job.full_name(),
            job.pr_number,
            diagnostic
        );
    }
    Ok(())
}
