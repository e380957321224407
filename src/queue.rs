//! Durable job queue and worker loop.
//!
//! Jobs live in SQLite and survive restarts. Submission is idempotent on job
//! id, claiming serializes jobs per pull request, and failed attempts are
//! re-delivered with exponential backoff until the attempt budget runs out.
//! A job that exhausts its budget is recorded as a failed review rather than
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::db::{ClaimedJob, ReviewJob};
use crate::pipeline;
use crate::sink;
use crate::store::Store;
use crate::AppState;

#[derive(Clone)]
pub struct JobQueue {
    store: Store,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a job. Returns false if a job with this id was already
    /// submitted; the duplicate is discarded.
    pub async fn submit(&self, job: ReviewJob) -> Result<bool> {
        let inserted = self.store.enqueue_job(job).await?;
        if inserted {
            self.notify.notify_waiters();
        }
        Ok(inserted)
    }

    /// Block until new work may be available: either a submission wakes us or
    /// the poll interval elapses (covering backoff timers and jobs queued by
    /// a previous process).
    pub async fn wait_for_work(&self, poll: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Delay before attempt `attempt + 1`, doubling from `base_secs` and capped
/// at `max_secs`.
pub fn backoff_delay_secs(attempt: u32, base_secs: i64, max_secs: i64) -> i64 {
    if attempt >= 32 {
        return max_secs;
    }
    base_secs.saturating_mul(1 << attempt).min(max_secs)
}

const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Worker loop: claim a due job, run it, record the outcome, repeat.
pub async fn worker_loop(state: Arc<AppState>, worker_id: usize) {
    info!("Review worker {} started", worker_id);
    loop {
        let claimed = match state.queue.store.claim_due_job(Utc::now().timestamp()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!("Worker {} failed to claim a job: {:#}", worker_id, e);
                tokio::time::sleep(WORKER_POLL_INTERVAL).await;
                continue;
            }
        };

        let Some(claimed) = claimed else {
            state.queue.wait_for_work(WORKER_POLL_INTERVAL).await;
            continue;
        };

        if let Err(e) = process_claimed_job(&state, claimed).await {
            error!("Worker {} failed to settle a job: {:#}", worker_id, e);
            tokio::time::sleep(WORKER_POLL_INTERVAL).await;
        }
    }
}

/// Run one claimed job and settle it: finish on success, requeue with
/// backoff on a retryable failure with budget left, otherwise record a
/// failed review and finish.
pub async fn process_claimed_job(state: &AppState, claimed: ClaimedJob) -> Result<()> {
    let job = claimed.job;
    let attempt = claimed.attempts + 1;

    match pipeline::run_review_job(state, &job).await {
        Ok(()) => {
            state.queue.store.finish_job(job.job_id.clone()).await?;
            info!("Job {} completed on attempt {}", job.job_id, attempt);
            Ok(())
        }
        Err(e) if e.is_retryable() && attempt < state.config.max_job_attempts => {
            let delay = backoff_delay_secs(
                claimed.attempts,
                state.config.retry_base_secs,
                state.config.retry_max_backoff_secs,
            );
            warn!(
                "Job {} attempt {} failed, retrying in {}s: {}",
                job.job_id, attempt, delay, e
            );
            state
                .queue
                .store
                .requeue_job(job.job_id.clone(), attempt, Utc::now().timestamp() + delay)
                .await?;
            Ok(())
        }
        Err(e) => {
            let mut diagnostic = e.diagnostic();
            if e.is_retryable() {
                diagnostic.push_str(" (retries exhausted)");
            }
            warn!(
                "Job {} failed terminally on attempt {}: {}",
                job.job_id, attempt, diagnostic
            );
            match sink::record_failure(state, &job, &diagnostic).await {
                Ok(()) => {
                    state.queue.store.finish_job(job.job_id.clone()).await?;
                    Ok(())
                }
                Err(persist_err) => {
                    // Never drop a job without a terminal record. Keep it
                    // queued so a later attempt can write the failure row.
                    error!(
                        "Job {} failed and the failure record could not be written: {:#}",
                        job.job_id, persist_err
                    );
                    state
                        .queue
                        .store
                        .requeue_job(
                            job.job_id.clone(),
                            attempt,
                            Utc::now().timestamp()
                                + backoff_delay_secs(
                                    claimed.attempts,
                                    state.config.retry_base_secs,
                                    state.config.retry_max_backoff_secs,
                                ),
                        )
                        .await?;
                    Ok(())
                }
            }
        }
    }
}
