//! Async facade over the SQLite database.
//!
//! `rusqlite` is synchronous; every operation here hops onto the blocking
//! thread pool so workers and request handlers never block the runtime on
//! database I/O.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::db::{
    ClaimedJob, ConsumeOutcome, NewRepository, NewReview, RepositoryRecord, ReviewJob,
    ReviewRecord, SqliteDb,
};

#[derive(Clone)]
pub struct Store {
    db: Arc<SqliteDb>,
}

macro_rules! blocking {
    ($self:ident, $db:ident => $body:expr) => {{
        let $db = $self.db.clone();
        tokio::task::spawn_blocking(move || $body)
            .await
            .context("spawn_blocking panicked")?
    }};
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let db = tokio::task::spawn_blocking(move || SqliteDb::open(&path))
            .await
            .context("spawn_blocking panicked")?
            .context("Failed to open SQLite database")?;
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(SqliteDb::open_in_memory()?),
        })
    }

    pub async fn upsert_account(&self, user_id: String, access_token: String) -> Result<()> {
        blocking!(self, db => db.upsert_account(&user_id, &access_token))
    }

    pub async fn access_token(&self, user_id: String) -> Result<Option<String>> {
        blocking!(self, db => db.access_token(&user_id))
    }

    pub async fn insert_repository(&self, new: NewRepository) -> Result<RepositoryRecord> {
        blocking!(self, db => db.insert_repository(&new))
    }

    pub async fn find_repository(&self, id: i64) -> Result<Option<RepositoryRecord>> {
        blocking!(self, db => db.find_repository(id))
    }

    pub async fn find_repository_by_full_name(
        &self,
        full_name: String,
    ) -> Result<Option<RepositoryRecord>> {
        blocking!(self, db => db.find_repository_by_full_name(&full_name))
    }

    pub async fn list_repositories_for_user(
        &self,
        user_id: String,
    ) -> Result<Vec<RepositoryRecord>> {
        blocking!(self, db => db.list_repositories_for_user(&user_id))
    }

    pub async fn count_repositories_for_user(&self, user_id: String) -> Result<i64> {
        blocking!(self, db => db.count_repositories_for_user(&user_id))
    }

    pub async fn delete_repository(&self, id: i64) -> Result<bool> {
        blocking!(self, db => db.delete_repository(id))
    }

    pub async fn enqueue_job(&self, job: ReviewJob) -> Result<bool> {
        blocking!(self, db => db.enqueue_job(&job))
    }

    pub async fn claim_due_job(&self, now: i64) -> Result<Option<ClaimedJob>> {
        blocking!(self, db => db.claim_due_job(now))
    }

    pub async fn requeue_job(
        &self,
        job_id: String,
        attempts: u32,
        next_attempt_at: i64,
    ) -> Result<()> {
        blocking!(self, db => db.requeue_job(&job_id, attempts, next_attempt_at))
    }

    pub async fn finish_job(&self, job_id: String) -> Result<()> {
        blocking!(self, db => db.finish_job(&job_id))
    }

    pub async fn reset_running_jobs(&self) -> Result<usize> {
        blocking!(self, db => db.reset_running_jobs())
    }

    pub async fn newer_job_completed(
        &self,
        owner: String,
        repo_name: String,
        pr_number: u64,
        enqueued_at: i64,
    ) -> Result<bool> {
        blocking!(self, db => db.newer_job_completed(&owner, &repo_name, pr_number, enqueued_at))
    }

    pub async fn insert_review(&self, new: NewReview) -> Result<bool> {
        blocking!(self, db => db.insert_review(&new))
    }

    pub async fn review_exists(
        &self,
        repository_id: i64,
        pr_number: u64,
        head_sha: String,
    ) -> Result<bool> {
        blocking!(self, db => db.review_exists(repository_id, pr_number, &head_sha))
    }

    pub async fn find_review(
        &self,
        repository_id: i64,
        pr_number: u64,
        head_sha: String,
    ) -> Result<Option<ReviewRecord>> {
        blocking!(self, db => db.find_review(repository_id, pr_number, &head_sha))
    }

    pub async fn count_reviews_for_user(&self, user_id: String) -> Result<i64> {
        blocking!(self, db => db.count_reviews_for_user(&user_id))
    }

    pub async fn try_consume_review(
        &self,
        job_id: String,
        user_id: String,
        repository_id: i64,
        limit: i64,
    ) -> Result<ConsumeOutcome> {
        blocking!(self, db => db.try_consume_review(&job_id, &user_id, repository_id, limit))
    }

    pub async fn review_usage(&self, user_id: String, repository_id: i64) -> Result<i64> {
        blocking!(self, db => db.review_usage(&user_id, repository_id))
    }
}
