//! SQLite persistence layer.
//!
//! Holds the durable state of the service: registered repositories, the
//! review job queue, terminal review records and entitlement counters.
//! States are stored with explicit relational columns rather than JSON blobs
//! for type safety and queryability.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// A queued review job. Immutable once enqueued; `job_id` is the idempotency
/// key (the provider's delivery GUID), so redelivery of the same event maps
/// to the same row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewJob {
    pub job_id: String,
    pub owner: String,
    pub repo_name: String,
    pub pr_number: u64,
    pub head_sha: String,
    pub user_id: String,
    pub enqueued_at: i64,
}

impl ReviewJob {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo_name)
    }
}

/// A job handed to a worker, together with how many times it has been
/// attempted before.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: ReviewJob,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Completed,
    Failed,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Completed => "completed",
            ReviewStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewRecord {
    pub id: i64,
    pub repository_id: i64,
    pub pr_number: u64,
    pub pr_title: String,
    pub pr_url: String,
    pub review_text: String,
    pub status: ReviewStatus,
    pub head_sha: String,
    pub job_id: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewReview {
    pub repository_id: i64,
    pub pr_number: u64,
    pub pr_title: String,
    pub pr_url: String,
    pub review_text: String,
    pub status: ReviewStatus,
    pub head_sha: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryRecord {
    pub id: i64,
    pub github_id: u64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub url: String,
    pub user_id: String,
    pub webhook_id: Option<u64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewRepository {
    pub github_id: u64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub url: String,
    pub user_id: String,
    pub webhook_id: Option<u64>,
}

/// Outcome of the atomic entitlement check-and-consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Quota was available and this job consumed one unit.
    Granted,
    /// This job already consumed its unit on an earlier delivery.
    AlreadyConsumed,
    /// No quota left; nothing was consumed.
    Denied,
}

/// SQLite database behind a `Mutex<Connection>`.
///
/// `rusqlite::Connection` is not `Sync`, so the mutex provides the required
/// synchronization. Callers wrap operations in `tokio::task::spawn_blocking`
/// for async compatibility (see `store::Store`).
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Open or create the database file at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                github_id INTEGER NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                full_name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                user_id TEXT NOT NULL,
                webhook_id INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                head_sha TEXT NOT NULL,
                user_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued'
                    CHECK(state IN ('queued', 'running', 'done')),
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, next_attempt_at);

            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repository_id INTEGER NOT NULL,
                pr_number INTEGER NOT NULL,
                pr_title TEXT NOT NULL,
                pr_url TEXT NOT NULL,
                review_text TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('completed', 'failed')),
                head_sha TEXT NOT NULL,
                job_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(repository_id, pr_number, head_sha)
            );

            CREATE TABLE IF NOT EXISTS review_usage (
                user_id TEXT NOT NULL,
                repository_id INTEGER NOT NULL,
                review_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, repository_id)
            );

            CREATE TABLE IF NOT EXISTS consumed_jobs (
                job_id TEXT PRIMARY KEY
            );
            "#,
        )
        .context("Failed to create initial schema")?;
        Ok(())
    }

    // ----- accounts -----

    pub fn upsert_account(&self, user_id: &str, access_token: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO accounts (user_id, access_token) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET access_token = excluded.access_token",
            params![user_id, access_token],
        )?;
        Ok(())
    }

    pub fn access_token(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let token = conn
            .query_row(
                "SELECT access_token FROM accounts WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }

    // ----- repositories -----

    /// Insert a repository record, returning the stored row. If a record with
    /// the same full name already exists it is returned unchanged.
    pub fn insert_repository(&self, new: &NewRepository) -> Result<RepositoryRecord> {
        let conn = self.conn.lock().expect("mutex poisoned");
        if let Some(existing) = Self::query_repository(
            &conn,
            "SELECT * FROM repositories WHERE full_name = ?1",
            params![new.full_name],
        )? {
            return Ok(existing);
        }

        let created_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO repositories
                 (github_id, owner, name, full_name, url, user_id, webhook_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.github_id as i64,
                new.owner,
                new.name,
                new.full_name,
                new.url,
                new.user_id,
                new.webhook_id.map(|id| id as i64),
                created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(RepositoryRecord {
            id,
            github_id: new.github_id,
            owner: new.owner.clone(),
            name: new.name.clone(),
            full_name: new.full_name.clone(),
            url: new.url.clone(),
            user_id: new.user_id.clone(),
            webhook_id: new.webhook_id,
            created_at,
        })
    }

    pub fn find_repository(&self, id: i64) -> Result<Option<RepositoryRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::query_repository(&conn, "SELECT * FROM repositories WHERE id = ?1", params![id])
    }

    pub fn find_repository_by_full_name(&self, full_name: &str) -> Result<Option<RepositoryRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::query_repository(
            &conn,
            "SELECT * FROM repositories WHERE full_name = ?1",
            params![full_name],
        )
    }

    pub fn list_repositories_for_user(&self, user_id: &str) -> Result<Vec<RepositoryRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM repositories WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], Self::row_to_repository)?;
        let mut repositories = Vec::new();
        for row in rows {
            repositories.push(row?);
        }
        Ok(repositories)
    }

    pub fn count_repositories_for_user(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM repositories WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn delete_repository(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let deleted = conn.execute("DELETE FROM repositories WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn query_repository(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<RepositoryRecord>> {
        let record = conn
            .query_row(sql, params, Self::row_to_repository)
            .optional()?;
        Ok(record)
    }

    fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepositoryRecord> {
        Ok(RepositoryRecord {
            id: row.get("id")?,
            github_id: row.get::<_, i64>("github_id")? as u64,
            owner: row.get("owner")?,
            name: row.get("name")?,
            full_name: row.get("full_name")?,
            url: row.get("url")?,
            user_id: row.get("user_id")?,
            webhook_id: row.get::<_, Option<i64>>("webhook_id")?.map(|id| id as u64),
            created_at: row.get("created_at")?,
        })
    }

    // ----- job queue -----

    /// Idempotent enqueue: inserting a previously-seen job_id is a no-op.
    /// Returns whether the job was newly inserted.
    pub fn enqueue_job(&self, job: &ReviewJob) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs
                 (job_id, owner, repo_name, pr_number, head_sha, user_id,
                  state, attempts, next_attempt_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 0, ?7, ?7)",
            params![
                job.job_id,
                job.owner,
                job.repo_name,
                job.pr_number as i64,
                job.head_sha,
                job.user_id,
                job.enqueued_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Claim one due job, marking it `running`.
    ///
    /// Jobs whose (owner, repo, PR) key already has a running job are not
    /// eligible, giving effective per-PR serialization.
    pub fn claim_due_job(&self, now: i64) -> Result<Option<ClaimedJob>> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;

        let claimed = tx
            .query_row(
                "SELECT job_id, owner, repo_name, pr_number, head_sha, user_id,
                        attempts, enqueued_at
                 FROM jobs j
                 WHERE state = 'queued' AND next_attempt_at <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM jobs r
                       WHERE r.state = 'running'
                         AND r.owner = j.owner
                         AND r.repo_name = j.repo_name
                         AND r.pr_number = j.pr_number
                   )
                 ORDER BY next_attempt_at
                 LIMIT 1",
                params![now],
                |row| {
                    Ok(ClaimedJob {
                        job: ReviewJob {
                            job_id: row.get("job_id")?,
                            owner: row.get("owner")?,
                            repo_name: row.get("repo_name")?,
                            pr_number: row.get::<_, i64>("pr_number")? as u64,
                            head_sha: row.get("head_sha")?,
                            user_id: row.get("user_id")?,
                            enqueued_at: row.get("enqueued_at")?,
                        },
                        attempts: row.get("attempts")?,
                    })
                },
            )
            .optional()?;

        if let Some(ref claimed) = claimed {
            tx.execute(
                "UPDATE jobs SET state = 'running' WHERE job_id = ?1",
                params![claimed.job.job_id],
            )?;
        }
        tx.commit()?;

        Ok(claimed)
    }

    /// Put a job back in the queue after a transient failure.
    pub fn requeue_job(&self, job_id: &str, attempts: u32, next_attempt_at: i64) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE jobs SET state = 'queued', attempts = ?2, next_attempt_at = ?3
             WHERE job_id = ?1",
            params![job_id, attempts, next_attempt_at],
        )?;
        Ok(())
    }

    /// Mark a job terminal.
    pub fn finish_job(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE jobs SET state = 'done' WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(())
    }

    /// Requeue jobs left `running` by a crashed instance. Called at startup;
    /// the at-least-once contract makes re-delivery safe.
    pub fn reset_running_jobs(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let reset = conn.execute("UPDATE jobs SET state = 'queued' WHERE state = 'running'", [])?;
        Ok(reset)
    }

    /// Whether a job enqueued after `enqueued_at` for the same PR has already
    /// produced a completed review. Used to suppress out-of-date comments.
    pub fn newer_job_completed(
        &self,
        owner: &str,
        repo_name: &str,
        pr_number: u64,
        enqueued_at: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let newer: i64 = conn.query_row(
            "SELECT COUNT(*)
             FROM jobs j
             JOIN reviews r ON r.job_id = j.job_id
             WHERE j.owner = ?1 AND j.repo_name = ?2 AND j.pr_number = ?3
               AND j.enqueued_at > ?4 AND r.status = 'completed'",
            params![owner, repo_name, pr_number as i64, enqueued_at],
            |row| row.get(0),
        )?;
        Ok(newer > 0)
    }

    // ----- reviews -----

    /// Insert a terminal review row. The UNIQUE constraint on
    /// (repository_id, pr_number, head_sha) makes re-runs a no-op; returns
    /// whether a row was newly inserted.
    pub fn insert_review(&self, new: &NewReview) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO reviews
                 (repository_id, pr_number, pr_title, pr_url, review_text,
                  status, head_sha, job_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                new.repository_id,
                new.pr_number as i64,
                new.pr_title,
                new.pr_url,
                new.review_text,
                new.status.as_str(),
                new.head_sha,
                new.job_id,
                now,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn review_exists(
        &self,
        repository_id: i64,
        pr_number: u64,
        head_sha: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reviews
             WHERE repository_id = ?1 AND pr_number = ?2 AND head_sha = ?3",
            params![repository_id, pr_number as i64, head_sha],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn find_review(
        &self,
        repository_id: i64,
        pr_number: u64,
        head_sha: &str,
    ) -> Result<Option<ReviewRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let record = conn
            .query_row(
                "SELECT * FROM reviews
                 WHERE repository_id = ?1 AND pr_number = ?2 AND head_sha = ?3",
                params![repository_id, pr_number as i64, head_sha],
                Self::row_to_review,
            )
            .optional()?;
        Ok(record)
    }

    pub fn count_reviews_for_user(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM reviews r
             JOIN repositories repo ON repo.id = r.repository_id
             WHERE repo.user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_review(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewRecord> {
        let status: String = row.get("status")?;
        Ok(ReviewRecord {
            id: row.get("id")?,
            repository_id: row.get("repository_id")?,
            pr_number: row.get::<_, i64>("pr_number")? as u64,
            pr_title: row.get("pr_title")?,
            pr_url: row.get("pr_url")?,
            review_text: row.get("review_text")?,
            status: if status == "completed" {
                ReviewStatus::Completed
            } else {
                ReviewStatus::Failed
            },
            head_sha: row.get("head_sha")?,
            job_id: row.get("job_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    // ----- entitlements -----

    /// Atomic check-and-consume of one review unit.
    ///
    /// One transaction covers the read, the per-job dedup and the increment,
    /// so two concurrent jobs cannot both pass the gate on the last unit of
    /// quota, and redelivery of an already-consumed job never double-counts.
    pub fn try_consume_review(
        &self,
        job_id: &str,
        user_id: &str,
        repository_id: i64,
        limit: i64,
    ) -> Result<ConsumeOutcome> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;

        let already: i64 = tx.query_row(
            "SELECT COUNT(*) FROM consumed_jobs WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        if already > 0 {
            tx.commit()?;
            return Ok(ConsumeOutcome::AlreadyConsumed);
        }

        let used: i64 = tx
            .query_row(
                "SELECT review_count FROM review_usage
                 WHERE user_id = ?1 AND repository_id = ?2",
                params![user_id, repository_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if used >= limit {
            tx.commit()?;
            return Ok(ConsumeOutcome::Denied);
        }

        tx.execute(
            "INSERT INTO consumed_jobs (job_id) VALUES (?1)",
            params![job_id],
        )?;
        tx.execute(
            "INSERT INTO review_usage (user_id, repository_id, review_count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(user_id, repository_id)
                 DO UPDATE SET review_count = review_count + 1",
            params![user_id, repository_id],
        )?;
        tx.commit()?;

        Ok(ConsumeOutcome::Granted)
    }

    pub fn review_usage(&self, user_id: &str, repository_id: i64) -> Result<i64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let used = conn
            .query_row(
                "SELECT review_count FROM review_usage
                 WHERE user_id = ?1 AND repository_id = ?2",
                params![user_id, repository_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(used)
    }
}
