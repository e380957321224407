use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    pub github_webhook_secret: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub port: u16,
    /// Public base URL of this service, used when registering provider-side
    /// webhooks (e.g. "https://reviewd.example.com").
    pub public_base_url: String,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub worker_count: usize,
    /// Maximum number of delivery attempts per job before the job is routed
    /// to the failure sink.
    pub max_job_attempts: u32,
    /// Base delay in seconds for exponential retry backoff.
    pub retry_base_secs: i64,
    /// Cap on the retry backoff delay in seconds.
    pub retry_max_backoff_secs: i64,
    /// Timeout applied to every outbound HTTP call.
    pub request_timeout_secs: u64,
    /// Upper bound on files collected during repository tree walking.
    pub max_context_files: usize,
    /// Upper bound on total bytes collected during repository tree walking.
    pub max_context_bytes: u64,
    /// Reviews allowed per (user, repository) in the current billing period.
    pub review_limit: i64,
    /// Connected repositories allowed per user.
    pub repository_limit: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_webhook_secret = env::var("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let openai_api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable is required")?;

        let openai_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .context("PUBLIC_BASE_URL environment variable is required")?
            .trim_end_matches('/')
            .to_string();

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let worker_count = parse_or_default("WORKER_COUNT", 4)?;
        let max_job_attempts = parse_or_default("MAX_JOB_ATTEMPTS", 4)?;
        let retry_base_secs = parse_or_default("RETRY_BASE_SECS", 30)?;
        let retry_max_backoff_secs = parse_or_default("RETRY_MAX_BACKOFF_SECS", 900)?;
        let request_timeout_secs = parse_or_default("REQUEST_TIMEOUT_SECS", 60)?;
        let max_context_files = parse_or_default("MAX_CONTEXT_FILES", 50)?;
        let max_context_bytes = parse_or_default("MAX_CONTEXT_BYTES", 2_000_000)?;
        let review_limit = parse_or_default("REVIEW_LIMIT", 20)?;
        let repository_limit = parse_or_default("REPOSITORY_LIMIT", 5)?;

        Ok(Config {
            github_webhook_secret,
            openai_api_key,
            openai_model,
            port,
            public_base_url,
            state_dir,
            worker_count,
            max_job_attempts,
            retry_base_secs,
            retry_max_backoff_secs,
            request_timeout_secs,
            max_context_files,
            max_context_bytes,
            review_limit,
            repository_limit,
        })
    }

    /// The endpoint provider-side webhooks should deliver to.
    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.public_base_url)
    }
}

fn parse_or_default<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}
