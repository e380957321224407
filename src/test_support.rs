//! Shared fixtures for unit tests: an in-memory application state plus fake
//! provider and review-backend implementations with scriptable failures.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Config;
use crate::context::{ContextFile, ReviewInput};
use crate::db::{NewRepository, RepositoryRecord, ReviewJob};
use crate::github::{
    ContributionCalendar, ContributionDay, ContributionWeek, EntryKind, ProviderClient,
    ProviderError, PullRequestDetails, PullRequestRef, RepoSummary, TreeEntry, WebhookInfo,
};
use crate::openai::{BackendError, ReviewBackend};
use crate::queue::JobQueue;
use crate::store::Store;
use crate::AppState;

pub fn test_config() -> Config {
    Config {
        github_webhook_secret: "test-secret".to_string(),
        openai_api_key: "test-key".to_string(),
        openai_model: "gpt-4o-mini".to_string(),
        port: 0,
        public_base_url: "https://reviewd.test".to_string(),
        state_dir: PathBuf::from("."),
        worker_count: 1,
        max_job_attempts: 3,
        retry_base_secs: 1,
        retry_max_backoff_secs: 900,
        request_timeout_secs: 5,
        max_context_files: 50,
        max_context_bytes: 2_000_000,
        review_limit: 20,
        repository_limit: 5,
    }
}

pub fn test_state_with<P, B>(provider: P, backend: B) -> AppState
where
    P: ProviderClient + 'static,
    B: ReviewBackend + 'static,
{
    let store = Store::open_in_memory().unwrap();
    let queue = JobQueue::new(store.clone());
    AppState {
        provider: Arc::new(provider),
        backend: Arc::new(backend),
        store,
        queue,
        config: test_config(),
    }
}

/// Register the standard test account and repository: `acme/widgets` owned by
/// `user-1` whose access token is on file.
pub async fn connect_sample_repo(state: &AppState) -> RepositoryRecord {
    state
        .store
        .upsert_account("user-1".to_string(), "token".to_string())
        .await
        .unwrap();
    state
        .store
        .insert_repository(NewRepository {
            github_id: 777,
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            full_name: "acme/widgets".to_string(),
            url: "https://github.com/acme/widgets".to_string(),
            user_id: "user-1".to_string(),
            webhook_id: Some(1),
        })
        .await
        .unwrap()
}

pub fn sample_job(job_id: &str, head_sha: &str, enqueued_at: i64) -> ReviewJob {
    ReviewJob {
        job_id: job_id.to_string(),
        owner: "acme".to_string(),
        repo_name: "widgets".to_string(),
        pr_number: 42,
        head_sha: head_sha.to_string(),
        user_id: "user-1".to_string(),
        enqueued_at,
    }
}

#[derive(Default)]
struct FakeProviderInner {
    dirs: HashMap<String, Vec<TreeEntry>>,
    files: HashMap<String, String>,
    failing_files: HashSet<String>,
    pull_request_status: Option<u16>,
    failing_comments: bool,
    failing_contributions: bool,
    comments: Vec<String>,
    // Webhooks keyed by "owner/repo"; `None` (pre-registered via
    // `with_webhook`) is visible from every repository.
    webhooks: Vec<(Option<String>, WebhookInfo)>,
    failing_webhook_deletes: HashSet<u64>,
    deleted_webhooks: Vec<u64>,
    next_webhook_id: u64,
    repositories: Vec<RepoSummary>,
}

/// Scriptable in-memory `ProviderClient`. Clones share state, so a test can
/// keep a handle for assertions after moving a clone into `AppState`.
#[derive(Clone)]
pub struct FakeProvider {
    inner: Arc<Mutex<FakeProviderInner>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeProviderInner {
                next_webhook_id: 100,
                ..Default::default()
            })),
        }
    }

    /// Script a directory listing. Each entry is `(path, is_dir)`.
    pub fn with_dir(self, dir: &str, entries: &[(&str, bool)]) -> Self {
        let listing = entries
            .iter()
            .map(|(path, is_dir)| TreeEntry {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                path: path.to_string(),
                kind: if *is_dir { EntryKind::Dir } else { EntryKind::File },
            })
            .collect();
        self.inner
            .lock()
            .unwrap()
            .dirs
            .insert(dir.to_string(), listing);
        self
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Make fetching this file fail with a decode error.
    pub fn with_failing_file(self, path: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .failing_files
            .insert(path.to_string());
        self
    }

    /// Make pull-request and diff fetches fail with this HTTP status.
    pub fn with_pull_request_status(self, status: u16) -> Self {
        self.inner.lock().unwrap().pull_request_status = Some(status);
        self
    }

    pub fn with_failing_comments(self) -> Self {
        self.inner.lock().unwrap().failing_comments = true;
        self
    }

    pub fn with_failing_contributions(self) -> Self {
        self.inner.lock().unwrap().failing_contributions = true;
        self
    }

    /// Pre-register an existing provider-side webhook.
    pub fn with_webhook(self, id: u64, url: &str) -> Self {
        self.inner.lock().unwrap().webhooks.push((
            None,
            WebhookInfo {
                id,
                url: url.to_string(),
            },
        ));
        self
    }

    /// Make deleting this webhook fail.
    pub fn with_failing_webhook_delete(self, id: u64) -> Self {
        self.inner.lock().unwrap().failing_webhook_deletes.insert(id);
        self
    }

    pub fn with_repository(self, id: u64, owner: &str, name: &str) -> Self {
        self.inner.lock().unwrap().repositories.push(RepoSummary {
            id,
            name: name.to_string(),
            full_name: format!("{}/{}", owner, name),
            html_url: format!("https://github.com/{}/{}", owner, name),
            owner: crate::github::RepoOwner {
                login: owner.to_string(),
            },
        });
        self
    }

    pub fn comments(&self) -> Vec<String> {
        self.inner.lock().unwrap().comments.clone()
    }

    pub fn webhooks(&self) -> Vec<WebhookInfo> {
        self.inner
            .lock()
            .unwrap()
            .webhooks
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect()
    }

    pub fn deleted_webhooks(&self) -> Vec<u64> {
        self.inner.lock().unwrap().deleted_webhooks.clone()
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn get_pull_request(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<PullRequestDetails, ProviderError> {
        if let Some(status) = self.inner.lock().unwrap().pull_request_status {
            return Err(ProviderError::Status {
                status,
                message: "scripted failure".to_string(),
            });
        }
        Ok(PullRequestDetails {
            number: pr_number,
            title: "Add cache".to_string(),
            body: Some("Speeds up lookups.".to_string()),
            html_url: format!("https://github.com/{}/{}/pull/{}", owner, repo, pr_number),
            head: PullRequestRef {
                sha: "abc123".to_string(),
            },
        })
    }

    async fn get_pull_request_diff(
        &self,
        _token: &str,
        _owner: &str,
        _repo: &str,
        _pr_number: u64,
    ) -> Result<String, ProviderError> {
        if let Some(status) = self.inner.lock().unwrap().pull_request_status {
            return Err(ProviderError::Status {
                status,
                message: "scripted failure".to_string(),
            });
        }
        Ok("diff --git a/src/cache.rs b/src/cache.rs\n+pub struct Cache;\n".to_string())
    }

    async fn list_directory(
        &self,
        _token: &str,
        _owner: &str,
        _repo: &str,
        path: &str,
    ) -> Result<Vec<TreeEntry>, ProviderError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .dirs
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_file_content(
        &self,
        _token: &str,
        _owner: &str,
        _repo: &str,
        path: &str,
    ) -> Result<String, ProviderError> {
        let inner = self.inner.lock().unwrap();
        if inner.failing_files.contains(path) {
            return Err(ProviderError::Decode(format!(
                "invalid base64 in '{}'",
                path
            )));
        }
        inner
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                message: format!("no such file '{}'", path),
            })
    }

    async fn create_issue_comment(
        &self,
        _token: &str,
        _owner: &str,
        _repo: &str,
        _issue_number: u64,
        body: &str,
    ) -> Result<u64, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_comments {
            return Err(ProviderError::Status {
                status: 502,
                message: "scripted failure".to_string(),
            });
        }
        inner.comments.push(body.to_string());
        Ok(inner.comments.len() as u64)
    }

    async fn list_webhooks(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<WebhookInfo>, ProviderError> {
        let full_name = format!("{}/{}", owner, repo);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .webhooks
            .iter()
            .filter(|(key, _)| key.as_deref().map_or(true, |k| k == full_name))
            .map(|(_, hook)| hook.clone())
            .collect())
    }

    async fn create_webhook(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        hook_url: &str,
        _secret: &str,
    ) -> Result<u64, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_webhook_id;
        inner.next_webhook_id += 1;
        inner.webhooks.push((
            Some(format!("{}/{}", owner, repo)),
            WebhookInfo {
                id,
                url: hook_url.to_string(),
            },
        ));
        Ok(id)
    }

    async fn delete_webhook(
        &self,
        _token: &str,
        _owner: &str,
        _repo: &str,
        hook_id: u64,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_webhook_deletes.contains(&hook_id) {
            return Err(ProviderError::Status {
                status: 500,
                message: "scripted failure".to_string(),
            });
        }
        inner.webhooks.retain(|(_, hook)| hook.id != hook_id);
        inner.deleted_webhooks.push(hook_id);
        Ok(())
    }

    async fn get_repositories(
        &self,
        _token: &str,
        _page: u32,
        _per_page: u32,
    ) -> Result<Vec<RepoSummary>, ProviderError> {
        Ok(self.inner.lock().unwrap().repositories.clone())
    }

    async fn get_authenticated_user(&self, _token: &str) -> Result<String, ProviderError> {
        Ok("octocat".to_string())
    }

    async fn search_author_pull_requests(
        &self,
        _token: &str,
        _login: &str,
    ) -> Result<u64, ProviderError> {
        Ok(12)
    }

    async fn fetch_user_contributions(
        &self,
        _token: &str,
        _login: &str,
    ) -> Result<ContributionCalendar, ProviderError> {
        if self.inner.lock().unwrap().failing_contributions {
            return Err(ProviderError::Status {
                status: 502,
                message: "scripted failure".to_string(),
            });
        }
        Ok(ContributionCalendar {
            total_contributions: 321,
            weeks: vec![ContributionWeek {
                contribution_days: vec![ContributionDay {
                    contribution_count: 321,
                    date: "2024-01-01".to_string(),
                    color: "#216e39".to_string(),
                }],
            }],
        })
    }
}

/// Canned `ReviewBackend`: either always returns the given text or always
/// fails with a retryable backend error.
pub struct FakeBackend {
    response: Option<String>,
}

impl FakeBackend {
    pub fn ok(text: &str) -> Self {
        Self {
            response: Some(text.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { response: None }
    }
}

#[async_trait]
impl ReviewBackend for FakeBackend {
    async fn generate_review(
        &self,
        _input: &ReviewInput,
        _context: &[ContextFile],
    ) -> Result<String, BackendError> {
        match &self.response {
            Some(text) => Ok(text.clone()),
            None => Err(BackendError::Status {
                status: 500,
                message: "scripted failure".to_string(),
            }),
        }
    }
}
