//! Diff and repository-context retrieval.
//!
//! Fetches what the reviewer needs to see: the pull request's metadata and
//! unified diff, plus an optional bounded sample of repository files for
//! additional context. The tree walk uses an explicit work list rather than
//! recursion so arbitrarily deep trees cannot blow the stack, and a
//! file-count/byte budget so large repositories yield partial context instead
//! of unbounded work.

use tracing::{info, warn};

use crate::error::JobError;
use crate::github::{EntryKind, ProviderClient, ProviderError};

/// Extensions excluded from context collection: binary and media formats
/// whose contents are useless as review context.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "bmp", "tiff",
    // archives
    "zip", "tar", "gz", "bz2", "xz", "rar", "7z", "jar",
    // documents
    "pdf",
    // audio / video
    "mp3", "wav", "ogg", "mp4", "avi", "mov", "mkv", "webm",
    // fonts and compiled artifacts
    "woff", "woff2", "ttf", "eot", "otf", "so", "dylib", "dll", "exe", "wasm", "o", "a", "class",
];

/// Everything the review engine needs about one pull request.
#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub title: String,
    pub description: String,
    pub diff: String,
    pub pr_url: String,
    pub head_sha: String,
}

/// Transient (path, content) pair collected during tree walking. Never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_files: usize,
    pub max_total_bytes: u64,
}

fn classify(err: ProviderError, what: &str) -> JobError {
    if err.is_transient() {
        JobError::Transient {
            message: format!("{}: {}", what, err),
        }
    } else {
        JobError::Retrieval {
            message: match &err {
                ProviderError::Status { status: 404, .. } => "pull request not found".to_string(),
                ProviderError::Status { status: 401, .. }
                | ProviderError::Status { status: 403, .. } => {
                    "repository access denied".to_string()
                }
                _ => format!("{}: {}", what, err),
            },
        }
    }
}

/// Fetch the pull request's diff, title and description.
///
/// A 404/403 here means the PR or repository is gone or the token no longer
/// works; that is terminal and the job must not be retried.
pub async fn fetch_review_input(
    provider: &dyn ProviderClient,
    token: &str,
    owner: &str,
    repo: &str,
    pr_number: u64,
) -> Result<ReviewInput, JobError> {
    let details = provider
        .get_pull_request(token, owner, repo, pr_number)
        .await
        .map_err(|e| classify(e, "fetching pull request"))?;

    let diff = provider
        .get_pull_request_diff(token, owner, repo, pr_number)
        .await
        .map_err(|e| classify(e, "fetching diff"))?;

    Ok(ReviewInput {
        title: details.title,
        description: details.body.unwrap_or_default(),
        diff,
        pr_url: details.html_url,
        head_sha: details.head.sha,
    })
}

/// Whether a path is excluded from context collection by extension.
pub fn is_excluded_path(path: &str) -> bool {
    let extension = match path.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return false,
    };
    EXCLUDED_EXTENSIONS.contains(&extension.as_str())
}

/// Walk the repository tree collecting text files, up to the budget.
///
/// Directory listings that fail transiently propagate so the job-level retry
/// budget applies; a failed fetch of a single file is skipped and logged,
/// never aborting the whole review. Exceeding the budget stops the walk
/// gracefully with whatever was collected so far.
pub async fn collect_repository_context(
    provider: &dyn ProviderClient,
    token: &str,
    owner: &str,
    repo: &str,
    budget: ContextBudget,
) -> Result<Vec<ContextFile>, JobError> {
    let mut files: Vec<ContextFile> = Vec::new();
    let mut total_bytes: u64 = 0;
    // Explicit work list instead of recursion.
    let mut pending_dirs: Vec<String> = vec![String::new()];

    while let Some(dir) = pending_dirs.pop() {
        let entries = match provider.list_directory(token, owner, repo, &dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_transient() => {
                return Err(JobError::Transient {
                    message: format!("listing '{}': {}", dir, e),
                });
            }
            Err(e) => {
                warn!("Skipping directory '{}': {}", dir, e);
                continue;
            }
        };

        for entry in entries {
            match entry.kind {
                EntryKind::Dir => pending_dirs.push(entry.path),
                EntryKind::File => {
                    if is_excluded_path(&entry.path) {
                        continue;
                    }
                    if files.len() >= budget.max_files {
                        info!(
                            "Context file budget reached ({} files), stopping walk",
                            budget.max_files
                        );
                        return Ok(files);
                    }

                    match provider
                        .get_file_content(token, owner, repo, &entry.path)
                        .await
                    {
                        Ok(content) => {
                            total_bytes += content.len() as u64;
                            files.push(ContextFile {
                                path: entry.path,
                                content,
                            });
                            if total_bytes >= budget.max_total_bytes {
                                info!(
                                    "Context byte budget reached ({} bytes), stopping walk",
                                    total_bytes
                                );
                                return Ok(files);
                            }
                        }
                        Err(e) => {
                            warn!("Skipping file '{}': {}", entry.path, e);
                        }
                    }
                }
                EntryKind::Other => {}
            }
        }
    }

    info!(
        "Collected {} context files ({} bytes)",
        files.len(),
        total_bytes
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProvider;

    #[test]
    fn test_is_excluded_path() {
        assert!(is_excluded_path("assets/logo.png"));
        assert!(is_excluded_path("docs/manual.PDF"));
        assert!(is_excluded_path("dist/bundle.tar.gz"));
        assert!(!is_excluded_path("src/main.rs"));
        assert!(!is_excluded_path("README.md"));
        assert!(!is_excluded_path("Makefile"));
    }

    #[tokio::test]
    async fn test_walk_excludes_binary_but_keeps_sibling_text() {
        let provider = FakeProvider::new()
            .with_dir("", &[("src", true), ("logo.png", false), ("README.md", false)])
            .with_dir("src", &[("src/main.rs", false)])
            .with_file("logo.png", "\u{fffd}binary\u{fffd}")
            .with_file("README.md", "# hello")
            .with_file("src/main.rs", "fn main() {}");

        let files = collect_repository_context(
            &provider,
            "token",
            "acme",
            "widgets",
            ContextBudget {
                max_files: 10,
                max_total_bytes: 1_000_000,
            },
        )
        .await
        .unwrap();

        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"README.md"));
        assert!(paths.contains(&"src/main.rs"));
        assert!(!paths.contains(&"logo.png"));
    }

    #[tokio::test]
    async fn test_walk_stops_at_file_budget() {
        let provider = FakeProvider::new()
            .with_dir(
                "",
                &[("a.rs", false), ("b.rs", false), ("c.rs", false)],
            )
            .with_file("a.rs", "a")
            .with_file("b.rs", "b")
            .with_file("c.rs", "c");

        let files = collect_repository_context(
            &provider,
            "token",
            "acme",
            "widgets",
            ContextBudget {
                max_files: 2,
                max_total_bytes: 1_000_000,
            },
        )
        .await
        .unwrap();

        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_walk_stops_at_byte_budget() {
        let provider = FakeProvider::new()
            .with_dir("", &[("big.rs", false), ("late.rs", false)])
            .with_file("big.rs", &"x".repeat(100))
            .with_file("late.rs", "y");

        let files = collect_repository_context(
            &provider,
            "token",
            "acme",
            "widgets",
            ContextBudget {
                max_files: 10,
                max_total_bytes: 50,
            },
        )
        .await
        .unwrap();

        // The walk stops as soon as the byte budget is crossed.
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "big.rs");
    }

    #[tokio::test]
    async fn test_single_file_failure_does_not_abort_walk() {
        let provider = FakeProvider::new()
            .with_dir("", &[("ok.rs", false), ("broken.rs", false)])
            .with_file("ok.rs", "fine")
            .with_failing_file("broken.rs");

        let files = collect_repository_context(
            &provider,
            "token",
            "acme",
            "widgets",
            ContextBudget {
                max_files: 10,
                max_total_bytes: 1_000_000,
            },
        )
        .await
        .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "ok.rs");
    }

    #[tokio::test]
    async fn test_fetch_review_input_classifies_missing_pr_as_terminal() {
        let provider = FakeProvider::new().with_pull_request_status(404);

        let err = fetch_review_input(&provider, "token", "acme", "widgets", 42)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.diagnostic(), "pull request not found");
    }

    #[tokio::test]
    async fn test_fetch_review_input_classifies_rate_limit_as_retryable() {
        let provider = FakeProvider::new().with_pull_request_status(429);

        let err = fetch_review_input(&provider, "token", "acme", "widgets", 42)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
