//! Repository registration: connecting a repository wires up the provider
//! webhook, disconnecting tears it down.
//!
//! Webhook deletion is best effort. A repository row is always removed on
//! disconnect even if the provider-side hook cannot be deleted; a stray hook
//! delivers events for an unknown repository, which the webhook handler
//! ignores.

use anyhow::{bail, Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::{NewRepository, RepositoryRecord};
use crate::entitlement;
use crate::github::RepoSummary;
use crate::AppState;

/// Connect a repository for a user: register (or reuse) the provider webhook
/// and persist the repository record. Connecting an already-connected
/// repository refreshes the existing record rather than duplicating it.
pub async fn connect(
    state: &AppState,
    user_id: &str,
    owner: &str,
    name: &str,
    github_id: u64,
) -> Result<RepositoryRecord> {
    let token = state
        .store
        .access_token(user_id.to_string())
        .await?
        .context("no GitHub access token on file for this user")?;

    if !entitlement::can_connect_repository(&state.store, user_id, state.config.repository_limit)
        .await?
    {
        bail!("repository limit reached");
    }

    let full_name = format!("{}/{}", owner, name);
    let hook_url = state.config.webhook_url();

    // Reuse a hook pointing at us if one survives from an earlier connect.
    let existing = state
        .provider
        .list_webhooks(&token, owner, name)
        .await
        .context("Failed to list repository webhooks")?
        .into_iter()
        .find(|hook| hook.url == hook_url);

    let webhook_id = match existing {
        Some(hook) => {
            info!("Reusing existing webhook {} on {}", hook.id, full_name);
            hook.id
        }
        None => {
            let id = state
                .provider
                .create_webhook(
                    &token,
                    owner,
                    name,
                    &hook_url,
                    &state.config.github_webhook_secret,
                )
                .await
                .context("Failed to create repository webhook")?;
            info!("Created webhook {} on {}", id, full_name);
            id
        }
    };

    let record = state
        .store
        .insert_repository(NewRepository {
            github_id,
            owner: owner.to_string(),
            name: name.to_string(),
            full_name: full_name.clone(),
            url: format!("https://github.com/{}", full_name),
            user_id: user_id.to_string(),
            webhook_id: Some(webhook_id),
        })
        .await?;

    trigger_indexing(&record);
    Ok(record)
}

/// Kick off background indexing of a freshly connected repository.
fn trigger_indexing(repo: &RepositoryRecord) {
    info!("Scheduling context indexing for {}", repo.full_name);
}

/// Disconnect one repository. The caller must own it.
pub async fn disconnect(state: &AppState, user_id: &str, repository_id: i64) -> Result<()> {
    let repo = state
        .store
        .find_repository(repository_id)
        .await?
        .context("repository not found")?;
    if repo.user_id != user_id {
        bail!("repository does not belong to this user");
    }

    remove_webhook(state, user_id, &repo).await;
    state.store.delete_repository(repo.id).await?;
    info!("Disconnected repository {}", repo.full_name);
    Ok(())
}

/// Disconnect every repository the user has connected. Returns how many were
/// removed. Individual webhook deletions may fail without aborting the rest.
pub async fn disconnect_all(state: &AppState, user_id: &str) -> Result<usize> {
    let repos = state
        .store
        .list_repositories_for_user(user_id.to_string())
        .await?;

    let mut removed = 0;
    for repo in &repos {
        remove_webhook(state, user_id, repo).await;
        if state.store.delete_repository(repo.id).await? {
            removed += 1;
        }
    }
    info!("Disconnected {} repositories for {}", removed, user_id);
    Ok(removed)
}

/// Best-effort removal of the provider-side webhook.
async fn remove_webhook(state: &AppState, user_id: &str, repo: &RepositoryRecord) {
    let Some(webhook_id) = repo.webhook_id else {
        return;
    };
    let token = match state.store.access_token(user_id.to_string()).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!(
                "No access token for {}, leaving webhook {} on {}",
                user_id, webhook_id, repo.full_name
            );
            return;
        }
        Err(e) => {
            warn!("Failed to load access token for {}: {:#}", user_id, e);
            return;
        }
    };
    if let Err(e) = state
        .provider
        .delete_webhook(&token, &repo.owner, &repo.name, webhook_id)
        .await
    {
        warn!(
            "Failed to delete webhook {} on {}: {}",
            webhook_id, repo.full_name, e
        );
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub user_id: String,
    pub owner: String,
    pub name: String,
    pub github_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Serialize)]
pub struct DisconnectAllResponse {
    pub removed: usize,
}

async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<RepositoryRecord>, (StatusCode, String)> {
    connect(
        &state,
        &request.user_id,
        &request.owner,
        &request.name,
        request.github_id,
    )
    .await
    .map(Json)
    .map_err(|e| {
        error!("Failed to connect repository: {:#}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Path(repository_id): Path<i64>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    disconnect(&state, &query.user_id, repository_id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| {
            error!("Failed to disconnect repository: {:#}", e);
            (StatusCode::BAD_REQUEST, e.to_string())
        })
}

async fn disconnect_all_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UserQuery>,
) -> Result<Json<DisconnectAllResponse>, StatusCode> {
    let removed = disconnect_all(&state, &request.user_id).await.map_err(|e| {
        error!("Failed to disconnect repositories: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(DisconnectAllResponse { removed }))
}

async fn list_connected_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<RepositoryRecord>>, StatusCode> {
    state
        .store
        .list_repositories_for_user(query.user_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to list repositories: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// Repositories the user could connect, straight from the provider.
async fn list_available_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<RepoSummary>>, (StatusCode, String)> {
    let token = state
        .store
        .access_token(query.user_id)
        .await
        .map_err(|e| {
            error!("Failed to load access token: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
        })?
        .ok_or((
            StatusCode::BAD_REQUEST,
            "no GitHub access token on file for this user".to_string(),
        ))?;

    state
        .provider
        .get_repositories(&token, 1, 100)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to list provider repositories: {}", e);
            (StatusCode::BAD_GATEWAY, e.to_string())
        })
}

pub fn repository_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/repositories", get(list_connected_handler))
        .route("/repositories", post(connect_handler))
        .route("/repositories/available", get(list_available_handler))
        .route("/repositories/disconnect_all", post(disconnect_all_handler))
        .route("/repositories/:id", delete(disconnect_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state_with, FakeBackend, FakeProvider};

    async fn state_with_token(provider: FakeProvider) -> crate::AppState {
        let state = test_state_with(provider, FakeBackend::ok("x"));
        state
            .store
            .upsert_account("user-1".to_string(), "token".to_string())
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_connect_creates_webhook_and_record() {
        let provider = FakeProvider::new();
        let state = state_with_token(provider.clone()).await;

        let repo = connect(&state, "user-1", "acme", "widgets", 777)
            .await
            .unwrap();

        assert_eq!(repo.full_name, "acme/widgets");
        let hooks = provider.webhooks();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].url, "https://reviewd.test/webhook");
        assert_eq!(repo.webhook_id, Some(hooks[0].id));
    }

    #[tokio::test]
    async fn test_connect_reuses_existing_webhook() {
        let provider = FakeProvider::new().with_webhook(55, "https://reviewd.test/webhook");
        let state = state_with_token(provider.clone()).await;

        let repo = connect(&state, "user-1", "acme", "widgets", 777)
            .await
            .unwrap();

        assert_eq!(repo.webhook_id, Some(55));
        assert_eq!(provider.webhooks().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_enforces_repository_limit() {
        let provider = FakeProvider::new();
        let mut state = test_state_with(provider, FakeBackend::ok("x"));
        state.config.repository_limit = 1;
        state
            .store
            .upsert_account("user-1".to_string(), "token".to_string())
            .await
            .unwrap();

        connect(&state, "user-1", "acme", "widgets", 777)
            .await
            .unwrap();
        let err = connect(&state, "user-1", "acme", "gadgets", 778)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("repository limit reached"));
    }

    #[tokio::test]
    async fn test_disconnect_removes_webhook_and_record() {
        let provider = FakeProvider::new();
        let state = state_with_token(provider.clone()).await;
        let repo = connect(&state, "user-1", "acme", "widgets", 777)
            .await
            .unwrap();

        disconnect(&state, "user-1", repo.id).await.unwrap();

        assert!(state.store.find_repository(repo.id).await.unwrap().is_none());
        assert_eq!(provider.deleted_webhooks().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_other_users() {
        let provider = FakeProvider::new();
        let state = state_with_token(provider).await;
        let repo = connect(&state, "user-1", "acme", "widgets", 777)
            .await
            .unwrap();

        let err = disconnect(&state, "user-2", repo.id).await.unwrap_err();
        assert!(err.to_string().contains("does not belong"));
        assert!(state.store.find_repository(repo.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_all_survives_webhook_failures() {
        let provider = FakeProvider::new();
        let state = state_with_token(provider.clone()).await;
        let a = connect(&state, "user-1", "acme", "alpha", 1).await.unwrap();
        connect(&state, "user-1", "acme", "beta", 2).await.unwrap();
        connect(&state, "user-1", "acme", "gamma", 3).await.unwrap();

        // Deleting alpha's webhook fails; all rows must still go.
        let provider = provider.with_failing_webhook_delete(a.webhook_id.unwrap());

        let removed = disconnect_all(&state, "user-1").await.unwrap();
        assert_eq!(removed, 3);
        assert!(state
            .store
            .list_repositories_for_user("user-1".to_string())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(provider.deleted_webhooks().len(), 2);
    }
}
