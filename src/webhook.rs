//! Inbound GitHub webhook endpoint.
//!
//! Every request is authenticated against the shared webhook secret via an
//! HMAC-SHA256 signature check before the handler sees it. The handler
//! itself stays thin: it turns qualifying pull-request events into queue
//! submissions and acknowledges everything else, because GitHub disables
//! hooks that keep failing.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::ReviewJob;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestHead,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestHead {
    pub sha: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: Owner,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Owner {
    pub login: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

type HmacSha256 = Hmac<Sha256>;

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.config.github_webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let event = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    // GitHub's delivery GUID doubles as our idempotency key; redelivery of
    // the same event carries the same GUID.
    let delivery_id = request
        .headers()
        .get("x-github-delivery")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: WebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    handle_event(&state, &event, delivery_id, payload).await
}

async fn handle_event(
    state: &AppState,
    event: &str,
    delivery_id: Option<String>,
    payload: WebhookPayload,
) -> Result<Json<WebhookResponse>, StatusCode> {
    if event == "ping" {
        info!("Received webhook ping");
        return Ok(Json(WebhookResponse {
            message: "pong".to_string(),
        }));
    }

    if event != "pull_request" {
        info!("Ignoring webhook event: {}", event);
        return Ok(Json(WebhookResponse {
            message: "ignored".to_string(),
        }));
    }

    match payload.action.as_deref() {
        Some("opened") | Some("synchronize") => {}
        other => {
            info!("Ignoring pull_request action: {:?}", other);
            return Ok(Json(WebhookResponse {
                message: "ignored".to_string(),
            }));
        }
    }

    let (Some(pr), Some(repository)) = (payload.pull_request, payload.repository) else {
        warn!("pull_request event missing pull request or repository data");
        return Err(StatusCode::BAD_REQUEST);
    };

    let repo = state
        .store
        .find_repository_by_full_name(repository.full_name.clone())
        .await
        .map_err(|e| {
            error!("Failed to look up repository: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let Some(repo) = repo else {
        // Stray hook from a repository nobody has connected.
        info!(
            "Ignoring pull_request event for unknown repository {}",
            repository.full_name
        );
        return Ok(Json(WebhookResponse {
            message: "repository not connected".to_string(),
        }));
    };

    let head_sha = pr.head.sha.clone();
    let job = ReviewJob {
        job_id: delivery_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        owner: repository.owner.login,
        repo_name: repository.name,
        pr_number: pr.number,
        head_sha: pr.head.sha,
        user_id: repo.user_id,
        enqueued_at: Utc::now().timestamp(),
    };

    let submitted = state.queue.submit(job).await.map_err(|e| {
        error!("Failed to enqueue review job: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let message = if submitted {
        info!(
            "Queued review for {}#{} at {}",
            repo.full_name, pr.number, head_sha
        );
        "review queued"
    } else {
        info!(
            "Duplicate delivery for {}#{}, ignoring",
            repo.full_name, pr.number
        );
        "duplicate delivery"
    };

    Ok(Json(WebhookResponse {
        message: message.to_string(),
    }))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
