//! Dashboard statistics: a small read-only aggregation of provider activity
//! and local review history.
//!
//! Stats are decorative. If GitHub is unreachable or the token is stale the
//! endpoint degrades to zeroes instead of failing, so a dashboard render
//! never breaks on a provider hiccup.

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_commits: u64,
    pub total_prs: u64,
    pub total_reviews: i64,
    pub total_repos: i64,
}

pub async fn dashboard_stats(state: &AppState, user_id: &str) -> DashboardStats {
    match try_dashboard_stats(state, user_id).await {
        Ok(stats) => stats,
        Err(e) => {
            warn!("Failed to compute dashboard stats for {}: {:#}", user_id, e);
            DashboardStats::default()
        }
    }
}

async fn try_dashboard_stats(state: &AppState, user_id: &str) -> Result<DashboardStats> {
    let token = state
        .store
        .access_token(user_id.to_string())
        .await?
        .context("no GitHub access token on file for this user")?;

    let login = state
        .provider
        .get_authenticated_user(&token)
        .await
        .context("Failed to resolve GitHub login")?;

    let calendar = state
        .provider
        .fetch_user_contributions(&token, &login)
        .await
        .context("Failed to fetch contribution calendar")?;

    let total_prs = state
        .provider
        .search_author_pull_requests(&token, &login)
        .await
        .context("Failed to count authored pull requests")?;

    let total_reviews = state.store.count_reviews_for_user(user_id.to_string()).await?;
    let total_repos = state
        .store
        .count_repositories_for_user(user_id.to_string())
        .await?;

    Ok(DashboardStats {
        total_commits: calendar.total_contributions,
        total_prs,
        total_reviews,
        total_repos,
    })
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub user_id: String,
}

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<DashboardStats>, StatusCode> {
    Ok(Json(dashboard_stats(&state, &query.user_id).await))
}
