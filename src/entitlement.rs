//! Entitlement gate: "may this user perform one more billable action?"
//!
//! Denial is not a fault. A denied job still terminates with a user-visible
//! failed review record; the counter only ever moves for jobs the gate
//! accepted, and at most once per job id.

use anyhow::Result;

use crate::db::ConsumeOutcome;
use crate::store::Store;

/// Decision returned by the review gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Granted,
    Denied,
}

/// Read-only entitlement check. Prefer `check_and_consume` inside the
/// pipeline; this exists for display surfaces that must not consume quota.
pub async fn can_review(
    store: &Store,
    user_id: &str,
    repository_id: i64,
    limit: i64,
) -> Result<bool> {
    let used = store
        .review_usage(user_id.to_string(), repository_id)
        .await?;
    Ok(used < limit)
}

/// Atomically check the review quota and record consumption for this job.
///
/// The check and the increment happen in one storage transaction, so two
/// concurrent jobs cannot both pass on the last unit of quota. Redelivery of
/// a job that already consumed its unit is granted again without a second
/// increment.
pub async fn check_and_consume(
    store: &Store,
    job_id: &str,
    user_id: &str,
    repository_id: i64,
    limit: i64,
) -> Result<GateDecision> {
    let outcome = store
        .try_consume_review(job_id.to_string(), user_id.to_string(), repository_id, limit)
        .await?;
    Ok(match outcome {
        ConsumeOutcome::Granted | ConsumeOutcome::AlreadyConsumed => GateDecision::Granted,
        ConsumeOutcome::Denied => GateDecision::Denied,
    })
}

/// Whether the user may connect another repository.
pub async fn can_connect_repository(store: &Store, user_id: &str, limit: i64) -> Result<bool> {
    let connected = store
        .count_repositories_for_user(user_id.to_string())
        .await?;
    Ok(connected < limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewRepository;

    async fn store_with_repo() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let repo = store
            .insert_repository(NewRepository {
                github_id: 1,
                owner: "acme".to_string(),
                name: "widgets".to_string(),
                full_name: "acme/widgets".to_string(),
                url: "https://github.com/acme/widgets".to_string(),
                user_id: "user-1".to_string(),
                webhook_id: None,
            })
            .await
            .unwrap();
        (store, repo.id)
    }

    #[tokio::test]
    async fn test_gate_grants_then_denies_at_limit() {
        let (store, repo_id) = store_with_repo().await;

        assert_eq!(
            check_and_consume(&store, "job-1", "user-1", repo_id, 1)
                .await
                .unwrap(),
            GateDecision::Granted
        );
        assert_eq!(
            check_and_consume(&store, "job-2", "user-1", repo_id, 1)
                .await
                .unwrap(),
            GateDecision::Denied
        );
        assert!(!can_review(&store, "user-1", repo_id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_redelivered_job_is_granted_without_double_count() {
        let (store, repo_id) = store_with_repo().await;

        check_and_consume(&store, "job-1", "user-1", repo_id, 1)
            .await
            .unwrap();
        // Same job id delivered again: still granted, counter unchanged.
        assert_eq!(
            check_and_consume(&store, "job-1", "user-1", repo_id, 1)
                .await
                .unwrap(),
            GateDecision::Granted
        );
        assert_eq!(
            store
                .review_usage("user-1".to_string(), repo_id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_repository_connect_limit() {
        let (store, _repo_id) = store_with_repo().await;
        assert!(can_connect_repository(&store, "user-1", 2).await.unwrap());
        assert!(!can_connect_repository(&store, "user-1", 1).await.unwrap());
    }
}
