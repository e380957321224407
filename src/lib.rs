pub mod config;
pub mod context;
pub mod db;
pub mod entitlement;
pub mod error;
pub mod github;
pub mod openai;
pub mod pipeline;
pub mod queue;
pub mod registrar;
pub mod sink;
pub mod stats;
pub mod store;
pub mod webhook;

#[cfg(test)]
pub mod test_support;

use std::sync::Arc;

pub use db::{RepositoryRecord, ReviewJob, ReviewRecord, ReviewStatus};
pub use error::JobError;
pub use github::ProviderClient;
pub use openai::ReviewBackend;
pub use queue::JobQueue;
pub use store::Store;

use config::Config;

/// Shared handles for the HTTP layer and the review workers.
///
/// Everything here is either cheaply cloneable or behind an `Arc`; nothing
/// holds a lock across an await point.
pub struct AppState {
    pub provider: Arc<dyn ProviderClient>,
    pub backend: Arc<dyn ReviewBackend>,
    pub store: Store,
    pub queue: JobQueue,
    pub config: Config,
}
