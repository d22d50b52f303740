use std::sync::Arc;

use sqlx::SqlitePool;
use stream_agency_client::StreamClient;
use stream_agency_config::RuntimeConfig;
use stream_agency_core::Scheduler;

/// Shared state handed to every axum handler. Cheap to clone: everything
/// inside is already an `Arc` or a `SqlitePool` (itself a pool of pooled
/// connections, safe to share across tasks).
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub cfg: RuntimeConfig,
    pub stream_client: Arc<dyn StreamClient>,
    pub scheduler: Arc<Scheduler>,
    pub api_token: Option<String>,
}
