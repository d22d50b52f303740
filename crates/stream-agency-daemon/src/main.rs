//! Stream Agency daemon binary: the Admin HTTP API plus, optionally, the
//! scheduler driver loop running in the same process.

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use stream_agency_client::HttpStreamClient;
use stream_agency_config::RuntimeConfig;
use stream_agency_core::Scheduler;
use stream_agency_daemon::{routes, runtime, state::AppState};
use stream_agency_settlement::ClawpySettlementExecutor;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "daemon exited with error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cfg = RuntimeConfig::from_env();
    cfg.validate()?;

    let pool = stream_agency_db::connect_from_env().await?;
    stream_agency_db::migrate(&pool).await?;

    let stream_client: Arc<dyn stream_agency_client::StreamClient> =
        Arc::new(HttpStreamClient::new(cfg.stream_url.clone()));
    let epoch_oracle: Option<Arc<dyn stream_agency_client::EpochOracle>> = if cfg.billing_enabled {
        Some(Arc::new(stream_agency_client::HttpEpochOracle::new(
            cfg.epoch_api_url.clone(),
        )))
    } else {
        None
    };
    let settlement_executor: Option<Arc<dyn stream_agency_settlement::SettlementExecutor>> =
        if cfg.billing_enabled {
            Some(Arc::new(ClawpySettlementExecutor::from_runtime_config(&cfg)?))
        } else {
            None
        };

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        stream_client.clone(),
        epoch_oracle,
        settlement_executor,
        cfg.clone(),
    ));

    let api_token = std::env::var("STREAM_AGENCY_API_TOKEN").ok();
    let host = std::env::var("STREAM_AGENCY_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("STREAM_AGENCY_API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8787);
    let with_scheduler = std::env::var("STREAM_AGENCY_WITH_SCHEDULER")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(true);

    let app_state = AppState {
        pool,
        cfg: cfg.clone(),
        stream_client,
        scheduler: scheduler.clone(),
        api_token,
    };

    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let scheduler_handle = if with_scheduler {
        Some(tokio::spawn(runtime::scheduler_loop(
            scheduler,
            cfg.poll_interval_seconds,
        )))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    info!(%host, port, "stream-agency-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(runtime::shutdown_signal())
        .await?;

    if let Some(handle) = scheduler_handle {
        runtime::abort_with_grace(handle).await;
    }

    Ok(())
}
