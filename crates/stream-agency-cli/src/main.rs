mod cli;
mod format;

use std::sync::Arc;

use clap::Parser;
use sqlx::SqlitePool;
use tracing::error;

use cli::{Cli, Command};
use stream_agency_client::{HttpEpochOracle, HttpStreamClient, StreamClient};
use stream_agency_config::RuntimeConfig;
use stream_agency_core::Scheduler;
use stream_agency_settlement::ClawpySettlementExecutor;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("ERROR: {e}");
            error!(error = %e, "command failed");
            std::process::exit(1);
        }
    }
}

async fn open_db(db_path: &str) -> anyhow::Result<SqlitePool> {
    let pool = stream_agency_db::connect(db_path).await?;
    stream_agency_db::migrate(&pool).await?;
    Ok(pool)
}

fn default_stream_client(cfg: &RuntimeConfig) -> Arc<dyn StreamClient> {
    Arc::new(HttpStreamClient::new(cfg.stream_url.clone()))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pool = open_db(&cli.db).await?;

    match cli.command {
        Command::InitDb => {
            println!("DB ready: {}", cli.db);
        }

        Command::Enroll { address, signature, fee_bps } => {
            let cfg = RuntimeConfig { intake_probe_stream: false, ..RuntimeConfig::default() };
            let stream_client = default_stream_client(&cfg);
            stream_agency_core::admin::enroll(&pool, stream_client.as_ref(), &cfg, &address, &signature, fee_bps)
                .await?;
            println!("Enrolled: {address}");
        }

        Command::EnrollFromPem { pem, fee_bps } => {
            let cfg = RuntimeConfig::default();
            let stream_client = default_stream_client(&cfg);
            let agent =
                stream_agency_core::admin::enroll_from_pem(&pool, stream_client.as_ref(), &cfg, &pem, fee_bps)
                    .await?;
            println!("Enrolled from PEM: {}", agent.address);
        }

        Command::Pause { address } => {
            stream_agency_core::admin::pause(&pool, &address).await?;
            println!("Paused: {address}");
        }

        Command::Resume { address } => {
            stream_agency_core::admin::resume(&pool, &address).await?;
            println!("Resumed: {address}");
        }

        Command::Remove { address } => {
            stream_agency_core::admin::remove(&pool, &address).await?;
            println!("Removed: {address}");
        }

        Command::Tick(runtime_args) => {
            let cfg = runtime_args.into_config(20)?;
            let scheduler = build_scheduler(pool, &cfg)?;
            let report = scheduler.execute_tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Run { poll_seconds, runtime } => {
            let cfg = runtime.into_config(poll_seconds)?;
            let scheduler = Arc::new(build_scheduler(pool, &cfg)?);
            println!(
                "Scheduler loop started: poll={}s lead={}s jitter={}s reward/window={} billing={}",
                cfg.poll_interval_seconds, cfg.lead_seconds, cfg.jitter_seconds, cfg.reward_per_window, cfg.billing_enabled
            );
            tokio::select! {
                _ = stream_agency_daemon::runtime::scheduler_loop(scheduler, cfg.poll_interval_seconds) => {},
                _ = stream_agency_daemon::runtime::shutdown_signal() => {
                    println!("Stopped.");
                },
            }
        }

        Command::Api { poll_seconds, api_host, api_port, api_token, with_scheduler, runtime } => {
            let cfg = runtime.into_config(poll_seconds)?;
            let stream_client = default_stream_client(&cfg);
            let scheduler = Arc::new(build_scheduler_with_client(pool.clone(), &cfg, stream_client.clone())?);

            let state = stream_agency_daemon::state::AppState {
                pool,
                cfg: cfg.clone(),
                stream_client,
                scheduler: scheduler.clone(),
                api_token: (!api_token.is_empty()).then_some(api_token),
            };
            let app = stream_agency_daemon::routes::router(state)
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::cors::CorsLayer::permissive());

            let scheduler_handle = with_scheduler
                .then(|| tokio::spawn(stream_agency_daemon::runtime::scheduler_loop(scheduler, cfg.poll_interval_seconds)));

            let listener = tokio::net::TcpListener::bind((api_host.as_str(), api_port)).await?;
            println!("API listening on {api_host}:{api_port}");
            axum::serve(listener, app)
                .with_graceful_shutdown(stream_agency_daemon::runtime::shutdown_signal())
                .await?;

            if let Some(handle) = scheduler_handle {
                stream_agency_daemon::runtime::abort_with_grace(handle).await;
            }
        }

        Command::Report => {
            let rows = stream_agency_core::admin::report(&pool).await?;
            format::print_report(&rows);
        }

        Command::Attempts { address, limit } => {
            let attempts = stream_agency_core::admin::recent_attempts(&pool, &address, limit).await?;
            format::print_attempts(&attempts);
        }

        Command::BillingAttempts { limit } => {
            let rows = stream_agency_core::admin::recent_billing_attempts(&pool, limit).await?;
            format::print_billing_attempts(&rows);
        }
    }

    Ok(())
}

fn build_scheduler(pool: SqlitePool, cfg: &RuntimeConfig) -> anyhow::Result<Scheduler> {
    let stream_client = default_stream_client(cfg);
    build_scheduler_with_client(pool, cfg, stream_client)
}

fn build_scheduler_with_client(
    pool: SqlitePool,
    cfg: &RuntimeConfig,
    stream_client: Arc<dyn StreamClient>,
) -> anyhow::Result<Scheduler> {
    let epoch_oracle: Option<Arc<dyn stream_agency_client::EpochOracle>> = if cfg.billing_enabled {
        Some(Arc::new(HttpEpochOracle::new(cfg.epoch_api_url.clone())))
    } else {
        None
    };
    let settlement_executor: Option<Arc<dyn stream_agency_settlement::SettlementExecutor>> =
        if cfg.billing_enabled {
            Some(Arc::new(ClawpySettlementExecutor::from_runtime_config(cfg)?))
        } else {
            None
        };

    Ok(Scheduler::new(pool, stream_client, epoch_oracle, settlement_executor, cfg.clone()))
}
