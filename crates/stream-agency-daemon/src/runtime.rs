//! Shared process plumbing used by both the daemon binary and the CLI's
//! `run`/`api` subcommands: the scheduler driver loop and graceful shutdown
//! wait.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use stream_agency_core::Scheduler;

/// Tick forever at `poll_interval_seconds`. Runs until its task is
/// aborted.
pub async fn scheduler_loop(scheduler: Arc<Scheduler>, poll_interval_seconds: u64) {
    info!(poll_interval_seconds, "scheduler loop started");
    loop {
        match scheduler.execute_tick().await {
            Ok(report) => {
                if report.stream.processed > 0 || report.billing.billing_candidates > 0 {
                    info!(
                        processed = report.stream.processed,
                        ok = report.stream.ok,
                        fail = report.stream.fail,
                        usage_added = report.stream.usage_windows_added,
                        billing_candidates = report.billing.billing_candidates,
                        "tick"
                    );
                }
                if let Some(err) = report.epoch_error {
                    error!(error = %err, "epoch-fetch-error");
                }
            }
            Err(e) => error!(error = %e, "tick failed"),
        }
        tokio::time::sleep(Duration::from_secs(poll_interval_seconds)).await;
    }
}

/// Resolves once SIGINT or (on Unix) SIGTERM is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Abort the scheduler loop task and wait up to 3s for it to unwind.
pub async fn abort_with_grace(handle: tokio::task::JoinHandle<()>) {
    handle.abort();
    let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
}
