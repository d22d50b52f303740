//! The Scheduler: the daemon's core tick loop driver.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use stream_agency_client::{EpochOracle, StreamClient};
use stream_agency_config::RuntimeConfig;
use stream_agency_schemas::now_ms;
use stream_agency_settlement::SettlementExecutor;

use crate::state_machine::{
    backoff_delay_seconds, classify_outcome, classify_reason, fee_for_success, next_attempt_ms,
    ArmOutcome,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub processed: i64,
    pub ok: i64,
    pub fail: i64,
    pub usage_windows_added: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingStats {
    pub billing_candidates: i64,
    pub billing_ok: i64,
    pub billing_fail: i64,
}

/// Result of one `execute_tick` call, shared verbatim by the `tick` CLI
/// subcommand and `POST /tick` — both render the same struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub stream: StreamStats,
    pub billing: BillingStats,
    pub chain_epoch: Option<i64>,
    pub epoch_error: Option<String>,
}

/// Drives one tick's epoch snapshot, stream pass, and billing pass against
/// a store, a stream client, an (optional) epoch oracle, and an (optional)
/// settlement executor. The oracle/executor are only consulted when
/// `cfg.billing_enabled`; callers should pass `None` rather than wiring a
/// dummy implementation when billing is off.
pub struct Scheduler {
    pool: SqlitePool,
    stream_client: Arc<dyn StreamClient>,
    epoch_oracle: Option<Arc<dyn EpochOracle>>,
    settlement_executor: Option<Arc<dyn SettlementExecutor>>,
    cfg: RuntimeConfig,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        stream_client: Arc<dyn StreamClient>,
        epoch_oracle: Option<Arc<dyn EpochOracle>>,
        settlement_executor: Option<Arc<dyn SettlementExecutor>>,
        cfg: RuntimeConfig,
    ) -> Self {
        Self {
            pool,
            stream_client,
            epoch_oracle,
            settlement_executor,
            cfg,
        }
    }

    /// Run one complete tick: epoch snapshot, stream pass, billing pass.
    /// Never returns early on a per-agent or per-settlement error — only a
    /// Store-level failure (e.g. the pool itself is gone) surfaces as
    /// `Err`.
    pub async fn execute_tick(&self) -> anyhow::Result<TickReport> {
        let mut chain_epoch = None;
        let mut epoch_error = None;

        if self.cfg.billing_enabled {
            if let Some(oracle) = &self.epoch_oracle {
                match oracle.get_epoch().await {
                    Ok(epoch) => chain_epoch = Some(epoch),
                    Err(e) => {
                        warn!(error = %e, "epoch oracle unavailable this tick; billing skipped");
                        epoch_error = Some(e.to_string());
                    }
                }
            }
        }

        let stream = self.process_due_agents(chain_epoch).await?;
        let billing = self.bill_closed_epochs(chain_epoch).await?;

        if stream.processed > 0 || billing.billing_candidates > 0 {
            info!(
                processed = stream.processed,
                ok = stream.ok,
                fail = stream.fail,
                usage_added = stream.usage_windows_added,
                billing_candidates = billing.billing_candidates,
                billing_ok = billing.billing_ok,
                billing_fail = billing.billing_fail,
                "tick complete"
            );
        }

        Ok(TickReport {
            stream,
            billing,
            chain_epoch,
            epoch_error,
        })
    }

    async fn process_due_agents(&self, chain_epoch: Option<i64>) -> anyhow::Result<StreamStats> {
        let due = stream_agency_db::list_due_agents(&self.pool, now_ms()).await?;
        let mut stats = StreamStats::default();

        for agent in due {
            stats.processed += 1;
            match self.process_one_agent(&agent, chain_epoch).await {
                Ok(usage_incremented) => {
                    stats.ok += 1;
                    if usage_incremented {
                        stats.usage_windows_added += 1;
                    }
                }
                Err(e) if e.is::<BackoffApplied>() => {
                    stats.fail += 1;
                }
                Err(e) => {
                    // A Store failure mid-agent: log and move on, one
                    // agent's failure never blocks others.
                    error!(agent = %agent.address, error = %e, "failed to process due agent");
                    stats.fail += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Returns `Ok(usage_incremented)` on ArmSuccess/ReSync, or
    /// `Err(BackoffApplied)` (a sentinel, not a real failure) on Backoff so
    /// the caller can bump `fail` without special-casing the enum again.
    async fn process_one_agent(
        &self,
        agent: &stream_agency_schemas::Agent,
        chain_epoch: Option<i64>,
    ) -> anyhow::Result<bool> {
        let resp = self
            .stream_client
            .post_stream(&agent.address, &agent.stream_signature)
            .await;

        let reason = classify_reason(&resp);
        let outcome = classify_outcome(&resp);
        let end_stream_ms = resp.end_stream_ms();

        let mut tx = stream_agency_db::begin(&self.pool).await?;
        stream_agency_db::record_attempt(
            &mut tx,
            agent.id,
            resp.ok,
            resp.status,
            reason,
            end_stream_ms,
            &resp.body,
        )
        .await?;

        let result = match &outcome {
            ArmOutcome::ArmSuccess { end_stream_ms } => {
                let jitter = stream_agency_db::jitter_ms(self.cfg.jitter_seconds);
                let next = next_attempt_ms(*end_stream_ms, self.cfg.lead_seconds, jitter);
                let fee = fee_for_success(self.cfg.reward_per_window, agent.fee_bps);
                stream_agency_db::apply_arm_success(&mut tx, agent.id, *end_stream_ms, next, fee)
                    .await?;

                let mut usage_incremented = false;
                if let Some(epoch) = chain_epoch {
                    stream_agency_db::increment_usage(&mut tx, agent.id, epoch).await?;
                    usage_incremented = true;
                }
                Ok(usage_incremented)
            }
            ArmOutcome::ReSync { end_stream_ms } => {
                let jitter = stream_agency_db::jitter_ms(self.cfg.jitter_seconds);
                let next = next_attempt_ms(*end_stream_ms, self.cfg.lead_seconds, jitter);
                stream_agency_db::apply_already_streaming(&mut tx, agent.id, *end_stream_ms, next)
                    .await?;
                Ok(false)
            }
            ArmOutcome::Backoff { status_code, body } => {
                let delay = backoff_delay_seconds(agent.retry_step);
                let next = now_ms() + delay * 1000;
                let err_msg = format!("{status_code}: {body}");
                stream_agency_db::apply_failure(
                    &mut tx,
                    agent.id,
                    next,
                    agent.retry_step + 1,
                    &err_msg,
                )
                .await?;
                Err(anyhow::Error::new(BackoffApplied))
            }
        };

        tx.commit().await?;
        result
    }

    async fn bill_closed_epochs(&self, chain_epoch: Option<i64>) -> anyhow::Result<BillingStats> {
        let mut stats = BillingStats::default();
        if !self.cfg.billing_enabled {
            return Ok(stats);
        }
        let Some(chain_epoch) = chain_epoch else {
            return Ok(stats);
        };
        let Some(executor) = &self.settlement_executor else {
            return Ok(stats);
        };

        let candidates =
            stream_agency_db::list_billing_candidates(&self.pool, chain_epoch).await?;
        stats.billing_candidates = candidates.len() as i64;

        for c in candidates {
            let outcome = executor.bill(&c.address, c.epoch, c.windows);

            stream_agency_db::record_billing_attempt(
                &self.pool,
                c.agent_id,
                c.epoch,
                c.windows,
                outcome.ok,
                outcome.return_code,
                &outcome.stdout,
                &outcome.stderr,
            )
            .await?;

            if outcome.ok {
                stream_agency_db::mark_billed(&self.pool, c.agent_id, c.epoch).await?;
                stats.billing_ok += 1;
            } else {
                let err = if !outcome.stderr.is_empty() {
                    outcome.stderr
                } else if !outcome.stdout.is_empty() {
                    outcome.stdout
                } else {
                    "billing failed".to_string()
                };
                stream_agency_db::record_billing_failure(&self.pool, c.agent_id, c.epoch, &err)
                    .await?;
                stats.billing_fail += 1;
            }
        }

        Ok(stats)
    }
}

/// Sentinel error used internally to thread a Backoff outcome back up to
/// `process_due_agents` without re-deriving the classification.
#[derive(Debug)]
struct BackoffApplied;

impl std::fmt::Display for BackoffApplied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("backoff applied")
    }
}

impl std::error::Error for BackoffApplied {}
