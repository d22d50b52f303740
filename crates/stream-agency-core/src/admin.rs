//! Admin Surface: thin, synchronous operations on the Store, shared by the
//! CLI and the HTTP admin API. Validation and the enroll probe live here so
//! both callers get identical behavior.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;

use stream_agency_client::StreamClient;
use stream_agency_config::RuntimeConfig;
use stream_agency_schemas::{
    Agent, AgentReport, AgentStatus, AgencyError, BillingAttemptReport, StreamAttempt,
};

use crate::state_machine::{classify_outcome, next_attempt_ms, ArmOutcome};

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^claw1[0-9a-z]+$").unwrap());
static SIGNATURE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static ADDRESS_SCRAPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"claw1[0-9a-z]+").unwrap());

fn validate_address(address: &str) -> Result<(), AgencyError> {
    if ADDRESS_RE.is_match(address) {
        Ok(())
    } else {
        Err(AgencyError::Validation("invalid claws address".into()))
    }
}

fn validate_fee_bps(fee_bps: i64) -> Result<(), AgencyError> {
    if (0..=10_000).contains(&fee_bps) {
        Ok(())
    } else {
        Err(AgencyError::Validation(
            "fee_bps must be between 0 and 10000".into(),
        ))
    }
}

/// Enroll an agent, validating its address/fee and optionally running a
/// live probe. When `cfg.intake_probe_stream` is set, the probe is
/// rejected unless the stream call is either a success carrying an
/// `end_stream_ms`, or an `already_streaming` reply that also carries one.
pub async fn enroll(
    pool: &SqlitePool,
    stream_client: &dyn StreamClient,
    cfg: &RuntimeConfig,
    address: &str,
    signature: &str,
    fee_bps: i64,
) -> Result<Agent, AgencyError> {
    let address = address.trim();
    validate_address(address)?;
    validate_fee_bps(fee_bps)?;
    if signature.trim().is_empty() {
        return Err(AgencyError::Validation("missing stream signature".into()));
    }

    let mut probed_end_stream_ms = None;
    if cfg.intake_probe_stream {
        let resp = stream_client.post_stream(address, signature).await;
        let outcome = classify_outcome(&resp);
        match outcome {
            ArmOutcome::ArmSuccess { end_stream_ms } | ArmOutcome::ReSync { end_stream_ms } => {
                probed_end_stream_ms = Some(end_stream_ms);
            }
            ArmOutcome::Backoff { status_code, body } => {
                let mut snippet = body;
                snippet.truncate(220);
                return Err(AgencyError::StreamTransient(format!(
                    "stream signature probe failed (status={status_code}): {snippet}"
                )));
            }
        }
    }

    let agent = stream_agency_db::upsert_agent(pool, address, signature, fee_bps)
        .await
        .map_err(|e| AgencyError::Fatal(e.to_string()))?;

    if let Some(end_stream_ms) = probed_end_stream_ms {
        let jitter = stream_agency_db::jitter_ms(cfg.jitter_seconds);
        let next = next_attempt_ms(end_stream_ms, cfg.lead_seconds, jitter);
        stream_agency_db::apply_enroll_probe(pool, agent.id, end_stream_ms, next)
            .await
            .map_err(|e| AgencyError::Fatal(e.to_string()))?;
        return stream_agency_db::get_agent_by_address(pool, address)
            .await
            .map_err(|e| AgencyError::Fatal(e.to_string()))?
            .ok_or_else(|| AgencyError::NotFound(address.to_string()));
    }

    Ok(agent)
}

/// Derive an address and a signed message from a wallet PEM by shelling
/// out to `clawpy`, then enroll the resulting address.
pub async fn enroll_from_pem(
    pool: &SqlitePool,
    stream_client: &dyn StreamClient,
    cfg: &RuntimeConfig,
    pem_path: &str,
    fee_bps: i64,
) -> Result<Agent, AgencyError> {
    let address_output = run_clawpy(&[
        "wallet",
        "convert",
        "--infile",
        pem_path,
        "--in-format",
        "pem",
        "--out-format",
        "address-bech32",
    ])?;
    let address = ADDRESS_SCRAPE_RE
        .find(&address_output)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            AgencyError::Fatal(format!(
                "unable to parse claw address from clawpy output: {address_output}"
            ))
        })?;

    let signature_output = run_clawpy(&[
        "wallet",
        "sign-message",
        "--pem",
        pem_path,
        "--message",
        "stream",
    ])?;
    let signature = SIGNATURE_RE
        .find(&signature_output)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            AgencyError::Fatal(format!(
                "unable to parse signature from clawpy output: {signature_output}"
            ))
        })?;

    enroll(pool, stream_client, cfg, &address, &signature, fee_bps).await
}

fn run_clawpy(args: &[&str]) -> Result<String, AgencyError> {
    let output = std::process::Command::new("clawpy")
        .args(args)
        .output()
        .map_err(|e| AgencyError::Fatal(format!("failed to spawn clawpy: {e}")))?;

    if !output.status.success() {
        return Err(AgencyError::Fatal(format!(
            "clawpy {} failed ({})\nstdout:\n{}\nstderr:\n{}",
            args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        )));
    }

    Ok(format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
    .trim()
    .to_string())
}

pub async fn pause(pool: &SqlitePool, address: &str) -> Result<(), AgencyError> {
    stream_agency_db::set_status(pool, address, AgentStatus::Paused)
        .await
        .map_err(to_agency_error)
}

pub async fn resume(pool: &SqlitePool, address: &str) -> Result<(), AgencyError> {
    stream_agency_db::set_status(pool, address, AgentStatus::Active)
        .await
        .map_err(to_agency_error)
}

pub async fn remove(pool: &SqlitePool, address: &str) -> Result<(), AgencyError> {
    stream_agency_db::remove_agent(pool, address)
        .await
        .map_err(to_agency_error)
}

pub async fn get_agent(pool: &SqlitePool, address: &str) -> Result<Agent, AgencyError> {
    stream_agency_db::get_agent_by_address(pool, address)
        .await
        .map_err(|e| AgencyError::Fatal(e.to_string()))?
        .ok_or_else(|| AgencyError::NotFound(address.to_string()))
}

pub async fn report(pool: &SqlitePool) -> Result<Vec<AgentReport>, AgencyError> {
    stream_agency_db::collect_report_data(pool)
        .await
        .map_err(|e| AgencyError::Fatal(e.to_string()))
}

pub async fn recent_attempts(
    pool: &SqlitePool,
    address: &str,
    limit: i64,
) -> Result<Vec<StreamAttempt>, AgencyError> {
    stream_agency_db::recent_attempts(pool, address, limit)
        .await
        .map_err(to_agency_error)
}

pub async fn recent_billing_attempts(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<BillingAttemptReport>, AgencyError> {
    stream_agency_db::recent_billing_attempts(pool, limit)
        .await
        .map_err(|e| AgencyError::Fatal(e.to_string()))
}

/// `stream-agency-db` returns `anyhow::Error` wrapping whichever
/// `AgencyError` it raised (e.g. `NotFound`) or a plain context chain for
/// unexpected sqlx failures. Downcast the former through; collapse the
/// latter to `Fatal`.
fn to_agency_error(e: anyhow::Error) -> AgencyError {
    match e.downcast::<AgencyError>() {
        Ok(agency_err) => agency_err,
        Err(e) => AgencyError::Fatal(e.to_string()),
    }
}

/// Convenience wrapper pairing a pool with the dependencies the Admin
/// Surface needs for the probe path, used by the HTTP and CLI adapters so
/// neither has to thread `stream_client`/`cfg` through every call site.
#[derive(Clone)]
pub struct AdminSurface {
    pub pool: SqlitePool,
    pub stream_client: Arc<dyn StreamClient>,
    pub cfg: RuntimeConfig,
}

impl AdminSurface {
    pub fn new(pool: SqlitePool, stream_client: Arc<dyn StreamClient>, cfg: RuntimeConfig) -> Self {
        Self {
            pool,
            stream_client,
            cfg,
        }
    }

    pub async fn enroll(
        &self,
        address: &str,
        signature: &str,
        fee_bps: i64,
    ) -> Result<Agent, AgencyError> {
        enroll(
            &self.pool,
            self.stream_client.as_ref(),
            &self.cfg,
            address,
            signature,
            fee_bps,
        )
        .await
    }

    pub async fn enroll_from_pem(&self, pem_path: &str, fee_bps: i64) -> Result<Agent, AgencyError> {
        enroll_from_pem(&self.pool, self.stream_client.as_ref(), &self.cfg, pem_path, fee_bps).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation_matches_bech32_shape() {
        assert!(validate_address("claw1abc123xyz").is_ok());
        assert!(validate_address("claw1ABC").is_err());
        assert!(validate_address("notclaw1abc").is_err());
    }

    #[test]
    fn fee_bps_validation_rejects_out_of_range() {
        assert!(validate_fee_bps(0).is_ok());
        assert!(validate_fee_bps(10_000).is_ok());
        assert!(validate_fee_bps(10_001).is_err());
        assert!(validate_fee_bps(-1).is_err());
    }
}
