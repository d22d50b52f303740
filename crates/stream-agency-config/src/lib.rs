//! Runtime configuration for the Stream Agency daemon.
//!
//! Values are sourced from environment variables with CLI-flag overrides
//! applied by the `stream-agency-cli`/`stream-agency-daemon` binaries:
//! defaults are layered under explicit `STREAM_AGENCY_*` env vars, then
//! validated once all overrides are applied.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STREAM_URL: &str = "https://stream.claws.network/stream";
pub const DEFAULT_EPOCH_API_URL: &str = "https://api.claws.network";
pub const ENV_DB_PATH: &str = "STREAM_AGENCY_DB_PATH";
pub const DEFAULT_DB_PATH: &str = "stream-agency/agency.db";

/// Tunables for one tick of the Scheduler, plus billing wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub lead_seconds: i64,
    pub jitter_seconds: i64,
    pub reward_per_window: f64,
    pub poll_interval_seconds: u64,
    pub stream_url: String,
    pub billing_enabled: bool,
    pub escrow_contract: Option<String>,
    pub operator_pem: Option<String>,
    pub billing_proxy: String,
    pub billing_chain: String,
    pub billing_gas_limit: i64,
    pub billing_gas_price: i64,
    pub epoch_api_url: String,
    /// When true, `/enroll` performs a live probe through the Stream Client
    /// before accepting the agent.
    pub intake_probe_stream: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lead_seconds: 360,
            jitter_seconds: 20,
            reward_per_window: 1.0,
            poll_interval_seconds: 20,
            stream_url: DEFAULT_STREAM_URL.to_string(),
            billing_enabled: false,
            escrow_contract: None,
            operator_pem: None,
            billing_proxy: DEFAULT_EPOCH_API_URL.to_string(),
            billing_chain: "C".to_string(),
            billing_gas_limit: 25_000_000,
            billing_gas_price: 20_000_000_000_000,
            epoch_api_url: DEFAULT_EPOCH_API_URL.to_string(),
            intake_probe_stream: true,
        }
    }
}

impl RuntimeConfig {
    /// Load defaults, then overlay any `STREAM_AGENCY_*` environment
    /// variables that are set. CLI flags are applied by the caller after
    /// this returns, so flags always win over env.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("STREAM_AGENCY_LEAD_SECONDS") {
            if let Ok(n) = v.parse() {
                cfg.lead_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_JITTER_SECONDS") {
            if let Ok(n) = v.parse() {
                cfg.jitter_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_REWARD_PER_WINDOW") {
            if let Ok(n) = v.parse() {
                cfg.reward_per_window = n;
            }
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_POLL_SECONDS") {
            if let Ok(n) = v.parse() {
                cfg.poll_interval_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_STREAM_URL") {
            cfg.stream_url = v;
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_EPOCH_API_URL") {
            cfg.epoch_api_url = v;
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_BILLING_PROXY") {
            cfg.billing_proxy = v;
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_BILLING_CHAIN") {
            cfg.billing_chain = v;
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_BILLING_ENABLED") {
            cfg.billing_enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_ESCROW_CONTRACT") {
            cfg.escrow_contract = Some(v);
        }
        if let Ok(v) = std::env::var("STREAM_AGENCY_OPERATOR_PEM") {
            cfg.operator_pem = Some(v);
        }
        cfg
    }

    /// *ConfigMissing* guard: billing must not be enabled without an
    /// escrow contract address and an operator credentials path.
    pub fn validate(&self) -> Result<()> {
        if self.billing_enabled && (self.escrow_contract.is_none() || self.operator_pem.is_none())
        {
            bail!("billing_enabled requires escrow_contract and operator_pem to be configured");
        }
        Ok(())
    }
}

pub fn db_path_from_env() -> String {
    std::env::var(ENV_DB_PATH).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
}
