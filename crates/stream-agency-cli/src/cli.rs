use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stream-agency", version, about = "Stream Agency daemon control")]
pub struct Cli {
    /// SQLite DB path.
    #[arg(long, global = true, default_value = stream_agency_config::DEFAULT_DB_PATH)]
    pub db: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create or migrate local database.
    InitDb,

    /// Enroll/update an agent.
    Enroll {
        #[arg(long)]
        address: String,
        /// Reusable signature for message 'stream'.
        #[arg(long)]
        signature: String,
        #[arg(long, default_value_t = 500)]
        fee_bps: i64,
    },

    /// Enroll agent directly from wallet PEM.
    EnrollFromPem {
        #[arg(long)]
        pem: String,
        #[arg(long, default_value_t = 500)]
        fee_bps: i64,
    },

    /// Pause an agent.
    Pause {
        #[arg(long)]
        address: String,
    },

    /// Resume an agent.
    Resume {
        #[arg(long)]
        address: String,
    },

    /// Delete an agent and all local records.
    Remove {
        #[arg(long)]
        address: String,
    },

    /// Run one scheduling cycle (+ optional auto billing).
    Tick(RuntimeArgs),

    /// Run continuous scheduler loop (+ optional auto billing).
    Run {
        #[arg(long, default_value_t = 20)]
        poll_seconds: u64,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Run intake HTTP API server.
    Api {
        #[arg(long, default_value_t = 20)]
        poll_seconds: u64,
        #[arg(long, default_value = "0.0.0.0")]
        api_host: String,
        #[arg(long, default_value_t = 8787)]
        api_port: u16,
        /// Optional bearer/API key token for all endpoints except /health.
        #[arg(long, default_value = "")]
        api_token: String,
        /// Run scheduler loop in-process alongside the API server.
        #[arg(long, default_value_t = false)]
        with_scheduler: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Show enrolled agents and local usage summary.
    Report,

    /// Show recent stream attempts for one agent.
    Attempts {
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Show recent billEpoch attempt history.
    BillingAttempts {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

/// Shared by `tick`/`run`/`api`.
#[derive(Args, Clone)]
pub struct RuntimeArgs {
    #[arg(long, default_value_t = 360)]
    pub lead_seconds: i64,
    #[arg(long, default_value_t = 20)]
    pub jitter_seconds: i64,
    #[arg(long, default_value_t = 1.0)]
    pub reward_per_window: f64,
    #[arg(long, default_value = stream_agency_config::DEFAULT_STREAM_URL)]
    pub stream_url: String,
    /// Skip stream signature probe during API /enroll (not recommended).
    #[arg(long, default_value_t = false)]
    pub intake_no_probe_stream: bool,

    #[arg(long, default_value_t = false)]
    pub billing_enabled: bool,
    #[arg(long, default_value = "")]
    pub escrow_contract: String,
    #[arg(long, default_value = "")]
    pub operator_pem: String,
    #[arg(long, default_value = stream_agency_config::DEFAULT_EPOCH_API_URL)]
    pub epoch_api_url: String,
    #[arg(long, default_value = stream_agency_config::DEFAULT_EPOCH_API_URL)]
    pub billing_proxy: String,
    #[arg(long, default_value = "C")]
    pub billing_chain: String,
    #[arg(long, default_value_t = 25_000_000)]
    pub billing_gas_limit: i64,
    #[arg(long, default_value_t = 20_000_000_000_000)]
    pub billing_gas_price: i64,
}

impl RuntimeArgs {
    pub fn into_config(self, poll_interval_seconds: u64) -> anyhow::Result<stream_agency_config::RuntimeConfig> {
        if self.billing_enabled && (self.escrow_contract.is_empty() || self.operator_pem.is_empty()) {
            anyhow::bail!("--billing-enabled requires --escrow-contract and --operator-pem");
        }

        Ok(stream_agency_config::RuntimeConfig {
            lead_seconds: self.lead_seconds,
            jitter_seconds: self.jitter_seconds,
            reward_per_window: self.reward_per_window,
            poll_interval_seconds,
            stream_url: self.stream_url,
            billing_enabled: self.billing_enabled,
            escrow_contract: (!self.escrow_contract.is_empty()).then_some(self.escrow_contract),
            operator_pem: (!self.operator_pem.is_empty()).then_some(self.operator_pem),
            billing_proxy: self.billing_proxy,
            billing_chain: self.billing_chain,
            billing_gas_limit: self.billing_gas_limit,
            billing_gas_price: self.billing_gas_price,
            epoch_api_url: self.epoch_api_url,
            intake_probe_stream: !self.intake_no_probe_stream,
        })
    }
}
