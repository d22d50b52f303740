//! Settlement Executor: submits the on-chain `billEpoch` call by shelling
//! out to the `clawpy` CLI. Only the process exit code determines success —
//! stdout is captured for the audit trail but never interpreted.

use std::process::Command;

use stream_agency_schemas::AgencyError;

/// Escrow/operator configuration required to invoke the settlement tool.
/// Absence of either is a `ConfigMissing` programmer error — callers should
/// validate at startup via `stream_agency_config::RuntimeConfig::validate`.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub escrow_contract: String,
    pub operator_pem: String,
    pub billing_proxy: String,
    pub billing_chain: String,
    pub billing_gas_limit: i64,
    pub billing_gas_price: i64,
}

#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub ok: bool,
    pub return_code: i64,
    pub stdout: String,
    pub stderr: String,
}

pub trait SettlementExecutor: Send + Sync {
    fn bill(&self, agent_address: &str, epoch: i64, windows: i64) -> SettlementOutcome;
}

pub struct ClawpySettlementExecutor {
    cfg: SettlementConfig,
}

impl ClawpySettlementExecutor {
    pub fn new(cfg: SettlementConfig) -> Self {
        Self { cfg }
    }

    pub fn from_runtime_config(
        cfg: &stream_agency_config::RuntimeConfig,
    ) -> Result<Self, AgencyError> {
        let escrow_contract = cfg.escrow_contract.clone().ok_or_else(|| {
            AgencyError::ConfigMissing("billing requires --escrow-contract".into())
        })?;
        let operator_pem = cfg
            .operator_pem
            .clone()
            .ok_or_else(|| AgencyError::ConfigMissing("billing requires --operator-pem".into()))?;

        Ok(Self::new(SettlementConfig {
            escrow_contract,
            operator_pem,
            billing_proxy: cfg.billing_proxy.clone(),
            billing_chain: cfg.billing_chain.clone(),
            billing_gas_limit: cfg.billing_gas_limit,
            billing_gas_price: cfg.billing_gas_price,
        }))
    }
}

impl SettlementExecutor for ClawpySettlementExecutor {
    fn bill(&self, agent_address: &str, epoch: i64, windows: i64) -> SettlementOutcome {
        let output = Command::new("clawpy")
            .arg("contract")
            .arg("call")
            .arg(&self.cfg.escrow_contract)
            .arg("--function")
            .arg("billEpoch")
            .arg("--arguments")
            .arg(agent_address)
            .arg(epoch.to_string())
            .arg(windows.to_string())
            .arg("--gas-limit")
            .arg(self.cfg.billing_gas_limit.to_string())
            .arg("--gas-price")
            .arg(self.cfg.billing_gas_price.to_string())
            .arg("--pem")
            .arg(&self.cfg.operator_pem)
            .arg("--chain")
            .arg(&self.cfg.billing_chain)
            .arg("--proxy")
            .arg(&self.cfg.billing_proxy)
            .arg("--send")
            .output();

        match output {
            Ok(output) => SettlementOutcome {
                ok: output.status.success(),
                return_code: output.status.code().unwrap_or(-1) as i64,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => SettlementOutcome {
                ok: false,
                return_code: -1,
                stdout: String::new(),
                stderr: format!("failed to spawn clawpy: {e}"),
            },
        }
    }
}
