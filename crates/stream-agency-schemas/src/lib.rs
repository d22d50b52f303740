//! Plain-data types shared across the Stream Agency crates.
//!
//! Nothing here touches I/O; this crate exists so `stream-agency-db`,
//! `stream-agency-core`, `stream-agency-daemon`, and `stream-agency-cli` can
//! agree on one definition of each row shape without depending on each
//! other.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod error;
pub use error::AgencyError;

/// Lifecycle state of an enrolled agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
    Suspended,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "paused" => Ok(AgentStatus::Paused),
            "suspended" => Ok(AgentStatus::Suspended),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// One enrolled wallet-identified principal.
///
/// Timestamps are epoch milliseconds, matching the wire format returned by
/// the stream and epoch endpoints; converting to `chrono::DateTime` only
/// happens at the reporting edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub address: String,
    pub stream_signature: String,
    pub fee_bps: i64,
    pub status: AgentStatus,
    pub expected_end_ms: Option<i64>,
    pub next_attempt_ms: Option<i64>,
    pub retry_step: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub fee_due_claw: f64,
    pub last_success_ms: Option<i64>,
    pub last_error: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
}

/// Append-only stream call log row. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAttempt {
    pub id: i64,
    pub agent_id: i64,
    pub attempted_ms: i64,
    pub ok: bool,
    pub status_code: i64,
    pub reason: String,
    pub end_stream_ms: Option<i64>,
    pub response_body_truncated: String,
}

/// Per-`(agent, epoch)` window counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageWindow {
    pub agent_id: i64,
    pub epoch: i64,
    pub windows: i64,
    pub billed: bool,
    pub billed_at_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// Append-only settlement call log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAttempt {
    pub id: i64,
    pub agent_id: i64,
    pub epoch: i64,
    pub windows: i64,
    pub attempted_ms: i64,
    pub ok: bool,
    pub return_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// A usage-window billing candidate joined with its agent address, as
/// returned by `list_billing_candidates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingCandidate {
    pub agent_id: i64,
    pub address: String,
    pub epoch: i64,
    pub windows: i64,
}

/// Per-agent summary row for `report` / `GET /report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub id: i64,
    pub address: String,
    pub fee_bps: i64,
    pub status: AgentStatus,
    pub success_count: i64,
    pub failure_count: i64,
    pub pending_windows: i64,
    pub billed_windows: i64,
    pub next_attempt_ms: Option<i64>,
    pub expected_end_ms: Option<i64>,
    pub last_success_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// A billing attempt joined with its agent's address, for
/// `billing-attempts` / `recent_billing_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAttemptReport {
    pub address: String,
    pub attempt: BillingAttempt,
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
